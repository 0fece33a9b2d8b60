use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use repr_core::config::Activation;
use repr_core::tensor_io;

use crate::error::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

/// One step's worth of inputs, consumed within a single step.
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Option<Tensor>,
}

/// Contract between the trainer/evaluation side and whatever produces
/// data. Batch sequences are lazy, finite and restartable; a `None`
/// shuffle seed means deterministic split order.
pub trait DataSource {
    fn num_samples(&self, split: Split) -> usize;

    fn batches<'a>(
        &'a self,
        split: Split,
        batch_size: i64,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = Result<Batch>> + 'a>;
}

/// Dataset held as one `[P, N]` tensor (plus optional integer labels)
/// with contiguous train/val/test ranges.
pub struct InMemoryDataset {
    data: Tensor,
    labels: Option<Tensor>,
    train: (i64, i64),
    val: (i64, i64),
    test: (i64, i64),
}

impl InMemoryDataset {
    pub fn new(data: Tensor, labels: Option<Tensor>, val_frac: f64, test_frac: f64) -> Self {
        let n = data.size()[0];
        let test_len = ((n as f64) * test_frac).round() as i64;
        let val_len = ((n as f64) * val_frac).round() as i64;
        let train_len = n - val_len - test_len;
        Self {
            data,
            labels,
            train: (0, train_len),
            val: (train_len, val_len),
            test: (train_len + val_len, test_len),
        }
    }

    fn range(&self, split: Split) -> (i64, i64) {
        match split {
            Split::Train => self.train,
            Split::Val => self.val,
            Split::Test => self.test,
        }
    }
}

impl DataSource for InMemoryDataset {
    fn num_samples(&self, split: Split) -> usize {
        self.range(split).1 as usize
    }

    fn batches<'a>(
        &'a self,
        split: Split,
        batch_size: i64,
        shuffle_seed: Option<u64>,
    ) -> Box<dyn Iterator<Item = Result<Batch>> + 'a> {
        let (start, len) = self.range(split);
        let mut indices: Vec<i64> = (start..start + len).collect();
        if let Some(seed) = shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        let batch_size = batch_size.max(1) as usize;
        let chunks: Vec<Vec<i64>> = indices.chunks(batch_size).map(|c| c.to_vec()).collect();
        Box::new(chunks.into_iter().map(move |chunk| {
            let idx = Tensor::from_slice(&chunk).to_device(self.data.device());
            Ok(Batch {
                inputs: self.data.index_select(0, &idx),
                labels: self.labels.as_ref().map(|l| l.index_select(0, &idx)),
            })
        }))
    }
}

/// Parameters of the hidden manifold model: data points live on a
/// `latent_dim`-dimensional manifold embedded in `ambient_dim` dimensions
/// through a random feature matrix and a componentwise nonlinearity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifoldConfig {
    /// Dimension of the latent space (D).
    pub latent_dim: i64,
    /// Dimension of the ambient space (N).
    pub ambient_dim: i64,
    /// Number of data points to generate (P).
    pub num_points: i64,
    /// Probability of a latent pattern entry being active.
    pub active_prob: f64,
    /// Standard deviation of Gaussian noise added to the data.
    pub noise: f64,
    /// Nonlinearity applied after the projection.
    pub nonlinearity: Activation,
}

impl Default for ManifoldConfig {
    fn default() -> Self {
        Self {
            latent_dim: 64,
            ambient_dim: 1024,
            num_points: 8192,
            active_prob: 0.5,
            noise: 0.0,
            nonlinearity: Activation::Tanh,
        }
    }
}

/// Generate a hidden-manifold dataset: Bernoulli latent patterns projected
/// through a Gaussian feature matrix, squashed by the nonlinearity.
pub fn hidden_manifold(config: &ManifoldConfig, seed: i64, device: Device) -> Tensor {
    tch::manual_seed(seed);
    let d = config.latent_dim;
    let n = config.ambient_dim;
    let p = config.num_points;
    let features = Tensor::randn(&[d, n], (Kind::Float, device));
    let patterns = (Tensor::ones(&[p, d], (Kind::Float, device)) * config.active_prob).bernoulli();
    let mut data = patterns.matmul(&features) / (d as f64).sqrt();
    data = match config.nonlinearity {
        Activation::Relu => data.relu(),
        Activation::Tanh => data.tanh(),
        Activation::Identity => data,
    };
    if config.noise > 0.0 {
        data = data + Tensor::randn(&[p, n], (Kind::Float, device)) * config.noise;
    }
    data
}

#[derive(Serialize, Deserialize)]
struct ManifoldMetadata {
    id: String,
    #[serde(flatten)]
    config: ManifoldConfig,
}

fn dataset_dir(root: &Path, id: &str) -> PathBuf {
    root.join(format!("rf_{}", id))
}

/// Save a generated dataset next to the config that produced it, for
/// reproducibility.
pub fn save_dataset(root: &Path, id: &str, data: &Tensor, config: &ManifoldConfig) -> Result<()> {
    let dir = dataset_dir(root, id);
    std::fs::create_dir_all(&dir)?;
    tensor_io::write_safetensors_file(
        dir.join("dataset.safetensors"),
        &[("data".to_string(), data.shallow_clone())],
    )?;
    let metadata = ManifoldMetadata {
        id: id.to_string(),
        config: config.clone(),
    };
    std::fs::write(
        dir.join("metadata.json"),
        serde_json::to_string_pretty(&metadata)?,
    )?;
    Ok(())
}

/// Load a dataset saved with `save_dataset`.
pub fn load_dataset(root: &Path, id: &str) -> Result<(Tensor, ManifoldConfig)> {
    let dir = dataset_dir(root, id);
    let metadata: ManifoldMetadata =
        serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json"))?)?;
    let tensors = tensor_io::read_safetensors_file(dir.join("dataset.safetensors"))?;
    let data = tensors
        .into_iter()
        .find(|(name, _)| name == "data")
        .map(|(_, t)| t)
        .ok_or_else(|| TrainError::Data("dataset file has no 'data' tensor".to_string()))?;
    Ok((data, metadata.config))
}
