use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Reduction, Tensor};

use repr_core::Autoencoder;

use crate::data::{DataSource, Split};
use crate::error::{Result, TrainError};
use crate::objective::Objective;
use crate::optim::{OptimConfig, Optimizer};

/// Latents for every sample of a split, built once per evaluation pass
/// from a model held fixed, and dropped when the pass completes.
pub struct LatentCache {
    pub latents: Tensor,
    pub labels: Option<Tensor>,
}

/// Linear probe settings. The iteration budget and learning rate are
/// deliberately configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Full-batch gradient steps to train the probe for.
    pub iters: u64,
    pub lr: f64,
    /// Fraction of the cache held out for the accuracy measurement.
    pub holdout_frac: f64,
    /// Seed for the probe's initialization and data shuffle.
    pub seed: i64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            iters: 300,
            lr: 0.05,
            holdout_frac: 0.2,
            seed: 7,
        }
    }
}

/// Input corruption process for the denoising evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Corruption {
    Gaussian { sigma: f64 },
    Masking { ratio: f64 },
}

pub fn corrupt(inputs: &Tensor, corruption: &Corruption) -> Tensor {
    match corruption {
        Corruption::Gaussian { sigma } => inputs + inputs.randn_like() * *sigma,
        Corruption::Masking { ratio } => {
            let keep = inputs.rand_like().ge(*ratio).totype(Kind::Float);
            inputs * keep
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlatnessScore {
    /// RMS change of the decoded output under latent perturbation.
    pub deviation: f64,
    /// Output deviation relative to the injected latent deviation, minus
    /// one. Zero for an identity decoder; lower is flatter.
    pub excess: f64,
}

/// Run the encoder over every sample of the split exactly once, without
/// gradients. Parameters are not touched.
pub fn extract_latents(
    objective: &dyn Objective,
    data: &dyn DataSource,
    split: Split,
    batch_size: i64,
) -> Result<LatentCache> {
    let mut latents = Vec::new();
    let mut labels = Vec::new();
    let mut all_labeled = true;
    for item in data.batches(split, batch_size, None) {
        let batch = item?;
        let z = tch::no_grad(|| objective.encode(&batch.inputs)).detach();
        latents.push(z);
        match batch.labels {
            Some(y) => labels.push(y),
            None => all_labeled = false,
        }
    }
    if latents.is_empty() {
        return Err(TrainError::Data(format!(
            "split '{}' has no samples to extract latents from",
            split.as_str()
        )));
    }
    Ok(LatentCache {
        latents: Tensor::cat(&latents, 0),
        labels: if all_labeled && !labels.is_empty() {
            Some(Tensor::cat(&labels, 0))
        } else {
            None
        },
    })
}

/// Train a fresh single-layer classifier on the cached latents and report
/// held-out accuracy. The classifier is transient; the latents are never
/// touched by gradients.
pub fn linear_probe(cache: &LatentCache, config: &ProbeConfig, device: Device) -> Result<f64> {
    let labels = cache
        .labels
        .as_ref()
        .ok_or_else(|| TrainError::Data("linear probe requires labels".to_string()))?;
    let n = cache.latents.size()[0];
    if n < 2 {
        return Err(TrainError::Data(
            "linear probe requires at least two samples".to_string(),
        ));
    }
    let dim = cache.latents.size()[1];
    let classes = labels.max().int64_value(&[]) + 1;

    tch::manual_seed(config.seed);
    let perm = Tensor::randperm(n, (Kind::Int64, device));
    let z = cache
        .latents
        .detach()
        .to_device(device)
        .index_select(0, &perm);
    let y = labels
        .to_device(device)
        .totype(Kind::Int64)
        .index_select(0, &perm);

    let holdout = (((n as f64) * config.holdout_frac).round() as i64).clamp(1, n - 1);
    let train_n = n - holdout;
    let (train_z, eval_z) = (z.narrow(0, 0, train_n), z.narrow(0, train_n, holdout));
    let (train_y, eval_y) = (y.narrow(0, 0, train_n), y.narrow(0, train_n, holdout));

    let vs = nn::VarStore::new(device);
    let probe = nn::linear(&vs.root() / "probe", dim, classes, Default::default());
    let mut opt = Optimizer::new(OptimConfig::Sgd {
        lr: config.lr,
        momentum: 0.9,
    });
    for _ in 0..config.iters {
        let loss = train_z.apply(&probe).cross_entropy_for_logits(&train_y);
        opt.backward_step(&loss, &vs, config.lr, None)?;
    }

    let accuracy = tch::no_grad(|| {
        eval_z
            .apply(&probe)
            .argmax(-1, false)
            .eq_tensor(&eval_y)
            .totype(Kind::Float)
            .mean(Kind::Float)
            .double_value(&[])
    });
    Ok(accuracy)
}

/// Perturb latents by Gaussian offsets of the given magnitude, decode, and
/// compare against the unperturbed decoding.
pub fn flatness<E, D>(
    encode: E,
    decode: D,
    samples: &Tensor,
    magnitude: f64,
    draws: i64,
) -> FlatnessScore
where
    E: Fn(&Tensor) -> Tensor,
    D: Fn(&Tensor) -> Tensor,
{
    tch::no_grad(|| {
        let z = encode(samples);
        let base = decode(&z);
        let draws = draws.max(1);
        let mut output_dev = 0.0;
        let mut latent_dev = 0.0;
        for _ in 0..draws {
            let delta = z.randn_like() * magnitude;
            let decoded = decode(&(&z + &delta));
            output_dev += (decoded - &base)
                .square()
                .mean(Kind::Float)
                .double_value(&[])
                .sqrt();
            latent_dev += delta
                .square()
                .mean(Kind::Float)
                .double_value(&[])
                .sqrt();
        }
        let deviation = output_dev / draws as f64;
        let latent = latent_dev / draws as f64;
        let excess = if latent > 0.0 {
            deviation / latent - 1.0
        } else {
            0.0
        };
        FlatnessScore { deviation, excess }
    })
}

/// Corrupt the inputs, reconstruct, and measure the error against the
/// clean originals.
pub fn denoising_quality(model: &Autoencoder, samples: &Tensor, corruption: &Corruption) -> f64 {
    tch::no_grad(|| {
        let noisy = corrupt(samples, corruption);
        model
            .reconstruct(&noisy)
            .mse_loss(samples, Reduction::Mean)
            .double_value(&[])
    })
}

/// Gather up to `limit` input rows from a split, in split order.
pub fn collect_inputs(
    data: &dyn DataSource,
    split: Split,
    limit: i64,
    batch_size: i64,
) -> Result<Tensor> {
    let mut parts = Vec::new();
    let mut gathered = 0i64;
    for item in data.batches(split, batch_size, None) {
        let batch = item?;
        gathered += batch.inputs.size()[0];
        parts.push(batch.inputs);
        if gathered >= limit {
            break;
        }
    }
    if parts.is_empty() {
        return Err(TrainError::Data(format!(
            "split '{}' has no samples",
            split.as_str()
        )));
    }
    let all = Tensor::cat(&parts, 0);
    let n = all.size()[0];
    Ok(all.narrow(0, 0, n.min(limit.max(1))))
}
