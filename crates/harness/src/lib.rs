pub mod checkpoint;
pub mod data;
pub mod error;
pub mod eval;
pub mod logger;
pub mod objective;
pub mod optim;
pub mod trainer;

pub use checkpoint::{CheckpointManager, MonitorMode, Tag};
pub use error::{Result, TrainError};
pub use logger::{ConsoleLogger, MemoryLogger, MetricLogger};
pub use objective::{build_objective, AutoencoderObjective, JepaObjective, Objective};
pub use trainer::Trainer;

use serde::{Deserialize, Serialize};

use repr_core::{ArchConfig, ModelKind};

use crate::eval::{Corruption, ProbeConfig};
use crate::optim::{OptimConfig, ScheduleConfig};

/// Everything a run is configured with. Built once at trainer
/// construction and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub seed: u64,
    /// Which model family to train.
    pub model: ModelKind,
    pub arch: ArchConfig,
    pub optimizer: OptimConfig,
    pub schedule: ScheduleConfig,
    pub batch_size: i64,
    pub epochs: u64,
    /// Save a `latest` checkpoint every this many epochs (0 = only at the
    /// end of `fit`).
    pub checkpoint_every: u64,
    /// Run the evaluation protocol every this many epochs (0 = never).
    pub eval_every: u64,
    /// Emit per-step scalars every this many steps (0 = epoch means only).
    pub log_every: u64,
    pub grad_clip: Option<f64>,
    pub checkpoint_dir: String,
    /// Metric the `best` checkpoint tracks, as produced by `evaluate`
    /// (e.g. "val/loss" or "val/probe_acc").
    pub monitor: String,
    pub monitor_mode: MonitorMode,
    /// Target-encoder momentum (JEPA only).
    pub ema_momentum: f64,
    /// Fraction of input features dropped to form the context view (JEPA
    /// only).
    pub mask_ratio: f64,
    /// L2 penalty on the latent code (autoencoder only).
    pub latent_reg: f64,
    /// Corruption process for the denoising evaluation.
    pub corruption: Corruption,
    pub flatness_magnitude: f64,
    pub flatness_draws: i64,
    /// How many samples the flatness/denoising evaluations look at.
    pub eval_samples: i64,
    pub probe: ProbeConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: "run".to_string(),
            seed: 42,
            model: ModelKind::Autoencoder,
            arch: ArchConfig::default(),
            optimizer: OptimConfig::default(),
            schedule: ScheduleConfig::default(),
            batch_size: 64,
            epochs: 10,
            checkpoint_every: 1,
            eval_every: 1,
            log_every: 10,
            grad_clip: Some(1.0),
            checkpoint_dir: "./checkpoints".to_string(),
            monitor: "val/loss".to_string(),
            monitor_mode: MonitorMode::Min,
            ema_momentum: 0.996,
            mask_ratio: 0.5,
            latent_reg: 0.0,
            corruption: Corruption::Gaussian { sigma: 0.3 },
            flatness_magnitude: 0.1,
            flatness_draws: 8,
            eval_samples: 256,
            probe: ProbeConfig::default(),
        }
    }
}
