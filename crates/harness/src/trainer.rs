use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tch::{Device, Kind, Tensor};

use repr_core::tensor_io;

use crate::checkpoint::{CheckpointManager, StateSnapshot, Tag};
use crate::data::{DataSource, Split};
use crate::error::{Result, TrainError};
use crate::eval::{collect_inputs, denoising_quality, extract_latents, flatness, linear_probe};
use crate::logger::MetricLogger;
use crate::objective::{EvalKind, Objective};
use crate::optim::{LrSchedule, Optimizer};
use crate::RunConfig;

/// The mutable part of a run that checkpoints carry besides tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainState {
    pub epoch: u64,
    pub global_step: u64,
    pub seed: u64,
}

/// Per-epoch running means of the step metrics.
#[derive(Default)]
struct MetricAgg {
    sums: BTreeMap<String, (f64, u64)>,
}

impl MetricAgg {
    fn add(&mut self, name: &str, value: f64) {
        let entry = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    fn means(&self) -> Vec<(String, f64)> {
        self.sums
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(name, (sum, count))| (name.clone(), sum / *count as f64))
            .collect()
    }
}

/// Owns the epoch/step loop, the gradient update cycle, evaluation
/// scheduling, metric aggregation and checkpoint triggering. The
/// model-specific behavior comes in through the `Objective` strategy.
pub struct Trainer {
    run: RunConfig,
    objective: Box<dyn Objective>,
    optimizer: Optimizer,
    schedule: LrSchedule,
    logger: Box<dyn MetricLogger>,
    checkpoints: CheckpointManager,
    state: TrainState,
    device: Device,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(
        run: RunConfig,
        objective: Box<dyn Objective>,
        logger: Box<dyn MetricLogger>,
        device: Device,
    ) -> Result<Self> {
        let checkpoints =
            CheckpointManager::new(&run.checkpoint_dir, &run.run_id, run.monitor_mode)?;
        let optimizer = Optimizer::new(run.optimizer.clone());
        let schedule = LrSchedule::new(run.schedule.clone(), run.optimizer.base_lr());
        let state = TrainState {
            epoch: 0,
            global_step: 0,
            seed: run.seed,
        };
        Ok(Self {
            run,
            objective,
            optimizer,
            schedule,
            logger,
            checkpoints,
            state,
            device,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn objective(&self) -> &dyn Objective {
        self.objective.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Flag for cooperative cancellation: once set, the current step
    /// completes, a `latest` checkpoint is written, and `fit` returns.
    /// The checkpoint sits mid-epoch; resuming from it restarts the
    /// interrupted epoch from its first batch, replaying the steps taken
    /// before the stop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the epoch loop up to `num_epochs`, continuing from the current
    /// state (zero for a fresh trainer, the restored epoch after
    /// `resume`).
    pub fn fit(&mut self, data: &dyn DataSource, num_epochs: u64) -> Result<()> {
        if self.state.epoch >= num_epochs {
            log::info!(
                "run '{}' already at epoch {}, nothing to do",
                self.run.run_id,
                self.state.epoch
            );
            return Ok(());
        }
        for epoch in self.state.epoch..num_epochs {
            // One deterministic stream per (seed, epoch): a resume from an
            // epoch boundary replays the same shuffles and noise draws.
            let epoch_seed = self
                .state
                .seed
                .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            tch::manual_seed(epoch_seed as i64);

            let mut agg = MetricAgg::default();
            let mut interrupted = false;
            let mut batch_index = 0usize;
            for item in data.batches(Split::Train, self.run.batch_size, Some(epoch_seed)) {
                batch_index += 1;
                let batch = match item {
                    Ok(batch) => batch,
                    Err(TrainError::Data(reason)) => {
                        log::warn!(
                            "skipping unreadable batch {} in epoch {}: {}",
                            batch_index,
                            epoch,
                            reason
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let out = match self.objective.forward_step(&batch) {
                    Ok(out) => out,
                    Err(TrainError::Data(reason)) => {
                        log::warn!(
                            "skipping malformed batch {} in epoch {}: {}",
                            batch_index,
                            epoch,
                            reason
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let loss_value = out.loss.double_value(&[]);
                if !loss_value.is_finite() {
                    let tag = Tag::Diverged;
                    log::error!(
                        "loss {} at epoch {}, step {} (batch {}); saving '{}' checkpoint and aborting",
                        loss_value,
                        epoch,
                        self.state.global_step,
                        batch_index,
                        tag
                    );
                    let snapshot = self.snapshot();
                    self.checkpoints.save(&snapshot, tag)?;
                    self.logger.finish();
                    return Err(TrainError::Divergence {
                        epoch,
                        step: self.state.global_step,
                        tag: tag.as_str().to_string(),
                    });
                }

                let lr = self.schedule.lr(self.state.global_step);
                self.optimizer.backward_step(
                    &out.loss,
                    self.objective.var_store(),
                    lr,
                    self.run.grad_clip,
                )?;
                self.objective.post_step();
                self.state.global_step += 1;

                agg.add("loss", loss_value);
                for (name, value) in &out.metrics {
                    agg.add(name, *value);
                }
                if self.run.log_every > 0 && self.state.global_step % self.run.log_every == 0 {
                    self.logger
                        .log_scalar("train/loss", loss_value, self.state.global_step);
                    self.logger.log_scalar("train/lr", lr, self.state.global_step);
                }

                if self.stop.load(Ordering::Relaxed) {
                    interrupted = true;
                    break;
                }
            }

            if interrupted {
                log::info!(
                    "stop requested; saving 'latest' at epoch {}, step {}",
                    epoch,
                    self.state.global_step
                );
                let snapshot = self.snapshot();
                self.checkpoints.save(&snapshot, Tag::Latest)?;
                self.logger.finish();
                return Ok(());
            }

            self.state.epoch = epoch + 1;
            let means = agg.means();
            for (name, mean) in &means {
                self.logger.log_scalar(
                    &format!("train/{}_epoch", name),
                    *mean,
                    self.state.global_step,
                );
            }
            if let Some((_, mean_loss)) = means.iter().find(|(name, _)| name == "loss") {
                log::info!("epoch {} | mean loss {:.6}", epoch, mean_loss);
            }

            if self.run.eval_every > 0 && (epoch + 1) % self.run.eval_every == 0 {
                if data.num_samples(Split::Val) == 0 {
                    log::warn!("no validation samples; skipping scheduled evaluation");
                } else {
                    let metrics = self.evaluate(data, Split::Val)?;
                    match metrics.iter().find(|(name, _)| *name == self.run.monitor) {
                        Some((_, value)) => {
                            let snapshot = self.snapshot();
                            if self.checkpoints.update_best(&snapshot, *value)? {
                                log::info!(
                                    "monitored metric '{}' improved to {:.6}",
                                    self.run.monitor,
                                    value
                                );
                            }
                        }
                        None => log::warn!(
                            "monitored metric '{}' not produced by evaluation",
                            self.run.monitor
                        ),
                    }
                }
            }

            if self.run.checkpoint_every > 0 && (epoch + 1) % self.run.checkpoint_every == 0 {
                let snapshot = self.snapshot();
                self.checkpoints.save(&snapshot, Tag::Latest)?;
            }
        }

        // A finished run is always resumable and inspectable.
        let snapshot = self.snapshot();
        self.checkpoints.save(&snapshot, Tag::Latest)?;
        self.logger.finish();
        Ok(())
    }

    /// Run the evaluation protocol on a split with the current model in
    /// inference mode, log the metrics at the current step, and return
    /// them. Blocking relative to training.
    pub fn evaluate(&mut self, data: &dyn DataSource, split: Split) -> Result<Vec<(String, f64)>> {
        let prefix = split.as_str();
        let mut results: Vec<(String, f64)> = Vec::new();

        let mut loss_sum = 0.0;
        let mut batches = 0u64;
        for item in data.batches(split, self.run.batch_size, None) {
            let batch = match item {
                Ok(batch) => batch,
                Err(TrainError::Data(reason)) => {
                    log::warn!("skipping unreadable eval batch: {}", reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match tch::no_grad(|| self.objective.forward_step(&batch)) {
                Ok(out) => {
                    loss_sum += out.loss.double_value(&[]);
                    batches += 1;
                }
                Err(TrainError::Data(reason)) => {
                    log::warn!("skipping malformed eval batch: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
        if batches > 0 {
            results.push((format!("{}/loss", prefix), loss_sum / batches as f64));
        }

        let cache = extract_latents(self.objective.as_ref(), data, split, self.run.batch_size)?;
        let kinds: Vec<EvalKind> = self.objective.evaluations().to_vec();
        for kind in kinds {
            match kind {
                EvalKind::LinearProbe => {
                    if cache.labels.is_some() {
                        let accuracy = linear_probe(&cache, &self.run.probe, self.device)?;
                        results.push((format!("{}/probe_acc", prefix), accuracy));
                    } else {
                        log::debug!("split '{}' has no labels; skipping linear probe", prefix);
                    }
                }
                EvalKind::Flatness => {
                    if let Some(model) = self.objective.autoencoder() {
                        let samples = eval_samples(data, split, &self.run, self.device)?;
                        let score = flatness(
                            |x| model.encode(x),
                            |z| model.decode(z),
                            &samples,
                            self.run.flatness_magnitude,
                            self.run.flatness_draws,
                        );
                        results.push((format!("{}/flatness_deviation", prefix), score.deviation));
                        results.push((format!("{}/flatness_excess", prefix), score.excess));
                    }
                }
                EvalKind::Denoising => {
                    if let Some(model) = self.objective.autoencoder() {
                        let samples = eval_samples(data, split, &self.run, self.device)?;
                        let mse = denoising_quality(model, &samples, &self.run.corruption);
                        results.push((format!("{}/denoising_mse", prefix), mse));
                    }
                }
            }
        }

        for (name, value) in &results {
            self.logger.log_scalar(name, *value, self.state.global_step);
        }
        Ok(results)
    }

    /// Restore training state from a checkpoint; later `fit` calls
    /// continue from the restored epoch.
    pub fn resume(&mut self, tag: Tag) -> Result<()> {
        let loaded = self.checkpoints.load(tag)?;
        let corrupt = |reason: String| TrainError::CheckpointCorrupt {
            run_id: self.run.run_id.clone(),
            tag: tag.as_str().to_string(),
            reason,
        };
        if loaded.meta.arch != self.run.arch {
            return Err(corrupt(
                "stored architecture does not match the run configuration".to_string(),
            ));
        }
        for (group, vs) in self.objective.var_groups() {
            tensor_io::load_into_varstore(vs, &loaded.tensors, &format!("{}/", group))
                .map_err(|e| corrupt(e.to_string()))?;
        }
        self.optimizer
            .load_state(&loaded.tensors, self.device, loaded.meta.optim_step);
        self.state = TrainState {
            epoch: loaded.meta.epoch,
            global_step: loaded.meta.global_step,
            seed: loaded.meta.seed,
        };
        self.checkpoints.set_best(loaded.meta.best_metric);
        log::info!(
            "resumed run '{}' from '{}' at epoch {}, step {}",
            self.run.run_id,
            tag,
            self.state.epoch,
            self.state.global_step
        );
        Ok(())
    }

    /// Deep-copy everything a checkpoint persists. Taken before the write
    /// so the save never races the next step's mutations.
    fn snapshot(&self) -> StateSnapshot {
        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for (group, vs) in self.objective.var_groups() {
            for (name, var) in vs.variables() {
                let copied = tch::no_grad(|| var.detach().copy()).to_device(Device::Cpu);
                tensors.push((format!("{}/{}", group, name), copied));
            }
        }
        for (name, tensor) in self.optimizer.state_tensors() {
            let copied = tch::no_grad(|| tensor.detach().copy()).to_device(Device::Cpu);
            tensors.push((name, copied));
        }
        StateSnapshot {
            epoch: self.state.epoch,
            global_step: self.state.global_step,
            optim_step: self.optimizer.step_count(),
            best_metric: self.checkpoints.best(),
            seed: self.state.seed,
            arch: self.run.arch.clone(),
            tensors,
        }
    }
}

fn eval_samples(
    data: &dyn DataSource,
    split: Split,
    run: &RunConfig,
    device: Device,
) -> Result<Tensor> {
    let samples = collect_inputs(data, split, run.eval_samples, run.batch_size)?;
    Ok(samples.to_device(device).totype(Kind::Float))
}
