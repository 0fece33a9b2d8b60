use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimConfig {
    Sgd {
        lr: f64,
        momentum: f64,
    },
    Adamw {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
    },
}

impl OptimConfig {
    pub fn base_lr(&self) -> f64 {
        match self {
            OptimConfig::Sgd { lr, .. } => *lr,
            OptimConfig::Adamw { lr, .. } => *lr,
        }
    }
}

impl Default for OptimConfig {
    fn default() -> Self {
        OptimConfig::Adamw {
            lr: 3e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScheduleConfig {
    Constant,
    Warmup {
        warmup_steps: u64,
    },
    WarmupCosine {
        warmup_steps: u64,
        total_steps: u64,
        min_factor: f64,
    },
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig::Constant
    }
}

/// Learning rate as a function of the global step.
pub struct LrSchedule {
    config: ScheduleConfig,
    base_lr: f64,
}

impl LrSchedule {
    pub fn new(config: ScheduleConfig, base_lr: f64) -> Self {
        Self { config, base_lr }
    }

    pub fn lr(&self, step: u64) -> f64 {
        match self.config {
            ScheduleConfig::Constant => self.base_lr,
            ScheduleConfig::Warmup { warmup_steps } => {
                if warmup_steps == 0 || step >= warmup_steps {
                    self.base_lr
                } else {
                    self.base_lr * (step + 1) as f64 / warmup_steps as f64
                }
            }
            ScheduleConfig::WarmupCosine {
                warmup_steps,
                total_steps,
                min_factor,
            } => {
                if step < warmup_steps {
                    return self.base_lr * (step + 1) as f64 / warmup_steps.max(1) as f64;
                }
                let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                let progress = ((step - warmup_steps) as f64 / span).min(1.0);
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                self.base_lr * (min_factor + (1.0 - min_factor) * cosine)
            }
        }
    }
}

struct Slot {
    m: Tensor,
    v: Option<Tensor>,
}

/// Optimizer over the named variables of a VarStore. The per-parameter
/// state lives in a name-keyed slot map so checkpoints can carry it; the
/// built-in `nn::Optimizer` cannot export its moments, which would break
/// resume.
pub struct Optimizer {
    config: OptimConfig,
    step: u64,
    slots: HashMap<String, Slot>,
}

impl Optimizer {
    pub fn new(config: OptimConfig) -> Self {
        Self {
            config,
            step: 0,
            slots: HashMap::new(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Zero grads, backprop the loss, optionally clip by global norm, and
    /// apply one update at the given learning rate.
    pub fn backward_step(
        &mut self,
        loss: &Tensor,
        vs: &nn::VarStore,
        lr: f64,
        clip_norm: Option<f64>,
    ) -> Result<()> {
        self.zero_grad(vs);
        loss.backward();
        if let Some(max_norm) = clip_norm {
            clip_grad_norm(vs, max_norm);
        }
        self.step += 1;
        self.apply(vs, lr);
        Ok(())
    }

    fn zero_grad(&self, vs: &nn::VarStore) {
        for (_, var) in vs.variables() {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    fn apply(&mut self, vs: &nn::VarStore, lr: f64) {
        let config = self.config.clone();
        let t = self.step as i32;
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = grad.detach();
                match config {
                    OptimConfig::Sgd { momentum, .. } => {
                        let slot = self.slots.entry(name).or_insert_with(|| Slot {
                            m: var.zeros_like(),
                            v: None,
                        });
                        let buf = &slot.m * momentum + &grad;
                        slot.m.copy_(&buf);
                        let updated = &var - &buf * lr;
                        var.copy_(&updated);
                    }
                    OptimConfig::Adamw {
                        beta1,
                        beta2,
                        eps,
                        weight_decay,
                        ..
                    } => {
                        let slot = self.slots.entry(name).or_insert_with(|| Slot {
                            m: var.zeros_like(),
                            v: Some(var.zeros_like()),
                        });
                        let m = &slot.m * beta1 + &grad * (1.0 - beta1);
                        slot.m.copy_(&m);
                        let v_slot = slot.v.get_or_insert_with(|| var.zeros_like());
                        let v = &*v_slot * beta2 + grad.square() * (1.0 - beta2);
                        v_slot.copy_(&v);
                        let m_hat = &m / (1.0 - beta1.powi(t));
                        let v_hat = &v / (1.0 - beta2.powi(t));
                        let update = &m_hat / (v_hat.sqrt() + eps) + &var * weight_decay;
                        let updated = &var - update * lr;
                        var.copy_(&updated);
                    }
                }
            }
        });
    }

    /// Export the slot tensors for checkpointing, under `optim/` names.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        for (name, slot) in &self.slots {
            out.push((format!("optim/m/{}", name), slot.m.shallow_clone()));
            if let Some(v) = &slot.v {
                out.push((format!("optim/v/{}", name), v.shallow_clone()));
            }
        }
        out
    }

    /// Rebuild the slot map from checkpointed tensors.
    pub fn load_state(&mut self, tensors: &[(String, Tensor)], device: Device, step: u64) {
        let mut m: HashMap<String, Tensor> = HashMap::new();
        let mut v: HashMap<String, Tensor> = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(key) = name.strip_prefix("optim/m/") {
                m.insert(key.to_string(), tensor.to_device(device));
            } else if let Some(key) = name.strip_prefix("optim/v/") {
                v.insert(key.to_string(), tensor.to_device(device));
            }
        }
        self.slots.clear();
        for (key, m_tensor) in m {
            let v_tensor = v.remove(&key);
            self.slots.insert(
                key,
                Slot {
                    m: m_tensor,
                    v: v_tensor,
                },
            );
        }
        self.step = step;
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
fn clip_grad_norm(vs: &nn::VarStore, max_norm: f64) {
    let mut total_sq = 0.0f64;
    for (_, var) in vs.variables() {
        let grad = var.grad();
        if grad.defined() {
            total_sq += grad.square().sum(Kind::Float).double_value(&[]);
        }
    }
    let norm = total_sq.sqrt();
    if norm > max_norm {
        let coef = max_norm / (norm + 1e-6);
        tch::no_grad(|| {
            for (_, var) in vs.variables() {
                let mut grad = var.grad();
                if grad.defined() {
                    let scaled = &grad * coef;
                    grad.copy_(&scaled);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::Init;

    fn quadratic_var(vs: &nn::VarStore) -> Tensor {
        vs.root().var("w", &[4], Init::Const(2.0))
    }

    #[test]
    fn sgd_descends_a_quadratic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = quadratic_var(&vs);
        let mut opt = Optimizer::new(OptimConfig::Sgd {
            lr: 0.1,
            momentum: 0.0,
        });
        for _ in 0..50 {
            let loss = (&w * &w).sum(Kind::Float);
            opt.backward_step(&loss, &vs, 0.1, None).unwrap();
        }
        let value = (&w * &w).sum(Kind::Float).double_value(&[]);
        assert!(value < 1e-3, "residual {}", value);
    }

    #[test]
    fn adamw_descends_a_quadratic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = quadratic_var(&vs);
        let mut opt = Optimizer::new(OptimConfig::Adamw {
            lr: 0.05,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        });
        let initial = (&w * &w).sum(Kind::Float).double_value(&[]);
        for _ in 0..100 {
            let loss = (&w * &w).sum(Kind::Float);
            opt.backward_step(&loss, &vs, 0.05, Some(5.0)).unwrap();
        }
        let value = (&w * &w).sum(Kind::Float).double_value(&[]);
        assert!(value < initial, "no descent: {} -> {}", initial, value);
    }

    #[test]
    fn state_round_trips_through_tensors() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = quadratic_var(&vs);
        let mut opt = Optimizer::new(OptimConfig::default());
        let loss = (&w * &w).sum(Kind::Float);
        opt.backward_step(&loss, &vs, 1e-3, None).unwrap();

        let state = opt.state_tensors();
        assert_eq!(state.len(), 2);

        let mut fresh = Optimizer::new(OptimConfig::default());
        fresh.load_state(&state, Device::Cpu, opt.step_count());
        assert_eq!(fresh.step_count(), 1);
        assert_eq!(fresh.state_tensors().len(), 2);
    }

    #[test]
    fn warmup_cosine_schedule_is_monotone_after_warmup() {
        let sched = LrSchedule::new(
            ScheduleConfig::WarmupCosine {
                warmup_steps: 10,
                total_steps: 110,
                min_factor: 0.1,
            },
            1.0,
        );
        assert!(sched.lr(0) < sched.lr(9));
        assert!((sched.lr(10) - 1.0).abs() < 1e-9);
        assert!(sched.lr(50) > sched.lr(100));
        assert!((sched.lr(1000) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn clipping_caps_the_global_gradient_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[2], Init::Const(100.0));
        let loss = (&w * &w).sum(Kind::Float);
        let mut opt = Optimizer::new(OptimConfig::Sgd {
            lr: 0.0,
            momentum: 0.0,
        });
        opt.backward_step(&loss, &vs, 0.0, Some(1.0)).unwrap();
        let grad_norm = w
            .grad()
            .square()
            .sum(Kind::Float)
            .double_value(&[])
            .sqrt();
        assert!(grad_norm <= 1.0 + 1e-6);
    }
}
