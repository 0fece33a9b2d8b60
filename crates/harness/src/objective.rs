use tch::{nn, Device, Kind, Reduction, Tensor};

use repr_core::{ArchConfig, Autoencoder, Jepa, Mlp, ModelKind};

use crate::data::Batch;
use crate::error::{Result, TrainError};
use crate::RunConfig;

/// Evaluation routines a given objective supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalKind {
    LinearProbe,
    Flatness,
    Denoising,
}

#[derive(Debug)]
pub struct StepOutput {
    pub loss: Tensor,
    pub metrics: Vec<(String, f64)>,
}

/// Forward-step strategy the trainer is parameterized over: the loss
/// computation, the applicable evaluations, and any per-step bookkeeping
/// that happens outside the gradient graph.
pub trait Objective {
    /// Compute the scalar loss and auxiliary metrics for one batch.
    fn forward_step(&mut self, batch: &Batch) -> Result<StepOutput>;

    /// Hook called once per step, after the gradient update.
    fn post_step(&mut self) {}

    /// Run the encoder in whatever way this objective defines "the
    /// representation".
    fn encode(&self, inputs: &Tensor) -> Tensor;

    fn evaluations(&self) -> &[EvalKind];

    /// Decoder access for reconstruction-based evaluations.
    fn autoencoder(&self) -> Option<&Autoencoder> {
        None
    }

    /// Variables the optimizer updates.
    fn var_store(&self) -> &nn::VarStore;

    /// Named parameter groups a checkpoint must carry. The first group is
    /// always the optimized one.
    fn var_groups(&self) -> Vec<(&'static str, &nn::VarStore)> {
        vec![("model", self.var_store())]
    }
}

/// Blend the target parameters toward the online ones:
/// `target <- momentum * target + (1 - momentum) * online`, matched by
/// variable name, outside the gradient graph.
pub fn ema_update(target: &nn::VarStore, online: &nn::VarStore, momentum: f64) {
    let online_vars = online.variables();
    tch::no_grad(|| {
        for (name, mut tgt) in target.variables() {
            if let Some(src) = online_vars.get(&name) {
                let blended = &tgt * momentum + src.detach() * (1.0 - momentum);
                tgt.copy_(&blended);
            }
        }
    });
}

fn check_inputs(inputs: &Tensor, input_dim: i64) -> Result<()> {
    let size = inputs.size();
    if size.len() < 2 || size[0] == 0 {
        return Err(TrainError::Data(format!(
            "expected a [batch, features] tensor, got {:?}",
            size
        )));
    }
    if size[size.len() - 1] != input_dim {
        return Err(TrainError::Data(format!(
            "expected feature dimension {}, got {:?}",
            input_dim, size
        )));
    }
    Ok(())
}

/// Reconstruction objective: MSE between input and decoded output, plus an
/// optional L2 penalty on the latent code.
pub struct AutoencoderObjective {
    vs: nn::VarStore,
    model: Autoencoder,
    latent_reg: f64,
}

impl AutoencoderObjective {
    pub fn new(arch: &ArchConfig, latent_reg: f64, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let model = Autoencoder::new(&vs.root(), arch);
        Self {
            vs,
            model,
            latent_reg,
        }
    }
}

impl Objective for AutoencoderObjective {
    fn forward_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        check_inputs(&batch.inputs, self.model.config.input_dim)?;
        let x = batch
            .inputs
            .to_device(self.vs.device())
            .totype(Kind::Float);
        let z = self.model.encode(&x);
        let recon = self.model.decode(&z);
        let recon_loss = recon.mse_loss(&x, Reduction::Mean);
        let recon_val = recon_loss.double_value(&[]);
        let loss = if self.latent_reg > 0.0 {
            recon_loss + z.square().mean(Kind::Float) * self.latent_reg
        } else {
            recon_loss
        };
        Ok(StepOutput {
            loss,
            metrics: vec![("recon_loss".to_string(), recon_val)],
        })
    }

    fn encode(&self, inputs: &Tensor) -> Tensor {
        let x = inputs.to_device(self.vs.device()).totype(Kind::Float);
        self.model.encode(&x)
    }

    fn evaluations(&self) -> &[EvalKind] {
        &[EvalKind::LinearProbe, EvalKind::Flatness, EvalKind::Denoising]
    }

    fn autoencoder(&self) -> Option<&Autoencoder> {
        Some(&self.model)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

/// Latent prediction objective: mask the input to form a context view,
/// predict the target encoder's latent of the clean view, and regress on
/// it in latent space. The target encoder tracks the online one by EMA.
pub struct JepaObjective {
    vs: nn::VarStore,
    model: Jepa,
    target_vs: nn::VarStore,
    target: Mlp,
    momentum: f64,
    mask_ratio: f64,
}

impl JepaObjective {
    pub fn new(arch: &ArchConfig, momentum: f64, mask_ratio: f64, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let model = Jepa::new(&vs.root(), arch);
        let mut target_vs = nn::VarStore::new(device);
        let target = Jepa::encoder_only(&target_vs.root(), arch);
        // The target starts as an exact copy of the online encoder.
        let online_vars = vs.variables();
        tch::no_grad(|| {
            for (name, mut tgt) in target_vs.variables() {
                if let Some(src) = online_vars.get(&name) {
                    tgt.copy_(&src.detach());
                }
            }
        });
        target_vs.freeze();
        Self {
            vs,
            model,
            target_vs,
            target,
            momentum,
            mask_ratio,
        }
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn target_vs(&self) -> &nn::VarStore {
        &self.target_vs
    }
}

impl Objective for JepaObjective {
    fn forward_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        check_inputs(&batch.inputs, self.model.config.input_dim)?;
        let x = batch
            .inputs
            .to_device(self.vs.device())
            .totype(Kind::Float);
        // Context view: zero out a random subset of input features.
        let keep = x
            .rand_like()
            .ge(self.mask_ratio)
            .totype(Kind::Float);
        let context = &x * &keep;
        let predicted = self.model.predict(&self.model.encode(&context));
        let target = tch::no_grad(|| self.target.forward(&x)).detach();
        let loss = predicted.mse_loss(&target, Reduction::Mean);
        let loss_val = loss.double_value(&[]);
        Ok(StepOutput {
            loss,
            metrics: vec![("pred_loss".to_string(), loss_val)],
        })
    }

    fn post_step(&mut self) {
        ema_update(&self.target_vs, &self.vs, self.momentum);
    }

    fn encode(&self, inputs: &Tensor) -> Tensor {
        let x = inputs.to_device(self.vs.device()).totype(Kind::Float);
        self.model.encode(&x)
    }

    fn evaluations(&self) -> &[EvalKind] {
        &[EvalKind::LinearProbe]
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_groups(&self) -> Vec<(&'static str, &nn::VarStore)> {
        vec![("model", &self.vs), ("target", &self.target_vs)]
    }
}

/// Build the objective a run configuration asks for.
pub fn build_objective(run: &RunConfig, device: Device) -> Box<dyn Objective> {
    match run.model {
        ModelKind::Autoencoder => Box::new(AutoencoderObjective::new(
            &run.arch,
            run.latent_reg,
            device,
        )),
        ModelKind::Jepa => Box::new(JepaObjective::new(
            &run.arch,
            run.ema_momentum,
            run.mask_ratio,
            device,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arch() -> ArchConfig {
        ArchConfig {
            input_dim: 8,
            latent_dim: 3,
            hidden_dims: vec![6],
            ..Default::default()
        }
    }

    fn batch(n: i64, dim: i64) -> Batch {
        Batch {
            inputs: Tensor::randn(&[n, dim], (Kind::Float, Device::Cpu)),
            labels: None,
        }
    }

    #[test]
    fn autoencoder_step_produces_finite_loss() {
        let mut obj = AutoencoderObjective::new(&small_arch(), 0.01, Device::Cpu);
        let out = obj.forward_step(&batch(4, 8)).unwrap();
        assert!(out.loss.double_value(&[]).is_finite());
        assert_eq!(out.metrics[0].0, "recon_loss");
    }

    #[test]
    fn rank_three_inputs_flow_through_the_autoencoder() {
        let mut obj = AutoencoderObjective::new(&small_arch(), 0.0, Device::Cpu);
        let inputs = Tensor::randn(&[2, 3, 8], (Kind::Float, Device::Cpu));
        let out = obj
            .forward_step(&Batch {
                inputs: inputs.shallow_clone(),
                labels: None,
            })
            .unwrap();
        assert!(out.loss.double_value(&[]).is_finite());
        // Linear layers act on the last dimension; leading dims pass through.
        assert_eq!(obj.encode(&inputs).size(), vec![2, 3, 3]);
    }

    #[test]
    fn wrong_feature_dimension_is_a_data_error() {
        let mut obj = AutoencoderObjective::new(&small_arch(), 0.0, Device::Cpu);
        let err = obj.forward_step(&batch(4, 5)).unwrap_err();
        assert!(matches!(err, TrainError::Data(_)));
    }

    #[test]
    fn jepa_target_starts_equal_to_online_encoder() {
        let obj = JepaObjective::new(&small_arch(), 0.99, 0.5, Device::Cpu);
        let online = obj.var_store().variables();
        for (name, tgt) in obj.target_vs().variables() {
            let diff = (&tgt - &online[&name]).abs().max().double_value(&[]);
            assert!(diff < 1e-7, "{} differs by {}", name, diff);
        }
    }

    #[test]
    fn ema_update_is_the_exact_momentum_blend() {
        let arch = small_arch();
        let obj = JepaObjective::new(&arch, 0.9, 0.5, Device::Cpu);
        let momentum = 0.75;

        // Move the online encoder away from the target first.
        let online_vars = obj.var_store().variables();
        tch::no_grad(|| {
            for (_, mut var) in obj.var_store().variables() {
                let shifted = &var + 1.0;
                var.copy_(&shifted);
            }
        });

        let before: Vec<(String, Tensor)> = obj
            .target_vs()
            .variables()
            .into_iter()
            .map(|(n, t)| (n, t.copy()))
            .collect();

        ema_update(obj.target_vs(), obj.var_store(), momentum);

        for (name, old) in before {
            let online = &online_vars[&name];
            let expected = &old * momentum + online.detach() * (1.0 - momentum);
            let actual = obj.target_vs().variables()[&name].copy();
            let diff = (actual - expected).abs().max().double_value(&[]);
            assert!(diff < 1e-6, "{} off by {}", name, diff);
        }
    }

    #[test]
    fn jepa_step_and_post_step_run() {
        let mut obj = JepaObjective::new(&small_arch(), 0.99, 0.25, Device::Cpu);
        let out = obj.forward_step(&batch(4, 8)).unwrap();
        assert!(out.loss.double_value(&[]).is_finite());
        obj.post_step();
    }
}
