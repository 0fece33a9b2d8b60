use tch::{nn, Tensor};

use crate::config::ArchConfig;
use crate::mlp::Mlp;

/// Online half of a joint-embedding predictive architecture: an encoder
/// plus a predictor head that maps a context latent to a predicted target
/// latent. The target encoder is a separate parameter set owned by the
/// training side (it is updated by EMA, not by gradients).
pub struct Jepa {
    encoder: Mlp,
    predictor: Mlp,
    pub config: ArchConfig,
}

impl Jepa {
    pub fn new(vs: &nn::Path, config: &ArchConfig) -> Self {
        let encoder = Mlp::new(&(vs / "encoder"), &config.encoder_dims(), config.activation);
        let predictor = Mlp::new(&(vs / "predictor"), &config.predictor_dims(), config.activation);
        Self {
            encoder,
            predictor,
            config: config.clone(),
        }
    }

    /// Build a bare encoder under the same `encoder` sub-path, so its
    /// variable names line up with the online encoder's. Used for the
    /// EMA target encoder.
    pub fn encoder_only(vs: &nn::Path, config: &ArchConfig) -> Mlp {
        Mlp::new(&(vs / "encoder"), &config.encoder_dims(), config.activation)
    }

    pub fn encode(&self, x: &Tensor) -> Tensor {
        self.encoder.forward(x)
    }

    pub fn predict(&self, z: &Tensor) -> Tensor {
        self.predictor.forward(z)
    }
}

unsafe impl Send for Jepa {}
unsafe impl Sync for Jepa {}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn prediction_stays_in_latent_space() {
        let cfg = ArchConfig {
            input_dim: 10,
            latent_dim: 4,
            hidden_dims: vec![6],
            ..Default::default()
        };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Jepa::new(&vs.root(), &cfg);
        let x = Tensor::randn(&[7, 10], (Kind::Float, Device::Cpu));
        let z = model.encode(&x);
        assert_eq!(z.size(), vec![7, 4]);
        assert_eq!(model.predict(&z).size(), vec![7, 4]);
    }

    #[test]
    fn target_encoder_names_match_online_encoder() {
        let cfg = ArchConfig {
            input_dim: 10,
            latent_dim: 4,
            hidden_dims: vec![6],
            ..Default::default()
        };
        let online = nn::VarStore::new(Device::Cpu);
        let _model = Jepa::new(&online.root(), &cfg);
        let target = nn::VarStore::new(Device::Cpu);
        let _enc = Jepa::encoder_only(&target.root(), &cfg);

        let online_vars = online.variables();
        for name in target.variables().keys() {
            assert!(online_vars.contains_key(name), "missing {}", name);
        }
    }
}
