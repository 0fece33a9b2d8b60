use tch::{nn, Tensor};

use crate::config::ArchConfig;
use crate::mlp::Mlp;

/// Encoder/decoder pair with a latent bottleneck. The decoder mirrors the
/// encoder's layer widths.
pub struct Autoencoder {
    encoder: Mlp,
    decoder: Mlp,
    pub config: ArchConfig,
}

impl Autoencoder {
    pub fn new(vs: &nn::Path, config: &ArchConfig) -> Self {
        let encoder = Mlp::new(&(vs / "encoder"), &config.encoder_dims(), config.activation);
        let decoder = Mlp::new(&(vs / "decoder"), &config.decoder_dims(), config.activation);
        Self {
            encoder,
            decoder,
            config: config.clone(),
        }
    }

    pub fn encode(&self, x: &Tensor) -> Tensor {
        self.encoder.forward(x)
    }

    pub fn decode(&self, z: &Tensor) -> Tensor {
        self.decoder.forward(z)
    }

    pub fn reconstruct(&self, x: &Tensor) -> Tensor {
        self.decode(&self.encode(x))
    }
}

unsafe impl Send for Autoencoder {}
unsafe impl Sync for Autoencoder {}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn reconstruction_has_input_shape() {
        let cfg = ArchConfig {
            input_dim: 12,
            latent_dim: 3,
            hidden_dims: vec![8],
            ..Default::default()
        };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Autoencoder::new(&vs.root(), &cfg);
        let x = Tensor::randn(&[5, 12], (Kind::Float, Device::Cpu));
        assert_eq!(model.encode(&x).size(), vec![5, 3]);
        assert_eq!(model.reconstruct(&x).size(), vec![5, 12]);
    }
}
