use serde::{Deserialize, Serialize};

/// Which model family a run trains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Autoencoder,
    Jepa,
}

/// Componentwise nonlinearity used between MLP layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchConfig {
    /// Dimension of the (flattened) input vectors.
    pub input_dim: i64,
    /// Dimension of the latent bottleneck.
    pub latent_dim: i64,
    /// Hidden layer widths of the encoder; the decoder mirrors them.
    pub hidden_dims: Vec<i64>,
    /// Nonlinearity applied between layers (never after the last one).
    pub activation: Activation,
    /// Hidden width of the JEPA predictor head.
    pub predictor_hidden: i64,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            input_dim: 1024,
            latent_dim: 64,
            hidden_dims: vec![256],
            activation: Activation::Tanh,
            predictor_hidden: 128,
        }
    }
}

impl ArchConfig {
    /// Layer widths of the encoder, input to latent.
    pub fn encoder_dims(&self) -> Vec<i64> {
        let mut dims = vec![self.input_dim];
        dims.extend_from_slice(&self.hidden_dims);
        dims.push(self.latent_dim);
        dims
    }

    /// Layer widths of the decoder, latent back to input.
    pub fn decoder_dims(&self) -> Vec<i64> {
        let mut dims = self.encoder_dims();
        dims.reverse();
        dims
    }

    /// Layer widths of the JEPA predictor (latent to latent).
    pub fn predictor_dims(&self) -> Vec<i64> {
        vec![self.latent_dim, self.predictor_hidden, self.latent_dim]
    }
}
