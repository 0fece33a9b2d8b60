use tch::{nn, Tensor};

use crate::config::Activation;

/// Plain fully-connected stack. The activation sits between layers but is
/// not applied after the last one, so outputs stay unbounded.
pub struct Mlp {
    layers: Vec<nn::Linear>,
    activation: Activation,
}

impl Mlp {
    pub fn new(vs: &nn::Path, dims: &[i64], activation: Activation) -> Self {
        let mut layers = Vec::new();
        for i in 0..dims.len().saturating_sub(1) {
            layers.push(nn::linear(
                vs / "l" / (i as i64),
                dims[i],
                dims[i + 1],
                Default::default(),
            ));
        }
        Self { layers, activation }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let last = self.layers.len().saturating_sub(1);
        let mut x = x.shallow_clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = x.apply(layer);
            if i < last {
                x = match self.activation {
                    Activation::Relu => x.relu(),
                    Activation::Tanh => x.tanh(),
                    Activation::Identity => x,
                };
            }
        }
        x
    }
}

unsafe impl Send for Mlp {}
unsafe impl Sync for Mlp {}
