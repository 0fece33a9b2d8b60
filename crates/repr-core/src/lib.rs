pub mod autoencoder;
pub mod config;
pub mod error;
pub mod jepa;
pub mod mlp;
pub mod tensor_io;

pub use autoencoder::Autoencoder;
pub use config::{Activation, ArchConfig, ModelKind};
pub use error::TensorIoError;
pub use jepa::Jepa;
pub use mlp::Mlp;
