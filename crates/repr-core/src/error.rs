use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("tensor '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("no stored tensor for variable '{0}'")]
    MissingVariable(String),
}

pub type Result<T> = std::result::Result<T, TensorIoError>;
