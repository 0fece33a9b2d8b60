use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    /// A malformed or unreadable batch. Recoverable: the trainer logs it
    /// and skips the batch.
    #[error("bad batch: {0}")]
    Data(String),

    /// Non-finite loss. Fatal: the trainer saves an emergency checkpoint
    /// and aborts the run.
    #[error("non-finite loss at epoch {epoch}, step {step} (see checkpoint tag '{tag}')")]
    Divergence { epoch: u64, step: u64, tag: String },

    #[error("no checkpoint for run '{run_id}' with tag '{tag}'")]
    CheckpointNotFound { run_id: String, tag: String },

    #[error("corrupt checkpoint for run '{run_id}' with tag '{tag}': {reason}")]
    CheckpointCorrupt {
        run_id: String,
        tag: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tensor IO error: {0}")]
    TensorIo(#[from] repr_core::TensorIoError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
