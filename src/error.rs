//! Pipeline-level error taxonomy.
//!
//! Transient conditions (`BufEmpty`, timeouts) are absorbed and retried at
//! the call site and never cross module boundaries; everything that does
//! cross a boundary is one of the kinds below.

use thiserror::Error;

use crate::detect::DetectError;
use crate::hw::HwError;

#[derive(Debug, Error)]
pub enum MediaError {
    /// A hardware domain refused to enable or was lost mid-run.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// A pool or queue ran out of capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Non-blocking acquire found no free block.
    #[error("operation would block")]
    WouldBlock,

    /// The NPU refused the model; any previous detector stays active.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// Scaler channel reconfiguration failed after a model swap; the
    /// detector has been unloaded.
    #[error("detector input reconfiguration failed: {0}")]
    ResizeFailed(String),

    /// The freshly constructed pipeline refused to start.
    #[error("pipeline start failed: {0}")]
    StartFailed(String),

    /// Observed on blocking primitives during shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Bad JSON or an unknown command type.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// A consumer callback failed; isolated to that consumer's worker.
    #[error("consumer '{name}' failed: {reason}")]
    Peer { name: String, reason: String },

    /// The requested operation does not apply in the current mode.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The manager is degraded and refuses pipeline work.
    #[error("degraded: {0}")]
    Degraded(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

impl From<HwError> for MediaError {
    fn from(e: HwError) -> Self {
        match e {
            HwError::Exhausted => MediaError::ResourceExhausted("hardware buffer pool".into()),
            other => MediaError::HardwareUnavailable(other.to_string()),
        }
    }
}

impl From<DetectError> for MediaError {
    fn from(e: DetectError) -> Self {
        MediaError::ModelLoad(e.to_string())
    }
}
