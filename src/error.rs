//! Engine Error Module
//!
//! Every failure the frame engine can surface. None of these are retried
//! internally: the frame that hit one is abandoned and the error is handed
//! to the outer render loop.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gpu::QueueKind;
use crate::resource::ResourceHandle;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No adapter could create a device, or the backend is unavailable here.
    #[error("device creation failed: {0}")]
    DeviceCreateFailed(String),

    /// The platform rejected the surface, format or buffer count.
    #[error("swap chain creation failed: {0}")]
    SurfaceCreateFailed(String),

    /// Out of memory, a full descriptor heap or an invalid descriptor.
    #[error("resource creation failed: {0}")]
    ResourceCreateFailed(String),

    #[error("fence value {fence_value} not reached within {timeout:?}")]
    SyncTimeout { fence_value: u64, timeout: Duration },

    #[error("shader {path:?} failed to compile: {message}")]
    ShaderCompileFailed { path: PathBuf, message: String },

    /// A recording slot or upload buffer was reused before the GPU released it.
    #[error("{queue:?} slot {slot} still in flight (waiting for fence {fence_value})")]
    BufferStillInFlight {
        queue: QueueKind,
        slot: usize,
        fence_value: u64,
    },

    #[error("resource handle {0:?} no longer refers to a live resource")]
    StaleResource(ResourceHandle),

    /// Any other API failure (present failed, device removed, ...).
    #[error("device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
