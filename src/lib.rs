//! RayVox Frame Engine
//!
//! Explicit GPU command submission and frame synchronization for a voxel
//! renderer:
//! 1. Queues of recorded GPU work, each tracked by a fence
//! 2. An arena of GPU resources with one authoritative state table
//! 3. A swap chain whose back buffers are only touched once their frame slot
//!    has been released by the GPU
//! 4. A frame driver tying the above into a record/submit/present cycle
//!
//! Direct3D 12 backs the engine on Windows; a deterministic simulated device
//! is available everywhere and drives the headless mode and the tests.

pub mod camera;
pub mod config;
pub mod constant_buffer;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod fence;
pub mod frame;
pub mod gpu;
pub mod input;
pub mod queue;
pub mod resource;
pub mod shader;
pub mod swapchain;
#[cfg(windows)]
pub mod window;

pub use context::GpuContext;
pub use error::{EngineError, Result};
pub use frame::{FrameDriver, FrameReport, FrameSettings, RenderMode};
pub use gpu::GpuDevice;
