//! GPU plumbing for the meshwork face landmark pipeline.
//!
//! This crate provides the [`Gpu`] context handle, fixed-size typed storage buffers
//! ([`GpuBuffer`]) with explicit CPU readback ([`Staging`]), and sampleable input [`Image`]s.
//!
//! # Environment Variables
//!
//! * `MESHWORK_GPU_BACKEND`: Restricts the graphics backends considered by [`Gpu::open`].
//!   Allowed values are `primary` (the default: Vulkan, Metal, DX12 and WebGPU), `vulkan`,
//!   `metal`, `dx12` and `gl`.
//! * `MESHWORK_REQUIRE_GPU`: When set to `1`, tests that need a graphics adapter fail instead of
//!   being skipped on machines without one. CI runners without a hardware GPU can provide one
//!   with a software Vulkan driver such as lavapipe.

mod buffer;
mod gpu;
mod image;

pub use buffer::{GpuBuffer, Staging};
pub use gpu::Gpu;
pub use image::{AsTexture, Image};

pub use wgpu;

/// Returns whether `MESHWORK_REQUIRE_GPU=1` is set, see the crate docs.
#[doc(hidden)]
pub fn gpu_required() -> bool {
    std::env::var("MESHWORK_REQUIRE_GPU").as_deref() == Ok("1")
}

/// Errors raised while talking to the GPU after it has been opened.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("GPU validation error: {0}")]
    Validation(String),
    #[error("failed to map GPU buffer for reading")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("GPU buffer mapping was aborted before completion")]
    MapAborted,
}
