//! GPU-resident face landmark estimation.
//!
//! This crate runs the MediaPipe face landmark network (the variant with attention outputs for
//! eyes, irises and lips) over an input image. Preprocessing, inference outputs and postprocessing
//! all stay in GPU memory; the only mandatory CPU synchronization point is the optional readback
//! of the main mesh via [`Detector::vertex_array`].
//!
//! # Pipeline
//!
//! 1. The preprocessing kernel samples the input texture into a `192x192x3` tensor.
//! 2. The [`nn::Worker`] created from the [`nn::ModelGraph`] runs the network.
//! 3. The postprocessing kernel reshapes each raw output into a typed vertex buffer. The
//!    face-presence flag is copied without a kernel.
//!
//! # Coordinates
//!
//! Landmarks are normalized to the network input: X and Y are in range `0.0..=1.0` relative to
//! the (stretched) input image, with X pointing to the right and Y pointing *up*. Z uses the same
//! scale as X. Mesh vertices carry `1.0` as their fourth component.
//!
//! # Environment Variables
//!
//! * `MESHWORK_GPU_BACKEND`: see [`meshwork_gpu`].
//! * `RUST_LOG`: overrides the log filter installed by [`init_logger!`].

use log::LevelFilter;

mod detector;
mod error;
pub mod nn;
mod num;
mod pool;
mod postprocess;
mod preprocess;
mod readback;
mod resources;
pub mod timer;

#[cfg(test)]
mod test;

pub use detector::Detector;
pub use error::{Error, ErrorKind};
pub use meshwork_gpu::{AsTexture, Gpu, GpuBuffer, GpuError, Image};
pub use num::sigmoid;
pub use pool::LandmarkSet;
pub use resources::{
    ColorMapper, PostprocessKernel, PreprocessKernel, ResourceSet, ResourceSetBuilder,
};

/// Width and height of the network's input image.
pub const IMAGE_SIZE: u32 = 192;

/// Number of vertices in the main face mesh.
pub const VERTEX_COUNT: usize = 468;

/// Number of landmarks per eye contour.
pub const EYE_VERTEX_COUNT: usize = 71;

/// Number of landmarks per iris.
pub const IRIS_VERTEX_COUNT: usize = 5;

/// Number of lip landmarks.
pub const LIPS_VERTEX_COUNT: usize = 80;

/// A main mesh vertex: `[x, y, z, 1.0]`.
pub type MeshVertex = [f32; 4];

/// An auxiliary landmark: `[x, y]`.
pub type LandmarkVertex = [f32; 2];

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("meshwork_gpu"), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and meshwork will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// `wgpu` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
