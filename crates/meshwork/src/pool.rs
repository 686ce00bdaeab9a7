//! Per-detector GPU buffers.

use std::fmt;

use meshwork_gpu::{Gpu, GpuBuffer, Staging};
use wgpu::{util::DeviceExt, Buffer, BufferUsages};

use crate::{
    nn::{InputTensor, OutputName},
    resources::ColorMapper,
    LandmarkVertex, MeshVertex, EYE_VERTEX_COUNT, IRIS_VERTEX_COUNT, LIPS_VERTEX_COUNT,
    VERTEX_COUNT,
};

/// Identifies one of the 2D landmark sets produced by the attention outputs of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LandmarkSet {
    LeftEye,
    RightEye,
    LeftIris,
    RightIris,
    Lips,
}

impl LandmarkSet {
    pub const ALL: [Self; 5] = [
        Self::LeftEye,
        Self::RightEye,
        Self::LeftIris,
        Self::RightIris,
        Self::Lips,
    ];

    /// Returns the number of landmarks in this set.
    pub fn vertex_count(self) -> usize {
        match self {
            Self::LeftEye | Self::RightEye => EYE_VERTEX_COUNT,
            Self::LeftIris | Self::RightIris => IRIS_VERTEX_COUNT,
            Self::Lips => LIPS_VERTEX_COUNT,
        }
    }

    /// Returns the network output this set is computed from.
    pub fn output(self) -> OutputName {
        match self {
            Self::LeftEye => OutputName::LeftEye,
            Self::RightEye => OutputName::RightEye,
            Self::LeftIris => OutputName::LeftIris,
            Self::RightIris => OutputName::RightIris,
            Self::Lips => OutputName::Lips,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::LeftEye => "left_eye",
            Self::RightEye => "right_eye",
            Self::LeftIris => "left_iris",
            Self::RightIris => "right_iris",
            Self::Lips => "lips",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LandmarkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A landmark buffer and the uniform that tells the kernel how many vertices to write into it.
pub(crate) struct LandmarkSlot {
    pub(crate) buffer: GpuBuffer<LandmarkVertex>,
    pub(crate) params: Buffer,
}

/// All GPU memory owned by one detector.
///
/// Everything is allocated once, at construction time, and released when dropped.
pub(crate) struct FrameBuffers {
    /// The preprocessed `1x192x192x3` input tensor.
    pub(crate) pre_tensor: GpuBuffer<f32>,
    pub(crate) mesh: GpuBuffer<MeshVertex>,
    /// The raw face-presence logit.
    pub(crate) face_flag: GpuBuffer<f32>,
    landmarks: [LandmarkSlot; 5],
    pub(crate) color_map: Buffer,
    pub(crate) mesh_staging: Staging<MeshVertex>,
}

impl FrameBuffers {
    pub(crate) fn new(gpu: &Gpu, color_mapper: &ColorMapper) -> Self {
        let landmarks = LandmarkSet::ALL.map(|set| {
            let count = set.vertex_count() as u32;
            LandmarkSlot {
                buffer: GpuBuffer::new(gpu, set.label(), set.vertex_count()),
                params: uniform(gpu, "postprocess_params", &[count, 0, 0, 0]),
            }
        });

        Self {
            pre_tensor: GpuBuffer::new(
                gpu,
                "pre_tensor",
                InputTensor::SHAPE.iter().product(),
            ),
            mesh: GpuBuffer::new(gpu, "mesh", VERTEX_COUNT),
            face_flag: GpuBuffer::new(gpu, "face_flag", 1),
            landmarks,
            color_map: uniform(gpu, "color_map", &color_mapper.uniform()),
            mesh_staging: Staging::new(gpu, "mesh_readback", VERTEX_COUNT),
        }
    }

    pub(crate) fn landmarks(&self, set: LandmarkSet) -> &LandmarkSlot {
        &self.landmarks[set.index()]
    }
}

fn uniform<T: bytemuck::Pod>(gpu: &Gpu, label: &str, contents: &[T]) -> Buffer {
    gpu.device()
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: BufferUsages::UNIFORM,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn set_sizes() {
        assert_eq!(LandmarkSet::LeftEye.vertex_count(), 71);
        assert_eq!(LandmarkSet::RightEye.vertex_count(), 71);
        assert_eq!(LandmarkSet::LeftIris.vertex_count(), 5);
        assert_eq!(LandmarkSet::RightIris.vertex_count(), 5);
        assert_eq!(LandmarkSet::Lips.vertex_count(), 80);

        for set in LandmarkSet::ALL {
            assert_eq!(set.output().min_len(), set.vertex_count() * 2);
            assert_eq!(LandmarkSet::ALL[set.index()], set);
        }
    }

    #[test]
    fn allocation() {
        let Some(gpu) = test::gpu() else { return };

        let buffers = FrameBuffers::new(gpu, &ColorMapper::default());
        assert_eq!(buffers.pre_tensor.len(), 192 * 192 * 3);
        assert_eq!(buffers.mesh.len(), 468);
        assert_eq!(buffers.mesh.stride(), 16);
        assert_eq!(buffers.face_flag.len(), 1);
        assert_eq!(buffers.mesh_staging.len(), 468);
        for set in LandmarkSet::ALL {
            let slot = buffers.landmarks(set);
            assert_eq!(slot.buffer.len(), set.vertex_count());
            assert_eq!(slot.buffer.stride(), 8);
        }
    }
}
