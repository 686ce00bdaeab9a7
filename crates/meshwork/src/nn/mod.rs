//! Neural network inference.
//!
//! The network math is provided by a [`ModelGraph`] implementation. A graph is immutable and can
//! be shared between any number of detectors; each detector owns exactly one [`Worker`] created
//! from it. Workers run on the detector's GPU queue and expose their named outputs as regions of
//! GPU buffers.
//!
//! [`onnx::OnnxGraph`] is a ready-to-use graph that loads an ONNX file.

pub mod onnx;

use std::fmt;

use meshwork_gpu::{Gpu, GpuBuffer};
use wgpu::{Buffer, BufferAddress};

use crate::{
    error::Error, pool::LandmarkSet, EYE_VERTEX_COUNT, IMAGE_SIZE, IRIS_VERTEX_COUNT,
    LIPS_VERTEX_COUNT, VERTEX_COUNT,
};

/// A loaded, immutable network topology.
pub trait ModelGraph: Send + Sync {
    /// Creates a new [`Worker`] that executes this graph on `gpu`.
    ///
    /// This is called once per detector, at construction time.
    fn create_worker(&self, gpu: &Gpu) -> anyhow::Result<Box<dyn Worker>>;
}

/// A stateful executor bound to one [`ModelGraph`].
pub trait Worker: Send {
    /// Runs the network on `input`.
    ///
    /// GPU work may still be in flight when this returns, as long as it is submitted to the
    /// queue of `gpu`. Later submissions observe the results.
    ///
    /// This is not called inside a validation scope. Implementations should wrap their own GPU
    /// calls in [`Gpu::validate`] and keep CPU work outside of it, since every other user of the
    /// GPU waits while a scope is open. Calling `validate` from within another `validate`
    /// closure deadlocks.
    fn execute(&mut self, gpu: &Gpu, input: InputTensor<'_>) -> anyhow::Result<()>;

    /// Returns the output tensor called `name`, produced by the last call to
    /// [`Worker::execute`].
    ///
    /// Returns [`None`] if the network has no output of that name.
    fn output(&self, name: &str) -> Option<OutputTensor<'_>>;
}

/// The network input: the preprocessed image as a GPU-resident NHWC tensor.
#[derive(Clone, Copy)]
pub struct InputTensor<'a> {
    buffer: &'a GpuBuffer<f32>,
}

impl<'a> InputTensor<'a> {
    pub const SHAPE: [usize; 4] = [1, IMAGE_SIZE as usize, IMAGE_SIZE as usize, 3];

    /// Wraps the pre-tensor buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not hold exactly as many values as [`InputTensor::SHAPE`]
    /// requires.
    #[track_caller]
    pub(crate) fn new(buffer: &'a GpuBuffer<f32>) -> Self {
        assert_eq!(
            buffer.len(),
            Self::SHAPE.iter().product::<usize>(),
            "input tensor buffer does not match shape {:?}",
            Self::SHAPE,
        );
        Self { buffer }
    }

    /// Returns the tensor shape, `[1, 192, 192, 3]`.
    #[inline]
    pub fn shape(&self) -> [usize; 4] {
        Self::SHAPE
    }

    /// Returns the GPU buffer holding the tensor data.
    #[inline]
    pub fn buffer(&self) -> &'a GpuBuffer<f32> {
        self.buffer
    }
}

/// A region of a GPU buffer holding one flat `f32` output tensor.
#[derive(Clone, Copy)]
pub struct OutputTensor<'a> {
    buffer: &'a Buffer,
    offset: BufferAddress,
    len: usize,
}

impl<'a> OutputTensor<'a> {
    /// Describes `len` `f32` values starting at byte `offset` in `buffer`.
    ///
    /// The buffer must have been created with [`wgpu::BufferUsages::COPY_SRC`].
    ///
    /// # Panics
    ///
    /// `offset` must be a multiple of [`wgpu::COPY_BUFFER_ALIGNMENT`].
    #[track_caller]
    pub fn new(buffer: &'a Buffer, offset: BufferAddress, len: usize) -> Self {
        assert_eq!(
            offset % wgpu::COPY_BUFFER_ALIGNMENT,
            0,
            "output tensor offset {offset} is not aligned"
        );
        Self {
            buffer,
            offset,
            len,
        }
    }

    #[inline]
    pub fn buffer(&self) -> &'a Buffer {
        self.buffer
    }

    /// Returns the byte offset of the first value.
    #[inline]
    pub fn offset(&self) -> BufferAddress {
        self.offset
    }

    /// Returns the number of `f32` values in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for OutputTensor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTensor")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// The named outputs of the face landmark network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputName {
    Mesh,
    FaceFlag,
    LeftEye,
    RightEye,
    LeftIris,
    RightIris,
    Lips,
}

impl OutputName {
    pub const ALL: [Self; 7] = [
        Self::Mesh,
        Self::FaceFlag,
        Self::LeftEye,
        Self::RightEye,
        Self::LeftIris,
        Self::RightIris,
        Self::Lips,
    ];

    /// Returns the output's name in the model graph.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mesh => "output_mesh_identity",
            Self::FaceFlag => "conv_faceflag",
            Self::LeftEye => "output_left_eye",
            Self::RightEye => "output_right_eye",
            Self::LeftIris => "output_left_iris",
            Self::RightIris => "output_right_iris",
            Self::Lips => "output_lips",
        }
    }

    /// Returns the minimum number of values the output has to hold.
    ///
    /// Mesh vertices are stored as `x, y, z` triples, all other landmarks as `x, y` pairs.
    pub fn min_len(self) -> usize {
        match self {
            Self::Mesh => VERTEX_COUNT * 3,
            Self::FaceFlag => 1,
            Self::LeftEye | Self::RightEye => EYE_VERTEX_COUNT * 2,
            Self::LeftIris | Self::RightIris => IRIS_VERTEX_COUNT * 2,
            Self::Lips => LIPS_VERTEX_COUNT * 2,
        }
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outputs of one inference pass, resolved by name and checked for size.
#[derive(Debug)]
pub(crate) struct Outputs<'a> {
    pub(crate) mesh: OutputTensor<'a>,
    pub(crate) face_flag: OutputTensor<'a>,
    left_eye: OutputTensor<'a>,
    right_eye: OutputTensor<'a>,
    left_iris: OutputTensor<'a>,
    right_iris: OutputTensor<'a>,
    lips: OutputTensor<'a>,
}

impl<'a> Outputs<'a> {
    /// Looks up every required output of `worker`.
    ///
    /// Fails if any output is missing or too small, before any of them is used.
    pub(crate) fn resolve(worker: &'a dyn Worker) -> Result<Self, Error> {
        let get = |name: OutputName| -> Result<OutputTensor<'a>, Error> {
            let tensor = worker
                .output(name.as_str())
                .ok_or(Error::MissingOutput(name))?;
            if tensor.len() < name.min_len() {
                return Err(Error::OutputTooSmall {
                    name,
                    len: tensor.len(),
                    expected: name.min_len(),
                });
            }
            Ok(tensor)
        };

        Ok(Self {
            mesh: get(OutputName::Mesh)?,
            face_flag: get(OutputName::FaceFlag)?,
            left_eye: get(OutputName::LeftEye)?,
            right_eye: get(OutputName::RightEye)?,
            left_iris: get(OutputName::LeftIris)?,
            right_iris: get(OutputName::RightIris)?,
            lips: get(OutputName::Lips)?,
        })
    }

    pub(crate) fn landmarks(&self, set: LandmarkSet) -> OutputTensor<'a> {
        match set {
            LandmarkSet::LeftEye => self.left_eye,
            LandmarkSet::RightEye => self.right_eye,
            LandmarkSet::LeftIris => self.left_iris,
            LandmarkSet::RightIris => self.right_iris,
            LandmarkSet::Lips => self.lips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{self, FixedGraph};

    #[test]
    fn output_sizes() {
        assert_eq!(OutputName::Mesh.min_len(), 1404);
        assert_eq!(OutputName::FaceFlag.min_len(), 1);
        assert_eq!(OutputName::LeftEye.min_len(), 142);
        assert_eq!(OutputName::RightIris.min_len(), 10);
        assert_eq!(OutputName::Lips.min_len(), 160);
    }

    #[test]
    fn names_are_unique() {
        for (i, a) in OutputName::ALL.iter().enumerate() {
            for b in &OutputName::ALL[i + 1..] {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }

    #[test]
    fn resolve_all() {
        let Some(gpu) = test::gpu() else { return };

        let worker = FixedGraph::zeros().create_worker(gpu).unwrap();
        let outputs = Outputs::resolve(&*worker).unwrap();
        assert_eq!(outputs.mesh.len(), VERTEX_COUNT * 3);
        assert_eq!(outputs.face_flag.len(), 1);
        assert_eq!(
            outputs.landmarks(LandmarkSet::Lips).len(),
            LIPS_VERTEX_COUNT * 2
        );
    }

    #[test]
    fn resolve_missing() {
        let Some(gpu) = test::gpu() else { return };

        let worker = FixedGraph::zeros()
            .without(OutputName::RightIris)
            .create_worker(gpu)
            .unwrap();
        match Outputs::resolve(&*worker) {
            Err(Error::MissingOutput(OutputName::RightIris)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn resolve_truncated() {
        let Some(gpu) = test::gpu() else { return };

        let worker = FixedGraph::zeros()
            .with_len(OutputName::LeftEye, 20)
            .create_worker(gpu)
            .unwrap();
        match Outputs::resolve(&*worker) {
            Err(Error::OutputTooSmall {
                name: OutputName::LeftEye,
                len: 20,
                expected: 142,
            }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
