//! ONNX model provider backed by [tract].
//!
//! tract runs on the CPU, so an [`OnnxGraph`] worker reads the preprocessed input tensor back
//! from the GPU, runs the plan, and uploads every output into a single GPU buffer. This is the
//! only step of the pipeline that synchronizes with the GPU before the landmarks are read.
//!
//! Only the readback and the upload run inside [`Gpu::validate`]. The plan runs outside of it, so
//! detectors sharing the GPU can run inference at the same time.
//!
//! [tract]: https://github.com/sonos/tract

use std::{path::Path, sync::Arc};

use itertools::zip_eq;
use meshwork_gpu::{Gpu, Staging};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TypedFact, TypedOp,
};
use wgpu::{Buffer, BufferAddress, BufferDescriptor, BufferUsages};

use super::{InputTensor, ModelGraph, OutputTensor, Worker};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// A face landmark network loaded from an ONNX file.
///
/// This is a cheaply [`Clone`]able handle to the underlying optimized plan. The network must take
/// a single `f32` input of shape `[1, 192, 192, 3]`.
#[derive(Clone)]
pub struct OnnxGraph(Arc<OnnxGraphImpl>);

struct OnnxGraphImpl {
    plan: Model,
    outputs: Vec<OutputInfo>,
}

/// Information about a network output node.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    name: String,
    len: usize,
}

impl OutputInfo {
    /// Returns the name of this output.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of values in this output.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl OnnxGraph {
    /// Loads and optimizes a network from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl(path: &Path) -> anyhow::Result<Self> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => anyhow::bail!("neural network file must have `.onnx` extension"),
        }

        let model_data = std::fs::read(path)?;
        log::debug!(
            "loading ONNX model from '{}' ({} bytes)",
            path.display(),
            model_data.len()
        );
        Self::from_onnx(&model_data)
    }

    /// Loads and optimizes a network from an in-memory ONNX file.
    ///
    /// Returns an error if the network data is malformed, if the network uses unimplemented
    /// operations, or if its input does not have the expected shape.
    pub fn from_onnx(raw: &[u8]) -> anyhow::Result<Self> {
        let graph = tract_onnx::onnx()
            .model_for_read(&mut &*raw)?
            .into_optimized()?;

        if graph.inputs.len() != 1 {
            anyhow::bail!(
                "face landmark network has to take exactly 1 input, this one takes {}",
                graph.inputs.len(),
            );
        }
        let input_fact = graph.input_fact(0)?;
        match input_fact.shape.as_concrete() {
            Some(shape) if shape == InputTensor::SHAPE => {}
            shape => anyhow::bail!(
                "invalid model input shape {:?}, expected {:?}",
                shape,
                InputTensor::SHAPE,
            ),
        }

        let mut outputs = Vec::with_capacity(graph.outputs.len());
        for &outlet in graph.output_outlets()? {
            let name = graph
                .outlet_label(outlet)
                .unwrap_or(&graph.node(outlet.node).name)
                .to_string();
            let fact = graph.outlet_fact(outlet)?;
            let Some(shape) = fact.shape.as_concrete() else {
                anyhow::bail!("model output `{name}` has a symbolic shape");
            };
            let len = shape.iter().product();
            log::trace!("model output `{name}`: {shape:?}");
            outputs.push(OutputInfo { name, len });
        }

        let plan = SimplePlan::new(graph)?;

        Ok(Self(Arc::new(OnnxGraphImpl { plan, outputs })))
    }

    /// Returns information about the network's outputs, in graph order.
    pub fn outputs(&self) -> &[OutputInfo] {
        &self.0.outputs
    }
}

impl ModelGraph for OnnxGraph {
    fn create_worker(&self, gpu: &Gpu) -> anyhow::Result<Box<dyn Worker>> {
        Ok(Box::new(OnnxWorker::new(gpu, self.clone())))
    }
}

/// Executes an [`OnnxGraph`] on the CPU and exposes its outputs in GPU memory.
struct OnnxWorker {
    graph: OnnxGraph,
    input_staging: Staging<f32>,
    input: Vec<f32>,
    /// All outputs, back to back.
    arena: Buffer,
    /// Byte offset of each output in `arena`.
    offsets: Vec<BufferAddress>,
}

impl OnnxWorker {
    fn new(gpu: &Gpu, graph: OnnxGraph) -> Self {
        let input_len = InputTensor::SHAPE.iter().product();

        let mut offsets = Vec::with_capacity(graph.outputs().len());
        let mut size = 0;
        for info in graph.outputs() {
            offsets.push(size);
            size += (info.len * 4) as BufferAddress;
        }

        let arena = gpu.device().create_buffer(&BufferDescriptor {
            label: Some("onnx_outputs"),
            // zero-sized buffers are valid, but can't be bound or copied from
            size: size.max(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            graph,
            input_staging: Staging::new(gpu, "onnx_input_readback", input_len),
            input: vec![0.0; input_len],
            arena,
            offsets,
        }
    }
}

impl Worker for OnnxWorker {
    fn execute(&mut self, gpu: &Gpu, input: InputTensor<'_>) -> anyhow::Result<()> {
        self.input_staging
            .fetch(gpu, input.buffer(), &mut self.input)?;

        let tensor = tract_onnx::prelude::Tensor::from_shape(&input.shape(), &self.input)?;
        let outputs = self
            .graph
            .0
            .plan
            .run(tvec![TValue::from_const(Arc::new(tensor))])?;

        let mut data = Vec::with_capacity(outputs.len());
        for (output, info) in zip_eq(&outputs, self.graph.outputs()) {
            let values = output.as_slice::<f32>()?;
            anyhow::ensure!(
                values.len() == info.len,
                "model output `{}` produced {} values, expected {}",
                info.name,
                values.len(),
                info.len,
            );
            data.push(values);
        }

        gpu.validate(|| {
            for (&values, &offset) in zip_eq(&data, &self.offsets) {
                if !values.is_empty() {
                    gpu.queue()
                        .write_buffer(&self.arena, offset, bytemuck::cast_slice(values));
                }
            }
        })?;

        Ok(())
    }

    fn output(&self, name: &str) -> Option<OutputTensor<'_>> {
        let index = self
            .graph
            .outputs()
            .iter()
            .position(|info| info.name == name)?;
        Some(OutputTensor::new(
            &self.arena,
            self.offsets[index],
            self.graph.outputs()[index].len,
        ))
    }
}
