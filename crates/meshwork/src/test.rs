//! Test helpers: GPU access and a network stand-in with predictable outputs.

use std::sync::{Arc, Mutex, OnceLock};

use meshwork_gpu::{Gpu, GpuBuffer};

use crate::nn::{InputTensor, ModelGraph, OutputName, OutputTensor, Worker};

/// Returns the global GPU, or `None` if this machine has no usable graphics adapter.
///
/// Tests that need a GPU return early when this returns `None`. With `MESHWORK_REQUIRE_GPU=1`
/// set, a missing adapter fails the test instead.
pub fn gpu() -> Option<&'static Gpu> {
    static GPU: OnceLock<Option<&'static Gpu>> = OnceLock::new();
    *GPU.get_or_init(|| match Gpu::try_get() {
        Ok(gpu) => Some(gpu),
        Err(e) if meshwork_gpu::gpu_required() => panic!("no GPU available: {e:#}"),
        Err(e) => {
            log::warn!("no GPU available, skipping GPU tests: {e:#}");
            None
        }
    })
}

type Generator = dyn Fn(u32, OutputName, usize) -> f32 + Send + Sync;
type Hook = dyn Fn() -> anyhow::Result<()> + Send + Sync;

/// A [`ModelGraph`] whose outputs are computed by a closure instead of a network.
///
/// The closure receives the 1-based number of the `execute` call, the output and the index of the
/// value within the output.
#[derive(Clone)]
pub struct FixedGraph {
    generator: Arc<Generator>,
    omitted: Vec<OutputName>,
    lens: Vec<(OutputName, usize)>,
    failing_call: Option<u32>,
    inputs: Arc<Mutex<Vec<Vec<f32>>>>,
    capture: bool,
    hook: Option<Arc<Hook>>,
}

impl FixedGraph {
    pub fn from_fn(f: impl Fn(u32, OutputName, usize) -> f32 + Send + Sync + 'static) -> Self {
        Self {
            generator: Arc::new(f),
            omitted: Vec::new(),
            lens: Vec::new(),
            failing_call: None,
            inputs: Arc::default(),
            capture: false,
            hook: None,
        }
    }

    /// Every output is all zeroes.
    pub fn zeros() -> Self {
        Self::from_fn(|_, _, _| 0.0)
    }

    /// Removes `name` from the outputs.
    pub fn without(mut self, name: OutputName) -> Self {
        self.omitted.push(name);
        self
    }

    /// Overrides the number of values in output `name`.
    pub fn with_len(mut self, name: OutputName, len: usize) -> Self {
        self.lens.push((name, len));
        self
    }

    /// Makes the `call`th `execute` call (counting from 1) of every worker fail.
    pub fn failing_on(mut self, call: u32) -> Self {
        self.failing_call = Some(call);
        self
    }

    /// Makes workers read back and record every input tensor they are given.
    pub fn capture_inputs(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Calls `f` at the start of every successful `execute` call, before any GPU work.
    ///
    /// An error returned by `f` fails the call.
    pub fn on_execute(
        mut self,
        f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Arc::new(f));
        self
    }

    /// Returns the input tensors recorded so far, see [`FixedGraph::capture_inputs`].
    pub fn captured(&self) -> Vec<Vec<f32>> {
        self.inputs.lock().unwrap().clone()
    }

    fn len(&self, name: OutputName) -> usize {
        self.lens
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map_or(name.min_len(), |&(_, len)| len)
    }
}

impl ModelGraph for FixedGraph {
    fn create_worker(&self, gpu: &Gpu) -> anyhow::Result<Box<dyn Worker>> {
        let outputs = OutputName::ALL
            .into_iter()
            .filter(|name| !self.omitted.contains(name))
            .map(|name| (name, GpuBuffer::new(gpu, name.as_str(), self.len(name))))
            .collect();
        Ok(Box::new(FixedWorker {
            graph: self.clone(),
            outputs,
            calls: 0,
        }))
    }
}

struct FixedWorker {
    graph: FixedGraph,
    outputs: Vec<(OutputName, GpuBuffer<f32>)>,
    calls: u32,
}

impl Worker for FixedWorker {
    fn execute(&mut self, gpu: &Gpu, input: InputTensor<'_>) -> anyhow::Result<()> {
        self.calls += 1;
        if self.graph.failing_call == Some(self.calls) {
            anyhow::bail!("simulated failure in call {}", self.calls);
        }
        if let Some(hook) = &self.graph.hook {
            hook()?;
        }

        if self.graph.capture {
            let data = input.buffer().read(gpu)?;
            self.graph.inputs.lock().unwrap().push(data);
        }

        let data = self
            .outputs
            .iter()
            .map(|(name, buffer)| {
                (0..buffer.len())
                    .map(|i| (self.graph.generator)(self.calls, *name, i))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        gpu.validate(|| {
            for ((_, buffer), data) in self.outputs.iter().zip(&data) {
                buffer.write(gpu, data);
            }
        })?;
        Ok(())
    }

    fn output(&self, name: &str) -> Option<OutputTensor<'_>> {
        self.outputs
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, buffer)| OutputTensor::new(buffer.raw(), 0, buffer.len()))
    }
}
