//! Kernels and models shared by detectors.

use std::{ops::RangeInclusive, sync::Arc};

use meshwork_gpu::Gpu;
use wgpu::{ComputePipeline, ComputePipelineDescriptor, ShaderModuleDescriptor, ShaderSource};

use crate::{error::Error, nn::ModelGraph};

/// The compute kernel that turns an input image into the network's input tensor.
///
/// Custom kernels must use the bindings of the built-in `preprocess.wgsl`: the source texture at
/// binding 0, the output tensor at binding 1 and the color map uniform at binding 2 of group 0,
/// with a workgroup size of 8x8.
pub struct PreprocessKernel {
    gpu: Gpu,
    pipeline: ComputePipeline,
}

impl PreprocessKernel {
    /// Compiles the built-in preprocessing kernel.
    pub fn new(gpu: &Gpu) -> Result<Self, Error> {
        Self::from_wgsl(gpu, include_str!("shaders/preprocess.wgsl"), "preprocess")
    }

    /// Compiles a preprocessing kernel from WGSL source.
    pub fn from_wgsl(gpu: &Gpu, source: &str, entry_point: &str) -> Result<Self, Error> {
        let pipeline = gpu
            .validate(|| compile(gpu, "preprocess", source, entry_point))
            .map_err(|source| Error::Kernel {
                kernel: "preprocessing",
                source,
            })?;
        Ok(Self {
            gpu: gpu.clone(),
            pipeline,
        })
    }

    pub(crate) fn pipeline(&self) -> &ComputePipeline {
        &self.pipeline
    }
}

/// The compute kernels that turn raw network outputs into vertex buffers.
///
/// This consists of two entry points in one shader module: one for the 468-vertex mesh (52
/// vertices per workgroup) and one for the 2D landmark sets (one workgroup per vertex). See the
/// built-in `postprocess.wgsl` for the binding layout custom kernels must follow.
pub struct PostprocessKernel {
    gpu: Gpu,
    mesh: ComputePipeline,
    landmarks: ComputePipeline,
}

impl PostprocessKernel {
    /// Compiles the built-in postprocessing kernels.
    pub fn new(gpu: &Gpu) -> Result<Self, Error> {
        Self::from_wgsl(
            gpu,
            include_str!("shaders/postprocess.wgsl"),
            "postprocess_mesh",
            "postprocess_landmarks",
        )
    }

    /// Compiles postprocessing kernels from WGSL source containing both entry points.
    pub fn from_wgsl(
        gpu: &Gpu,
        source: &str,
        mesh_entry_point: &str,
        landmarks_entry_point: &str,
    ) -> Result<Self, Error> {
        let (mesh, landmarks) = gpu
            .validate(|| {
                (
                    compile(gpu, "postprocess_mesh", source, mesh_entry_point),
                    compile(gpu, "postprocess_landmarks", source, landmarks_entry_point),
                )
            })
            .map_err(|source| Error::Kernel {
                kernel: "postprocessing",
                source,
            })?;
        Ok(Self {
            gpu: gpu.clone(),
            mesh,
            landmarks,
        })
    }

    pub(crate) fn mesh(&self) -> &ComputePipeline {
        &self.mesh
    }

    pub(crate) fn landmarks(&self) -> &ComputePipeline {
        &self.landmarks
    }
}

fn compile(gpu: &Gpu, label: &str, source: &str, entry_point: &str) -> ComputePipeline {
    let module = gpu.device().create_shader_module(ShaderModuleDescriptor {
        label: Some(label),
        source: ShaderSource::Wgsl(source.into()),
    });
    gpu.device()
        .create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(label),
            layout: None,
            module: &module,
            entry_point,
        })
}

/// Maps colors loaded from the input image to the value range the network expects.
#[derive(Debug, Clone)]
pub struct ColorMapper {
    scale: f32,
    offset: f32,
}

impl ColorMapper {
    /// Creates a color mapper that uniformly maps color channels in `0.0..=1.0` to
    /// `target_range`.
    ///
    /// Note that this operates on *non-linear* sRGB colors, but maps them linearly to the target
    /// range.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty or reversed.
    pub fn linear(target_range: RangeInclusive<f32>) -> Self {
        let start = *target_range.start();
        let end = *target_range.end();
        assert!(end > start, "invalid color range {start}..={end}");

        Self {
            scale: end - start,
            offset: start,
        }
    }

    /// Returns the contents of the kernel's color map uniform.
    pub(crate) fn uniform(&self) -> [f32; 4] {
        [self.scale, self.offset, 0.0, 0.0]
    }
}

/// The face mesh network expects colors in range `0.0..=1.0`.
impl Default for ColorMapper {
    fn default() -> Self {
        Self::linear(0.0..=1.0)
    }
}

/// A read-only bundle of the kernels and the model graph used by [`Detector`]s.
///
/// This is a cheaply [`Clone`]able handle. Any number of detectors can be created from the same
/// resource set; they share the compiled kernels and the model graph, but own their buffers and
/// workers.
///
/// [`Detector`]: crate::Detector
#[derive(Clone)]
pub struct ResourceSet(Arc<Resources>);

struct Resources {
    gpu: Gpu,
    preprocess: PreprocessKernel,
    postprocess: PostprocessKernel,
    model: Arc<dyn ModelGraph>,
    color_mapper: ColorMapper,
}

impl ResourceSet {
    pub fn builder() -> ResourceSetBuilder {
        ResourceSetBuilder {
            preprocess: None,
            postprocess: None,
            model: None,
            color_mapper: ColorMapper::default(),
        }
    }

    /// Creates a resource set using the built-in kernels and the default color mapping.
    pub fn new<M: ModelGraph + 'static>(gpu: &Gpu, model: M) -> Result<Self, Error> {
        Self::builder()
            .preprocess(PreprocessKernel::new(gpu)?)
            .postprocess(PostprocessKernel::new(gpu)?)
            .model(model)
            .build()
    }

    pub(crate) fn gpu(&self) -> &Gpu {
        &self.0.gpu
    }

    pub(crate) fn preprocess(&self) -> &PreprocessKernel {
        &self.0.preprocess
    }

    pub(crate) fn postprocess(&self) -> &PostprocessKernel {
        &self.0.postprocess
    }

    pub(crate) fn model(&self) -> &dyn ModelGraph {
        &*self.0.model
    }

    pub(crate) fn color_mapper(&self) -> &ColorMapper {
        &self.0.color_mapper
    }
}

/// Builder for [`ResourceSet`]s, returned by [`ResourceSet::builder`].
pub struct ResourceSetBuilder {
    preprocess: Option<PreprocessKernel>,
    postprocess: Option<PostprocessKernel>,
    model: Option<Arc<dyn ModelGraph>>,
    color_mapper: ColorMapper,
}

impl ResourceSetBuilder {
    pub fn preprocess(mut self, kernel: PreprocessKernel) -> Self {
        self.preprocess = Some(kernel);
        self
    }

    pub fn postprocess(mut self, kernel: PostprocessKernel) -> Self {
        self.postprocess = Some(kernel);
        self
    }

    pub fn model<M: ModelGraph + 'static>(self, model: M) -> Self {
        self.shared_model(Arc::new(model))
    }

    /// Uses a model graph that is also referenced elsewhere.
    pub fn shared_model(mut self, model: Arc<dyn ModelGraph>) -> Self {
        self.model = Some(model);
        self
    }

    /// Maps image colors linearly to `range` before they are passed to the network.
    ///
    /// Shorthand for `.color_mapper(ColorMapper::linear(range))`.
    pub fn input_range(self, range: RangeInclusive<f32>) -> Self {
        self.color_mapper(ColorMapper::linear(range))
    }

    /// Sets the mapping from image colors to network input values.
    pub fn color_mapper(mut self, color_mapper: ColorMapper) -> Self {
        self.color_mapper = color_mapper;
        self
    }

    /// Finishes the resource set.
    ///
    /// Fails with a configuration error if a kernel or the model graph was not provided, or if the
    /// kernels were compiled for different devices.
    pub fn build(self) -> Result<ResourceSet, Error> {
        let preprocess = self
            .preprocess
            .ok_or(Error::MissingResource("preprocessing kernel"))?;
        let postprocess = self
            .postprocess
            .ok_or(Error::MissingResource("postprocessing kernel"))?;
        let model = self.model.ok_or(Error::MissingResource("model graph"))?;

        if !Arc::ptr_eq(preprocess.gpu.device(), postprocess.gpu.device()) {
            return Err(Error::DeviceMismatch);
        }

        Ok(ResourceSet(Arc::new(Resources {
            gpu: preprocess.gpu.clone(),
            preprocess,
            postprocess,
            model,
            color_mapper: self.color_mapper,
        })))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{error::ErrorKind, test, test::FixedGraph};

    fn map(mapper: &ColorMapper, value: f32) -> f32 {
        let [scale, offset, ..] = mapper.uniform();
        value * scale + offset
    }

    #[test]
    fn color_mapper() {
        let mapper = ColorMapper::linear(-1.0..=1.0);
        assert_relative_eq!(map(&mapper, 0.0), -1.0);
        assert_relative_eq!(map(&mapper, 0.5), 0.0);
        assert_relative_eq!(map(&mapper, 1.0), 1.0);

        let mapper = ColorMapper::linear(1.0..=2.0);
        assert_relative_eq!(map(&mapper, 0.0), 1.0);
        assert_relative_eq!(map(&mapper, 1.0), 2.0);

        let mapper = ColorMapper::default();
        assert_relative_eq!(map(&mapper, 0.0), 0.0);
        assert_relative_eq!(map(&mapper, 1.0), 1.0);
    }

    #[test]
    #[should_panic(expected = "invalid color range")]
    fn color_mapper_reversed() {
        ColorMapper::linear(1.0..=0.0);
    }

    #[test]
    fn missing_everything() {
        let err = ResourceSet::builder().build().err().unwrap();
        assert!(matches!(err, Error::MissingResource("preprocessing kernel")));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn input_range_without_kernels() {
        let err = ResourceSet::builder()
            .input_range(-1.0..=1.0)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_kernels() {
        let Some(gpu) = test::gpu() else { return };

        let err = ResourceSet::builder()
            .preprocess(PreprocessKernel::new(gpu).unwrap())
            .model(FixedGraph::zeros())
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::MissingResource("postprocessing kernel")
        ));

        let err = ResourceSet::builder()
            .preprocess(PreprocessKernel::new(gpu).unwrap())
            .postprocess(PostprocessKernel::new(gpu).unwrap())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingResource("model graph")));
    }

    #[test]
    fn builtin_kernels_compile() {
        let Some(gpu) = test::gpu() else { return };

        ResourceSet::new(gpu, FixedGraph::zeros()).unwrap();
    }

    #[test]
    fn broken_kernel() {
        let Some(gpu) = test::gpu() else { return };

        let err = PreprocessKernel::from_wgsl(gpu, "this is not WGSL", "preprocess")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Kernel { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = PostprocessKernel::from_wgsl(
            gpu,
            include_str!("shaders/postprocess.wgsl"),
            "postprocess_mesh",
            "no_such_entry_point",
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Kernel { .. }));
    }
}
