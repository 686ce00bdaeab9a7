use meshwork_gpu::{AsTexture, GpuBuffer};

use crate::{
    error::Error,
    nn::{InputTensor, Outputs, Worker},
    num::sigmoid,
    pool::{FrameBuffers, LandmarkSet},
    postprocess, preprocess,
    readback::ReadCache,
    resources::ResourceSet,
    timer::Timer,
    LandmarkVertex, MeshVertex, VERTEX_COUNT,
};

/// Runs the face landmark pipeline on input images.
///
/// A detector owns its GPU buffers and its inference [`Worker`]. All of them are allocated by
/// [`Detector::new`] and reused for every frame. The [`ResourceSet`] it was created from may be
/// shared with other detectors.
///
/// After [`Detector::dispose`] has been called, every method returns [`Error::Disposed`].
pub struct Detector {
    resources: ResourceSet,
    live: Option<Live>,
    timers: Timers,
}

struct Live {
    buffers: FrameBuffers,
    worker: Box<dyn Worker>,
    mesh: ReadCache<Box<[MeshVertex]>>,
    frame: FrameStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStatus {
    /// All landmark buffers hold the results of the last `process_image` call.
    Complete,
    /// The last `process_image` call failed part way through.
    Failed,
}

struct Timers {
    preprocess: Timer,
    inference: Timer,
    postprocess: Timer,
    readback: Timer,
}

impl Detector {
    /// Creates a detector from a resource set.
    ///
    /// This allocates all landmark buffers and creates the inference worker.
    pub fn new(resources: &ResourceSet) -> Result<Self, Error> {
        let gpu = resources.gpu();
        let worker = resources
            .model()
            .create_worker(gpu)
            .map_err(|e| Error::CreateWorker(e.into()))?;
        let buffers = FrameBuffers::new(gpu, resources.color_mapper());
        log::debug!(
            "created detector, mesh buffer: {:?}, input tensor: {:?}",
            buffers.mesh,
            buffers.pre_tensor,
        );

        Ok(Self {
            resources: resources.clone(),
            live: Some(Live {
                buffers,
                worker,
                mesh: ReadCache::new(vec![[0.0; 4]; VERTEX_COUNT].into_boxed_slice()),
                frame: FrameStatus::Complete,
            }),
            timers: Timers {
                preprocess: Timer::new("preprocess"),
                inference: Timer::new("inference"),
                postprocess: Timer::new("postprocess"),
                readback: Timer::new("readback"),
            },
        })
    }

    /// Runs the whole pipeline on `image`.
    ///
    /// When this returns successfully, all landmark buffers have been written by commands
    /// submitted to the GPU queue. The GPU may still be executing them; reading a buffer back
    /// (for example via [`Detector::vertex_array`]) waits for them to finish.
    ///
    /// If this fails, the frame is incomplete: landmark buffers may hold a mix of old and new
    /// results, and [`Detector::vertex_array`] fails until the next successful call.
    pub fn process_image<I: AsTexture + ?Sized>(&mut self, image: &I) -> Result<(), Error> {
        let live = self.live.as_mut().ok_or(Error::Disposed)?;
        let gpu = self.resources.gpu();

        live.mesh.invalidate();
        live.frame = FrameStatus::Failed;

        let texture = image.as_texture();
        preprocess::check_texture(texture)?;

        log::trace!("preprocessing {}x{} image", texture.width(), texture.height());
        self.timers.preprocess.time(|| {
            gpu.validate(|| {
                preprocess::submit(gpu, self.resources.preprocess(), &live.buffers, texture)
            })
        })?;

        log::trace!("running inference");
        // Unscoped: workers validate their own GPU calls.
        self.timers
            .inference
            .time(|| {
                live.worker
                    .execute(gpu, InputTensor::new(&live.buffers.pre_tensor))
            })
            .map_err(|e| Error::Inference(e.into()))?;

        let outputs = Outputs::resolve(&*live.worker)?;

        log::trace!("postprocessing");
        self.timers.postprocess.time(|| {
            gpu.validate(|| {
                postprocess::submit(gpu, self.resources.postprocess(), &outputs, &live.buffers)
            })
        })?;

        live.frame = FrameStatus::Complete;
        Ok(())
    }

    /// Returns the GPU buffer holding the 468 main mesh vertices.
    pub fn vertex_buffer(&self) -> Result<&GpuBuffer<MeshVertex>, Error> {
        Ok(&self.live()?.buffers.mesh)
    }

    /// Returns the main mesh vertices, reading them back from the GPU if necessary.
    ///
    /// The first call after [`Detector::process_image`] blocks until the GPU has finished the
    /// frame and copies the mesh to CPU memory. Later calls return the same data without touching
    /// the GPU. Before the first frame, all vertices are zero.
    pub fn vertex_array(&mut self) -> Result<&[MeshVertex], Error> {
        let live = self.live.as_mut().ok_or(Error::Disposed)?;
        if live.frame == FrameStatus::Failed {
            return Err(Error::IncompleteFrame);
        }

        let gpu = self.resources.gpu();
        let readback = &self.timers.readback;
        let buffers = &live.buffers;
        let data = live.mesh.get_or_fetch(|data| {
            log::trace!("reading back mesh");
            readback.time(|| buffers.mesh_staging.fetch(gpu, &buffers.mesh, data))
        })?;
        Ok(&data[..])
    }

    /// Returns the GPU buffer holding the raw face-presence logit.
    ///
    /// Use [`sigmoid`] (or [`Detector::face_confidence`]) to turn it into a confidence value.
    pub fn face_flag(&self) -> Result<&GpuBuffer<f32>, Error> {
        Ok(&self.live()?.buffers.face_flag)
    }

    /// Reads back the face-presence flag and returns the confidence that the input image shows a
    /// face, in range `0.0..=1.0`.
    pub fn face_confidence(&self) -> Result<f32, Error> {
        let live = self.live()?;
        if live.frame == FrameStatus::Failed {
            return Err(Error::IncompleteFrame);
        }

        let flag = live.buffers.face_flag.read(self.resources.gpu())?;
        Ok(sigmoid(flag[0]))
    }

    /// Returns the GPU buffer holding the landmarks of `set`.
    pub fn landmarks(&self, set: LandmarkSet) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        Ok(&self.live()?.buffers.landmarks(set).buffer)
    }

    /// The 71 landmarks around the left eye.
    pub fn left_eye(&self) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        self.landmarks(LandmarkSet::LeftEye)
    }

    /// The 71 landmarks around the right eye.
    pub fn right_eye(&self) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        self.landmarks(LandmarkSet::RightEye)
    }

    /// The 5 landmarks of the left iris.
    pub fn left_iris(&self) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        self.landmarks(LandmarkSet::LeftIris)
    }

    /// The 5 landmarks of the right iris.
    pub fn right_iris(&self) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        self.landmarks(LandmarkSet::RightIris)
    }

    /// The 80 landmarks around the lips.
    pub fn lips(&self) -> Result<&GpuBuffer<LandmarkVertex>, Error> {
        self.landmarks(LandmarkSet::Lips)
    }

    /// Returns profiling timers for the pipeline stages.
    ///
    /// GPU work is asynchronous, so the GPU stages only measure recording and submission. The
    /// time the GPU spends on them is attributed to the readback.
    pub fn timers(&self) -> impl IntoIterator<Item = &Timer> + '_ {
        [
            &self.timers.preprocess,
            &self.timers.inference,
            &self.timers.postprocess,
            &self.timers.readback,
        ]
    }

    /// Releases the worker and all GPU buffers of this detector.
    ///
    /// Calling this more than once has no effect. Dropping the detector releases the same
    /// resources.
    pub fn dispose(&mut self) {
        if self.live.take().is_some() {
            log::debug!("disposed detector");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.live.is_none()
    }

    fn live(&self) -> Result<&Live, Error> {
        self.live.as_ref().ok_or(Error::Disposed)
    }
}
