use std::{
    env::{self, VarError},
    process,
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::anyhow;
use wgpu::{
    Adapter, AdapterInfo, Backends, Device, DeviceDescriptor, ErrorFilter, Features, Instance,
    Limits, Queue,
};

use crate::GpuError;

/// A handle to a GPU.
///
/// There is a global GPU handle that can be accessed with [`Gpu::get()`]. Pipelines that share
/// their device with other code can construct a handle from existing [`wgpu`] objects via
/// [`Gpu::from_wgpu`] instead.
///
/// All fields are reference-counted, so cloning a [`Gpu`] is cheap and yields a handle to the same
/// device.
#[derive(Clone)]
pub struct Gpu {
    instance: Arc<Instance>,
    adapter: Arc<Adapter>,
    device: Arc<Device>,
    queue: Arc<Queue>,
    /// Serializes [`Gpu::validate`], since error scopes are shared by all users of the device.
    scope: Arc<Mutex<()>>,
}

static INSTANCE: OnceLock<Gpu> = OnceLock::new();

impl Gpu {
    /// Returns a reference to the global GPU handle.
    ///
    /// If the global GPU handle hasn't been initialized yet, an appropriate default GPU will be
    /// opened. If this fails, this method will panic.
    pub fn get() -> &'static Gpu {
        match Self::try_get() {
            Ok(gpu) => gpu,
            Err(e) => panic!("failed to open default GPU: {e:#}"),
        }
    }

    /// Returns a reference to the global GPU handle, opening a default GPU if necessary.
    ///
    /// Unlike [`Gpu::get`], this returns an error when no usable graphics adapter exists. A failed
    /// attempt is not cached, so a later call will try again.
    pub fn try_get() -> anyhow::Result<&'static Gpu> {
        if let Some(gpu) = INSTANCE.get() {
            return Ok(gpu);
        }

        let gpu = pollster::block_on(Self::open())?;
        Ok(INSTANCE.get_or_init(|| gpu))
    }

    /// Sets the global GPU handle.
    ///
    /// # Panics
    ///
    /// This will panic if the global GPU handle has already been initialized by a previous call to
    /// [`Gpu::set`], or if [`Gpu::get`] has ever been called successfully.
    pub fn set(gpu: Self) {
        let mut error = true;
        INSTANCE.get_or_init(|| {
            error = false;
            gpu
        });

        if error {
            panic!("global GPU handle was already set");
        }
    }

    /// Returns a [`bool`] indicating whether the global [`Gpu`] context has been configured.
    pub fn is_set() -> bool {
        INSTANCE.get().is_some()
    }

    /// Opens a suitable default GPU.
    ///
    /// The set of backends to consider is taken from the `MESHWORK_GPU_BACKEND` environment
    /// variable (see the crate documentation).
    pub async fn open() -> anyhow::Result<Self> {
        let backends = backends();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        log::debug!("available graphics adapters:");
        for adapter in instance.enumerate_adapters(backends) {
            let info = adapter.get_info();
            log_adapter("-", &info);
        }

        let adapter = instance
            .request_adapter(&Default::default())
            .await
            .ok_or_else(|| anyhow!("no graphics adapter found (backends: {:?})", backends))?;
        log_adapter("using", &adapter.get_info());

        log::debug!("adapter features: {:?}", adapter.features());
        log::debug!("adapter limits: {:?}", adapter.limits());

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("meshwork"),
                    features: Features::empty(),
                    // Source images can be large camera frames, so take the texture limits from
                    // the adapter.
                    limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        Ok(Self::from_wgpu(instance, adapter, device, queue))
    }

    /// Creates a [`Gpu`] handle from an existing [`wgpu::Device`] and [`wgpu::Queue`].
    ///
    /// [`Device`] and [`Queue`] can be passed wrapped in [`Arc`]s, which allows sharing them
    /// outside of the library.
    pub fn from_wgpu(
        instance: impl Into<Arc<Instance>>,
        adapter: impl Into<Arc<Adapter>>,
        device: impl Into<Arc<Device>>,
        queue: impl Into<Arc<Queue>>,
    ) -> Self {
        Self {
            instance: instance.into(),
            adapter: adapter.into(),
            device: device.into(),
            queue: queue.into(),
            scope: Arc::default(),
        }
    }

    /// Returns a reference to the [`Instance`].
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Returns a reference to the [`Adapter`].
    #[inline]
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Returns a reference to the [`Device`].
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns a reference to the [`Queue`].
    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Runs `f` inside a validation error scope.
    ///
    /// wgpu reports validation errors through an uncaptured error handler that panics by default.
    /// Any validation error raised while `f` records or submits work is instead returned as
    /// [`GpuError::Validation`].
    ///
    /// wgpu error scopes are shared by every thread using the device, so calls on clones of the
    /// same handle are serialized and `f` must not call `validate` itself. Keep `f` limited to
    /// recording and submitting GPU work: other threads wait while it runs, and an invalid call
    /// they make outside of `validate` meanwhile is reported here instead of to them.
    pub fn validate<R>(&self, f: impl FnOnce() -> R) -> Result<R, GpuError> {
        let _guard = self.scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.device.push_error_scope(ErrorFilter::Validation);
        let ret = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(GpuError::Validation(err.to_string())),
            None => Ok(ret),
        }
    }
}

fn backends() -> Backends {
    static BACKENDS: OnceLock<Backends> = OnceLock::new();

    *BACKENDS.get_or_init(|| {
        let backends = match env::var("MESHWORK_GPU_BACKEND").as_deref() {
            Ok("primary") | Err(VarError::NotPresent) => Backends::PRIMARY,
            Ok("vulkan") => Backends::VULKAN,
            Ok("metal") => Backends::METAL,
            Ok("dx12") => Backends::DX12,
            // Not part of `PRIMARY`, but useful on machines that only have a software GL driver.
            Ok("gl") => Backends::GL,
            Ok(invalid) => {
                eprintln!(
                    "invalid value set for `MESHWORK_GPU_BACKEND` variable: '{invalid}'; exiting"
                );
                process::exit(1);
            }
            Err(VarError::NotUnicode(s)) => {
                eprintln!(
                    "invalid value set for `MESHWORK_GPU_BACKEND` variable: {}; exiting",
                    s.to_string_lossy()
                );
                process::exit(1);
            }
        };
        log::debug!("using GPU backends {:?}", backends);
        backends
    })
}

fn log_adapter(prefix: &str, info: &AdapterInfo) {
    let backend = match info.backend {
        wgpu::Backend::Empty => "dummy",
        wgpu::Backend::Vulkan => "Vulkan",
        wgpu::Backend::Metal => "Metal",
        wgpu::Backend::Dx12 => "DX12",
        wgpu::Backend::Dx11 => "DX11",
        wgpu::Backend::Gl => "OpenGL",
        wgpu::Backend::BrowserWebGpu => "WebGPU",
    };
    let device_type = match info.device_type {
        wgpu::DeviceType::Other => "Unknown",
        wgpu::DeviceType::IntegratedGpu => "iGPU",
        wgpu::DeviceType::DiscreteGpu => "dGPU",
        wgpu::DeviceType::VirtualGpu => "vGPU",
        wgpu::DeviceType::Cpu => "CPU",
    };
    log::info!("{} [{}] [{}] {}", prefix, backend, device_type, info.name);
}
