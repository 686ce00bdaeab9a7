use std::{fmt, marker::PhantomData, mem, sync::mpsc};

use bytemuck::Pod;
use wgpu::{
    BindingResource, Buffer, BufferAddress, BufferDescriptor, BufferUsages,
    CommandEncoderDescriptor, MapMode,
};

use crate::{Gpu, GpuError};

/// A fixed-size GPU storage buffer holding `len` elements of type `T`.
///
/// The element stride is `size_of::<T>()`. Landmark buffers use `[f32; 4]` or `[f32; 2]` as their
/// element type, raw tensors use `f32`.
///
/// The underlying [`Buffer`] is released when the [`GpuBuffer`] is dropped.
pub struct GpuBuffer<T> {
    buffer: Buffer,
    len: usize,
    label: &'static str,
    _elem: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Allocates a zero-initialized buffer of `len` elements.
    ///
    /// The buffer can be bound as a storage buffer and used as the source and destination of copy
    /// operations.
    ///
    /// # Panics
    ///
    /// Panics if `len` is 0.
    pub fn new(gpu: &Gpu, label: &'static str, len: usize) -> Self {
        assert!(len > 0, "attempted to allocate empty GPU buffer `{label}`");

        let buffer = gpu.device().create_buffer(&BufferDescriptor {
            label: Some(label),
            size: byte_size::<T>(len),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            label,
            _elem: PhantomData,
        }
    }

    /// Returns the number of elements in this buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always returns `false`, since empty buffers cannot be created.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the size of a single element, in bytes.
    #[inline]
    pub fn stride(&self) -> usize {
        mem::size_of::<T>()
    }

    /// Returns the size of the whole buffer, in bytes.
    #[inline]
    pub fn size(&self) -> BufferAddress {
        byte_size::<T>(self.len)
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Returns the underlying [`wgpu::Buffer`].
    #[inline]
    pub fn raw(&self) -> &Buffer {
        &self.buffer
    }

    /// Returns a [`BindingResource`] covering the whole buffer.
    #[inline]
    pub fn binding(&self) -> BindingResource<'_> {
        self.buffer.as_entire_binding()
    }

    /// Schedules a write of `data` to the start of the buffer.
    ///
    /// # Panics
    ///
    /// `data` must have exactly [`GpuBuffer::len`] elements.
    #[track_caller]
    pub fn write(&self, gpu: &Gpu, data: &[T]) {
        assert_eq!(
            data.len(),
            self.len,
            "attempted to write {} elements to GPU buffer `{}` of length {}",
            data.len(),
            self.label,
            self.len,
        );
        gpu.queue()
            .write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
    }

    /// Copies the buffer contents back to the CPU, blocking until all previously submitted work
    /// that writes to it has finished.
    ///
    /// This allocates a transient staging buffer. Code that reads the same buffer repeatedly
    /// should keep a [`Staging`] buffer around instead.
    pub fn read(&self, gpu: &Gpu) -> Result<Vec<T>, GpuError> {
        let staging = Staging::new(gpu, "transient_readback", self.len);
        let mut out = vec![T::zeroed(); self.len];
        staging.fetch(gpu, self, &mut out)?;
        Ok(out)
    }
}

impl<T> fmt::Debug for GpuBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("stride", &mem::size_of::<T>())
            .finish()
    }
}

/// A CPU-mappable buffer used to read a [`GpuBuffer`] of the same length back to the host.
pub struct Staging<T> {
    buffer: Buffer,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T: Pod> Staging<T> {
    pub fn new(gpu: &Gpu, label: &'static str, len: usize) -> Self {
        let buffer = gpu.device().create_buffer(&BufferDescriptor {
            label: Some(label),
            size: byte_size::<T>(len),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            _elem: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `src` into `out` via this staging buffer.
    ///
    /// This submits a copy command and blocks until the GPU has executed it. Since the queue
    /// executes submissions in order, all work previously submitted that writes to `src` is
    /// visible in `out`.
    ///
    /// The copy is recorded inside [`Gpu::validate`], so this must not be called from within
    /// another `validate` closure.
    ///
    /// # Panics
    ///
    /// `src` and `out` must both have exactly [`Staging::len`] elements.
    #[track_caller]
    pub fn fetch(&self, gpu: &Gpu, src: &GpuBuffer<T>, out: &mut [T]) -> Result<(), GpuError> {
        assert_eq!(src.len(), self.len, "staging buffer length mismatch");
        assert_eq!(out.len(), self.len, "readback destination length mismatch");

        // Only recording and submission run inside the error scope, not the wait.
        let (tx, rx) = mpsc::channel();
        let index = gpu.validate(|| {
            let mut enc = gpu
                .device()
                .create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("readback"),
                });
            enc.copy_buffer_to_buffer(src.raw(), 0, &self.buffer, 0, src.size());
            let index = gpu.queue().submit([enc.finish()]);

            self.buffer.slice(..).map_async(MapMode::Read, move |res| {
                tx.send(res).ok();
            });
            index
        })?;
        gpu.device()
            .poll(wgpu::MaintainBase::WaitForSubmissionIndex(index));
        rx.recv().map_err(|_| GpuError::MapAborted)??;

        let slice = self.buffer.slice(..);
        {
            let view = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice::<u8, T>(&view));
        }
        self.buffer.unmap();
        Ok(())
    }
}

fn byte_size<T>(len: usize) -> BufferAddress {
    (len * mem::size_of::<T>()) as BufferAddress
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> Option<&'static Gpu> {
        match Gpu::try_get() {
            Ok(gpu) => Some(gpu),
            Err(e) if crate::gpu_required() => panic!("no GPU available: {e:#}"),
            Err(e) => {
                log::warn!("no GPU available, skipping GPU test: {e:#}");
                None
            }
        }
    }

    #[test]
    fn layout() {
        let Some(gpu) = gpu() else { return };

        let vertices = GpuBuffer::<[f32; 4]>::new(gpu, "vertices", 468);
        assert_eq!(vertices.len(), 468);
        assert_eq!(vertices.stride(), 16);
        assert_eq!(vertices.size(), 468 * 16);

        let flag = GpuBuffer::<f32>::new(gpu, "flag", 1);
        assert_eq!(flag.stride(), 4);
        assert_eq!(flag.size(), 4);
    }

    #[test]
    fn starts_zeroed() {
        let Some(gpu) = gpu() else { return };

        let buf = GpuBuffer::<[f32; 2]>::new(gpu, "zeroed", 71);
        assert_eq!(buf.read(gpu).unwrap(), vec![[0.0, 0.0]; 71]);
    }

    #[test]
    fn write_then_read() {
        let Some(gpu) = gpu() else { return };

        let data = (0..80)
            .map(|i| [i as f32, -(i as f32)])
            .collect::<Vec<_>>();
        let buf = GpuBuffer::<[f32; 2]>::new(gpu, "lips", 80);
        buf.write(gpu, &data);
        assert_eq!(buf.read(gpu).unwrap(), data);

        // A persistent staging buffer can be reused.
        let staging = Staging::new(gpu, "staging", 80);
        let mut out = vec![[0.0; 2]; 80];
        staging.fetch(gpu, &buf, &mut out).unwrap();
        assert_eq!(out, data);
        buf.write(gpu, &vec![[1.0, 2.0]; 80]);
        staging.fetch(gpu, &buf, &mut out).unwrap();
        assert_eq!(out, vec![[1.0, 2.0]; 80]);
    }
}
