//! Raw network outputs to vertex buffers.
//!
//! All invocations of one frame are recorded into a single command encoder and submitted
//! together. The face-presence flag needs no reshaping and is copied directly.

use meshwork_gpu::{Gpu, GpuBuffer};
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, BufferDescriptor, BufferUsages, CommandEncoder,
    CommandEncoderDescriptor, ComputePassDescriptor, ComputePipeline,
};

use crate::{
    nn::{OutputTensor, Outputs},
    pool::{FrameBuffers, LandmarkSet},
    resources::PostprocessKernel,
    LandmarkVertex, VERTEX_COUNT,
};

const MESH_WORKGROUP_SIZE: u32 = 52;

/// Where one postprocessing invocation writes its vertices.
enum Target<'a> {
    Mesh,
    Landmarks {
        buffer: &'a GpuBuffer<LandmarkVertex>,
        params: &'a wgpu::Buffer,
        count: u32,
    },
}

/// Records and submits postprocessing of every network output into `buffers`.
pub(crate) fn submit(
    gpu: &Gpu,
    kernel: &PostprocessKernel,
    outputs: &Outputs<'_>,
    buffers: &FrameBuffers,
) {
    let mut enc = gpu
        .device()
        .create_command_encoder(&CommandEncoderDescriptor {
            label: Some("postprocess"),
        });

    enc.copy_buffer_to_buffer(
        outputs.face_flag.buffer(),
        outputs.face_flag.offset(),
        buffers.face_flag.raw(),
        0,
        buffers.face_flag.size(),
    );

    invoke(gpu, &mut enc, kernel.mesh(), outputs.mesh, buffers, Target::Mesh);
    for set in LandmarkSet::ALL {
        let slot = buffers.landmarks(set);
        invoke(
            gpu,
            &mut enc,
            kernel.landmarks(),
            outputs.landmarks(set),
            buffers,
            Target::Landmarks {
                buffer: &slot.buffer,
                params: &slot.params,
                count: set.vertex_count() as u32,
            },
        );
    }

    gpu.queue().submit([enc.finish()]);
}

/// Records one kernel invocation reading `source` and writing `target`.
///
/// Output tensors may start at any 4-byte aligned offset, which is not necessarily a valid storage
/// binding offset, so the tensor is first copied into a transient buffer. The buffer handle is
/// released when this returns; the recorded commands keep the allocation alive until they have
/// executed.
fn invoke(
    gpu: &Gpu,
    enc: &mut CommandEncoder,
    pipeline: &ComputePipeline,
    source: OutputTensor<'_>,
    buffers: &FrameBuffers,
    target: Target<'_>,
) {
    let size = (source.len() * 4) as wgpu::BufferAddress;
    let raw = gpu.device().create_buffer(&BufferDescriptor {
        label: Some("postprocess_input"),
        size,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    enc.copy_buffer_to_buffer(source.buffer(), source.offset(), &raw, 0, size);

    let layout = pipeline.get_bind_group_layout(0);
    let (bind_group, workgroups) = match target {
        Target::Mesh => {
            let bind_group = gpu.device().create_bind_group(&BindGroupDescriptor {
                label: Some("postprocess_mesh"),
                layout: &layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: raw.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: buffers.mesh.binding(),
                    },
                ],
            });
            (
                bind_group,
                (VERTEX_COUNT as u32).div_ceil(MESH_WORKGROUP_SIZE),
            )
        }
        Target::Landmarks {
            buffer,
            params,
            count,
        } => {
            let bind_group = gpu.device().create_bind_group(&BindGroupDescriptor {
                label: Some("postprocess_landmarks"),
                layout: &layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: raw.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: buffer.binding(),
                    },
                    BindGroupEntry {
                        binding: 3,
                        resource: params.as_entire_binding(),
                    },
                ],
            });
            (bind_group, count)
        }
    };

    {
        let mut pass = enc.begin_compute_pass(&ComputePassDescriptor {
            label: Some("postprocess"),
            ..Default::default()
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(workgroups, 1, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_workgroups() {
        assert_eq!((VERTEX_COUNT as u32).div_ceil(MESH_WORKGROUP_SIZE), 9);
        assert_eq!(VERTEX_COUNT as u32 % MESH_WORKGROUP_SIZE, 0);
    }
}
