//! Image to tensor conversion.

use meshwork_gpu::Gpu;
use wgpu::{
    BindGroupDescriptor, BindGroupEntry, BindingResource, CommandEncoderDescriptor,
    ComputePassDescriptor, Extent3d, Texture, TextureDimension, TextureFormat, TextureUsages,
    TextureViewDescriptor,
};

use crate::{error::Error, pool::FrameBuffers, resources::PreprocessKernel, IMAGE_SIZE};

const WORKGROUP_SIZE: u32 = 8;

/// Checks that the preprocessing kernel can sample `texture`.
pub(crate) fn check_texture(texture: &Texture) -> Result<(), Error> {
    check_properties(
        texture.format(),
        texture.usage(),
        texture.dimension(),
        texture.sample_count(),
        texture.size(),
    )
}

fn check_properties(
    format: TextureFormat,
    usage: TextureUsages,
    dimension: TextureDimension,
    sample_count: u32,
    size: Extent3d,
) -> Result<(), Error> {
    if !usage.contains(TextureUsages::TEXTURE_BINDING) {
        return Err(Error::UnsampleableImage(
            "texture was not created with `TEXTURE_BINDING` usage".into(),
        ));
    }
    if dimension != TextureDimension::D2 || size.depth_or_array_layers != 1 {
        return Err(Error::UnsampleableImage(format!(
            "expected a single 2D texture, got {dimension:?} texture with {} layers",
            size.depth_or_array_layers,
        )));
    }
    if size.width == 0 || size.height == 0 {
        return Err(Error::UnsampleableImage(format!(
            "texture is empty ({}x{})",
            size.width, size.height,
        )));
    }
    if sample_count != 1 {
        return Err(Error::UnsampleableImage(format!(
            "multisampled textures are not supported (sample count {sample_count})"
        )));
    }
    if !is_color_format(format) {
        return Err(Error::UnsampleableImage(format!(
            "texture format {format:?} is not a filterable color format"
        )));
    }
    Ok(())
}

fn is_color_format(format: TextureFormat) -> bool {
    use TextureFormat::*;

    matches!(
        format,
        R8Unorm
            | Rg8Unorm
            | Rgba8Unorm
            | Rgba8UnormSrgb
            | Bgra8Unorm
            | Bgra8UnormSrgb
            | R16Float
            | Rg16Float
            | Rgba16Float
            | Rgb10a2Unorm
    )
}

/// Records and submits the preprocessing dispatch, writing `buffers.pre_tensor`.
pub(crate) fn submit(
    gpu: &Gpu,
    kernel: &PreprocessKernel,
    buffers: &FrameBuffers,
    texture: &Texture,
) {
    let view = texture.create_view(&TextureViewDescriptor::default());
    let bind_group = gpu.device().create_bind_group(&BindGroupDescriptor {
        label: Some("preprocess"),
        layout: &kernel.pipeline().get_bind_group_layout(0),
        entries: &[
            BindGroupEntry {
                binding: 0,
                resource: BindingResource::TextureView(&view),
            },
            BindGroupEntry {
                binding: 1,
                resource: buffers.pre_tensor.binding(),
            },
            BindGroupEntry {
                binding: 2,
                resource: buffers.color_map.as_entire_binding(),
            },
        ],
    });

    let mut enc = gpu
        .device()
        .create_command_encoder(&CommandEncoderDescriptor {
            label: Some("preprocess"),
        });
    {
        let mut pass = enc.begin_compute_pass(&ComputePassDescriptor {
            label: Some("preprocess"),
            ..Default::default()
        });
        pass.set_pipeline(kernel.pipeline());
        pass.set_bind_group(0, &bind_group, &[]);
        let groups = IMAGE_SIZE.div_ceil(WORKGROUP_SIZE);
        pass.dispatch_workgroups(groups, groups, 1);
    }
    gpu.queue().submit([enc.finish()]);
}
