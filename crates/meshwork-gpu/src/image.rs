use std::path::Path;

use wgpu::{
    Extent3d, ImageDataLayout, Texture, TextureDescriptor, TextureDimension, TextureFormat,
    TextureUsages,
};

use crate::Gpu;

/// Abstraction over GPU textures that can be fed into a compute pass.
pub trait AsTexture {
    fn as_texture(&self) -> &Texture;
}

impl AsTexture for Texture {
    #[inline]
    fn as_texture(&self) -> &Texture {
        self
    }
}

impl AsTexture for Image {
    #[inline]
    fn as_texture(&self) -> &Texture {
        &self.texture
    }
}

impl<T: AsTexture + ?Sized> AsTexture for &T {
    #[inline]
    fn as_texture(&self) -> &Texture {
        (**self).as_texture()
    }
}

/// An 8-bit RGBA image stored in a sampleable GPU texture.
///
/// The pixel data is kept as non-linear sRGB; shaders that load from the texture see the encoded
/// values mapped to `0.0..=1.0`.
pub struct Image {
    texture: Texture,
}

impl Image {
    /// Creates a blank [`Image`] of the given dimensions.
    ///
    /// Textures are zero-initialized by wgpu, so the image starts out fully transparent black.
    ///
    /// # Panics
    ///
    /// Panics if `width` or `height` is 0, since empty textures fail wgpu validation.
    pub fn new(gpu: &Gpu, width: u32, height: u32) -> Self {
        assert!(
            width > 0 && height > 0,
            "attempted to create empty {width}x{height} image"
        );

        let texture = gpu.device().create_texture(&TextureDescriptor {
            label: Some("image"),
            size: Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_DST
                | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        Self { texture }
    }

    /// Creates an [`Image`] from raw, preexisting RGBA pixel data.
    ///
    /// `buf` needs to contain data in the following interleaved pixel format:
    /// `rrrrrrrr gggggggg bbbbbbbb aaaaaaaa`. Its length needs to be exactly `width * height * 4`,
    /// or this function will panic.
    pub fn from_rgba8(gpu: &Gpu, width: u32, height: u32, buf: &[u8]) -> Self {
        let expected_size = width as usize * height as usize * 4;
        assert_eq!(
            expected_size,
            buf.len(),
            "incorrect buffer size {} for {}x{} image (expected {} bytes)",
            buf.len(),
            width,
            height,
            expected_size,
        );

        let image = Image::new(gpu, width, height);
        gpu.queue().write_texture(
            image.texture.as_image_copy(),
            buf,
            ImageDataLayout {
                bytes_per_row: Some(width * 4),
                ..Default::default()
            },
            Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        image
    }

    /// Returns a new [`Image`] where every pixel has the given RGBA value.
    pub fn filled(gpu: &Gpu, width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let buf = rgba.repeat(width as usize * height as usize);
        Self::from_rgba8(gpu, width, height, &buf)
    }

    /// Uploads a decoded [`image::DynamicImage`].
    pub fn from_dynamic(gpu: &Gpu, image: &image::DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        Self::from_rgba8(gpu, rgba.width(), rgba.height(), rgba.as_raw())
    }

    /// Loads and decodes an image file, then uploads it to the GPU.
    pub fn load<P: AsRef<Path>>(gpu: &Gpu, path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)?;
        log::trace!(
            "loaded {}x{} image from '{}'",
            image.width(),
            image.height(),
            path.display()
        );
        Ok(Self::from_dynamic(gpu, &image))
    }

    /// Returns the width of this image, in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.texture.width()
    }

    /// Returns the height of this image, in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.texture.height()
    }

    #[inline]
    pub fn texture(&self) -> &Texture {
        &self.texture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_image() {
        let gpu = match Gpu::try_get() {
            Ok(gpu) => gpu,
            Err(e) => return eprintln!("skipping GPU test: {e:#}"),
        };

        let image = Image::filled(gpu, 640, 480, [255, 0, 0, 255]);
        assert_eq!(image.width(), 640);
        assert_eq!(image.height(), 480);
        assert_eq!(image.as_texture().format(), TextureFormat::Rgba8Unorm);
        assert!(image
            .texture()
            .usage()
            .contains(TextureUsages::TEXTURE_BINDING));
    }

    #[test]
    fn from_dynamic() {
        let gpu = match Gpu::try_get() {
            Ok(gpu) => gpu,
            Err(e) => return eprintln!("skipping GPU test: {e:#}"),
        };

        let decoded = image::DynamicImage::new_rgb8(12, 7);
        let image = Image::from_dynamic(gpu, &decoded);
        assert_eq!((image.width(), image.height()), (12, 7));
    }
}
