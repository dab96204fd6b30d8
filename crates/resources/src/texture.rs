use crate::error::ResourceError;
use spartan_common::Color;
use std::path::Path;

/// Decoded RGBA8 texture data.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub srgb: bool,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// A 1x1 texture of a single color.
    pub fn solid(name: impl Into<String>, color: Color, srgb: bool) -> Self {
        Self {
            name: name.into(),
            width: 1,
            height: 1,
            srgb,
            pixels: color.to_rgba8().to_vec(),
        }
    }

    /// Decode PNG or JPEG bytes.
    pub fn decode(
        name: impl Into<String>,
        bytes: &[u8],
        srgb: bool,
    ) -> Result<Self, ResourceError> {
        let name = name.into();
        let img = image::load_from_memory(bytes).map_err(|e| ResourceError::Decode {
            path: name.clone().into(),
            reason: e.to_string(),
        })?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            name,
            width,
            height,
            srgb,
            pixels: rgba.into_raw(),
        })
    }

    /// Read and decode an image file.
    pub fn load(path: &Path, srgb: bool) -> Result<Self, ResourceError> {
        let bytes = std::fs::read(path).map_err(|e| ResourceError::io(path, e))?;
        Self::decode(path.to_string_lossy(), &bytes, srgb).map_err(|e| match e {
            ResourceError::Decode { reason, .. } => ResourceError::Decode {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_texture_is_one_pixel() {
        let t = TextureData::solid("missing", Color::MISSING, true);
        assert_eq!((t.width, t.height), (1, 1));
        assert_eq!(t.pixels, vec![255, 0, 255, 255]);
    }

    #[test]
    fn decode_png_roundtrip() {
        let img = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let t = TextureData::decode("t.png", &bytes, false).unwrap();
        assert_eq!((t.width, t.height), (2, 3));
        assert_eq!(&t.pixels[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn decode_garbage_fails() {
        let err = TextureData::decode("bad.png", b"not an image", true).unwrap_err();
        assert!(matches!(err, ResourceError::Decode { .. }));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = TextureData::load(Path::new("/definitely/not/here.png"), true).unwrap_err();
        assert!(matches!(err, ResourceError::Io { .. }));
    }
}
