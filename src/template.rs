use crate::error::CertForgeError;
use base64::Engine;
use image::GenericImageView;
use std::path::Path;

/// Background artwork drawn full-page beneath the layout fields.
///
/// Pixels are decoded once, flattened onto white, and kept zlib-compressed so
/// every rendered row can embed them without touching the source image again.
#[derive(Debug)]
pub struct TemplateImage {
    width_px: u32,
    height_px: u32,
    compressed_rgb: Vec<u8>,
}

impl TemplateImage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertForgeError> {
        let decoded = match image::guess_format(bytes) {
            Ok(format) => image::load_from_memory_with_format(bytes, format),
            Err(_) => image::load_from_memory(bytes),
        }
        .map_err(|err| CertForgeError::Asset(format!("unreadable template image: {}", err)))?;
        let (width_px, height_px) = decoded.dimensions();
        if width_px == 0 || height_px == 0 {
            return Err(CertForgeError::Asset(
                "template image has no pixels".to_string(),
            ));
        }
        let rgba = decoded.to_rgba8();
        let mut rgb = Vec::with_capacity(width_px as usize * height_px as usize * 3);
        for px in rgba.as_raw().chunks_exact(4) {
            let alpha = px[3] as u16;
            for channel in &px[..3] {
                // Composite over white.
                let value = (*channel as u16 * alpha + 255 * (255 - alpha) + 127) / 255;
                rgb.push(value as u8);
            }
        }
        Ok(Self {
            width_px,
            height_px,
            compressed_rgb: miniz_oxide::deflate::compress_to_vec_zlib(&rgb, 6),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CertForgeError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(&bytes)
    }

    /// Accepts the `data:image/...;base64,` URLs the layout editor uploads.
    pub fn from_data_url(source: &str) -> Result<Self, CertForgeError> {
        let Some((header, payload)) = source
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(','))
        else {
            return Err(CertForgeError::Asset(
                "template is not a data URL".to_string(),
            ));
        };
        if !header.contains("base64") {
            return Self::from_bytes(payload.as_bytes());
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|err| CertForgeError::Asset(format!("invalid template base64: {}", err)))?;
        Self::from_bytes(&bytes)
    }

    pub fn width_px(&self) -> u32 {
        self.width_px
    }

    pub fn height_px(&self) -> u32 {
        self.height_px
    }

    pub(crate) fn compressed_rgb(&self) -> &[u8] {
        &self.compressed_rgb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(pixel));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    #[test]
    fn decodes_dimensions_and_flattens_alpha_onto_white() {
        let template = TemplateImage::from_bytes(&png(6, 3, [0, 0, 0, 0])).expect("template");
        assert_eq!((template.width_px(), template.height_px()), (6, 3));
        let rgb = miniz_oxide::inflate::decompress_to_vec_zlib(template.compressed_rgb())
            .expect("inflate");
        assert_eq!(rgb.len(), 6 * 3 * 3);
        assert!(rgb.iter().all(|&v| v == 255));

        let template = TemplateImage::from_bytes(&png(1, 1, [200, 10, 0, 255])).expect("opaque");
        let rgb = miniz_oxide::inflate::decompress_to_vec_zlib(template.compressed_rgb())
            .expect("inflate");
        assert_eq!(rgb, [200, 10, 0]);
    }

    #[test]
    fn data_urls_are_decoded() {
        let url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(png(4, 8, [1, 2, 3, 255]))
        );
        let template = TemplateImage::from_data_url(&url).expect("template");
        assert_eq!((template.width_px(), template.height_px()), (4, 8));
        assert!(matches!(
            TemplateImage::from_data_url("https://example.com/a.png"),
            Err(CertForgeError::Asset(_))
        ));
    }

    #[test]
    fn garbage_is_an_asset_error() {
        assert!(matches!(
            TemplateImage::from_bytes(b"not an image"),
            Err(CertForgeError::Asset(_))
        ));
    }
}
