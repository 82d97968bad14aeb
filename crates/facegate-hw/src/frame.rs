//! Frame type and pixel processing: YUYV/Y16 unpacking and JPEG data URLs.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Pixel layout of [`Frame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 8-bit grayscale, 1 byte/pixel.
    Gray8,
    /// Packed 8-bit RGB, 3 bytes/pixel.
    Rgb8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Encode the frame as baseline JPEG at `quality` (1–100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let expected = self.width as usize * self.height as usize * self.layout.bytes_per_pixel();
        if self.data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }

        let color = match self.layout {
            PixelLayout::Gray8 => ExtendedColorType::L8,
            PixelLayout::Rgb8 => ExtendedColorType::Rgb8,
        };

        let mut out = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.data, self.width, self.height, color)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Encode as a `data:image/jpeg;base64,...` URL, the form the server expects.
    pub fn to_data_url(&self, quality: u8) -> Result<String, FrameError> {
        let jpeg = self.encode_jpeg(quality)?;
        Ok(format!(
            "data:image/jpeg;base64,{}",
            BASE64_STANDARD.encode(jpeg)
        ))
    }
}

/// Convert packed YUYV (4:2:2) to packed RGB using integer BT.601 coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        push_rgb(&mut rgb, y0, u, v);
        push_rgb(&mut rgb, y1, u, v);
    }
    Ok(rgb)
}

fn push_rgb(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    out.push(clamp(298 * c + 409 * e + 128));
    out.push(clamp(298 * c - 100 * d - 208 * e + 128));
    out.push(clamp(298 * c + 516 * d + 128));
}

/// Downscale 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Frame {
        Frame {
            data,
            width,
            height,
            layout,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        let yuyv = vec![128, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert_eq!(rgb[0], rgb[1]);
        assert_eq!(rgb[1], rgb[2]);
        assert_eq!(rgb[3], rgb[4]);
        assert_eq!(rgb[4], rgb[5]);
        assert!(rgb[3] > rgb[0]);
    }

    #[test]
    fn test_yuyv_to_rgb_clamps() {
        let yuyv = vec![255, 255, 0, 255];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb[0], 255); // Y=255, V=255 saturates red
        assert!(rgb[5] > 200); // Y=0, U=255 still pushes blue high
        assert_eq!(rgb[4], 0);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let buf = vec![0x34, 0x12, 0xff, 0xab];
        assert_eq!(y16_to_grayscale(&buf, 2, 1).unwrap(), vec![0x12, 0xab]);
    }

    #[test]
    fn test_data_url_is_jpeg() {
        let f = frame(vec![128u8; 16 * 16 * 3], 16, 16, PixelLayout::Rgb8);
        let url = f.to_data_url(80).unwrap();
        let b64 = url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let jpeg = BASE64_STANDARD.decode(b64).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }

    #[test]
    fn test_encode_rejects_short_buffer() {
        let f = frame(vec![0u8; 10], 16, 16, PixelLayout::Gray8);
        assert!(matches!(
            f.encode_jpeg(90),
            Err(FrameError::InvalidLength { expected: 256, actual: 10 })
        ));
    }
}
