use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// One sensor acquisition
#[derive(Clone)]
pub struct Frame {
    /// Raw buffer as delivered by the driver
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host time at which the driver handed the frame over
    pub timestamp: Instant,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats a capture sequence can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Grayscale,
    Yuv422,
    Rgb24,
}

impl PixelFormat {
    /// File extension used for persisted frames.
    pub fn extension(self) -> &'static str {
        match self {
            PixelFormat::Jpeg => "jpg",
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Grayscale => "gray",
            PixelFormat::Yuv422 => "yuv",
            _ => "raw",
        }
    }

    /// Bytes per pixel for uncompressed formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Grayscale => Some(1),
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => Some(2),
            PixelFormat::Rgb24 => Some(3),
        }
    }

    /// Parse a request value, case-insensitive. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(PixelFormat::Jpeg),
            "rgb565" => Some(PixelFormat::Rgb565),
            "grayscale" | "gray" => Some(PixelFormat::Grayscale),
            "yuv422" | "yuv" => Some(PixelFormat::Yuv422),
            "rgb24" | "rgb888" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PixelFormat::Jpeg => "jpeg",
            PixelFormat::Rgb565 => "rgb565",
            PixelFormat::Grayscale => "grayscale",
            PixelFormat::Yuv422 => "yuv422",
            PixelFormat::Rgb24 => "rgb24",
        })
    }
}

/// Named sensor resolutions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSize {
    Qqvga,
    Qvga,
    Vga,
    Svga,
    Xga,
    Sxga,
    Uxga,
}

impl FrameSize {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FrameSize::Qqvga => (160, 120),
            FrameSize::Qvga => (320, 240),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Sxga => (1280, 1024),
            FrameSize::Uxga => (1600, 1200),
        }
    }

    /// Parse a request value, case-insensitive. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qqvga" => Some(FrameSize::Qqvga),
            "qvga" => Some(FrameSize::Qvga),
            "vga" => Some(FrameSize::Vga),
            "svga" => Some(FrameSize::Svga),
            "xga" => Some(FrameSize::Xga),
            "sxga" => Some(FrameSize::Sxga),
            "uxga" => Some(FrameSize::Uxga),
            _ => None,
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameSize::Qqvga => "qqvga",
            FrameSize::Qvga => "qvga",
            FrameSize::Vga => "vga",
            FrameSize::Svga => "svga",
            FrameSize::Xga => "xga",
            FrameSize::Sxga => "sxga",
            FrameSize::Uxga => "uxga",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_follows_format() {
        assert_eq!(PixelFormat::Jpeg.extension(), "jpg");
        assert_eq!(PixelFormat::Rgb565.extension(), "rgb565");
        assert_eq!(PixelFormat::Grayscale.extension(), "gray");
        assert_eq!(PixelFormat::Yuv422.extension(), "yuv");
        assert_eq!(PixelFormat::Rgb24.extension(), "raw");
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!(PixelFormat::parse("RGB565"), Some(PixelFormat::Rgb565));
        assert_eq!(PixelFormat::parse("GrayScale"), Some(PixelFormat::Grayscale));
        assert_eq!(PixelFormat::parse("bmp"), None);
        assert_eq!(FrameSize::parse("UXGA"), Some(FrameSize::Uxga));
        assert_eq!(FrameSize::parse(" qvga "), Some(FrameSize::Qvga));
        assert_eq!(FrameSize::parse("4k"), None);
    }
}
