//! Pixel format, memory layout, and resolution types.
//!
//! These describe the fixed formats a conversion pipeline negotiates at
//! construction time: the source-side format the capture stream
//! exports, and the result-side format the converter emits.
//!
//! # Design Principles
//!
//! - **Type safety**: Use enums instead of stringly-typed formats
//! - **Zero-cost**: Small, Copy types wherever possible
//! - **Explicit**: Clear format descriptions, no implicit conversions

/// Pixel formats understood by the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, three planes (Y, U, V).
    I420,
    /// Semi-planar YUV 4:2:0, two planes (Y, interleaved UV).
    Nv12,
    /// Packed YUV 4:2:2, single plane.
    Yuyv,
    /// Packed RGBA, 4 bytes per pixel, single plane.
    Rgba,
    /// Packed BGRA, 4 bytes per pixel, single plane.
    Bgra,
    /// Packed RGB, 3 bytes per pixel, single plane.
    Rgb24,
    /// 8-bit grayscale, single plane.
    Gray8,
}

impl PixelFormat {
    /// Number of memory planes this format occupies.
    pub fn plane_count(&self) -> usize {
        match self {
            Self::I420 => 3,
            Self::Nv12 => 2,
            Self::Yuyv | Self::Rgba | Self::Bgra | Self::Rgb24 | Self::Gray8 => 1,
        }
    }

    /// Total frame size in bytes at the given resolution.
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixels();
        match self {
            Self::I420 | Self::Nv12 => pixels * 3 / 2,
            Self::Yuyv => pixels * 2,
            Self::Rgba | Self::Bgra => pixels * 4,
            Self::Rgb24 => pixels * 3,
            Self::Gray8 => pixels,
        }
    }

    /// Dimensions of the nth plane at the given resolution.
    ///
    /// Chroma planes of subsampled formats are half-height (and
    /// half-width for fully planar layouts); plane 0 is always full
    /// size.
    pub fn plane_dimensions(&self, plane: usize, resolution: Resolution) -> (u32, u32) {
        match (self, plane) {
            (Self::I420, 1) | (Self::I420, 2) => (resolution.width / 2, resolution.height / 2),
            (Self::Nv12, 1) => (resolution.width, resolution.height / 2),
            _ => (resolution.width, resolution.height),
        }
    }

    /// Size in bytes of the nth plane at the given resolution.
    pub fn plane_size(&self, plane: usize, resolution: Resolution) -> usize {
        let (w, h) = self.plane_dimensions(plane, resolution);
        match (self, plane) {
            // Packed single-plane formats carry the whole frame.
            (Self::Yuyv, 0) => (w * h * 2) as usize,
            (Self::Rgba, 0) | (Self::Bgra, 0) => (w * h * 4) as usize,
            (Self::Rgb24, 0) => (w * h * 3) as usize,
            _ => (w * h) as usize,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::I420 => "I420",
            Self::Nv12 => "NV12",
            Self::Yuyv => "YUYV",
            Self::Rgba => "RGBA",
            Self::Bgra => "BGRA",
            Self::Rgb24 => "RGB24",
            Self::Gray8 => "GRAY8",
        };
        f.write_str(name)
    }
}

/// Physical layout of pixel memory.
///
/// Hardware converters distinguish tiled device-internal layouts from
/// linear layouts the host can read directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLayout {
    /// Device-internal tiled layout; only the hardware reads it.
    BlockLinear,
    /// Row-major layout readable by the host.
    #[default]
    Pitch,
}

impl std::fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockLinear => f.write_str("block-linear"),
            Self::Pitch => f.write_str("pitch"),
        }
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Check that both dimensions are non-zero.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let res = Resolution::new(640, 480);
        assert_eq!(PixelFormat::I420.frame_size(res), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Nv12.frame_size(res), 640 * 480 * 3 / 2);
        assert_eq!(PixelFormat::Yuyv.frame_size(res), 640 * 480 * 2);
        assert_eq!(PixelFormat::Rgba.frame_size(res), 640 * 480 * 4);
        assert_eq!(PixelFormat::Gray8.frame_size(res), 640 * 480);
    }

    #[test]
    fn test_plane_counts() {
        assert_eq!(PixelFormat::I420.plane_count(), 3);
        assert_eq!(PixelFormat::Nv12.plane_count(), 2);
        assert_eq!(PixelFormat::Rgba.plane_count(), 1);
    }

    #[test]
    fn test_plane_dimensions_subsampled() {
        let res = Resolution::new(640, 480);
        assert_eq!(PixelFormat::I420.plane_dimensions(0, res), (640, 480));
        assert_eq!(PixelFormat::I420.plane_dimensions(1, res), (320, 240));
        assert_eq!(PixelFormat::Nv12.plane_dimensions(1, res), (640, 240));
    }

    #[test]
    fn test_plane_sizes_sum_to_frame_size() {
        let res = Resolution::new(640, 480);
        for format in [PixelFormat::I420, PixelFormat::Nv12, PixelFormat::Rgba] {
            let total: usize = (0..format.plane_count())
                .map(|i| format.plane_size(i, res))
                .sum();
            assert_eq!(total, format.frame_size(res), "{format}");
        }
    }
}
