//! Transfer buffers cycling through the conversion pipeline.
//!
//! A [`TransferBuffer`] is a reusable, indexed unit of converter memory.
//! Input-plane buffers bind an exported frame image (an
//! [`ExternalHandle`]) for the duration of one conversion cycle;
//! result-plane buffers carry device-mapped storage the host can read.
//! Buffers are allocated once at plane setup and cycle forever between
//! the ready queue, the worker, and the converter; they are released as
//! a batch when the pipeline is torn down.

use crate::format::{PixelFormat, Resolution};
use smallvec::SmallVec;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Maximum number of memory planes a buffer can carry.
pub const MAX_PLANES: usize = 3;

/// Non-zero `bytes_used` stamp for submitted input buffers.
///
/// The converter treats a zero byte count as "no data" and skips the
/// buffer, so the worker stamps this marker before queueing even though
/// the true payload lives behind the external handle.
pub const PAYLOAD_MARKER: u32 = 1;

/// Externally owned image memory bound to a buffer for one cycle.
///
/// Dropping the handle releases the underlying resource. The handle is
/// created by [`CaptureFrame::export`](crate::source::CaptureFrame::export)
/// and travels with the input buffer until the input-plane completion
/// fires, at which point the dispatcher drops it.
pub trait ExternalImage: Send + std::fmt::Debug {}

/// Owned handle to external image memory.
pub type ExternalHandle = Box<dyn ExternalImage>;

/// A dmabuf-backed external image.
///
/// The most common concrete handle on Linux: a frame exported as a
/// DMA-BUF file descriptor. Closing the descriptor (on drop) releases
/// the image back to its allocator.
#[derive(Debug)]
pub struct DmaBufImage {
    fd: OwnedFd,
}

impl DmaBufImage {
    /// Wrap an exported DMA-BUF file descriptor.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// The raw descriptor, for handing to device plane configuration.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl ExternalImage for DmaBufImage {}

/// One memory plane of a transfer buffer.
#[derive(Debug)]
pub struct TransferPlane {
    /// Plane width in pixels.
    pub width: u32,
    /// Plane height in pixels.
    pub height: u32,
    /// Payload byte count; zero means "empty" to the converter.
    pub bytes_used: u32,
    /// Device-mapped storage, present only for mapped-mode planes.
    data: Option<Vec<u8>>,
}

impl TransferPlane {
    /// Create a plane with no host-visible storage (import mode).
    pub fn imported(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bytes_used: 0,
            data: None,
        }
    }

    /// Create a plane backed by device-mapped storage of `size` bytes.
    pub fn mapped(width: u32, height: u32, size: usize) -> Self {
        Self {
            width,
            height,
            bytes_used: 0,
            data: Some(vec![0; size]),
        }
    }

    /// Host-visible plane data, if this plane is mapped.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Mutable host-visible plane data, if this plane is mapped.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }
}

/// A reusable, indexed unit of converter buffer memory.
///
/// Identity is the pool index assigned at plane setup; a buffer keeps
/// its index across every cycle through the pipeline, while the bound
/// external handle (if any) differs each cycle.
#[derive(Debug)]
pub struct TransferBuffer {
    index: u32,
    planes: SmallVec<[TransferPlane; MAX_PLANES]>,
    handle: Option<ExternalHandle>,
}

impl TransferBuffer {
    /// Create a buffer from pre-built planes.
    pub fn new(index: u32, planes: SmallVec<[TransferPlane; MAX_PLANES]>) -> Self {
        Self {
            index,
            planes,
            handle: None,
        }
    }

    /// Create an import-mode buffer (input plane): one descriptor per
    /// format plane, no host-visible storage.
    pub fn imported(index: u32, format: PixelFormat, resolution: Resolution) -> Self {
        let planes = (0..format.plane_count())
            .map(|i| {
                let (w, h) = format.plane_dimensions(i, resolution);
                TransferPlane::imported(w, h)
            })
            .collect();
        Self::new(index, planes)
    }

    /// Create a mapped-mode buffer (result plane): device storage is
    /// allocated per plane and host-readable.
    pub fn mapped(index: u32, format: PixelFormat, resolution: Resolution) -> Self {
        let planes = (0..format.plane_count())
            .map(|i| {
                let (w, h) = format.plane_dimensions(i, resolution);
                TransferPlane::mapped(w, h, format.plane_size(i, resolution))
            })
            .collect();
        Self::new(index, planes)
    }

    /// Pool index identifying this buffer.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The buffer's planes.
    pub fn planes(&self) -> &[TransferPlane] {
        &self.planes
    }

    /// Mutable access to the buffer's planes.
    pub fn planes_mut(&mut self) -> &mut [TransferPlane] {
        &mut self.planes
    }

    /// Payload byte count reported by plane 0.
    pub fn bytes_used(&self) -> u32 {
        self.planes.first().map(|p| p.bytes_used).unwrap_or(0)
    }

    /// Stamp plane 0 with the non-zero payload marker so the converter
    /// processes the buffer.
    pub fn mark_populated(&mut self) {
        if let Some(plane) = self.planes.first_mut() {
            plane.bytes_used = PAYLOAD_MARKER;
        }
    }

    /// Reset every plane's byte count to zero (logically empty).
    pub fn clear_payload(&mut self) {
        for plane in &mut self.planes {
            plane.bytes_used = 0;
        }
    }

    /// Bind an external image handle for the current cycle.
    pub fn attach_handle(&mut self, handle: ExternalHandle) {
        self.handle = Some(handle);
    }

    /// Take the bound external handle, if any.
    pub fn take_handle(&mut self) -> Option<ExternalHandle> {
        self.handle.take()
    }

    /// Whether an external handle is currently bound.
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Token;
    impl ExternalImage for Token {}

    #[test]
    fn test_imported_buffer_layout() {
        let buf = TransferBuffer::imported(3, PixelFormat::I420, Resolution::new(640, 480));
        assert_eq!(buf.index(), 3);
        assert_eq!(buf.planes().len(), 3);
        assert!(buf.planes()[0].data().is_none());
        assert_eq!(buf.bytes_used(), 0);
    }

    #[test]
    fn test_mapped_buffer_storage() {
        let res = Resolution::new(64, 48);
        let buf = TransferBuffer::mapped(0, PixelFormat::Rgba, res);
        assert_eq!(buf.planes().len(), 1);
        assert_eq!(buf.planes()[0].data().unwrap().len(), 64 * 48 * 4);
    }

    #[test]
    fn test_payload_marker_round_trip() {
        let mut buf = TransferBuffer::imported(0, PixelFormat::Nv12, Resolution::new(64, 48));
        buf.mark_populated();
        assert_eq!(buf.bytes_used(), PAYLOAD_MARKER);
        buf.clear_payload();
        assert_eq!(buf.bytes_used(), 0);
    }

    #[test]
    fn test_dmabuf_image_owns_fd() {
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let image = DmaBufImage::from_fd(fd);
        assert!(image.raw_fd() >= 0);
        let handle: ExternalHandle = Box::new(image);
        drop(handle);
    }

    #[test]
    fn test_handle_attach_take() {
        let mut buf = TransferBuffer::imported(0, PixelFormat::I420, Resolution::new(64, 48));
        assert!(!buf.has_handle());
        buf.attach_handle(Box::new(Token));
        assert!(buf.has_handle());
        assert!(buf.take_handle().is_some());
        assert!(!buf.has_handle());
    }
}
