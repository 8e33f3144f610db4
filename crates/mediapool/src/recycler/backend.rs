//! Pluggable buffer backends and the backend registry
//!
//! A backend owns the storage strategy for packet and frame buffers. The
//! built-in heap backend lays frames out plane by plane with aligned
//! strides. Hardware-accelerated backends register under their own names;
//! an absent backend is simply not in the registry.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{MemoryError, MemoryResult};

/// Planar formats carry at most this many planes.
pub const MAX_PLANES: usize = 4;

/// Pixel formats the frame recycler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Rgb24,
    Rgba,
    Gray8,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Rgba => "rgba",
            Self::Gray8 => "gray8",
        }
    }

    /// Number of planes in this format.
    pub fn planes(self) -> usize {
        match self {
            Self::Yuv420p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Rgba | Self::Gray8 => 1,
        }
    }

    /// Unaligned row width in bytes and row count for plane `plane`.
    fn plane_dims(self, width: u32, height: u32, plane: usize) -> (usize, usize) {
        let (w, h) = (width as usize, height as usize);
        match (self, plane) {
            (Self::Yuv420p, 0) => (w, h),
            (Self::Yuv420p, 1 | 2) => (w.div_ceil(2), h.div_ceil(2)),
            (Self::Nv12, 0) => (w, h),
            // Interleaved UV: full width, half height.
            (Self::Nv12, 1) => (w, h.div_ceil(2)),
            (Self::Rgb24, 0) => (w * 3, h),
            (Self::Rgba, 0) => (w * 4, h),
            (Self::Gray8, 0) => (w, h),
            _ => (0, 0),
        }
    }
}

/// Geometry of a decoded frame. Keys a frame sub-pool, so two streams with
/// identical geometry share buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Stride alignment in bytes; must be a power of two
    pub alignment: usize,
}

impl FrameSpec {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            alignment: 32,
        }
    }

    pub fn validate(&self) -> MemoryResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(MemoryError::invalid_params(
                "frame dimensions must be > 0",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(MemoryError::invalid_params(
                "stride alignment must be a power of two",
            ));
        }
        Ok(())
    }

    /// Per-plane strides, offsets, and the total buffer size.
    pub fn layout(&self) -> FrameLayout {
        let planes = self.format.planes();
        let mut strides = [0usize; MAX_PLANES];
        let mut offsets = [0usize; MAX_PLANES];
        let mut total = 0usize;
        for plane in 0..planes {
            let (row, rows) = self.format.plane_dims(self.width, self.height, plane);
            let stride = row.div_ceil(self.alignment) * self.alignment;
            strides[plane] = stride;
            offsets[plane] = total;
            total += stride * rows;
        }
        FrameLayout {
            strides,
            offsets,
            planes,
            size: total,
        }
    }
}

/// Computed plane layout for a [`FrameSpec`].
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    pub strides: [usize; MAX_PLANES],
    pub offsets: [usize; MAX_PLANES],
    pub planes: usize,
    pub size: usize,
}

/// Reusable compressed-packet buffer.
#[derive(Debug, Default)]
pub struct PacketBuf {
    pub data: Vec<u8>,
}

impl PacketBuf {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

/// Reusable decoded-frame buffer with plane metadata.
#[derive(Debug)]
pub struct FrameBuf {
    pub data: Vec<u8>,
    pub strides: [usize; MAX_PLANES],
    pub offsets: [usize; MAX_PLANES],
    pub planes: usize,
    pub spec: FrameSpec,
}

impl FrameBuf {
    /// Byte slice of plane `plane`.
    pub fn plane(&self, plane: usize) -> &[u8] {
        let start = self.offsets[plane];
        let end = if plane + 1 < self.planes {
            self.offsets[plane + 1]
        } else {
            self.data.len()
        };
        &self.data[start..end]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        let start = self.offsets[plane];
        let end = if plane + 1 < self.planes {
            self.offsets[plane + 1]
        } else {
            self.data.len()
        };
        &mut self.data[start..end]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Storage strategy for packet and frame buffers.
pub trait BufferBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can lay out frames of `format`. Hardware
    /// backends typically cover a subset; heap storage covers everything.
    fn supports(&self, _format: PixelFormat) -> bool {
        true
    }

    /// Allocate a packet buffer with at least `capacity` bytes.
    fn alloc_packet(&self, capacity: usize) -> PacketBuf;

    /// Scrub a packet buffer for reuse. Capacity must survive.
    fn reset_packet(&self, buf: &mut PacketBuf) {
        buf.data.clear();
    }

    /// Allocate and lay out a frame buffer for `spec`.
    fn alloc_frame(&self, spec: &FrameSpec) -> MemoryResult<FrameBuf>;

    /// Scrub a frame buffer for reuse.
    fn reset_frame(&self, _buf: &mut FrameBuf) {}
}

/// Plain heap storage, always available.
#[derive(Debug, Default)]
pub struct HeapBackend;

impl BufferBackend for HeapBackend {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn alloc_packet(&self, capacity: usize) -> PacketBuf {
        PacketBuf {
            data: Vec::with_capacity(capacity),
        }
    }

    fn alloc_frame(&self, spec: &FrameSpec) -> MemoryResult<FrameBuf> {
        spec.validate()?;
        let layout = spec.layout();
        Ok(FrameBuf {
            data: vec![0u8; layout.size],
            strides: layout.strides,
            offsets: layout.offsets,
            planes: layout.planes,
            spec: *spec,
        })
    }
}

/// Named backend registry with deterministic detection order.
pub struct BackendRegistry {
    backends: FxHashMap<&'static str, Arc<dyn BufferBackend>>,
}

/// Detection preference, best first. Hardware backends win over plain heap
/// when something registered them.
const DETECT_ORDER: [&str; 3] = ["ffmpeg", "gstreamer", "heap"];

impl BackendRegistry {
    /// Empty registry. `get` and `detect` fail until something registers.
    pub fn new() -> Self {
        Self {
            backends: FxHashMap::default(),
        }
    }

    /// Registry with the heap backend pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HeapBackend));
        registry
    }

    /// Register a backend under its own name, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn BufferBackend>) {
        debug!(backend = backend.name(), "registered buffer backend");
        self.backends.insert(backend.name(), backend);
    }

    pub fn get(&self, name: &str) -> MemoryResult<Arc<dyn BufferBackend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| MemoryError::BackendUnavailable {
                requested: name.to_string(),
            })
    }

    /// Pick the best registered backend by detection order, then any other
    /// registered backend, deterministically by name.
    pub fn detect(&self) -> MemoryResult<Arc<dyn BufferBackend>> {
        for name in DETECT_ORDER {
            if let Some(backend) = self.backends.get(name) {
                return Ok(Arc::clone(backend));
            }
        }
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
            .first()
            .map(|name| Arc::clone(&self.backends[name]))
            .ok_or_else(|| MemoryError::BackendUnavailable {
                requested: "any".to_string(),
            })
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420p_layout_is_aligned() {
        let spec = FrameSpec::new(1920, 1080, PixelFormat::Yuv420p);
        let layout = spec.layout();
        assert_eq!(layout.planes, 3);
        assert_eq!(layout.strides[0], 1920);
        assert_eq!(layout.strides[1], 960);
        for plane in 0..layout.planes {
            assert_eq!(layout.strides[plane] % 32, 0);
        }
        // Luma + two quarter-size chroma planes.
        assert_eq!(layout.size, 1920 * 1080 + 2 * 960 * 540);
    }

    #[test]
    fn odd_dimensions_round_up() {
        let spec = FrameSpec::new(1919, 1079, PixelFormat::Yuv420p);
        let layout = spec.layout();
        // 1919 rounds to the next 32-byte stride, chroma covers 960x540.
        assert_eq!(layout.strides[0], 1920);
        assert_eq!(layout.strides[1], 960);
        assert_eq!(layout.offsets[1], 1920 * 1079);
    }

    #[test]
    fn nv12_has_interleaved_chroma() {
        let spec = FrameSpec::new(640, 480, PixelFormat::Nv12);
        let layout = spec.layout();
        assert_eq!(layout.planes, 2);
        assert_eq!(layout.strides[1], 640);
        assert_eq!(layout.size, 640 * 480 + 640 * 240);
    }

    #[test]
    fn heap_backend_frame_planes() {
        let backend = HeapBackend;
        let spec = FrameSpec::new(320, 240, PixelFormat::Rgba);
        let frame = backend.alloc_frame(&spec).unwrap();
        assert_eq!(frame.planes, 1);
        assert_eq!(frame.plane(0).len(), 320 * 4 * 240);
    }

    #[test]
    fn rejects_zero_dimension() {
        let backend = HeapBackend;
        let spec = FrameSpec::new(0, 240, PixelFormat::Gray8);
        assert!(matches!(
            backend.alloc_frame(&spec),
            Err(MemoryError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn detection_prefers_accelerated_backends() {
        struct FakeFfmpeg;
        impl BufferBackend for FakeFfmpeg {
            fn name(&self) -> &'static str {
                "ffmpeg"
            }
            fn alloc_packet(&self, capacity: usize) -> PacketBuf {
                PacketBuf {
                    data: Vec::with_capacity(capacity),
                }
            }
            fn alloc_frame(&self, spec: &FrameSpec) -> MemoryResult<FrameBuf> {
                HeapBackend.alloc_frame(spec)
            }
        }

        let mut registry = BackendRegistry::with_defaults();
        assert_eq!(registry.detect().unwrap().name(), "heap");

        registry.register(Arc::new(FakeFfmpeg));
        assert_eq!(registry.detect().unwrap().name(), "ffmpeg");
        assert_eq!(registry.names(), vec!["ffmpeg", "heap"]);
    }

    #[test]
    fn missing_backend_is_an_error() {
        let registry = BackendRegistry::with_defaults();
        assert!(matches!(
            registry.get("cuda"),
            Err(MemoryError::BackendUnavailable { .. })
        ));
        assert!(BackendRegistry::new().detect().is_err());
    }
}
