//! Size-categorized buffer recycling for packets and frames
//!
//! Compressed packets are bucketed into size categories, each holding a
//! handful of target-size sub-pools. Decoded frames are pooled per exact
//! [`FrameSpec`]. Both recyclers hand out RAII leases that return the
//! buffer on drop, and both lean on a pluggable [`BufferBackend`] for the
//! actual storage.

mod backend;
mod frame;
mod packet;

pub use backend::{
    BackendRegistry, BufferBackend, FrameBuf, FrameSpec, HeapBackend, MAX_PLANES, PacketBuf,
    PixelFormat,
};
pub use frame::{FramePoolInfo, FrameLease, FrameRecycler, SharedFrame};
pub use packet::{CategoryInfo, PacketLease, PacketRecycler, SharedPacket};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Packet size buckets. Boundaries follow typical compressed media sizes:
/// audio packets are tiny, P-frames small to medium, keyframes large.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeCategory {
    /// Up to 1 KiB
    Tiny,
    /// Up to 16 KiB
    Small,
    /// Up to 256 KiB
    Medium,
    /// Up to 1 MiB
    Large,
    /// Everything above 1 MiB
    ExtraLarge,
}

impl SizeCategory {
    pub const ALL: [Self; 5] = [
        Self::Tiny,
        Self::Small,
        Self::Medium,
        Self::Large,
        Self::ExtraLarge,
    ];

    /// Bucket a requested size.
    pub fn for_size(size: usize) -> Self {
        if size <= KIB {
            Self::Tiny
        } else if size <= 16 * KIB {
            Self::Small
        } else if size <= 256 * KIB {
            Self::Medium
        } else if size <= MIB {
            Self::Large
        } else {
            Self::ExtraLarge
        }
    }

    /// Capacity actually allocated for a request of `size` bytes. Fixed per
    /// category so buffers are interchangeable within a sub-pool; extra-large
    /// requests round up to the next MiB.
    pub fn suggested_size(self, size: usize) -> usize {
        match self {
            Self::Tiny => KIB,
            Self::Small => 16 * KIB,
            Self::Medium => 256 * KIB,
            Self::Large => MIB,
            Self::ExtraLarge => size.div_ceil(MIB) * MIB,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::ExtraLarge => "extra-large",
        }
    }
}
