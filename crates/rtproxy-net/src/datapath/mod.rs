//! Packet datapath primitives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Datapath                             │
//! │                                                               │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │  │ Packet       │    │ UdpDatagram  │    │ Relay        │   │
//! │  │ (segments +  │ ─→ │ RtpHeaderMut │ ─→ │ Statistics   │   │
//! │  │  metadata)   │    │ (views)      │    │              │   │
//! │  └──────────────┘    └──────────────┘    └──────────────┘   │
//! │         ↑                   ↑                   ↑            │
//! │         │                   │                   │            │
//! │    Linearized on       In-place header     Cache-line       │
//! │    first access        rewrites            aligned          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod packet;
pub mod stats;

pub use packet::{
    ChecksumOffload, ChecksumState, DeviceFeatures, Packet, RouteInfo, RtpHeaderMut,
    UdpDatagram,
};
pub use stats::{RelayStats, StatsSnapshot};

/// Cache line size for padding (64 bytes on most architectures).
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache line padding to prevent false sharing.
#[repr(C, align(64))]
#[derive(Debug, Default, Clone, Copy)]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Returns a reference to the inner value.
    #[inline]
    pub const fn get(&self) -> &T {
        &self.0
    }
}
