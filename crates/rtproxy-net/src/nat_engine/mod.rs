//! RTP relay NAT engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Checkpoint Dispatcher                       │
//! │  PRE_ROUTING / LOCAL_OUT        LOCAL_IN / POST_ROUTING          │
//! │        (pre-decision)              (post-decision)               │
//! │                              │                                   │
//! │   parse ─→ config ─→ session lookup by destination port          │
//! │                              │                                   │
//! │                 no session   │   session                         │
//! │               pass through ←─┴─→                                 │
//! │                              ↓                                   │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                  Classify + Rewrite                         │ │
//! │  │  - Loopback / Outgoing / Incoming / Ambiguous / NoRoute     │ │
//! │  │  - pre-decision: destination address only                   │ │
//! │  │  - post-decision: source, ports, RTP smoothing              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                              │                                   │
//! │                              ↓                                   │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                  Checksum Offload                           │ │
//! │  │  - inbound: diagnostics, CHECKSUM_COMPLETE downgrade        │ │
//! │  │  - outbound: IP header + full or partial UDP checksum       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod checksum;
pub mod dispatch;
pub mod offload;
pub mod rewrite;

pub use checksum::{ChecksumReport, checksum_fold};
pub use dispatch::{Checkpoint, CheckpointBehavior, HookPriority, PostAction, Rerouter};
pub use rewrite::{RewritePhase, RouteMatch, classify};

use crate::error::RerouteError;

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Both directions matched with the same score.
    AmbiguousRoute,
    /// Neither direction matched.
    NoRoute,
    /// The forwarding decision could not be redone after a rewrite.
    Reroute(RerouteError),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousRoute => write!(f, "ambiguous route"),
            Self::NoRoute => write!(f, "no route"),
            Self::Reroute(err) => write!(f, "{err}"),
        }
    }
}

/// Outcome of a checkpoint for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the packet continue, rewritten or untouched.
    Accept,
    /// Discard the packet.
    Drop(DropReason),
}

impl Verdict {
    /// Returns true if the packet continues.
    #[must_use]
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }

    /// Returns the drop reason, if any.
    #[must_use]
    pub const fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Self::Accept => None,
            Self::Drop(reason) => Some(*reason),
        }
    }
}
