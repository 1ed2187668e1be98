//! # rtproxy-net
//!
//! RTP/RTCP relay NAT engine.
//!
//! The engine sits at four packet-processing checkpoints of a host network
//! stack and rewrites UDP media traffic addressed to a proxy port so that a
//! media source on the internal side and a session border controller (SBC)
//! on the external side talk through the relay, optionally chaining two local
//! sessions into one round trip.
//!
//! - **Session table**: 65,536 independently locked slots keyed by proxy port
//! - **Classification**: loopback / outgoing / incoming by tuple matching
//! - **Two-phase rewrite**: destination before the routing decision, source
//!   and ports after it
//! - **RTP smoothing**: per-session sequence number offsets
//! - **Checksum offload**: IPv4 and UDP checksums kept consistent with the
//!   packet's offload state
//! - **Control plane**: text commands, status listing, start-up settings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  rtproxy-net                    │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │                 Relay                   │   │
//! │  │  - ConfigStore                          │   │
//! │  │  - RoutingTable                         │   │
//! │  │  - RelayStats                           │   │
//! │  └─────────────────────────────────────────┘   │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────────┐   │
//! │  │ control  │ │  status  │ │   settings   │   │
//! │  └──────────┘ └──────────┘ └──────────────┘   │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │  nat_engine: dispatch → rewrite →       │   │
//! │  │              checksum / offload         │   │
//! │  └─────────────────────────────────────────┘   │
//! │  ┌─────────────────────────────────────────┐   │
//! │  │  datapath: Packet, UdpDatagram, stats    │   │
//! │  └─────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use rtproxy_net::{Checkpoint, KeepRoute, Packet, Relay, Verdict, control};
//!
//! let relay = Relay::new();
//! control::handle_command(&relay, "c 1.1.1.1 2.2.2.2").unwrap();
//! control::handle_command(&relay, "a 32768 0.0.0.0:0 10.0.0.2:5002 9.9.9.9:6000").unwrap();
//!
//! let mut packet = Packet::udp(
//!     "10.0.0.7:5000".parse().unwrap(),
//!     "1.1.1.1:32768".parse().unwrap(),
//!     b"media",
//! )
//! .unwrap();
//! let verdict = relay.process(Checkpoint::PreRouting, &mut packet, &KeepRoute);
//! assert_eq!(verdict, Verdict::Accept);
//! assert_eq!(packet.datagram().unwrap().dst_addr().to_string(), "9.9.9.9");
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod control;
pub mod datapath;
pub mod error;
pub mod nat_engine;
pub mod relay;
pub mod settings;
pub mod status;
pub mod table;

pub use config::{ConfigStore, ProxyConfig};
pub use control::{ControlCommand, ControlError};
pub use datapath::{ChecksumState, Packet, RelayStats, StatsSnapshot};
pub use error::{RelayError, RerouteError, Result};
pub use nat_engine::dispatch::KeepRoute;
pub use nat_engine::{Checkpoint, DropReason, Rerouter, Verdict};
pub use relay::Relay;
pub use settings::Settings;
pub use table::{Routing, RoutingTable, SessionEndpoints, SessionEntry};
