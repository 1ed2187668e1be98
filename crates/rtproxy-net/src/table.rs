//! Session routing table.
//!
//! The table has exactly one slot per possible UDP port. Each slot is its own
//! lock, so packets for different proxy ports never contend. The slot index is
//! the proxy port the relay owns for that session.
//!
//! # Routing derivation
//!
//! ```text
//!   sender ──► int_proxy:port ~~► ext_proxy:port ──► sbc
//! receiver ◄── int_proxy:port ◄~~ ext_proxy:port ◄── sbc
//! ```
//!
//! With loopback enabled, a session whose SBC address is the external proxy
//! address points at another local session (the SBC port is that session's
//! proxy port). The second session's internal side then replaces the first
//! session's external side, chaining two relay legs back to back.

use std::net::{Ipv4Addr, SocketAddrV4};

use parking_lot::Mutex;

use crate::config::ProxyConfig;

/// Number of slots, one per 16-bit port value.
pub const TABLE_SIZE: usize = 1 << 16;

/// Backward sequence number jump that counts as a discontinuity.
pub const MIN_SEQUENCE_DELTA: u16 = 4;

const UNSPECIFIED: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

/// Endpoint fields of a session, as supplied by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEndpoints {
    /// Media sender; `0.0.0.0:0` matches any sender.
    pub sender: SocketAddrV4,
    /// Media receiver on the internal side.
    pub receiver: SocketAddrV4,
    /// Remote relay peer (session border controller).
    pub sbc: SocketAddrV4,
}

/// NAT record of a single relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    /// Media sender.
    pub sender: SocketAddrV4,
    /// Media receiver.
    pub receiver: SocketAddrV4,
    /// Remote relay peer.
    pub sbc: SocketAddrV4,
    /// Last observed RTP sequence number.
    pub last_sn: u16,
    /// Amount added to every forwarded RTP sequence number.
    pub offset: u16,
    /// Whether `offset` has been seeded.
    pub offset_set: bool,
    /// Whether an RTP packet has been observed.
    pub entry_used: bool,
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl SessionEntry {
    /// The all-zero entry stored in unused slots.
    pub const EMPTY: Self = Self {
        sender: UNSPECIFIED,
        receiver: UNSPECIFIED,
        sbc: UNSPECIFIED,
        last_sn: 0,
        offset: 0,
        offset_set: false,
        entry_used: false,
    };

    /// Creates an entry with the given endpoints and no smoothing state.
    #[must_use]
    pub const fn new(endpoints: SessionEndpoints) -> Self {
        Self {
            sender: endpoints.sender,
            receiver: endpoints.receiver,
            sbc: endpoints.sbc,
            ..Self::EMPTY
        }
    }

    /// Returns true if both the receiver and the SBC endpoint are set.
    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_set(self.receiver) && is_set(self.sbc)
    }

    /// Returns the endpoint fields.
    #[must_use]
    pub const fn endpoints(&self) -> SessionEndpoints {
        SessionEndpoints {
            sender: self.sender,
            receiver: self.receiver,
            sbc: self.sbc,
        }
    }

    /// Overwrites the endpoint fields.
    ///
    /// The sequence offset is seeded from `seed` only the first time; later
    /// updates keep the smoothing state of the session.
    pub fn update(&mut self, endpoints: SessionEndpoints, seed: impl FnOnce() -> u16) {
        self.sender = endpoints.sender;
        self.receiver = endpoints.receiver;
        self.sbc = endpoints.sbc;

        if !self.offset_set {
            self.offset = seed();
            self.offset_set = true;
        }
    }

    /// Feeds an observed RTP sequence number and returns the number to emit.
    ///
    /// A backward jump of at least [`MIN_SEQUENCE_DELTA`] grows the offset by
    /// the jump, so the emitted sequence continues where it left off.
    pub fn smooth(&mut self, sn: u16) -> u16 {
        if self.entry_used {
            let expected = self.last_sn.wrapping_add(1);
            if sn < expected {
                let delta = expected - sn;
                if delta >= MIN_SEQUENCE_DELTA {
                    self.offset = self.offset.wrapping_add(delta);
                }
            }
        } else {
            self.entry_used = true;
        }

        self.last_sn = sn;
        sn.wrapping_add(self.offset)
    }
}

#[inline]
fn is_set(endpoint: SocketAddrV4) -> bool {
    !endpoint.ip().is_unspecified() && endpoint.port() != 0
}

/// Routing context derived from a session entry and the configuration.
///
/// Recomputed for every packet and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routing {
    /// Expected source on the internal side.
    pub int_src: SocketAddrV4,
    /// Destination on the internal side.
    pub int_dst: SocketAddrV4,
    /// Relay endpoint facing the internal side.
    pub int_proxy: SocketAddrV4,
    /// Relay endpoint facing the external side.
    pub ext_proxy: SocketAddrV4,
    /// Expected source on the external side.
    pub ext_src: SocketAddrV4,
    /// Destination on the external side.
    pub ext_dst: SocketAddrV4,
    /// Loopback route: every packet goes towards the external side.
    pub loopback: bool,
    /// RTP smoothing enabled.
    pub smoothing: bool,
}

impl Routing {
    /// Builds the routing context of a single session.
    #[must_use]
    pub fn from_entry(port: u16, config: &ProxyConfig, entry: &SessionEntry) -> Self {
        let int_proxy = SocketAddrV4::new(config.int_proxy_addr, port);
        let ext_proxy = SocketAddrV4::new(config.ext_proxy_addr, port);

        if config.loopback && entry.receiver == int_proxy {
            Self {
                int_src: entry.sbc,
                int_dst: entry.sbc,
                int_proxy: ext_proxy,
                ext_proxy,
                ext_src: entry.sbc,
                ext_dst: entry.sbc,
                loopback: true,
                smoothing: config.smoothing,
            }
        } else {
            Self {
                int_src: entry.sender,
                int_dst: entry.receiver,
                int_proxy,
                ext_proxy,
                ext_src: entry.sbc,
                ext_dst: entry.sbc,
                loopback: false,
                smoothing: config.smoothing,
            }
        }
    }
}

/// Fixed-size table of session entries keyed by proxy port.
pub struct RoutingTable {
    slots: Box<[Mutex<SessionEntry>]>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("sessions", &self.len())
            .finish()
    }
}

impl RoutingTable {
    /// Creates a table with every slot empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..TABLE_SIZE)
                .map(|_| Mutex::new(SessionEntry::EMPTY))
                .collect(),
        }
    }

    #[inline]
    fn slot(&self, port: u16) -> &Mutex<SessionEntry> {
        &self.slots[usize::from(port)]
    }

    /// Returns a snapshot of the slot, valid or not.
    #[inline]
    #[must_use]
    pub fn entry(&self, port: u16) -> SessionEntry {
        *self.slot(port).lock()
    }

    /// Returns a snapshot of the slot if it holds a valid session.
    #[inline]
    #[must_use]
    pub fn get(&self, port: u16) -> Option<SessionEntry> {
        let entry = self.entry(port);
        entry.is_valid().then_some(entry)
    }

    /// Stores an entry.
    pub fn put(&self, port: u16, entry: SessionEntry) {
        *self.slot(port).lock() = entry;
    }

    /// Empties a slot, dropping its smoothing state.
    pub fn delete(&self, port: u16) {
        self.put(port, SessionEntry::EMPTY);
    }

    /// Empties every slot.
    pub fn clear(&self) {
        for slot in &*self.slots {
            *slot.lock() = SessionEntry::EMPTY;
        }
    }

    /// Runs `f` on the slot's entry while holding the slot lock.
    ///
    /// This is the only way to do read-modify-write on an entry.
    pub fn atomically<R>(&self, port: u16, f: impl FnOnce(&mut SessionEntry) -> R) -> R {
        let mut guard = self.slot(port).lock();
        f(&mut *guard)
    }

    /// Adds or reconfigures a session.
    ///
    /// A fresh slot gets a random sequence offset; an existing session keeps
    /// its offset.
    pub fn update(&self, port: u16, endpoints: SessionEndpoints) -> SessionEntry {
        let entry = self.atomically(port, |entry| {
            entry.update(endpoints, rand::random::<u16>);
            *entry
        });
        tracing::debug!(
            port,
            sender = %entry.sender,
            receiver = %entry.receiver,
            sbc = %entry.sbc,
            "session updated"
        );
        entry
    }

    /// Looks up the session at `port` and derives its routing context.
    ///
    /// When loopback is enabled and the session's SBC address is the external
    /// proxy address, the session at the SBC port is looked up as well and its
    /// internal side becomes the external side of the result. The first slot
    /// is released before the second is locked. The cascaded fields are
    /// endpoints, which do not change while a session exists, so reading them
    /// without holding both locks is safe.
    #[must_use]
    pub fn derive_routing(&self, port: u16, config: &ProxyConfig) -> Option<(SessionEntry, Routing)> {
        let entry = self.get(port)?;
        let mut routing = Routing::from_entry(port, config, &entry);

        if config.loopback && *entry.sbc.ip() == config.ext_proxy_addr {
            let peer_port = entry.sbc.port();
            if let Some(peer) = self.get(peer_port) {
                let chained = Routing::from_entry(peer_port, config, &peer);
                routing.ext_proxy = chained.int_proxy;
                routing.ext_src = chained.int_src;
                routing.ext_dst = chained.int_dst;
            }
        }

        Some((entry, routing))
    }

    /// Iterates over valid sessions in ascending port order.
    pub fn sessions(&self) -> impl Iterator<Item = (u16, SessionEntry)> + '_ {
        (0..=u16::MAX).filter_map(|port| self.get(port).map(|entry| (port, entry)))
    }

    /// Returns the number of valid sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().count()
    }

    /// Returns true if no slot holds a valid session.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().next().is_none()
    }
}
