//! The relay: configuration, session table and counters shared by every
//! checkpoint and by the control plane.

use crate::config::{ConfigStore, ProxyConfig};
use crate::datapath::stats::RelayStats;
use crate::table::{Routing, RoutingTable, SessionEntry};

/// Shared relay state.
///
/// All methods take `&self`; the relay is meant to be shared across threads
/// behind an `Arc`.
#[derive(Debug, Default)]
pub struct Relay {
    config: ConfigStore,
    table: RoutingTable,
    stats: RelayStats,
}

impl Relay {
    /// Creates a relay with default configuration and no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a relay with the given configuration.
    #[must_use]
    pub fn with_config(config: ProxyConfig) -> Self {
        let relay = Self::new();
        relay.config.set(config);
        relay
    }

    /// Returns the configuration store.
    #[must_use]
    pub const fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// Returns the session table.
    #[must_use]
    pub const fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Returns the counters.
    #[must_use]
    pub const fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Derives the routing context of the session at `port` under the
    /// current configuration.
    #[must_use]
    pub fn derive_routing(&self, port: u16) -> Option<(SessionEntry, Routing)> {
        self.table.derive_routing(port, &self.config.get())
    }

    /// Resets configuration and drops every session.
    pub fn flush(&self) {
        self.config.clear();
        self.table.clear();
        tracing::info!("relay flushed");
    }
}
