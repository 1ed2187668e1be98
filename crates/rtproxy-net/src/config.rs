//! Relay configuration record.
//!
//! A single process-wide record read on every packet and written rarely by
//! the control plane. All four fields live behind one lock so readers never
//! observe a half-updated record.

use std::fmt;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

/// Global relay configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address the relay uses towards the internal (media) side.
    pub int_proxy_addr: Ipv4Addr,
    /// Address the relay uses towards the external (SBC) side.
    pub ext_proxy_addr: Ipv4Addr,
    /// RTP sequence number smoothing.
    pub smoothing: bool,
    /// Loopback routing and session cascading.
    pub loopback: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            int_proxy_addr: Ipv4Addr::UNSPECIFIED,
            ext_proxy_addr: Ipv4Addr::UNSPECIFIED,
            smoothing: true,
            loopback: true,
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: int_proxy_addr: {} ext_proxy_addr: {} smoothing: {} loopback: {}",
            self.int_proxy_addr,
            self.ext_proxy_addr,
            u8::from(self.smoothing),
            u8::from(self.loopback)
        )
    }
}

/// Lock-protected holder of the [`ProxyConfig`] record.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: Mutex<ProxyConfig>,
}

impl ConfigStore {
    /// Creates a store holding the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current record.
    #[inline]
    #[must_use]
    pub fn get(&self) -> ProxyConfig {
        *self.inner.lock()
    }

    /// Replaces the whole record.
    pub fn set(&self, config: ProxyConfig) {
        *self.inner.lock() = config;
        tracing::info!(%config, "configuration updated");
    }

    /// Resets the record to its defaults.
    pub fn clear(&self) {
        self.set(ProxyConfig::default());
    }

    /// Applies a read-modify-write to the record under the lock and returns
    /// the resulting record.
    pub fn update(&self, f: impl FnOnce(&mut ProxyConfig)) -> ProxyConfig {
        let config = {
            let mut guard = self.inner.lock();
            f(&mut *guard);
            *guard
        };
        tracing::info!(%config, "configuration updated");
        config
    }
}
