//! Start-up settings.
//!
//! Settings are loaded from the following sources, later ones overriding
//! earlier ones:
//!
//! 1. Default values
//! 2. Configuration file (`/etc/rtproxy/rtproxy.toml`, optional)
//! 3. Environment variables (`RTPROXY_*`)
//!
//! ## Example Configuration File
//!
//! ```toml
//! int_proxy_addr = "10.1.40.121"
//! ext_proxy_addr = "10.1.40.121"
//! smoothing = true
//! loopback = true
//!
//! [[routes]]
//! proxy_port = 32768
//! sender = "192.168.100.8:18562"
//! receiver = "192.168.100.8:18560"
//! sbc = "10.1.40.121:32770"
//! ```

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::relay::Relay;
use crate::table::SessionEndpoints;

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/rtproxy/rtproxy.toml";

/// Relay settings applied at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Internal proxy address.
    pub int_proxy_addr: Ipv4Addr,
    /// External proxy address.
    pub ext_proxy_addr: Ipv4Addr,
    /// RTP sequence number smoothing.
    pub smoothing: bool,
    /// Loopback routing.
    pub loopback: bool,
    /// Sessions installed at start-up.
    pub routes: Vec<RouteSettings>,
}

/// One pre-provisioned session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// Proxy port of the session.
    pub proxy_port: u16,
    /// Internal sender, `0.0.0.0:0` to accept any.
    pub sender: SocketAddrV4,
    /// Internal receiver.
    pub receiver: SocketAddrV4,
    /// Remote relay peer.
    pub sbc: SocketAddrV4,
}

impl RouteSettings {
    /// Returns the session endpoints of this route.
    #[must_use]
    pub const fn endpoints(&self) -> SessionEndpoints {
        SessionEndpoints {
            sender: self.sender,
            receiver: self.receiver,
            sbc: self.sbc,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let config = ProxyConfig::default();
        Self {
            int_proxy_addr: config.int_proxy_addr,
            ext_proxy_addr: config.ext_proxy_addr,
            smoothing: config.smoothing,
            loopback: config.loopback,
            routes: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from the default file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be parsed.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Loads settings from a specific file and the environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the environment cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        Self::figment(path.as_ref().to_path_buf()).extract()
    }

    fn figment(path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RTPROXY_"))
    }

    /// Returns the configuration record described by these settings.
    #[must_use]
    pub const fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            int_proxy_addr: self.int_proxy_addr,
            ext_proxy_addr: self.ext_proxy_addr,
            smoothing: self.smoothing,
            loopback: self.loopback,
        }
    }

    /// Checks the routes for conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if two routes share a proxy port.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.routes.len());
        for route in &self.routes {
            if !seen.insert(route.proxy_port) {
                return Err(RelayError::Config(format!(
                    "proxy port {} is configured more than once",
                    route.proxy_port
                )));
            }
        }
        Ok(())
    }

    /// Writes the configuration record and installs every route.
    ///
    /// Routes are installed the way the `a` control command installs a
    /// session, so each one gets a freshly seeded sequence offset.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails; the relay is not modified in
    /// that case.
    pub fn apply(&self, relay: &Relay) -> Result<()> {
        self.validate()?;
        relay.config().set(self.proxy_config());
        for route in &self.routes {
            relay.table().update(route.proxy_port, route.endpoints());
        }
        tracing::info!(routes = self.routes.len(), "settings applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("missing.toml")?;
            assert_eq!(settings, Settings::default());
            assert!(settings.smoothing);
            assert!(settings.loopback);
            Ok(())
        });
    }

    #[test]
    fn test_load_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rtproxy.toml",
                r#"
                int_proxy_addr = "10.1.40.121"
                ext_proxy_addr = "10.1.40.121"
                smoothing = true

                [[routes]]
                proxy_port = 32768
                sender = "192.168.100.8:18562"
                receiver = "192.168.100.8:18560"
                sbc = "10.1.40.121:32770"
                "#,
            )?;
            jail.set_env("RTPROXY_SMOOTHING", "false");
            jail.set_env("RTPROXY_EXT_PROXY_ADDR", "2.2.2.2");

            let settings = Settings::load_from("rtproxy.toml")?;
            assert_eq!(settings.int_proxy_addr, Ipv4Addr::new(10, 1, 40, 121));
            assert_eq!(settings.ext_proxy_addr, Ipv4Addr::new(2, 2, 2, 2));
            assert!(!settings.smoothing);
            assert!(settings.loopback);
            assert_eq!(settings.routes.len(), 1);
            assert_eq!(settings.routes[0].proxy_port, 32768);
            assert_eq!(
                settings.routes[0].sbc,
                "10.1.40.121:32770".parse::<SocketAddrV4>().unwrap()
            );
            Ok(())
        });
    }

    #[test]
    fn test_invalid_route_address() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rtproxy.toml",
                r#"
                [[routes]]
                proxy_port = 32768
                sender = "192.168.100.8"
                receiver = "192.168.100.8:18560"
                sbc = "10.1.40.121:32770"
                "#,
            )?;
            let err = Settings::load_from("rtproxy.toml").unwrap_err();
            let err = RelayError::from(err);
            assert!(matches!(err, RelayError::Settings(_)));
            Ok(())
        });
    }

    fn route(proxy_port: u16) -> RouteSettings {
        RouteSettings {
            proxy_port,
            sender: "192.168.100.8:18562".parse().unwrap(),
            receiver: "192.168.100.8:18560".parse().unwrap(),
            sbc: "10.1.40.121:32770".parse().unwrap(),
        }
    }

    #[test]
    fn test_apply() {
        let relay = Relay::new();
        let settings = Settings {
            int_proxy_addr: Ipv4Addr::new(10, 1, 40, 121),
            ext_proxy_addr: Ipv4Addr::new(10, 1, 40, 121),
            smoothing: false,
            loopback: true,
            routes: vec![route(32768), route(32770)],
        };
        settings.apply(&relay).unwrap();

        assert_eq!(relay.config().get(), settings.proxy_config());
        assert_eq!(relay.table().len(), 2);
        let entry = relay.table().get(32770).unwrap();
        assert!(entry.offset_set);
        assert_eq!(entry.endpoints(), route(32770).endpoints());
    }

    #[test]
    fn test_apply_rejects_duplicate_ports() {
        let relay = Relay::new();
        let settings = Settings {
            int_proxy_addr: Ipv4Addr::new(1, 1, 1, 1),
            routes: vec![route(32768), route(32768)],
            ..Settings::default()
        };
        assert!(matches!(settings.apply(&relay), Err(RelayError::Config(_))));
        assert!(relay.table().is_empty());
        assert_eq!(relay.config().get(), ProxyConfig::default());
    }
}
