//! Text control protocol.
//!
//! One command per line. The first character selects the command, arguments
//! follow separated by whitespace:
//!
//! ```text
//! a <proxy_port> <sender_ip>:<port> <receiver_ip>:<port> <sbc_ip>:<port>   add or update a session
//! d <proxy_port>                                                            delete a session
//! c <int_proxy_ip> <ext_proxy_ip>                                           configure proxy addresses
//! s <0|1>                                                                   RTP smoothing
//! l <0|1>                                                                   loopback routing
//! f                                                                         flush configuration and sessions
//! ```
//!
//! A line is parsed completely before anything is applied, so a rejected
//! line leaves the relay untouched.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::{FromStr, SplitWhitespace};

use thiserror::Error;

use crate::relay::Relay;
use crate::table::SessionEndpoints;

/// Rejected control command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Line has no command letter.
    #[error("empty command")]
    Empty,

    /// Command letter not recognized.
    #[error("unknown command '{0}'")]
    Unknown(char),

    /// Arguments missing, extra, or unparsable.
    #[error("command '{command}' failed: {reason}")]
    Malformed {
        /// Command letter.
        command: char,
        /// What was wrong.
        reason: String,
    },
}

/// A parsed control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Add a session or update its endpoints.
    Add {
        /// Proxy port of the session.
        port: u16,
        /// New endpoints.
        endpoints: SessionEndpoints,
    },
    /// Delete a session.
    Delete {
        /// Proxy port of the session.
        port: u16,
    },
    /// Set both proxy addresses.
    Configure {
        /// Internal proxy address.
        int_proxy_addr: Ipv4Addr,
        /// External proxy address.
        ext_proxy_addr: Ipv4Addr,
    },
    /// Enable or disable RTP smoothing.
    Smoothing(bool),
    /// Enable or disable loopback routing.
    Loopback(bool),
    /// Reset configuration and drop all sessions.
    Flush,
}

struct Args<'a> {
    command: char,
    inner: SplitWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn malformed(&self, reason: impl Into<String>) -> ControlError {
        ControlError::Malformed {
            command: self.command,
            reason: reason.into(),
        }
    }

    fn next<T: FromStr>(&mut self, what: &str) -> Result<T, ControlError> {
        let token: &'a str = self
            .inner
            .next()
            .ok_or_else(|| self.malformed(format!("missing {what}")))?;
        token
            .parse()
            .map_err(|_| self.malformed(format!("invalid {what} '{token}'")))
    }

    fn finish(mut self) -> Result<(), ControlError> {
        match self.inner.next() {
            None => Ok(()),
            Some(extra) => Err(self.malformed(format!("unexpected argument '{extra}'"))),
        }
    }
}

impl FromStr for ControlCommand {
    type Err = ControlError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut chars = line.chars();
        let command = chars.next().ok_or(ControlError::Empty)?;
        let mut args = Args {
            command,
            inner: chars.as_str().split_whitespace(),
        };

        let parsed = match command {
            'a' => Self::Add {
                port: args.next("proxy port")?,
                endpoints: SessionEndpoints {
                    sender: args.next::<SocketAddrV4>("sender")?,
                    receiver: args.next::<SocketAddrV4>("receiver")?,
                    sbc: args.next::<SocketAddrV4>("sbc")?,
                },
            },
            'd' => Self::Delete {
                port: args.next("proxy port")?,
            },
            'c' => Self::Configure {
                int_proxy_addr: args.next("internal proxy address")?,
                ext_proxy_addr: args.next("external proxy address")?,
            },
            's' => Self::Smoothing(args.next::<u8>("smoothing flag")? != 0),
            'l' => Self::Loopback(args.next::<u8>("loopback flag")? != 0),
            'f' => Self::Flush,
            other => return Err(ControlError::Unknown(other)),
        };

        args.finish()?;
        Ok(parsed)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { port, endpoints } => write!(
                f,
                "a {port} {} {} {}",
                endpoints.sender, endpoints.receiver, endpoints.sbc
            ),
            Self::Delete { port } => write!(f, "d {port}"),
            Self::Configure {
                int_proxy_addr,
                ext_proxy_addr,
            } => write!(f, "c {int_proxy_addr} {ext_proxy_addr}"),
            Self::Smoothing(on) => write!(f, "s {}", u8::from(*on)),
            Self::Loopback(on) => write!(f, "l {}", u8::from(*on)),
            Self::Flush => f.write_str("f"),
        }
    }
}

impl ControlCommand {
    /// Applies the command to the relay.
    pub fn apply(&self, relay: &Relay) {
        match *self {
            Self::Add { port, endpoints } => {
                relay.table().update(port, endpoints);
            }
            Self::Delete { port } => {
                relay.table().delete(port);
                tracing::debug!(port, "session deleted");
            }
            Self::Configure {
                int_proxy_addr,
                ext_proxy_addr,
            } => {
                relay.config().update(|config| {
                    config.int_proxy_addr = int_proxy_addr;
                    config.ext_proxy_addr = ext_proxy_addr;
                });
            }
            Self::Smoothing(on) => {
                relay.config().update(|config| config.smoothing = on);
            }
            Self::Loopback(on) => {
                relay.config().update(|config| config.loopback = on);
            }
            Self::Flush => relay.flush(),
        }
    }
}

/// Parses and applies one command line.
///
/// # Errors
///
/// Returns the parse error; the relay is not modified in that case.
pub fn handle_command(relay: &Relay, line: &str) -> Result<ControlCommand, ControlError> {
    tracing::debug!(command = line.trim(), "control command");
    let command: ControlCommand = line.parse()?;
    command.apply(relay);
    Ok(command)
}
