//! Checkpoint dispatcher.
//!
//! The host network layer calls [`Relay::process`] at four points of a
//! packet's path. Every checkpoint parses the packet, looks up the session
//! by destination port, and runs one rewrite phase. They differ in what
//! happens around the rewrite:
//!
//! | checkpoint   | phase           | inbound checksums | on accept           | priority |
//! |--------------|-----------------|-------------------|---------------------|----------|
//! | PRE_ROUTING  | pre-decision    | yes               |                     | first    |
//! | LOCAL_IN     | post-decision   |                   |                     | last     |
//! | LOCAL_OUT    | pre-decision    | yes               | redo routing        | first    |
//! | POST_ROUTING | post-decision   |                   | finalize checksums  | last     |

use std::fmt;

use super::rewrite::{self, RewritePhase};
use super::{DropReason, Verdict, checksum, offload};
use crate::datapath::packet::Packet;
use crate::error::RerouteError;
use crate::relay::Relay;
use crate::status;

/// Where in the host's packet path the relay is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// Packet arrived from the network, before the forwarding decision.
    PreRouting,
    /// Packet is about to be delivered to this host.
    LocalIn,
    /// Packet generated by this host, before the forwarding decision.
    LocalOut,
    /// Packet is about to leave this host.
    PostRouting,
}

/// What runs after a rewrite was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    /// Nothing.
    None,
    /// Ask the host to redo its forwarding decision.
    Reroute,
    /// Make checksums match the rewritten headers.
    FinalizeChecksums,
}

/// Position of the relay among other handlers at the same checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPriority {
    /// Before every other handler.
    First,
    /// After every other handler.
    Last,
}

/// Static description of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointBehavior {
    /// Name used in logs.
    pub name: &'static str,
    /// Rewrite phase.
    pub phase: RewritePhase,
    /// Inspect checksums of the arriving packet before rewriting.
    pub inbound_checksums: bool,
    /// Action after an accepted rewrite.
    pub post_action: PostAction,
    /// Handler priority.
    pub priority: HookPriority,
}

impl Checkpoint {
    /// All checkpoints, in registration order.
    pub const ALL: [Self; 4] = [Self::PreRouting, Self::LocalIn, Self::LocalOut, Self::PostRouting];

    /// Returns the behavior descriptor.
    #[must_use]
    pub const fn behavior(self) -> CheckpointBehavior {
        match self {
            Self::PreRouting => CheckpointBehavior {
                name: "PRE_ROUTING",
                phase: RewritePhase::PreDecision,
                inbound_checksums: true,
                post_action: PostAction::None,
                priority: HookPriority::First,
            },
            Self::LocalIn => CheckpointBehavior {
                name: "LOCAL_IN",
                phase: RewritePhase::PostDecision,
                inbound_checksums: false,
                post_action: PostAction::None,
                priority: HookPriority::Last,
            },
            Self::LocalOut => CheckpointBehavior {
                name: "LOCAL_OUT",
                phase: RewritePhase::PreDecision,
                inbound_checksums: true,
                post_action: PostAction::Reroute,
                priority: HookPriority::First,
            },
            Self::PostRouting => CheckpointBehavior {
                name: "POST_ROUTING",
                phase: RewritePhase::PostDecision,
                inbound_checksums: false,
                post_action: PostAction::FinalizeChecksums,
                priority: HookPriority::Last,
            },
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.behavior().name)
    }
}

/// Redoes the host's forwarding decision for a packet whose destination
/// changed.
pub trait Rerouter {
    /// Re-evaluates the route of `packet`, updating its route metadata.
    ///
    /// # Errors
    ///
    /// Returns the host's failure code when no route exists.
    fn reroute(&self, packet: &mut Packet) -> Result<(), RerouteError>;
}

impl<F> Rerouter for F
where
    F: Fn(&mut Packet) -> Result<(), RerouteError>,
{
    fn reroute(&self, packet: &mut Packet) -> Result<(), RerouteError> {
        self(packet)
    }
}

/// Keeps the current route metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepRoute;

impl Rerouter for KeepRoute {
    fn reroute(&self, _packet: &mut Packet) -> Result<(), RerouteError> {
        Ok(())
    }
}

impl Relay {
    /// Runs one checkpoint on a packet.
    ///
    /// Packets that are not UDP over IPv4, cannot be linearized, or whose
    /// destination port has no session are accepted untouched.
    pub fn process<R: Rerouter + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        packet: &mut Packet,
        rerouter: &R,
    ) -> Verdict {
        let behavior = checkpoint.behavior();

        let port = match packet.datagram() {
            Ok(datagram) => datagram.dst_port(),
            Err(err) => {
                tracing::trace!(%checkpoint, %err, "not examined");
                self.stats().record_pass_through();
                return Verdict::Accept;
            }
        };

        let config = self.config().get();
        let Some((entry, routing)) = self.table().derive_routing(port, &config) else {
            self.stats().record_pass_through();
            return Verdict::Accept;
        };

        self.stats().record_examined();
        tracing::debug!(%checkpoint, port, ?entry, "session matched");
        tracing::trace!("{}", status::routing_lines(&routing));

        if behavior.inbound_checksums {
            match offload::handle_inbound_checksums(packet) {
                Ok(Some(report)) => self.stats().record_checksum_mismatches(report.mismatches()),
                Ok(None) => {}
                Err(err) => tracing::warn!(%checkpoint, %err, "inbound checksum handling failed"),
            }
        }

        let verdict = match packet.datagram() {
            Ok(mut datagram) => {
                let verdict = match behavior.phase {
                    RewritePhase::PreDecision => rewrite::rewrite_pre_decision(&mut datagram, &routing),
                    RewritePhase::PostDecision => rewrite::rewrite_post_decision(
                        &mut datagram,
                        &routing,
                        self.table(),
                        self.stats(),
                    ),
                };
                if verdict.is_accept() {
                    checksum::update_ipv4_checksum(&mut datagram);
                }
                verdict
            }
            Err(err) => {
                tracing::warn!(%checkpoint, %err, "packet changed shape during processing");
                Verdict::Accept
            }
        };

        let verdict = match verdict {
            Verdict::Accept => self.post_action(checkpoint, behavior.post_action, packet, rerouter),
            Verdict::Drop(_) => verdict,
        };

        self.stats().record_verdict(verdict);
        verdict
    }

    fn post_action<R: Rerouter + ?Sized>(
        &self,
        checkpoint: Checkpoint,
        action: PostAction,
        packet: &mut Packet,
        rerouter: &R,
    ) -> Verdict {
        match action {
            PostAction::None => Verdict::Accept,
            PostAction::Reroute => match rerouter.reroute(packet) {
                Ok(()) => Verdict::Accept,
                Err(err) => {
                    tracing::debug!(%checkpoint, %err, "reroute failed, dropping");
                    Verdict::Drop(DropReason::Reroute(err))
                }
            },
            PostAction::FinalizeChecksums => {
                if let Err(err) = offload::handle_outbound_checksums(packet) {
                    tracing::warn!(%checkpoint, %err, "outbound checksum handling failed");
                }
                Verdict::Accept
            }
        }
    }
}
