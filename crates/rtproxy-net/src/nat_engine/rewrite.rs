//! Route classification and in-place packet rewriting.
//!
//! A packet hitting a proxy port is classified by the direction it comes
//! from. Packets from the sender go to the SBC, packets from the SBC go to
//! the receiver.
//!
//! Rewriting happens in two phases. Before the host's forwarding decision
//! only the destination address changes, so the decision is made on the new
//! address while the destination port still names the session. After the
//! forwarding decision the source address, source port and destination port
//! are rewritten, and outgoing RTP gets its sequence number smoothed.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use super::{DropReason, Verdict};
use crate::datapath::packet::{RtpHeaderMut, UdpDatagram};
use crate::datapath::stats::RelayStats;
use crate::table::{Routing, RoutingTable};

/// Direction a packet takes through a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    /// Loopback session: always towards the external side.
    Loopback,
    /// From the internal sender towards the SBC.
    Outgoing,
    /// From the SBC towards the internal receiver.
    Incoming,
    /// Both directions matched equally well.
    Ambiguous,
    /// Neither direction matched.
    NoRoute,
}

impl RouteMatch {
    /// Returns the drop reason for classifications that cannot be forwarded.
    #[must_use]
    pub const fn drop_reason(self) -> Option<DropReason> {
        match self {
            Self::Ambiguous => Some(DropReason::AmbiguousRoute),
            Self::NoRoute => Some(DropReason::NoRoute),
            Self::Loopback | Self::Outgoing | Self::Incoming => None,
        }
    }
}

impl fmt::Display for RouteMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loopback => "LOOPBACK_ROUTE",
            Self::Outgoing => "OUTGOING_ROUTE",
            Self::Incoming => "INCOMING_ROUTE",
            Self::Ambiguous => "AMBIGUOUS_ROUTE",
            Self::NoRoute => "NO_ROUTE",
        };
        f.write_str(name)
    }
}

/// Which fields a checkpoint rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewritePhase {
    /// Before the forwarding decision: destination address only.
    PreDecision,
    /// After the forwarding decision: source address, both ports.
    PostDecision,
}

/// New values for the four tuple fields. A zero address or port leaves the
/// field unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteTarget {
    /// Source address.
    pub src_addr: Ipv4Addr,
    /// Source port.
    pub src_port: u16,
    /// Destination address.
    pub dst_addr: Ipv4Addr,
    /// Destination port.
    pub dst_port: u16,
}

impl Default for RewriteTarget {
    fn default() -> Self {
        Self::UNCHANGED
    }
}

impl RewriteTarget {
    /// Leaves every field unchanged.
    pub const UNCHANGED: Self = Self {
        src_addr: Ipv4Addr::UNSPECIFIED,
        src_port: 0,
        dst_addr: Ipv4Addr::UNSPECIFIED,
        dst_port: 0,
    };

    /// Rewrites the destination address only.
    #[must_use]
    pub const fn destination_addr(addr: Ipv4Addr) -> Self {
        Self {
            dst_addr: addr,
            ..Self::UNCHANGED
        }
    }

    /// Rewrites the source endpoint and the destination port.
    #[must_use]
    pub const fn source_and_port(source: SocketAddrV4, dst_port: u16) -> Self {
        Self {
            src_addr: *source.ip(),
            src_port: source.port(),
            dst_addr: Ipv4Addr::UNSPECIFIED,
            dst_port,
        }
    }

    /// Writes the non-zero fields into the datagram.
    pub fn apply(&self, datagram: &mut UdpDatagram<'_>) {
        let (before_src, before_dst) = (datagram.source(), datagram.destination());

        if !self.src_addr.is_unspecified() {
            datagram.set_src_addr(self.src_addr);
        }
        if self.src_port != 0 {
            datagram.set_src_port(self.src_port);
        }
        if !self.dst_addr.is_unspecified() {
            datagram.set_dst_addr(self.dst_addr);
        }
        if self.dst_port != 0 {
            datagram.set_dst_port(self.dst_port);
        }

        tracing::trace!(
            "BEFORE REWRITE: {before_src} -> {before_dst}, AFTER REWRITE: {} -> {}",
            datagram.source(),
            datagram.destination()
        );
    }
}

/// Scores a packet tuple against an expected source and destination port.
///
/// Returns the number of non-wildcard fields, or 0 if any of them differs.
/// The destination address is always a wildcard.
#[must_use]
pub fn match_score(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    expected_source: SocketAddrV4,
    expected_dst_port: u16,
) -> u8 {
    let fields = [
        (u32::from(*expected_source.ip()), u32::from(*source.ip())),
        (u32::from(expected_source.port()), u32::from(source.port())),
        (u32::from(expected_dst_port), u32::from(destination.port())),
    ];

    let mut score = 0;
    for (expected, actual) in fields {
        if expected == 0 {
            continue;
        }
        if expected != actual {
            return 0;
        }
        score += 1;
    }
    score
}

/// Classifies a packet against a session's routing context.
#[must_use]
pub fn classify(source: SocketAddrV4, destination: SocketAddrV4, routing: &Routing) -> RouteMatch {
    if routing.loopback {
        return RouteMatch::Loopback;
    }

    let outgoing = match_score(source, destination, routing.int_src, routing.int_proxy.port());
    let incoming = match_score(source, destination, routing.ext_src, routing.ext_proxy.port());

    match (outgoing, incoming) {
        (0, 0) => RouteMatch::NoRoute,
        (out, inc) if out > inc => RouteMatch::Outgoing,
        (out, inc) if inc > out => RouteMatch::Incoming,
        _ => RouteMatch::Ambiguous,
    }
}

fn classify_datagram(datagram: &UdpDatagram<'_>, routing: &Routing) -> RouteMatch {
    let route = classify(datagram.source(), datagram.destination(), routing);
    tracing::debug!(
        source = %datagram.source(),
        destination = %datagram.destination(),
        %route,
        "classified"
    );
    route
}

/// Rewrites a packet before the forwarding decision.
///
/// Only the destination address changes: to the SBC side for outgoing and
/// loopback traffic, to the receiver for incoming traffic.
pub fn rewrite_pre_decision(datagram: &mut UdpDatagram<'_>, routing: &Routing) -> Verdict {
    let route = classify_datagram(datagram, routing);
    let target = match route {
        RouteMatch::Loopback | RouteMatch::Outgoing => {
            RewriteTarget::destination_addr(*routing.ext_dst.ip())
        }
        RouteMatch::Incoming => RewriteTarget::destination_addr(*routing.int_dst.ip()),
        RouteMatch::Ambiguous | RouteMatch::NoRoute => {
            return reject(route);
        }
    };
    target.apply(datagram);
    Verdict::Accept
}

/// Rewrites a packet after the forwarding decision.
///
/// Outgoing and loopback traffic leaves from the external proxy endpoint
/// towards the SBC port, with RTP smoothing keyed by the external proxy port.
/// Incoming traffic leaves from the internal proxy endpoint towards the
/// receiver port.
pub fn rewrite_post_decision(
    datagram: &mut UdpDatagram<'_>,
    routing: &Routing,
    table: &RoutingTable,
    stats: &RelayStats,
) -> Verdict {
    let route = classify_datagram(datagram, routing);
    match route {
        RouteMatch::Loopback | RouteMatch::Outgoing => {
            RewriteTarget::source_and_port(routing.ext_proxy, routing.ext_dst.port()).apply(datagram);
            if routing.smoothing {
                smooth_rtp(datagram, routing.ext_proxy.port(), table, stats);
            }
        }
        RouteMatch::Incoming => {
            RewriteTarget::source_and_port(routing.int_proxy, routing.int_dst.port()).apply(datagram);
        }
        RouteMatch::Ambiguous | RouteMatch::NoRoute => return reject(route),
    }
    Verdict::Accept
}

fn reject(route: RouteMatch) -> Verdict {
    let reason = route.drop_reason().unwrap_or(DropReason::NoRoute);
    tracing::debug!(%route, "packet could not be routed, dropping");
    Verdict::Drop(reason)
}

/// Returns true if `port` carries RTCP by the even/odd port convention.
#[inline]
#[must_use]
pub const fn is_rtcp_port(port: u16) -> bool {
    port & 1 == 1
}

/// Smooths the RTP sequence number of an outgoing packet.
///
/// RTCP ports, short payloads and non-version-2 packets are left alone.
/// Returns the emitted sequence number if the packet was smoothed.
pub fn smooth_rtp(
    datagram: &mut UdpDatagram<'_>,
    port: u16,
    table: &RoutingTable,
    stats: &RelayStats,
) -> Option<u16> {
    if is_rtcp_port(port) {
        return None;
    }

    let mut rtp = RtpHeaderMut::parse(datagram.payload_mut())?;
    let observed = rtp.sequence_number();
    let (emitted, adjusted) = table.atomically(port, |entry| {
        let offset = entry.offset;
        let emitted = entry.smooth(observed);
        (emitted, entry.offset != offset)
    });
    rtp.set_sequence_number(emitted);

    if adjusted {
        stats.record_smoothing_adjustment();
        tracing::debug!(port, observed, emitted, "RTP sequence discontinuity absorbed");
    } else {
        tracing::trace!(port, observed, emitted, "RTP sequence number");
    }
    Some(emitted)
}
