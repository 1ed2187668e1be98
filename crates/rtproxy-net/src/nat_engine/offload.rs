//! Checksum-offload handling around a rewrite.
//!
//! Inbound handling runs before a pre-decision rewrite and only inspects
//! checksums, except that a `CHECKSUM_COMPLETE` packet is downgraded because
//! its whole-packet sum goes stale once headers change. Outbound handling
//! runs after a post-decision rewrite and makes the checksums match the new
//! headers, either completely in software or by leaving the payload sum to
//! the output device.

use super::checksum::{self, ChecksumReport};
use crate::datapath::packet::{ChecksumState, Packet, UDP_CHECKSUM_OFFSET, UdpDatagram};
use crate::error::Result;

/// Whether inbound checksums are verified.
pub const DIAGNOSTICS: bool = cfg!(feature = "diagnostics");

/// Inspects the checksums of an arriving packet.
///
/// Returns the verification report when diagnostics ran. Mismatches are
/// logged, never corrected.
///
/// # Errors
///
/// Fails if the packet is not UDP over IPv4.
pub fn handle_inbound_checksums(packet: &mut Packet) -> Result<Option<ChecksumReport>> {
    handle_inbound_checksums_with(packet, DIAGNOSTICS)
}

/// Like [`handle_inbound_checksums`] with diagnostics chosen at run time.
///
/// # Errors
///
/// Fails if the packet is not UDP over IPv4.
pub fn handle_inbound_checksums_with(
    packet: &mut Packet,
    diagnostics: bool,
) -> Result<Option<ChecksumReport>> {
    let (datagram, offload, _) = packet.parts_mut()?;

    let report = match offload.state {
        ChecksumState::None | ChecksumState::Unnecessary => {
            diagnostics.then(|| checksum::verify(&datagram))
        }
        ChecksumState::Complete => {
            tracing::warn!(state = %offload.state, "unsupported inbound checksum state");
            let report = diagnostics.then(|| checksum::verify(&datagram));
            offload.state = ChecksumState::Unnecessary;
            report
        }
        ChecksumState::Partial => diagnostics.then(|| checksum::verify_partial(&datagram)),
    };

    if let Some(report) = &report {
        log_report(&datagram, report);
    }
    Ok(report)
}

fn log_report(datagram: &UdpDatagram<'_>, report: &ChecksumReport) {
    if !report.ip_ok() {
        tracing::warn!(
            source = %datagram.source(),
            destination = %datagram.destination(),
            actual = format_args!("{:#06x}", report.ip_residual),
            "IP header checksum check failed"
        );
    }
    if !report.udp_ok() {
        tracing::warn!(
            source = %datagram.source(),
            destination = %datagram.destination(),
            stored = format_args!("{:#06x}", report.udp_stored),
            expected = format_args!("{:#06x}", report.udp_expected),
            "UDP checksum check failed"
        );
    }
}

/// Brings the checksums of a leaving packet in line with its headers.
///
/// The IPv4 header checksum is always recomputed. A `CHECKSUM_PARTIAL`
/// packet gets a fresh pseudo-header sum. Any other packet is switched to
/// `CHECKSUM_PARTIAL` when it leaves through a checksumming device, and
/// otherwise gets a full software UDP checksum.
///
/// # Errors
///
/// Fails if the packet is not UDP over IPv4.
pub fn handle_outbound_checksums(packet: &mut Packet) -> Result<()> {
    let (mut datagram, offload, route) = packet.parts_mut()?;

    checksum::update_ipv4_checksum(&mut datagram);

    match offload.state {
        ChecksumState::Partial => {
            checksum::update_udp_pseudo_partial(&mut datagram);
        }
        ChecksumState::None | ChecksumState::Unnecessary | ChecksumState::Complete => {
            if !route.local_delivery && route.can_hw_checksum() {
                offload.state = ChecksumState::Partial;
                offload.csum_start = u16::try_from(datagram.ihl()).unwrap_or(u16::MAX);
                offload.csum_offset = UDP_CHECKSUM_OFFSET as u16;
                checksum::update_udp_pseudo_partial(&mut datagram);
            } else {
                checksum::update_udp_checksum(&mut datagram);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::packet::{ChecksumOffload, DeviceFeatures, RouteInfo};

    fn packet() -> Packet {
        Packet::udp(
            "192.168.100.8:18562".parse().unwrap(),
            "10.1.40.121:32768".parse().unwrap(),
            b"\x80\x00\x00\x01 rtp media payload",
        )
        .unwrap()
    }

    fn corrupt(packet: &mut Packet) {
        packet.datagram().unwrap().set_src_port(1234);
    }

    #[test]
    fn test_inbound_without_diagnostics_only_downgrades() {
        for state in [ChecksumState::None, ChecksumState::Unnecessary, ChecksumState::Partial] {
            let mut packet = packet().with_checksum_state(state);
            let report = handle_inbound_checksums_with(&mut packet, false).unwrap();
            assert!(report.is_none());
            assert_eq!(packet.offload().state, state);
        }

        let mut packet = packet().with_checksum_state(ChecksumState::Complete);
        assert!(handle_inbound_checksums_with(&mut packet, false).unwrap().is_none());
        assert_eq!(packet.offload().state, ChecksumState::Unnecessary);
    }

    #[test]
    fn test_inbound_diagnostics_report_mismatch() {
        let mut packet = packet();
        let report = handle_inbound_checksums_with(&mut packet, true).unwrap().unwrap();
        assert!(report.is_ok());

        corrupt(&mut packet);
        let before = packet.data().to_vec();
        let report = handle_inbound_checksums_with(&mut packet, true).unwrap().unwrap();
        assert!(report.ip_ok());
        assert!(!report.udp_ok());
        // logged, not corrected
        assert_eq!(packet.data(), before.as_slice());
    }

    #[test]
    fn test_inbound_partial_diagnostics() {
        let mut packet = packet().with_checksum_state(ChecksumState::Partial);
        {
            let mut datagram = packet.datagram().unwrap();
            checksum::update_udp_pseudo_partial(&mut datagram);
        }
        let report = handle_inbound_checksums_with(&mut packet, true).unwrap().unwrap();
        assert!(report.is_ok());
    }

    #[test]
    fn test_inbound_rejects_non_udp() {
        let mut packet = Packet::from_slice(&[0x45; 40]);
        assert!(handle_inbound_checksums(&mut packet).is_err());
    }

    #[test]
    fn test_outbound_full_checksum_for_local_delivery() {
        let mut packet = packet().with_route(RouteInfo {
            local_delivery: true,
            device: None,
        });
        corrupt(&mut packet);

        handle_outbound_checksums(&mut packet).unwrap();
        assert_eq!(packet.offload().state, ChecksumState::None);
        assert!(checksum::verify(&packet.datagram().unwrap()).is_ok());
    }

    #[test]
    fn test_outbound_full_checksum_without_device_support() {
        let mut packet = packet().with_route(RouteInfo {
            local_delivery: false,
            device: Some(DeviceFeatures::default()),
        });
        corrupt(&mut packet);

        handle_outbound_checksums(&mut packet).unwrap();
        assert_eq!(packet.offload().state, ChecksumState::None);
        assert!(checksum::verify(&packet.datagram().unwrap()).is_ok());
    }

    #[test]
    fn test_outbound_switches_to_partial() {
        let mut packet = packet()
            .with_checksum_state(ChecksumState::Unnecessary)
            .with_route(RouteInfo {
                local_delivery: false,
                device: Some(DeviceFeatures {
                    ip_csum: false,
                    hw_csum: true,
                }),
            });
        corrupt(&mut packet);

        handle_outbound_checksums(&mut packet).unwrap();
        assert_eq!(
            *packet.offload(),
            ChecksumOffload {
                state: ChecksumState::Partial,
                csum_start: 20,
                csum_offset: 6,
            }
        );
        assert!(checksum::verify_partial(&packet.datagram().unwrap()).is_ok());

        checksum::complete_partial(&mut packet).unwrap();
        assert!(checksum::verify(&packet.datagram().unwrap()).is_ok());
    }

    #[test]
    fn test_outbound_partial_stays_partial() {
        let mut packet = packet().with_offload(ChecksumOffload {
            state: ChecksumState::Partial,
            csum_start: 20,
            csum_offset: 6,
        });
        packet.datagram().unwrap().set_src_addr("1.1.1.1".parse().unwrap());

        handle_outbound_checksums(&mut packet).unwrap();
        assert_eq!(packet.offload().state, ChecksumState::Partial);
        let datagram = packet.datagram().unwrap();
        assert!(checksum::verify_partial(&datagram).is_ok());
    }
}
