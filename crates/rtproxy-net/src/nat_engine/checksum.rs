//! Checksum calculation.
//!
//! IPv4 header and UDP checksums per RFC 791/768/1071, the pseudo-header
//! partial sum used with checksum offload, and verification routines for
//! diagnostic builds.

use std::net::Ipv4Addr;

use crate::datapath::packet::{ChecksumState, IPPROTO_UDP, Packet, UdpDatagram};
use crate::error::{RelayError, Result};

/// Value stored in place of a computed zero UDP checksum.
pub const CSUM_MANGLED_0: u16 = 0xFFFF;

/// Folds a 32-bit sum into a 16-bit checksum.
#[inline(always)]
pub fn checksum_fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Calculates the ones' complement sum of 16-bit words.
///
/// This is the core operation for IP/TCP/UDP checksums.
#[inline]
pub fn checksum_add(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = chunks.by_ref().fold(0u32, |sum, word| {
        sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])))
    });

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    sum
}

/// Calculates Internet checksum over data.
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    checksum_fold(checksum_add(data))
}

/// Calculates IPv4 header checksum.
///
/// Assumes checksum field is zeroed before calculation.
#[inline]
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    debug_assert!(header.len() >= 20, "IPv4 header too short");
    checksum(header)
}

/// Sums the UDP pseudo-header.
#[inline]
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, udp_len: u16) -> u32 {
    let [s0, s1, s2, s3] = src.octets();
    let [d0, d1, d2, d3] = dst.octets();

    [
        u16::from_be_bytes([s0, s1]),
        u16::from_be_bytes([s2, s3]),
        u16::from_be_bytes([d0, d1]),
        u16::from_be_bytes([d2, d3]),
        udp_len,
    ]
    .into_iter()
    .fold(u32::from(IPPROTO_UDP), |sum, word| sum + u32::from(word))
}

/// Returns the pseudo-header partial sum stored in the checksum field of a
/// packet whose checksum is completed by the device.
///
/// This is the folded sum, not its complement.
#[inline]
pub fn udp_pseudo_partial(src: Ipv4Addr, dst: Ipv4Addr, udp_len: u16) -> u16 {
    !checksum_fold(pseudo_header_sum(src, dst, udp_len))
}

/// Calculates UDP checksum including pseudo-header.
///
/// `udp_segment` is the UDP header and payload with the checksum field
/// zeroed. A computed zero is returned as [`CSUM_MANGLED_0`].
#[inline]
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp_segment: &[u8]) -> u16 {
    let len = u16::try_from(udp_segment.len()).unwrap_or(u16::MAX);
    let sum = pseudo_header_sum(src, dst, len).wrapping_add(checksum_add(udp_segment));

    match checksum_fold(sum) {
        0 => CSUM_MANGLED_0,
        result => result,
    }
}

/// Recomputes the IPv4 header checksum in place.
///
/// Returns the old and new values.
pub fn update_ipv4_checksum(datagram: &mut UdpDatagram<'_>) -> (u16, u16) {
    let old = datagram.ip_checksum();
    datagram.set_ip_checksum(0);
    let new = ipv4_header_checksum(datagram.ip_header());
    datagram.set_ip_checksum(new);
    tracing::trace!(old = format_args!("{old:#06x}"), new = format_args!("{new:#06x}"), "ip csum");
    (old, new)
}

/// Computes the full UDP checksum in software and stores it.
///
/// Returns the old and new values.
pub fn update_udp_checksum(datagram: &mut UdpDatagram<'_>) -> (u16, u16) {
    let old = datagram.udp_checksum();
    datagram.set_udp_checksum(0);
    let new = udp_checksum(datagram.src_addr(), datagram.dst_addr(), datagram.udp_segment());
    datagram.set_udp_checksum(new);
    tracing::trace!(old = format_args!("{old:#06x}"), new = format_args!("{new:#06x}"), "udp csum");
    (old, new)
}

/// Stores the pseudo-header partial sum, leaving the rest to the device.
///
/// Returns the old and new values.
pub fn update_udp_pseudo_partial(datagram: &mut UdpDatagram<'_>) -> (u16, u16) {
    let old = datagram.udp_checksum();
    let new = udp_pseudo_partial(datagram.src_addr(), datagram.dst_addr(), datagram.udp_len());
    datagram.set_udp_checksum(new);
    tracing::trace!(
        old = format_args!("{old:#06x}"),
        new = format_args!("{new:#06x}"),
        "udp pseudo header csum"
    );
    (old, new)
}

/// Outcome of verifying the checksums of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumReport {
    /// Checksum over the IPv4 header including its checksum field; zero when
    /// the header is intact.
    pub ip_residual: u16,
    /// What the UDP checksum should have produced; zero when intact or when
    /// the packet carries no checksum.
    pub udp_residual: u16,
    /// Value stored in the UDP checksum field.
    pub udp_stored: u16,
    /// Value the UDP checksum field was expected to hold.
    pub udp_expected: u16,
}

impl ChecksumReport {
    /// Returns true if the IPv4 header checksum is valid.
    #[must_use]
    pub const fn ip_ok(&self) -> bool {
        self.ip_residual == 0
    }

    /// Returns true if the UDP checksum is valid.
    #[must_use]
    pub const fn udp_ok(&self) -> bool {
        self.udp_residual == 0
    }

    /// Returns true if both checksums are valid.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ip_ok() && self.udp_ok()
    }

    /// Returns the number of invalid checksums.
    #[must_use]
    pub fn mismatches(&self) -> u64 {
        u64::from(!self.ip_ok()) + u64::from(!self.udp_ok())
    }
}

/// Verifies a datagram that carries complete checksums.
///
/// A zero UDP checksum means the sender did not compute one and is accepted.
#[must_use]
pub fn verify(datagram: &UdpDatagram<'_>) -> ChecksumReport {
    let ip_residual = checksum(datagram.ip_header());
    let udp_stored = datagram.udp_checksum();

    let (udp_residual, udp_expected) = if udp_stored == 0 {
        (0, 0)
    } else {
        let pseudo = pseudo_header_sum(datagram.src_addr(), datagram.dst_addr(), datagram.udp_len());
        let residual = checksum_fold(pseudo.wrapping_add(checksum_add(datagram.udp_segment())));
        let mut segment = datagram.udp_segment().to_vec();
        segment[6..8].fill(0);
        let expected = udp_checksum(datagram.src_addr(), datagram.dst_addr(), &segment);
        (residual, expected)
    };

    ChecksumReport {
        ip_residual,
        udp_residual,
        udp_stored,
        udp_expected,
    }
}

/// Verifies a datagram whose UDP checksum field holds the pseudo-header
/// partial sum.
#[must_use]
pub fn verify_partial(datagram: &UdpDatagram<'_>) -> ChecksumReport {
    let ip_residual = checksum(datagram.ip_header());
    let udp_stored = datagram.udp_checksum();
    let udp_expected =
        udp_pseudo_partial(datagram.src_addr(), datagram.dst_addr(), datagram.udp_len());

    ChecksumReport {
        ip_residual,
        udp_residual: udp_stored ^ udp_expected,
        udp_stored,
        udp_expected,
    }
}

/// Completes the checksum of a [`ChecksumState::Partial`] packet the way an
/// offloading device does at transmission.
///
/// Sums from `csum_start` to the end of the UDP datagram, stores the result at
/// `csum_start + csum_offset` and clears the offload state. Packets in any
/// other state are left alone.
///
/// # Errors
///
/// Fails if the packet cannot be linearized or the offsets lie outside it.
pub fn complete_partial(packet: &mut Packet) -> Result<()> {
    let offload = *packet.offload();
    if offload.state != ChecksumState::Partial {
        return Ok(());
    }

    let end = {
        let datagram = packet.datagram()?;
        datagram.ihl() + usize::from(datagram.udp_len())
    };
    let data = packet.data_mut();
    let start = usize::from(offload.csum_start);
    let at = start + usize::from(offload.csum_offset);
    if at + 2 > end {
        return Err(RelayError::packet(format!(
            "checksum offset {at} outside datagram of {end} bytes"
        )));
    }

    let result = match checksum(&data[start..end]) {
        0 => CSUM_MANGLED_0,
        sum => sum,
    };
    data[at..at + 2].copy_from_slice(&result.to_be_bytes());
    packet.offload_mut().state = ChecksumState::None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapath::packet::ChecksumOffload;

    fn packet(payload: &[u8]) -> Packet {
        Packet::udp(
            "192.168.100.8:18562".parse().unwrap(),
            "10.1.40.121:32768".parse().unwrap(),
            payload,
        )
        .unwrap()
    }

    #[test]
    fn test_checksum_basic() {
        // Test vector from RFC 1071
        let data = [0x00, 0x01, 0xF2, 0x03, 0xF4, 0xF5, 0xF6, 0xF7];
        let sum = checksum(&data);
        // Expected: ~(0x0001 + 0xF203 + 0xF4F5 + 0xF6F7) = ~0x2DDF0 = ~0xDDF2 = 0x220D
        assert_eq!(sum, 0x220D);
    }

    #[test]
    fn test_checksum_empty() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn test_checksum_odd_length() {
        let data = [0x01, 0x02, 0x03];
        let sum = checksum(&data);
        // 0x0102 + 0x0300 = 0x0402, ~0x0402 = 0xFBFD
        assert_eq!(sum, 0xFBFD);
    }

    #[test]
    fn test_ipv4_checksum() {
        let mut header: [u8; 20] = [
            0x45, 0x00, // Version, IHL, ToS
            0x00, 0x3c, // Total Length
            0x1c, 0x46, // Identification
            0x40, 0x00, // Flags, Fragment Offset
            0x40, 0x06, // TTL, Protocol (TCP)
            0x00, 0x00, // Checksum (zeroed for calculation)
            0xac, 0x10, 0x0a, 0x63, // Source IP: 172.16.10.99
            0xac, 0x10, 0x0a, 0x0c, // Dest IP: 172.16.10.12
        ];

        let sum = ipv4_header_checksum(&header);
        assert_eq!(sum, 0xB1E6);

        header[10..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_update_ipv4_checksum() {
        let mut packet = packet(b"payload");
        let mut datagram = packet.datagram().unwrap();
        datagram.set_dst_addr(Ipv4Addr::new(213, 30, 241, 190));
        assert!(!verify(&datagram).ip_ok());

        update_ipv4_checksum(&mut datagram);
        assert_eq!(checksum(datagram.ip_header()), 0);
    }

    #[test]
    fn test_full_udp_checksum_verifies() {
        for payload in [&b""[..], b"a", b"rtp payload", b"odd payload"] {
            let mut packet = packet(payload);
            let datagram = packet.datagram().unwrap();
            let report = verify(&datagram);
            assert!(report.is_ok(), "{report:?}");
            assert_ne!(datagram.udp_checksum(), 0);
            assert_eq!(report.udp_expected, report.udp_stored);
        }
    }

    #[test]
    fn test_rewrite_detected_then_fixed() {
        let mut packet = packet(b"some media");
        let mut datagram = packet.datagram().unwrap();
        datagram.set_src_port(40000);

        let report = verify(&datagram);
        assert!(report.ip_ok());
        assert!(!report.udp_ok());
        assert_eq!(report.mismatches(), 1);

        update_udp_checksum(&mut datagram);
        assert!(verify(&datagram).is_ok());
    }

    #[test]
    fn test_zero_udp_checksum_is_not_verified() {
        let mut packet = packet(b"no checksum");
        let mut datagram = packet.datagram().unwrap();
        datagram.set_udp_checksum(0);
        datagram.set_src_port(1);
        assert!(verify(&datagram).udp_ok());
    }

    #[test]
    fn test_pseudo_partial_then_device_completion() {
        let mut packet = packet(b"offloaded payload");
        let full = packet.datagram().unwrap().udp_checksum();

        {
            let mut datagram = packet.datagram().unwrap();
            update_udp_pseudo_partial(&mut datagram);
            assert!(verify_partial(&datagram).is_ok());
        }

        *packet.offload_mut() = ChecksumOffload {
            state: ChecksumState::Partial,
            csum_start: 20,
            csum_offset: 6,
        };
        complete_partial(&mut packet).unwrap();

        assert_eq!(packet.offload().state, ChecksumState::None);
        let datagram = packet.datagram().unwrap();
        assert_eq!(datagram.udp_checksum(), full);
        assert!(verify(&datagram).is_ok());
    }

    #[test]
    fn test_complete_partial_ignores_trailing_bytes() {
        let mut clean = packet(b"padded frame");
        let full = clean.datagram().unwrap().udp_checksum();

        let mut data = clean.data().to_vec();
        data.extend_from_slice(&[0xAB, 0xCD]);
        let mut packet = Packet::from_slice(&data).with_offload(ChecksumOffload {
            state: ChecksumState::Partial,
            csum_start: 20,
            csum_offset: 6,
        });
        update_udp_pseudo_partial(&mut packet.datagram().unwrap());
        complete_partial(&mut packet).unwrap();

        assert_eq!(packet.len(), data.len() - 2);
        let datagram = packet.datagram().unwrap();
        assert_eq!(datagram.udp_checksum(), full);
        assert!(verify(&datagram).is_ok());
    }

    #[test]
    fn test_complete_partial_bounds() {
        let mut packet = packet(b"x").with_offload(ChecksumOffload {
            state: ChecksumState::Partial,
            csum_start: 20,
            csum_offset: 100,
        });
        assert!(complete_partial(&mut packet).is_err());

        let mut untouched = packet.clone().with_checksum_state(ChecksumState::Unnecessary);
        let before = untouched.data().to_vec();
        complete_partial(&mut untouched).unwrap();
        assert_eq!(untouched.data(), before.as_slice());
    }

    #[test]
    fn test_partial_mismatch() {
        let mut packet = packet(b"stale");
        let mut datagram = packet.datagram().unwrap();
        update_udp_pseudo_partial(&mut datagram);
        datagram.set_src_addr(Ipv4Addr::new(1, 1, 1, 1));

        let report = verify_partial(&datagram);
        assert!(!report.udp_ok());
        assert!(!report.ip_ok());
        assert_eq!(report.mismatches(), 2);
    }
}
