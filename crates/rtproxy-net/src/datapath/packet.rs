//! Packet representation and header views.
//!
//! A [`Packet`] is what a checkpoint receives from the host network layer: the
//! datagram bytes starting at the IPv4 header, possibly spread over several
//! segments, plus the checksum-offload and routing metadata the host attached
//! to it. [`UdpDatagram`] and [`RtpHeaderMut`] are mutable views over the
//! linearized bytes.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::BytesMut;

use crate::error::{RelayError, Result};
use crate::nat_engine::checksum;

/// Largest IPv4 datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Length of an IPv4 header without options.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Length of the UDP header.
pub const UDP_HEADER_LEN: usize = 8;

/// Offset of the checksum field within the UDP header.
pub const UDP_CHECKSUM_OFFSET: usize = 6;

/// Length of the fixed RTP header.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version carried by every packet this relay smooths.
pub const RTP_VERSION: u8 = 2;

/// IP protocol number of UDP.
pub const IPPROTO_UDP: u8 = 17;

const IPV4_CHECKSUM_OFFSET: usize = 10;

/// Who is responsible for the transport checksum of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    /// Checksum present in the packet but not verified.
    #[default]
    None,
    /// Hardware verified the checksums of the protocols it knows.
    Unnecessary,
    /// Hardware summed the whole packet.
    Complete,
    /// Checksum holds only the pseudo-header sum; the device completes it.
    Partial,
}

impl fmt::Display for ChecksumState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "CHECKSUM_NONE",
            Self::Unnecessary => "CHECKSUM_UNNECESSARY",
            Self::Complete => "CHECKSUM_COMPLETE",
            Self::Partial => "CHECKSUM_PARTIAL",
        };
        f.write_str(name)
    }
}

/// Checksum-offload metadata of a packet.
///
/// `csum_start` is relative to the start of the IPv4 header, `csum_offset` to
/// `csum_start`. Both are meaningful only in [`ChecksumState::Partial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumOffload {
    /// Offload state.
    pub state: ChecksumState,
    /// Where the device starts summing.
    pub csum_start: u16,
    /// Where the device stores the result, relative to `csum_start`.
    pub csum_offset: u16,
}

impl ChecksumOffload {
    /// Creates offload metadata in the given state.
    #[must_use]
    pub const fn new(state: ChecksumState) -> Self {
        Self {
            state,
            csum_start: 0,
            csum_offset: 0,
        }
    }
}

/// Offload capabilities of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    /// Can checksum UDP/TCP over IPv4.
    pub ip_csum: bool,
    /// Can checksum anything.
    pub hw_csum: bool,
}

impl DeviceFeatures {
    /// Returns true if the device can complete a UDP checksum.
    #[inline]
    #[must_use]
    pub const fn supports_checksum(&self) -> bool {
        self.ip_csum || self.hw_csum
    }
}

/// Result of the host's forwarding decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteInfo {
    /// The packet is delivered to this host.
    pub local_delivery: bool,
    /// Output device, if one has been chosen.
    pub device: Option<DeviceFeatures>,
}

impl RouteInfo {
    /// Returns true if the checksum may be left to the output device.
    ///
    /// A packet without a known device counts as capable.
    #[inline]
    #[must_use]
    pub fn can_hw_checksum(&self) -> bool {
        self.device.is_none_or(|device| device.supports_checksum())
    }
}

/// A packet handed to the relay by the host network layer.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    segments: Vec<BytesMut>,
    offload: ChecksumOffload,
    route: RouteInfo,
}

impl Packet {
    /// Creates a single-segment packet.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_segments(vec![BytesMut::from(data)])
    }

    /// Creates a packet from non-contiguous segments.
    #[must_use]
    pub fn from_segments(segments: Vec<BytesMut>) -> Self {
        Self {
            segments,
            offload: ChecksumOffload::default(),
            route: RouteInfo::default(),
        }
    }

    /// Builds a single-segment UDP over IPv4 packet with valid checksums.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit in one datagram.
    pub fn udp(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Result<Self> {
        let udp_len = UDP_HEADER_LEN + payload.len();
        let total = IPV4_MIN_HEADER_LEN + udp_len;
        let (Ok(total_field), Ok(udp_field)) = (u16::try_from(total), u16::try_from(udp_len))
        else {
            return Err(RelayError::packet(format!(
                "payload of {} bytes does not fit in a datagram",
                payload.len()
            )));
        };

        let mut buf = BytesMut::with_capacity(total);
        buf.extend_from_slice(&[0x45, 0x00]);
        buf.extend_from_slice(&total_field.to_be_bytes());
        // id, DF, TTL 64, UDP, checksum
        buf.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, 17, 0x00, 0x00]);
        buf.extend_from_slice(&source.ip().octets());
        buf.extend_from_slice(&destination.ip().octets());
        buf.extend_from_slice(&source.port().to_be_bytes());
        buf.extend_from_slice(&destination.port().to_be_bytes());
        buf.extend_from_slice(&udp_field.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x00]);
        buf.extend_from_slice(payload);

        let mut packet = Self::from_segments(vec![buf]);
        let mut datagram = packet.datagram()?;
        checksum::update_ipv4_checksum(&mut datagram);
        checksum::update_udp_checksum(&mut datagram);
        Ok(packet)
    }

    /// Sets the checksum-offload state.
    #[must_use]
    pub fn with_checksum_state(mut self, state: ChecksumState) -> Self {
        self.offload.state = state;
        self
    }

    /// Sets the full checksum-offload metadata.
    #[must_use]
    pub fn with_offload(mut self, offload: ChecksumOffload) -> Self {
        self.offload = offload;
        self
    }

    /// Sets the routing metadata.
    #[must_use]
    pub fn with_route(mut self, route: RouteInfo) -> Self {
        self.route = route;
        self
    }

    /// Returns the total length over all segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(BytesMut::len).sum()
    }

    /// Returns true if the packet has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the checksum-offload metadata.
    #[must_use]
    pub const fn offload(&self) -> &ChecksumOffload {
        &self.offload
    }

    /// Returns the checksum-offload metadata mutably.
    pub fn offload_mut(&mut self) -> &mut ChecksumOffload {
        &mut self.offload
    }

    /// Returns the routing metadata.
    #[must_use]
    pub const fn route(&self) -> &RouteInfo {
        &self.route
    }

    /// Returns the routing metadata mutably.
    pub fn route_mut(&mut self) -> &mut RouteInfo {
        &mut self.route
    }

    /// Merges all segments into one contiguous buffer.
    ///
    /// # Errors
    ///
    /// Fails if the packet is empty or larger than [`MAX_DATAGRAM_SIZE`].
    pub fn linearize(&mut self) -> Result<()> {
        let len = self.len();
        if len == 0 {
            return Err(RelayError::packet("empty packet"));
        }
        if len > MAX_DATAGRAM_SIZE {
            return Err(RelayError::packet(format!(
                "packet of {len} bytes exceeds the IPv4 maximum"
            )));
        }
        if self.segments.len() > 1 {
            let mut linear = BytesMut::with_capacity(len);
            for segment in self.segments.drain(..) {
                linear.extend_from_slice(&segment);
            }
            self.segments.push(linear);
        }
        Ok(())
    }

    /// Returns the bytes of a linear packet.
    ///
    /// Empty unless the packet consists of exactly one segment.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self.segments.as_slice() {
            [segment] => &segment[..],
            _ => &[],
        }
    }

    /// Returns the bytes of a linear packet mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.segments.as_mut_slice() {
            [segment] => &mut segment[..],
            _ => &mut [],
        }
    }

    /// Drops link-layer padding past the IPv4 total length of a linear
    /// IPv4 packet.
    fn trim_to_ip_len(&mut self) {
        if let [segment] = self.segments.as_mut_slice() {
            if segment.len() >= IPV4_MIN_HEADER_LEN && segment[0] >> 4 == 4 {
                let total_len = usize::from(u16::from_be_bytes([segment[2], segment[3]]));
                if total_len >= IPV4_MIN_HEADER_LEN && total_len < segment.len() {
                    segment.truncate(total_len);
                }
            }
        }
    }

    /// Linearizes the packet and views it as a UDP datagram.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot be linearized or is not UDP over IPv4.
    pub fn datagram(&mut self) -> Result<UdpDatagram<'_>> {
        self.linearize()?;
        self.trim_to_ip_len();
        UdpDatagram::parse(self.data_mut())
    }

    /// Like [`Packet::datagram`], also lending out the packet metadata.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot be linearized or is not UDP over IPv4.
    pub fn parts_mut(&mut self) -> Result<(UdpDatagram<'_>, &mut ChecksumOffload, &RouteInfo)> {
        self.linearize()?;
        self.trim_to_ip_len();
        let buf = match self.segments.as_mut_slice() {
            [segment] => &mut segment[..],
            _ => return Err(RelayError::packet("packet is not linear")),
        };
        let datagram = UdpDatagram::parse(buf)?;
        Ok((datagram, &mut self.offload, &self.route))
    }
}

/// Mutable view of a UDP over IPv4 datagram.
///
/// The buffer starts at the IPv4 header. The IPv4 total length must cover the
/// UDP length and fit in the buffer; bytes past the UDP length are left alone.
#[derive(Debug)]
pub struct UdpDatagram<'a> {
    buf: &'a mut [u8],
    ihl: usize,
}

impl<'a> UdpDatagram<'a> {
    /// Validates the IPv4 and UDP headers of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Packet`] if `buf` is not a complete UDP over IPv4
    /// datagram.
    pub fn parse(buf: &'a mut [u8]) -> Result<Self> {
        if buf.len() < IPV4_MIN_HEADER_LEN {
            return Err(RelayError::packet("too short for an IPv4 header"));
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(RelayError::packet(format!("IP version {version}")));
        }

        let ihl = usize::from(buf[0] & 0x0F) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || buf.len() < ihl + UDP_HEADER_LEN {
            return Err(RelayError::packet(format!("bad IPv4 header length {ihl}")));
        }

        let protocol = buf[9];
        if protocol != IPPROTO_UDP {
            return Err(RelayError::packet(format!("not UDP: protocol {protocol}")));
        }

        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len > buf.len() {
            return Err(RelayError::packet(format!(
                "IPv4 total length {total_len} exceeds {} captured bytes",
                buf.len()
            )));
        }

        let udp_len = usize::from(u16::from_be_bytes([buf[ihl + 4], buf[ihl + 5]]));
        if udp_len < UDP_HEADER_LEN || ihl + udp_len > total_len {
            return Err(RelayError::packet(format!("bad UDP length {udp_len}")));
        }

        Ok(Self { buf, ihl })
    }

    /// Returns the IPv4 header length in bytes.
    #[inline]
    #[must_use]
    pub const fn ihl(&self) -> usize {
        self.ihl
    }

    /// Returns the IPv4 header.
    #[inline]
    #[must_use]
    pub fn ip_header(&self) -> &[u8] {
        &self.buf[..self.ihl]
    }

    /// Returns the IPv4 header mutably.
    #[inline]
    pub fn ip_header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.ihl]
    }

    /// Returns the IPv4 header checksum.
    #[must_use]
    pub fn ip_checksum(&self) -> u16 {
        self.read_u16(IPV4_CHECKSUM_OFFSET)
    }

    /// Stores the IPv4 header checksum.
    pub fn set_ip_checksum(&mut self, checksum: u16) {
        self.write_u16(IPV4_CHECKSUM_OFFSET, checksum);
    }

    /// Returns the source address.
    #[must_use]
    pub fn src_addr(&self) -> Ipv4Addr {
        self.read_addr(12)
    }

    /// Sets the source address.
    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buf[12..16].copy_from_slice(&addr.octets());
    }

    /// Returns the destination address.
    #[must_use]
    pub fn dst_addr(&self) -> Ipv4Addr {
        self.read_addr(16)
    }

    /// Sets the destination address.
    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buf[16..20].copy_from_slice(&addr.octets());
    }

    /// Returns the UDP source port.
    #[must_use]
    pub fn src_port(&self) -> u16 {
        self.read_u16(self.ihl)
    }

    /// Sets the UDP source port.
    pub fn set_src_port(&mut self, port: u16) {
        self.write_u16(self.ihl, port);
    }

    /// Returns the UDP destination port.
    #[must_use]
    pub fn dst_port(&self) -> u16 {
        self.read_u16(self.ihl + 2)
    }

    /// Sets the UDP destination port.
    pub fn set_dst_port(&mut self, port: u16) {
        self.write_u16(self.ihl + 2, port);
    }

    /// Returns the source endpoint.
    #[must_use]
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_addr(), self.src_port())
    }

    /// Returns the destination endpoint.
    #[must_use]
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_addr(), self.dst_port())
    }

    /// Returns the UDP length field.
    #[must_use]
    pub fn udp_len(&self) -> u16 {
        self.read_u16(self.ihl + 4)
    }

    /// Returns the UDP checksum.
    #[must_use]
    pub fn udp_checksum(&self) -> u16 {
        self.read_u16(self.ihl + UDP_CHECKSUM_OFFSET)
    }

    /// Stores the UDP checksum.
    pub fn set_udp_checksum(&mut self, checksum: u16) {
        self.write_u16(self.ihl + UDP_CHECKSUM_OFFSET, checksum);
    }

    /// Returns the UDP header and payload.
    #[must_use]
    pub fn udp_segment(&self) -> &[u8] {
        &self.buf[self.ihl..self.ihl + usize::from(self.udp_len())]
    }

    /// Returns the UDP payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.udp_segment()[UDP_HEADER_LEN..]
    }

    /// Returns the UDP payload mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.ihl + UDP_HEADER_LEN;
        let end = self.ihl + usize::from(self.udp_len());
        &mut self.buf[start..end]
    }

    fn read_addr(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buf[offset],
            self.buf[offset + 1],
            self.buf[offset + 2],
            self.buf[offset + 3],
        )
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }
}

/// Mutable view of a fixed RTP header.
#[derive(Debug)]
pub struct RtpHeaderMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> RtpHeaderMut<'a> {
    /// Views the start of a UDP payload as an RTP header.
    ///
    /// Returns `None` if the payload is shorter than the fixed header or the
    /// version is not 2.
    #[must_use]
    pub fn parse(payload: &'a mut [u8]) -> Option<Self> {
        if payload.len() < RTP_HEADER_LEN || payload[0] >> 6 != RTP_VERSION {
            return None;
        }
        Some(Self { buf: payload })
    }

    /// Returns the sequence number.
    #[must_use]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    /// Sets the sequence number.
    pub fn set_sequence_number(&mut self, sn: u16) {
        self.buf[2..4].copy_from_slice(&sn.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(payload: &[u8]) -> Vec<u8> {
        let total = IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN + payload.len();
        let udp_len = UDP_HEADER_LEN + payload.len();
        let mut buf = vec![
            0x45, 0x00, 0, 0, // version/IHL, ToS, total length
            0x00, 0x01, 0x40, 0x00, // id, flags
            0x40, 17, 0x00, 0x00, // TTL, UDP, checksum
            192, 168, 100, 8, // source
            10, 1, 40, 121, // destination
            0x48, 0x82, 0x80, 0x00, // 18562 -> 32768
            0, 0, 0x00, 0x00, // length, checksum
        ];
        buf[2..4].copy_from_slice(&u16::try_from(total).unwrap().to_be_bytes());
        buf[24..26].copy_from_slice(&u16::try_from(udp_len).unwrap().to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_checksum_state_names() {
        assert_eq!(ChecksumState::None.to_string(), "CHECKSUM_NONE");
        assert_eq!(ChecksumState::Partial.to_string(), "CHECKSUM_PARTIAL");
    }

    #[test]
    fn test_parse_udp_datagram() {
        let mut buf = udp_packet(b"hello");
        let datagram = UdpDatagram::parse(&mut buf).unwrap();

        assert_eq!(datagram.ihl(), 20);
        assert_eq!(datagram.source(), "192.168.100.8:18562".parse().unwrap());
        assert_eq!(datagram.destination(), "10.1.40.121:32768".parse().unwrap());
        assert_eq!(datagram.udp_len(), 13);
        assert_eq!(datagram.payload(), b"hello");
    }

    #[test]
    fn test_rewrite_fields() {
        let mut buf = udp_packet(b"hello");
        let mut datagram = UdpDatagram::parse(&mut buf).unwrap();

        datagram.set_src_addr(Ipv4Addr::new(1, 1, 1, 1));
        datagram.set_src_port(32768);
        datagram.set_dst_addr(Ipv4Addr::new(213, 30, 241, 190));
        datagram.set_dst_port(40960);

        assert_eq!(datagram.source(), "1.1.1.1:32768".parse().unwrap());
        assert_eq!(datagram.destination(), "213.30.241.190:40960".parse().unwrap());
        assert_eq!(datagram.payload(), b"hello");
    }

    #[test]
    fn test_parse_rejects_non_udp() {
        let mut buf = udp_packet(b"");
        buf[9] = 6;
        assert!(UdpDatagram::parse(&mut buf).unwrap_err().is_packet());
    }

    #[test]
    fn test_parse_rejects_ipv6() {
        let mut buf = udp_packet(b"");
        buf[0] = 0x60;
        assert!(UdpDatagram::parse(&mut buf).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_lengths() {
        let mut buf = udp_packet(b"abc");
        buf[0] = 0x44;
        assert!(UdpDatagram::parse(&mut buf).is_err());

        let mut buf = udp_packet(b"abc");
        buf[24..26].copy_from_slice(&7u16.to_be_bytes());
        assert!(UdpDatagram::parse(&mut buf).is_err());

        let mut buf = udp_packet(b"abc");
        buf[24..26].copy_from_slice(&12u16.to_be_bytes());
        assert!(UdpDatagram::parse(&mut buf).is_err());

        let mut short = vec![0x45; 10];
        assert!(UdpDatagram::parse(&mut short).is_err());

        // total length beyond the captured bytes
        let mut buf = udp_packet(b"abc");
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        assert!(UdpDatagram::parse(&mut buf).is_err());

        // UDP length beyond the total length
        let mut buf = udp_packet(b"abc");
        buf.extend_from_slice(&[0, 0]);
        buf[24..26].copy_from_slice(&13u16.to_be_bytes());
        assert!(UdpDatagram::parse(&mut buf).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_trimmed() {
        let buf = udp_packet(b"abc");
        let mut padded = buf.clone();
        padded.extend_from_slice(&[0xAB, 0xCD]);
        let mut packet = Packet::from_slice(&padded);

        let datagram = packet.datagram().unwrap();
        assert_eq!(datagram.payload(), b"abc");
        assert_eq!(packet.len(), buf.len());
        assert_eq!(packet.data(), buf.as_slice());
    }

    #[test]
    fn test_linearize_segments() {
        let buf = udp_packet(b"segmented payload");
        let (head, tail) = buf.split_at(24);
        let mut packet =
            Packet::from_segments(vec![BytesMut::from(head), BytesMut::from(tail)]);
        assert_eq!(packet.segment_count(), 2);
        assert!(packet.data().is_empty());

        let datagram = packet.datagram().unwrap();
        assert_eq!(datagram.payload(), b"segmented payload");
        assert_eq!(packet.segment_count(), 1);
        assert_eq!(packet.data(), buf.as_slice());
    }

    #[test]
    fn test_linearize_rejects_oversized() {
        let mut packet = Packet::from_segments(vec![
            BytesMut::zeroed(MAX_DATAGRAM_SIZE),
            BytesMut::zeroed(1),
        ]);
        assert!(packet.linearize().is_err());
        assert!(Packet::default().linearize().is_err());
    }

    #[test]
    fn test_route_hw_checksum() {
        assert!(RouteInfo::default().can_hw_checksum());

        let dumb = RouteInfo {
            local_delivery: false,
            device: Some(DeviceFeatures::default()),
        };
        assert!(!dumb.can_hw_checksum());

        let capable = RouteInfo {
            local_delivery: false,
            device: Some(DeviceFeatures {
                ip_csum: true,
                hw_csum: false,
            }),
        };
        assert!(capable.can_hw_checksum());
    }

    #[test]
    fn test_rtp_header() {
        let mut payload = [0x80, 0x00, 0x12, 0x34, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut rtp = RtpHeaderMut::parse(&mut payload).unwrap();
        assert_eq!(rtp.sequence_number(), 0x1234);
        rtp.set_sequence_number(0xABCD);
        assert_eq!(payload[2..4], [0xAB, 0xCD]);

        let mut short = [0x80, 0x00, 0x12, 0x34];
        assert!(RtpHeaderMut::parse(&mut short).is_none());

        let mut version_one = [0x40; RTP_HEADER_LEN];
        assert!(RtpHeaderMut::parse(&mut version_one).is_none());
    }
}
