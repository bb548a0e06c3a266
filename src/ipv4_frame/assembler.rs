//! Compressed Gattlink-tunnel frame back to a full IPv4/UDP datagram.

use std::net::Ipv4Addr;

use log::{trace, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket};

use crate::errors::{GgError, GgResult};

use super::{IpConfig, IpMap, PortMode, DPORT_MODE_SHIFT, DST_ELIDED, MIN_IP_HEADER_SIZE, MODE_MASK,
    SPORT_MODE_SHIFT, SRC_ELIDED, UDP_HEADER_SIZE};

/// Leading fixed portion of every tunnel frame: the compression-flags byte
/// followed by a 2-byte big-endian declared payload length. The length lets
/// the assembler delimit frames over Gattlink's raw byte stream, the same
/// role the original IPv4 header's `total_length` field plays on the wire.
const FRAME_PREFIX_LEN: usize = 3;

/// Reconstructs full IPv4+UDP datagrams from Gattlink-tunnel frames produced
/// by an `Ipv4FrameSerializer` sharing the same `IpConfig`.
pub struct Ipv4FrameAssembler {
    config: IpConfig,
    ip_map: Option<IpMap>,
    next_identification: u16,
    max_packet_size: usize,
    scratch: Vec<u8>,
}

impl Ipv4FrameAssembler {
    pub fn new(config: IpConfig, max_packet_size: usize) -> Ipv4FrameAssembler {
        Ipv4FrameAssembler {
            config,
            ip_map: None,
            next_identification: 0,
            max_packet_size,
            scratch: Vec::new(),
        }
    }

    pub fn with_ip_map(config: IpConfig, ip_map: IpMap, max_packet_size: usize) -> Ipv4FrameAssembler {
        Ipv4FrameAssembler {
            config,
            ip_map: Some(ip_map),
            next_identification: 0,
            max_packet_size,
            scratch: Vec::new(),
        }
    }

    /// Feeds newly arrived tunnel-stream bytes in, returning every complete
    /// datagram that could be extracted. Bytes belonging to a frame that
    /// hasn't fully arrived yet are held in internal scratch state across
    /// calls — this is the streaming `{ ReadHeader, ReadCompressedHeader,
    /// ReadPayload }` state machine, expressed as "accumulate, then try to
    /// peel frames off the front" rather than as an explicit enum, since the
    /// whole header (compressed or not) is a fixed, flags-derived width and
    /// never itself needs to be read incrementally.
    ///
    /// A frame whose declared length exceeds `max_packet_size` is corrupt
    /// stream state, not just a bad datagram: there is no way to know where
    /// the next real frame boundary is, so the accumulated scratch is
    /// dropped entirely (a full reset back to `ReadHeader`) and the error
    /// propagates.
    pub fn feed(&mut self, bytes: &[u8]) -> GgResult<Vec<Vec<u8>>> {
        self.scratch.extend_from_slice(bytes);
        let mut datagrams = Vec::new();
        loop {
            let declared = match frame_length(&self.scratch) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    warn!("ipv4 frame: malformed tunnel frame header, resetting stream state: {}", e);
                    self.scratch.clear();
                    return Err(e);
                }
            };
            if declared > self.max_packet_size {
                warn!(
                    "ipv4 frame: declared frame length {} exceeds max_packet_size {}, resetting stream state",
                    declared, self.max_packet_size
                );
                self.scratch.clear();
                return Err(GgError::InvalidParameters(format!(
                    "declared frame length {} exceeds max_packet_size {}",
                    declared, self.max_packet_size
                )));
            }
            if self.scratch.len() < declared {
                break;
            }
            let frame: Vec<u8> = self.scratch.drain(..declared).collect();
            match self.assemble(&frame) {
                Ok(datagram) => datagrams.push(datagram),
                Err(e) => {
                    self.scratch.clear();
                    return Err(e);
                }
            }
        }
        Ok(datagrams)
    }

    /// Parses one complete tunnel frame (as delimited by its own length
    /// prefix) and builds a complete, checksummed IPv4 datagram. A length or
    /// field mismatch (a frame too short for the fields its own flags byte
    /// implies, or whose byte count doesn't match its declared payload
    /// length) is reported as `GgError::InvalidParameters`.
    pub fn assemble(&mut self, frame: &[u8]) -> GgResult<Vec<u8>> {
        if frame.len() < FRAME_PREFIX_LEN {
            warn!("ipv4 frame: rejecting tunnel frame shorter than its own prefix");
            return Err(GgError::InvalidParameters("tunnel frame shorter than its own prefix".to_owned()));
        }
        let flags = frame[0];
        let declared_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        let mut offset = FRAME_PREFIX_LEN;

        let src = if flags & SRC_ELIDED != 0 {
            self.config.default_src_address
        } else {
            let addr = read_addr(frame, offset)?;
            offset += 4;
            addr
        };
        let dst = if flags & DST_ELIDED != 0 {
            self.config.default_dst_address
        } else {
            let addr = read_addr(frame, offset)?;
            offset += 4;
            addr
        };

        let sport_mode = PortMode::from_bits((flags >> SPORT_MODE_SHIFT) & MODE_MASK)?;
        let sport = match sport_mode {
            PortMode::Literal => {
                let p = read_port(frame, offset)?;
                offset += 2;
                p
            }
            PortMode::Indexed(i) => *self
                .config
                .udp_src_ports
                .get(i as usize)
                .ok_or(GgError::OutOfRange)?,
        };
        let dport_mode = PortMode::from_bits((flags >> DPORT_MODE_SHIFT) & MODE_MASK)?;
        let dport = match dport_mode {
            PortMode::Literal => {
                let p = read_port(frame, offset)?;
                offset += 2;
                p
            }
            PortMode::Indexed(i) => *self
                .config
                .udp_dst_ports
                .get(i as usize)
                .ok_or(GgError::OutOfRange)?,
        };

        let payload_end = offset + declared_len;
        if payload_end != frame.len() {
            return Err(GgError::InvalidParameters(
                "tunnel frame length does not match its declared payload length".to_owned(),
            ));
        }
        let payload = &frame[offset..payload_end];

        let (src, dst) = match &self.ip_map {
            Some(ip_map) => ip_map.unapply(src, dst),
            None => (src, dst),
        };

        trace!("ipv4 frame: reconstructed {} byte frame to {}:{} -> {}:{}", frame.len(), src, sport, dst, dport);
        build_datagram(src, dst, sport, dport, payload, &mut self.next_identification)
    }
}

/// Header bytes implied by `flags` alone (beyond the fixed flags+length
/// prefix): elided address/port fields are simply absent from the wire, so
/// the layout is fully determined without reading any of them.
fn header_overhead(flags: u8) -> GgResult<usize> {
    let mut bytes = 0usize;
    if flags & SRC_ELIDED == 0 {
        bytes += 4;
    }
    if flags & DST_ELIDED == 0 {
        bytes += 4;
    }
    if let PortMode::Literal = PortMode::from_bits((flags >> SPORT_MODE_SHIFT) & MODE_MASK)? {
        bytes += 2;
    }
    if let PortMode::Literal = PortMode::from_bits((flags >> DPORT_MODE_SHIFT) & MODE_MASK)? {
        bytes += 2;
    }
    Ok(bytes)
}

/// Total byte length of the next complete frame sitting at the start of
/// `bytes`, if there's enough of it present yet to know. `Ok(None)` means
/// wait for more bytes to arrive; `Err` means the prefix itself is malformed
/// (an impossible port-mode bit pattern).
fn frame_length(bytes: &[u8]) -> GgResult<Option<usize>> {
    if bytes.len() < FRAME_PREFIX_LEN {
        return Ok(None);
    }
    let flags = bytes[0];
    let declared_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let overhead = header_overhead(flags)?;
    Ok(Some(FRAME_PREFIX_LEN + overhead + declared_len))
}

fn read_addr(frame: &[u8], offset: usize) -> GgResult<Ipv4Addr> {
    if offset + 4 > frame.len() {
        return Err(GgError::InvalidParameters("truncated address field".to_owned()));
    }
    Ok(Ipv4Addr::new(
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ))
}

fn read_port(frame: &[u8], offset: usize) -> GgResult<u16> {
    if offset + 2 > frame.len() {
        return Err(GgError::InvalidParameters("truncated port field".to_owned()));
    }
    Ok(u16::from_be_bytes([frame[offset], frame[offset + 1]]))
}

pub(crate) fn build_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    payload: &[u8],
    next_identification: &mut u16,
) -> GgResult<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    if udp_len > u16::MAX as usize {
        return Err(GgError::OutOfRange);
    }
    let mut udp_buf = vec![0u8; udp_len];
    {
        let mut udp_packet = MutableUdpPacket::new(&mut udp_buf)
            .ok_or_else(|| GgError::Internal("udp buffer too small".to_owned()))?;
        udp_packet.set_source(sport);
        udp_packet.set_destination(dport);
        udp_packet.set_length(udp_len as u16);
        udp_packet.set_payload(payload);
        let checksum = udp::ipv4_checksum(&udp_packet.to_immutable(), &src, &dst);
        udp_packet.set_checksum(checksum);
    }

    let total_len = MIN_IP_HEADER_SIZE + udp_len;
    if total_len > u16::MAX as usize {
        return Err(GgError::OutOfRange);
    }
    let mut ip_buf = vec![0u8; total_len];
    {
        let mut ip_packet = MutableIpv4Packet::new(&mut ip_buf)
            .ok_or_else(|| GgError::Internal("ipv4 buffer too small".to_owned()))?;
        ip_packet.set_version(4);
        ip_packet.set_header_length((MIN_IP_HEADER_SIZE / 4) as u8);
        ip_packet.set_total_length(total_len as u16);
        ip_packet.set_identification(*next_identification);
        *next_identification = next_identification.wrapping_add(1);
        ip_packet.set_ttl(64);
        ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip_packet.set_source(src);
        ip_packet.set_destination(dst);
        ip_packet.set_payload(&udp_buf);
        let checksum = ipv4::checksum(&ip_packet.to_immutable());
        ip_packet.set_checksum(checksum);
    }
    Ok(ip_buf)
}

#[cfg(test)]
mod tests {
    use super::super::serializer::Ipv4FrameSerializer;
    use super::*;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::udp::UdpPacket;
    use pnet::packet::Packet;

    fn config() -> IpConfig {
        IpConfig {
            default_src_address: Ipv4Addr::new(10, 0, 0, 1),
            default_dst_address: Ipv4Addr::new(10, 0, 0, 2),
            udp_src_ports: [5683, 0, 0],
            udp_dst_ports: [5684, 0, 0],
        }
    }

    fn make_test_datagram(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut id = 0u16;
        super::build_datagram(src, dst, sport, dport, payload, &mut id).expect("valid test datagram")
    }

    #[test]
    fn round_trips_through_serializer() {
        let original_src = Ipv4Addr::new(10, 0, 0, 1);
        let original_dst = Ipv4Addr::new(10, 0, 0, 2);
        let serializer = Ipv4FrameSerializer::new(config());
        let mut assembler = Ipv4FrameAssembler::new(config(), 1280);

        let datagram = make_test_datagram(original_src, original_dst, 5683, 5684, &[7, 7, 7]);
        let frame = serializer.serialize(&datagram).unwrap();
        let rebuilt = assembler.assemble(&frame).unwrap();

        let ip_packet = Ipv4Packet::new(&rebuilt).unwrap();
        assert_eq!(ip_packet.get_source(), original_src);
        assert_eq!(ip_packet.get_destination(), original_dst);
        let udp_packet = UdpPacket::new(ip_packet.payload()).unwrap();
        assert_eq!(udp_packet.get_source(), 5683);
        assert_eq!(udp_packet.get_destination(), 5684);
        assert_eq!(udp_packet.payload(), &[7, 7, 7]);
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut assembler = Ipv4FrameAssembler::new(config(), 1280);
        // src elision bit clear but no address bytes follow.
        assert!(assembler.assemble(&[0b0000_0000, 0, 0]).is_err());
        assert!(assembler.assemble(&[]).is_err());
    }

    /// Two datagrams concatenated in a single `feed` call (as Gattlink's
    /// byte-stream client hands bytes up in whatever chunking it has, with
    /// no awareness of frame boundaries) come back out as two datagrams,
    /// not one.
    #[test]
    fn feed_splits_concatenated_frames_from_a_single_chunk() {
        let original_src = Ipv4Addr::new(10, 0, 0, 1);
        let original_dst = Ipv4Addr::new(10, 0, 0, 2);
        let serializer = Ipv4FrameSerializer::new(config());
        let mut assembler = Ipv4FrameAssembler::new(config(), 1280);

        let mut stream = Vec::new();
        for payload_byte in [1u8, 2u8] {
            let datagram = make_test_datagram(original_src, original_dst, 5683, 5684, &[payload_byte; 3]);
            stream.extend(serializer.serialize(&datagram).unwrap());
        }

        let datagrams = assembler.feed(&stream).unwrap();
        assert_eq!(datagrams.len(), 2);
        for (i, datagram) in datagrams.iter().enumerate() {
            let ip_packet = Ipv4Packet::new(datagram).unwrap();
            let udp_packet = UdpPacket::new(ip_packet.payload()).unwrap();
            assert_eq!(udp_packet.payload(), &[(i + 1) as u8; 3]);
        }
    }

    /// A frame split across two `feed` calls is held in scratch state and
    /// only emitted once the second call completes it.
    #[test]
    fn feed_holds_a_partial_frame_across_calls() {
        let original_src = Ipv4Addr::new(10, 0, 0, 1);
        let original_dst = Ipv4Addr::new(10, 0, 0, 2);
        let serializer = Ipv4FrameSerializer::new(config());
        let mut assembler = Ipv4FrameAssembler::new(config(), 1280);

        let datagram = make_test_datagram(original_src, original_dst, 5683, 5684, &[9, 9, 9]);
        let frame = serializer.serialize(&datagram).unwrap();
        let (head, tail) = frame.split_at(frame.len() - 1);

        assert!(assembler.feed(head).unwrap().is_empty());
        let datagrams = assembler.feed(tail).unwrap();
        assert_eq!(datagrams.len(), 1);
    }

    /// A declared length beyond `max_packet_size` is corrupt stream state:
    /// it is reported as an error and the scratch buffer is dropped rather
    /// than kept around waiting for bytes that will never complete it.
    #[test]
    fn feed_resets_on_an_oversized_declared_length() {
        let mut assembler = Ipv4FrameAssembler::new(config(), 16);
        let mut bogus = vec![0u8; 3];
        bogus[1..3].copy_from_slice(&5000u16.to_be_bytes());
        assert!(assembler.feed(&bogus).is_err());
        assert!(assembler.feed(&[]).unwrap().is_empty());
    }
}
