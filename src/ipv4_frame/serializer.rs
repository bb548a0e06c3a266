//! Full IPv4/UDP datagram to compressed Gattlink-tunnel frame.

use log::trace;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::errors::{GgError, GgResult};

use super::{port_mode_for, IpConfig, IpMap, PortMode, DPORT_MODE_SHIFT, DST_ELIDED, MIN_IP_HEADER_SIZE,
    SPORT_MODE_SHIFT, SRC_ELIDED, UDP_HEADER_SIZE};

/// Compresses full IPv4+UDP datagrams down to a Gattlink-tunnel frame.
pub struct Ipv4FrameSerializer {
    config: IpConfig,
    ip_map: Option<IpMap>,
}

impl Ipv4FrameSerializer {
    pub fn new(config: IpConfig) -> Ipv4FrameSerializer {
        Ipv4FrameSerializer { config, ip_map: None }
    }

    pub fn with_ip_map(config: IpConfig, ip_map: IpMap) -> Ipv4FrameSerializer {
        Ipv4FrameSerializer {
            config,
            ip_map: Some(ip_map),
        }
    }

    /// Parses `datagram` as a complete, unfragmented IPv4/UDP packet and
    /// produces the compressed frame that an `Ipv4FrameAssembler` configured
    /// with the same `IpConfig` can reconstruct it from.
    pub fn serialize(&self, datagram: &[u8]) -> GgResult<Vec<u8>> {
        if datagram.len() < MIN_IP_HEADER_SIZE {
            return Err(GgError::InvalidParameters("datagram shorter than an IPv4 header".to_owned()));
        }
        let ip_packet = Ipv4Packet::new(datagram)
            .ok_or_else(|| GgError::InvalidParameters("malformed IPv4 header".to_owned()))?;
        if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
            return Err(GgError::NotSupported);
        }
        if ip_packet.get_fragment_offset() != 0 || (ip_packet.get_flags() & 0x1) != 0 {
            // MORE_FRAGMENTS set or non-zero offset: fragmentation is out of
            // scope for the tunnel.
            return Err(GgError::NotSupported);
        }
        if ip_packet.get_header_length() as usize * 4 != MIN_IP_HEADER_SIZE {
            // IPv4 options: compression always reconstructs a bare 20-byte
            // header, so a datagram carrying options can't round-trip and is
            // rejected rather than silently dropping them.
            return Err(GgError::NotSupported);
        }
        let total_length = ip_packet.get_total_length() as usize;
        if total_length > datagram.len() {
            return Err(GgError::InvalidParameters("IPv4 total length exceeds buffer".to_owned()));
        }

        let (mut src, mut dst) = (ip_packet.get_source(), ip_packet.get_destination());
        if let Some(ip_map) = &self.ip_map {
            let (s, d) = ip_map.apply(src, dst);
            src = s;
            dst = d;
        }

        let udp_packet = UdpPacket::new(ip_packet.payload())
            .ok_or_else(|| GgError::InvalidParameters("malformed UDP header".to_owned()))?;
        let sport = udp_packet.get_source();
        let dport = udp_packet.get_destination();
        let payload = udp_packet.payload();
        if (UDP_HEADER_SIZE + payload.len()) > (datagram.len().saturating_sub(MIN_IP_HEADER_SIZE)) {
            return Err(GgError::InvalidParameters("UDP length exceeds IPv4 payload".to_owned()));
        }

        let src_elided = src == self.config.default_src_address;
        let dst_elided = dst == self.config.default_dst_address;
        let sport_mode = port_mode_for(sport, &self.config.udp_src_ports);
        let dport_mode = port_mode_for(dport, &self.config.udp_dst_ports);

        let mut flags = 0u8;
        if src_elided {
            flags |= SRC_ELIDED;
        }
        if dst_elided {
            flags |= DST_ELIDED;
        }
        flags |= sport_mode.to_bits() << SPORT_MODE_SHIFT;
        flags |= dport_mode.to_bits() << DPORT_MODE_SHIFT;

        let mut out = Vec::with_capacity(3 + 8 + 4 + payload.len());
        out.push(flags);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        if !src_elided {
            out.extend_from_slice(&src.octets());
        }
        if !dst_elided {
            out.extend_from_slice(&dst.octets());
        }
        if let PortMode::Literal = sport_mode {
            out.extend_from_slice(&sport.to_be_bytes());
        }
        if let PortMode::Literal = dport_mode {
            out.extend_from_slice(&dport.to_be_bytes());
        }
        out.extend_from_slice(payload);
        trace!(
            "ipv4 frame: serialized {} byte datagram to {} byte frame (src_elided={}, dst_elided={})",
            datagram.len(),
            out.len(),
            src_elided,
            dst_elided
        );
        Ok(out)
    }
}
