//! Gattlink wire-format header encode/decode and PSN arithmetic.
//!
//! The header is not a layout `pnet` has a packet type for, so this module
//! hand-rolls bit-level access the way `rips::ipv4::ipv4_tx::Ipv4Builder`
//! and `rips::ethernet::ethernet_tx::EthernetBuilder` hand-roll their framing
//! via a small `Protocol`-style `len()`/`build()` pair, rather than pulling
//! in a bit-field crate.

/// Gattlink packet serial numbers are 5 bits wide, modulo 32.
pub const PSN_MODULUS: u8 = 32;
const PSN_MASK: u8 = 0x1F;

/// Forward distance from `from` to `to`, modulo 32, in `0..32`.
pub fn psn_distance(to: u8, from: u8) -> u8 {
    to.wrapping_sub(from) & PSN_MASK
}

/// Whether `candidate` is "newer than or equal to" `reference` mod-32: a
/// forward distance of at most 16 is considered newer.
pub fn psn_is_newer_or_equal(candidate: u8, reference: u8) -> bool {
    psn_distance(candidate, reference) <= 16
}

pub fn psn_next(psn: u8) -> u8 {
    (psn + 1) & PSN_MASK
}

const CONTROL_BIT: u8 = 0b1000_0000;
const ACK_BIT: u8 = 0b0100_0000;
const PSN_FIELD_MASK: u8 = 0b0001_1111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOpcode {
    ResetReq,
    ResetConf,
}

impl ControlOpcode {
    fn to_bit(self) -> u8 {
        match self {
            ControlOpcode::ResetReq => 0,
            ControlOpcode::ResetConf => 1,
        }
    }

    fn from_bit(bit: u8) -> ControlOpcode {
        if bit == 0 {
            ControlOpcode::ResetReq
        } else {
            ControlOpcode::ResetConf
        }
    }
}

/// A parsed control packet: `[opcode_byte, version, flags, rx_window, tx_window]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    pub opcode: ControlOpcode,
    pub rx_window: u8,
    pub tx_window: u8,
}

impl ControlPacket {
    pub const WIRE_SIZE: usize = 5;

    pub fn encode(&self, out: &mut [u8; Self::WIRE_SIZE]) {
        out[0] = CONTROL_BIT | self.opcode.to_bit();
        out[1] = 0; // version
        out[2] = 0; // flags
        out[3] = self.rx_window;
        out[4] = self.tx_window;
    }

    pub fn decode(buf: &[u8]) -> Option<ControlPacket> {
        if buf.len() < Self::WIRE_SIZE || buf[0] & CONTROL_BIT == 0 {
            return None;
        }
        Some(ControlPacket {
            opcode: ControlOpcode::from_bit(buf[0] & 0x01),
            rx_window: buf[3],
            tx_window: buf[4],
        })
    }
}

/// A parsed incoming frame: either a naked ack, a data frame (with an
/// optional piggybacked ack), or a control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Control(ControlPacket),
    /// A standalone ack with no accompanying data payload.
    NakedAck { acked_psn: u8 },
    /// A data frame, optionally carrying a piggybacked ack of an earlier PSN.
    Data {
        piggyback_ack: Option<u8>,
        psn: u8,
        payload: &'a [u8],
    },
}

impl<'a> Frame<'a> {
    /// Parses one raw transport fragment into a `Frame`. Malformed or
    /// truncated input (e.g. an ack-flagged byte with no following data
    /// header byte) is silently rejected with `None`.
    pub fn parse(buf: &'a [u8]) -> Option<Frame<'a>> {
        if buf.is_empty() {
            return None;
        }
        let first = buf[0];
        if first & CONTROL_BIT != 0 {
            return ControlPacket::decode(buf).map(Frame::Control);
        }
        let acked_psn_field = first & PSN_FIELD_MASK;
        if first & ACK_BIT != 0 {
            if buf.len() == 1 {
                return Some(Frame::NakedAck {
                    acked_psn: acked_psn_field,
                });
            }
            // Piggyback ack: a second header byte carries the data PSN.
            let second = buf[1];
            if second & (CONTROL_BIT | ACK_BIT) != 0 {
                return None;
            }
            let psn = second & PSN_FIELD_MASK;
            return Some(Frame::Data {
                piggyback_ack: Some(acked_psn_field),
                psn,
                payload: &buf[2..],
            });
        }
        Some(Frame::Data {
            piggyback_ack: None,
            psn: acked_psn_field,
            payload: &buf[1..],
        })
    }

    /// Number of header bytes this frame shape requires, used when sizing
    /// outgoing fragments against the transport MTU.
    pub fn header_len(piggyback_ack: bool) -> usize {
        if piggyback_ack {
            2
        } else {
            1
        }
    }

    /// Serializes a naked ack into `out`, returning the number of bytes
    /// written (always 1).
    pub fn write_naked_ack(acked_psn: u8, out: &mut [u8]) -> usize {
        out[0] = ACK_BIT | (acked_psn & PSN_FIELD_MASK);
        1
    }

    /// Serializes a data frame header (and optional piggyback ack) followed
    /// by `payload` into `out`. Returns the total number of bytes written.
    pub fn write_data(piggyback_ack: Option<u8>, psn: u8, payload: &[u8], out: &mut [u8]) -> usize {
        let mut offset = 0;
        if let Some(acked) = piggyback_ack {
            out[offset] = ACK_BIT | (acked & PSN_FIELD_MASK);
            offset += 1;
            out[offset] = psn & PSN_FIELD_MASK;
            offset += 1;
        } else {
            out[offset] = psn & PSN_FIELD_MASK;
            offset += 1;
        }
        out[offset..offset + payload.len()].copy_from_slice(payload);
        offset + payload.len()
    }
}
