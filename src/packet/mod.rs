//! Application framing: packets, reassembly worker and framing strategies.
//!
//! The reactor hands raw byte runs to the packet worker in arrival order; the
//! worker reassembles them into framed packets and fans them out to the
//! registered listeners on its own thread.

pub(crate) mod worker;

pub use worker::PacketWorker;

use crate::channel::ChannelRef;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use mio::Token;

/// One application-level message.
///
/// Single-byte framing carries the header alone; variable-length framing adds
/// a big-endian length-prefixed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: u16, payload: Bytes) -> Self {
        Packet { header, payload }
    }

    /// Header-only packet, as used by single-byte framing.
    pub fn header_only(header: u8) -> Self {
        Packet {
            header: header as u16,
            payload: Bytes::new(),
        }
    }
}

/// Receives fully framed packets from the packet worker thread.
pub trait PacketListener: Send + Sync {
    fn packet_arrived(&self, channel: &ChannelRef, packet: Packet);
}

/// Notified when a channel's reassembly buffer exceeds its growth cap.
pub trait OverflowListener: Send + Sync {
    fn buffer_exceeded(&self, token: Token);
}

/// Wire size of the packet-type header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLen {
    U8,
    U16,
}

impl HeaderLen {
    fn bytes(self) -> usize {
        match self {
            HeaderLen::U8 => 1,
            HeaderLen::U16 => 2,
        }
    }
}

/// Wire size of the payload-length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthLen {
    U16,
    U32,
}

impl LengthLen {
    fn bytes(self) -> usize {
        match self {
            LengthLen::U16 => 2,
            LengthLen::U32 => 4,
        }
    }
}

/// Framing strategy applied by the packet worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One byte per message, no payload
    SingleByte,
    /// header(1|2) length(2|4, big-endian, payload-only) payload
    VariableLength { header: HeaderLen, length: LengthLen },
}

impl Framing {
    pub fn variable(header: HeaderLen, length: LengthLen) -> Self {
        Framing::VariableLength { header, length }
    }

    /// Extract the next complete packet, or None if more bytes are needed.
    pub fn decode(&self, buf: &mut BytesMut) -> Option<Packet> {
        match *self {
            Framing::SingleByte => {
                if buf.is_empty() {
                    return None;
                }
                let header = buf.split_to(1)[0];
                Some(Packet::header_only(header))
            }
            Framing::VariableLength { header, length } => {
                let prefix = header.bytes() + length.bytes();
                if buf.len() < prefix {
                    return None;
                }
                let head = match header {
                    HeaderLen::U8 => buf[0] as u16,
                    HeaderLen::U16 => BigEndian::read_u16(&buf[..2]),
                };
                let len = match length {
                    LengthLen::U16 => BigEndian::read_u16(&buf[header.bytes()..prefix]) as usize,
                    LengthLen::U32 => BigEndian::read_u32(&buf[header.bytes()..prefix]) as usize,
                };
                if buf.len() < prefix + len {
                    return None;
                }
                buf.advance(prefix);
                let payload = buf.split_to(len).freeze();
                Some(Packet::new(head, payload))
            }
        }
    }

    /// Serialize a packet for transmission under this framing.
    pub fn encode(&self, packet: &Packet) -> Bytes {
        match *self {
            Framing::SingleByte => Bytes::copy_from_slice(&[packet.header as u8]),
            Framing::VariableLength { header, length } => {
                let mut out =
                    Vec::with_capacity(header.bytes() + length.bytes() + packet.payload.len());
                match header {
                    HeaderLen::U8 => out.write_u8(packet.header as u8).unwrap(),
                    HeaderLen::U16 => out.write_u16::<BigEndian>(packet.header).unwrap(),
                }
                match length {
                    LengthLen::U16 => out
                        .write_u16::<BigEndian>(packet.payload.len() as u16)
                        .unwrap(),
                    LengthLen::U32 => out
                        .write_u32::<BigEndian>(packet.payload.len() as u32)
                        .unwrap(),
                }
                out.extend_from_slice(&packet.payload);
                Bytes::from(out)
            }
        }
    }
}
