//! Packet definitions for the reliable stream protocol
//!
//! Wire format (all integers big-endian, 16-byte header):
//! [Sequence: 4][Ack: 4][Flags: 1][Reserved: 1][Window: 2][Checksum: 2][Length: 2][Payload: 0-1384]

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Size of the fixed header
pub const HEADER_LEN: usize = 16;

/// Largest payload carried by one datagram (1400-byte MTU budget minus header)
pub const MAX_PAYLOAD: usize = 1384;

/// Maximum packet size (including header)
pub const MAX_PACKET_SIZE: usize = HEADER_LEN + MAX_PAYLOAD;

const CHECKSUM_OFFSET: usize = 12;

/// Header flag set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Handshake initiation
    pub const SYN: Self = Self(0x01);
    /// Acknowledgment number is valid
    pub const ACK: Self = Self(0x02);
    /// Sender is done
    pub const FIN: Self = Self(0x04);
    /// Abort the connection
    pub const RST: Self = Self(0x08);
    /// Packet carries payload
    pub const DATA: Self = Self(0x10);

    const NAMES: [(PacketFlags, &'static str); 5] = [
        (Self::SYN, "SYN"),
        (Self::ACK, "ACK"),
        (Self::FIN, "FIN"),
        (Self::RST, "RST"),
        (Self::DATA, "DATA"),
    ];

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keep every bit, including the reserved ones
    pub const fn from_bits_retain(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag byte
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// All bits of `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// No bits set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            write!(f, "0x{:02x}", self.0)?;
        }
        Ok(())
    }
}

/// Fixed 16-byte transport header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Sequence number of this packet
    pub sequence: u32,
    /// Next sequence the sender expects from its peer
    pub acknowledgment: u32,
    /// Control flags
    pub flags: PacketFlags,
    /// Advertised receive window (packets)
    pub window: u16,
    /// Checksum over header (minus this field) and payload
    pub checksum: u16,
    /// Payload length in bytes
    pub payload_length: u16,
}

impl PacketHeader {
    /// Create a header with no payload and an unset checksum
    pub fn new(sequence: u32, acknowledgment: u32, flags: PacketFlags, window: u16) -> Self {
        Self {
            sequence,
            acknowledgment,
            flags,
            window,
            checksum: 0,
            payload_length: 0,
        }
    }

    /// Serialize the header
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.sequence);
        buf.put_u32(self.acknowledgment);
        buf.put_u8(self.flags.bits());
        buf.put_u8(0); // reserved
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.payload_length);
        out
    }

    /// Deserialize a header; exact inverse of [`PacketHeader::encode`]
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        let sequence = buf.get_u32();
        let acknowledgment = buf.get_u32();
        let flags = PacketFlags::from_bits_retain(buf.get_u8());
        buf.advance(1);
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let payload_length = buf.get_u16();

        Self {
            sequence,
            acknowledgment,
            flags,
            window,
            checksum,
            payload_length,
        }
    }
}

/// Compute the packet checksum.
///
/// Every header byte except the checksum field itself, plus every payload
/// byte, is added into a 32-bit accumulator; carries above bit 16 are folded
/// back until none remain and the result is complemented. Detects
/// corruption only.
pub fn checksum(header: &PacketHeader, payload: &[u8]) -> u16 {
    let encoded = header.encode();
    let mut sum: u32 = encoded
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_OFFSET && *i != CHECKSUM_OFFSET + 1)
        .map(|(_, b)| u32::from(*b))
        .sum();
    sum += payload.iter().map(|b| u32::from(*b)).sum::<u32>();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// A complete datagram: header + payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header with length and checksum filled in
    pub header: PacketHeader,
    /// Opaque payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet, filling in the payload length and checksum
    pub fn new(mut header: PacketHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        header.payload_length = payload.len() as u16;
        header.checksum = checksum(&header, &payload);
        Self { header, payload }
    }

    /// Create a zero-payload control packet
    pub fn control(sequence: u32, acknowledgment: u32, flags: PacketFlags, window: u16) -> Self {
        Self::new(
            PacketHeader::new(sequence, acknowledgment, flags, window),
            Bytes::new(),
        )
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse an untrusted datagram. The checksum is not checked here.
    pub fn from_bytes(data: &[u8]) -> NetworkResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&data[..HEADER_LEN]);
        let header = PacketHeader::decode(&raw);
        let payload = &data[HEADER_LEN..];

        if payload.len() != header.payload_length as usize {
            return Err(NetworkError::InvalidPacket(format!(
                "Length field says {} bytes, datagram carries {}",
                header.payload_length,
                payload.len()
            )));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(NetworkError::InvalidPacket(format!(
                "Payload too large: {} bytes",
                payload.len()
            )));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Whether the stored checksum matches the contents
    pub fn verify_checksum(&self) -> bool {
        checksum(&self.header, &self.payload) == self.header.checksum
    }
}
