//! Fixed-size packet header and the packet type table.
//!
//! Every unit on the wire is a 20-byte little-endian header followed by
//! `packet_size - HEADER_SIZE` bytes of payload:
//!
//! ```text
//! [protocol_id: u32][major: u16][minor: u16][packet_type: u32][packet_size: u64][payload ...]
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of an encoded [`PacketHeader`].
pub const HEADER_SIZE: usize = 20;

/// Protocol id every Cerver peer stamps on its packets unless configured otherwise.
pub const CERVER_PROTOCOL_ID: u32 = 0x4345_5256;

/// Version stamped by default.
pub const CERVER_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible when their major numbers agree.
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Protocol id and version a peer stamps on outgoing packets and expects on
/// incoming ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    pub protocol_id: u32,
    pub version: ProtocolVersion,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            protocol_id: CERVER_PROTOCOL_ID,
            version: CERVER_PROTOCOL_VERSION,
        }
    }
}

/// What kind of packet follows the header.
///
/// Values outside the known table decode as [`PacketType::Unknown`] so a
/// peer speaking a newer protocol is logged and ignored instead of dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Server,
    Client,
    Error,
    Request,
    Auth,
    Game,
    App,
    AppError,
    Custom,
    Test,
    DontCheckType,
    Unknown(u32),
}

impl PacketType {
    pub fn as_u32(self) -> u32 {
        match self {
            PacketType::Server => 0,
            PacketType::Client => 1,
            PacketType::Error => 2,
            PacketType::Request => 3,
            PacketType::Auth => 4,
            PacketType::Game => 5,
            PacketType::App => 6,
            PacketType::AppError => 7,
            PacketType::Custom => 70,
            PacketType::Test => 100,
            PacketType::DontCheckType => 101,
            PacketType::Unknown(value) => value,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Server => "SERVER",
            PacketType::Client => "CLIENT",
            PacketType::Error => "ERROR",
            PacketType::Request => "REQUEST",
            PacketType::Auth => "AUTH",
            PacketType::Game => "GAME",
            PacketType::App => "APP",
            PacketType::AppError => "APP_ERROR",
            PacketType::Custom => "CUSTOM",
            PacketType::Test => "TEST",
            PacketType::DontCheckType => "DONT_CHECK_TYPE",
            PacketType::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u32> for PacketType {
    fn from(value: u32) -> Self {
        match value {
            0 => PacketType::Server,
            1 => PacketType::Client,
            2 => PacketType::Error,
            3 => PacketType::Request,
            4 => PacketType::Auth,
            5 => PacketType::Game,
            6 => PacketType::App,
            7 => PacketType::AppError,
            70 => PacketType::Custom,
            100 => PacketType::Test,
            101 => PacketType::DontCheckType,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u32 {
    fn from(packet_type: PacketType) -> Self {
        packet_type.as_u32()
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Unknown(value) => write!(f, "UNKNOWN({})", value),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol_id: u32,
    pub version: ProtocolVersion,
    pub packet_type: PacketType,
    /// Header plus payload, in bytes.
    pub packet_size: u64,
}

impl PacketHeader {
    pub fn new(settings: &ProtocolSettings, packet_type: PacketType, payload_len: usize) -> Self {
        Self {
            protocol_id: settings.protocol_id,
            version: settings.version,
            packet_type,
            packet_size: (HEADER_SIZE + payload_len) as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.protocol_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.major.to_le_bytes());
        out[6..8].copy_from_slice(&self.version.minor.to_le_bytes());
        out[8..12].copy_from_slice(&self.packet_type.as_u32().to_le_bytes());
        out[12..20].copy_from_slice(&self.packet_size.to_le_bytes());
        out
    }

    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` when fewer bytes are available. No validation happens
    /// here; see [`crate::framing::FrameBuffer`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let protocol_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let major = u16::from_le_bytes([bytes[4], bytes[5]]);
        let minor = u16::from_le_bytes([bytes[6], bytes[7]]);
        let packet_type = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[12..20]);

        Some(Self {
            protocol_id,
            version: ProtocolVersion::new(major, minor),
            packet_type: PacketType::from(packet_type),
            packet_size: u64::from_le_bytes(size),
        })
    }

    pub fn payload_size(&self) -> usize {
        (self.packet_size as usize).saturating_sub(HEADER_SIZE)
    }
}

/// One complete framed unit: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a packet stamped with the default protocol settings.
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self::with_settings(&ProtocolSettings::default(), packet_type, payload)
    }

    pub fn with_settings(
        settings: &ProtocolSettings,
        packet_type: PacketType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: PacketHeader::new(settings, packet_type, payload.len()),
            payload,
        }
    }

    /// Builds a packet whose payload starts with a little-endian `u32`
    /// request type followed by `body`.
    pub fn request(packet_type: PacketType, request: u32, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&request.to_le_bytes());
        payload.extend_from_slice(body);
        Self::new(packet_type, payload)
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Leading request type of the payload, if the payload is long enough.
    pub fn request_type(&self) -> Option<u32> {
        self.payload
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Payload after the request type.
    pub fn request_body(&self) -> &[u8] {
        self.payload.get(4..).unwrap_or(&[])
    }

    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = PacketHeader {
            packet_size: self.wire_size() as u64,
            ..self.header
        };
        self.encode(header)
    }

    /// Encodes the packet with `settings` stamped over whatever the header held.
    pub fn to_bytes_with(&self, settings: &ProtocolSettings) -> Vec<u8> {
        self.encode(PacketHeader::new(
            settings,
            self.header.packet_type,
            self.payload.len(),
        ))
    }

    fn encode(&self, header: PacketHeader) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = PacketHeader {
            protocol_id: 0x0102_0304,
            version: ProtocolVersion::new(2, 7),
            packet_type: PacketType::App,
            packet_size: 0x30,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..6], &[2, 0]);
        assert_eq!(&bytes[6..8], &[7, 0]);
        assert_eq!(&bytes[8..12], &[6, 0, 0, 0]);
        assert_eq!(bytes[12], 0x30);
        assert_eq!(PacketHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn test_header_decode_needs_full_header() {
        let bytes = [0u8; HEADER_SIZE - 1];
        assert!(PacketHeader::decode(&bytes).is_none());
    }

    #[test]
    fn test_packet_type_table() {
        assert_eq!(PacketType::from(70), PacketType::Custom);
        assert_eq!(PacketType::from(100), PacketType::Test);
        assert_eq!(PacketType::from(9), PacketType::Unknown(9));
        assert_eq!(PacketType::Unknown(9).as_u32(), 9);
        assert_eq!(PacketType::AppError.to_string(), "APP_ERROR");
        assert_eq!(PacketType::Unknown(42).to_string(), "UNKNOWN(42)");
    }

    #[test]
    fn test_packet_size_counts_header() {
        let packet = Packet::new(PacketType::App, vec![1, 2, 3]);
        assert_eq!(packet.header.packet_size, (HEADER_SIZE + 3) as u64);
        assert_eq!(packet.to_bytes().len(), HEADER_SIZE + 3);
    }

    #[test]
    fn test_request_packet_prefix() {
        let packet = Packet::request(PacketType::Request, 7, b"abc");
        assert_eq!(packet.request_type(), Some(7));
        assert_eq!(packet.request_body(), b"abc");

        let short = Packet::new(PacketType::App, vec![1, 2]);
        assert_eq!(short.request_type(), None);
        assert!(short.request_body().is_empty());
    }

    #[test]
    fn test_to_bytes_with_restamps_header() {
        let settings = ProtocolSettings {
            protocol_id: 0xdead_beef,
            version: ProtocolVersion::new(3, 1),
        };
        let packet = Packet::new(PacketType::Test, Vec::new());
        let header = PacketHeader::decode(&packet.to_bytes_with(&settings)).unwrap();

        assert_eq!(header.protocol_id, 0xdead_beef);
        assert_eq!(header.version, ProtocolVersion::new(3, 1));
        assert_eq!(header.packet_type, PacketType::Test);
    }

    #[test]
    fn test_version_compatibility() {
        let v1 = ProtocolVersion::new(1, 0);
        assert!(v1.is_compatible(&ProtocolVersion::new(1, 9)));
        assert!(!v1.is_compatible(&ProtocolVersion::new(2, 0)));
    }
}
