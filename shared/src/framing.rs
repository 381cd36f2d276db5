//! Reassembly of packets from an arbitrary chunked byte stream.
//!
//! TCP gives no message boundaries and UDP datagrams may carry several
//! packets, so every read is appended to a [`FrameBuffer`] and complete
//! packets are sliced off using the header's `packet_size`. Leftover bytes
//! stay buffered until the next read.

use crate::packet::{Packet, PacketHeader, ProtocolSettings, ProtocolVersion, HEADER_SIZE};
use thiserror::Error;

/// Largest packet accepted unless configured otherwise.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub settings: ProtocolSettings,
    pub max_packet_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            settings: ProtocolSettings::default(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Reasons a byte stream can no longer be framed. All of them are fatal for
/// the stream: there is no way to find the next header boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("bad protocol id {found:#010x}, expected {expected:#010x}")]
    BadProtocolId { expected: u32, found: u32 },

    #[error("incompatible protocol version {found}, expected {expected}")]
    IncompatibleVersion {
        expected: ProtocolVersion,
        found: ProtocolVersion,
    },

    #[error("packet size {size} is smaller than the {} byte header", HEADER_SIZE)]
    BadPacketSize { size: u64 },

    #[error("packet size {size} exceeds the maximum of {max} bytes")]
    TooLarge { size: u64, max: usize },
}

#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    start: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            start: 0,
        }
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        // Reclaim consumed space before growing.
        if self.start > 0 && self.start >= self.buffer.len() / 2 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as part of a packet.
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Forgets all buffered bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.start = 0;
    }

    /// Slices the next complete packet off the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. After an `Err` the buffer
    /// contents are meaningless and the stream must be abandoned.
    pub fn next_packet(&mut self, limits: &FrameLimits) -> Result<Option<Packet>, FrameError> {
        let available = &self.buffer[self.start..];
        let header = match PacketHeader::decode(available) {
            Some(header) => header,
            None => return Ok(None),
        };

        Self::validate(&header, limits)?;

        let size = header.packet_size as usize;
        if available.len() < size {
            return Ok(None);
        }

        let payload = available[HEADER_SIZE..size].to_vec();
        self.start += size;
        if self.start == self.buffer.len() {
            self.clear();
        }

        Ok(Some(Packet { header, payload }))
    }

    /// Returns every complete packet currently buffered.
    pub fn drain_packets(&mut self, limits: &FrameLimits) -> Result<Vec<Packet>, FrameError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet(limits)? {
            packets.push(packet);
        }
        Ok(packets)
    }

    fn validate(header: &PacketHeader, limits: &FrameLimits) -> Result<(), FrameError> {
        if header.protocol_id != limits.settings.protocol_id {
            return Err(FrameError::BadProtocolId {
                expected: limits.settings.protocol_id,
                found: header.protocol_id,
            });
        }

        if !limits.settings.version.is_compatible(&header.version) {
            return Err(FrameError::IncompatibleVersion {
                expected: limits.settings.version,
                found: header.version,
            });
        }

        if header.packet_size < HEADER_SIZE as u64 {
            return Err(FrameError::BadPacketSize {
                size: header.packet_size,
            });
        }

        if header.packet_size > limits.max_packet_size as u64 {
            return Err(FrameError::TooLarge {
                size: header.packet_size,
                max: limits.max_packet_size,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn app_packet(len: usize, fill: u8) -> Packet {
        Packet::new(PacketType::App, vec![fill; len])
    }

    fn stream_of(packets: &[Packet]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.to_bytes()).collect()
    }

    #[test]
    fn test_single_packet_single_read() {
        let packet = app_packet(40, 7);
        let mut frames = FrameBuffer::new();
        frames.push(&packet.to_bytes());

        let decoded = frames.next_packet(&FrameLimits::default()).unwrap();
        assert_eq!(decoded, Some(packet));
        assert!(frames.is_empty());
    }

    #[test]
    fn test_five_small_reads_yield_one_packet() {
        // 20 byte header + 30 byte payload, delivered ten bytes at a time.
        let packet = app_packet(30, 1);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 50);

        let limits = FrameLimits::default();
        let mut frames = FrameBuffer::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(10) {
            frames.push(chunk);
            decoded.extend(frames.drain_packets(&limits).unwrap());
        }

        assert_eq!(decoded, vec![packet]);
    }

    #[test]
    fn test_header_split_across_reads() {
        let packet = app_packet(4, 9);
        let bytes = packet.to_bytes();
        let limits = FrameLimits::default();
        let mut frames = FrameBuffer::new();

        frames.push(&bytes[..7]);
        assert_eq!(frames.next_packet(&limits).unwrap(), None);
        frames.push(&bytes[7..]);
        assert_eq!(frames.next_packet(&limits).unwrap(), Some(packet));
    }

    #[test]
    fn test_back_to_back_packets_in_one_read() {
        let packets = vec![app_packet(0, 0), app_packet(3, 1), app_packet(100, 2)];
        let mut frames = FrameBuffer::new();
        frames.push(&stream_of(&packets));

        let decoded = frames.drain_packets(&FrameLimits::default()).unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_trailing_bytes_are_retained() {
        let first = app_packet(5, 1);
        let second = app_packet(5, 2);
        let mut bytes = first.to_bytes();
        let second_bytes = second.to_bytes();
        bytes.extend_from_slice(&second_bytes[..8]);

        let limits = FrameLimits::default();
        let mut frames = FrameBuffer::new();
        frames.push(&bytes);

        assert_eq!(frames.drain_packets(&limits).unwrap(), vec![first]);
        assert_eq!(frames.pending(), 8);

        frames.push(&second_bytes[8..]);
        assert_eq!(frames.drain_packets(&limits).unwrap(), vec![second]);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_output() {
        let packets: Vec<Packet> = (0..20).map(|i| app_packet(i * 13 % 97, i as u8)).collect();
        let bytes = stream_of(&packets);
        let limits = FrameLimits::default();

        for chunk_size in [1, 2, 3, 7, 19, 20, 21, 64, 1000, bytes.len()] {
            let mut frames = FrameBuffer::new();
            let mut decoded = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                frames.push(chunk);
                decoded.extend(frames.drain_packets(&limits).unwrap());
            }
            assert_eq!(decoded, packets, "chunk size {}", chunk_size);
            assert!(frames.is_empty());
        }
    }

    #[test]
    fn test_rejects_bad_protocol_id() {
        let mut header = PacketHeader::new(&ProtocolSettings::default(), PacketType::App, 0);
        header.protocol_id = 0x1234;

        let mut frames = FrameBuffer::new();
        frames.push(&header.to_bytes());

        let err = frames.next_packet(&FrameLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::BadProtocolId { found: 0x1234, .. }));
    }

    #[test]
    fn test_rejects_zero_and_oversized_packets() {
        let settings = ProtocolSettings::default();
        let limits = FrameLimits {
            settings,
            max_packet_size: 64,
        };

        let mut zero = PacketHeader::new(&settings, PacketType::App, 0);
        zero.packet_size = 0;
        let mut frames = FrameBuffer::new();
        frames.push(&zero.to_bytes());
        assert_eq!(
            frames.next_packet(&limits),
            Err(FrameError::BadPacketSize { size: 0 })
        );

        let huge = PacketHeader::new(&settings, PacketType::App, 1_000_000);
        let mut frames = FrameBuffer::new();
        frames.push(&huge.to_bytes());
        assert!(matches!(
            frames.next_packet(&limits),
            Err(FrameError::TooLarge { max: 64, .. })
        ));
    }

    #[test]
    fn test_rejects_incompatible_major_version() {
        let settings = ProtocolSettings {
            version: ProtocolVersion::new(2, 0),
            ..ProtocolSettings::default()
        };
        let packet = Packet::with_settings(&settings, PacketType::App, Vec::new());

        let mut frames = FrameBuffer::new();
        frames.push(&packet.to_bytes());
        assert!(matches!(
            frames.next_packet(&FrameLimits::default()),
            Err(FrameError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_clear_keeps_allocation() {
        let mut frames = FrameBuffer::with_capacity(256);
        frames.push(&[1, 2, 3]);
        frames.clear();
        assert!(frames.is_empty());
        assert!(frames.capacity() >= 256);
    }
}
