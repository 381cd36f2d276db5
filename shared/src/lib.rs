//! # Cerver wire protocol
//!
//! Types shared by the cerver and its clients: the fixed packet header, the
//! reassembly buffer that turns a chunked byte stream back into packets, and
//! the small bincode payloads used by control packets (auth, errors, cerver
//! info).

pub mod framing;
pub mod packet;
pub mod requests;

pub use framing::{FrameBuffer, FrameError, FrameLimits, DEFAULT_MAX_PACKET_SIZE};
pub use packet::{
    Packet, PacketHeader, PacketType, ProtocolSettings, ProtocolVersion, CERVER_PROTOCOL_ID,
    CERVER_PROTOCOL_VERSION, HEADER_SIZE,
};
pub use requests::{
    auth_credentials_packet, auth_token_packet, client_request_packet, test_packet, AuthRequest,
    AuthSuccessPayload, CerverInfo, ClientRequest, ErrorPayload, ErrorType, ProtocolError,
};

/// Milliseconds since the Unix epoch, zero if the clock is before it.
pub fn timestamp_millis() -> u64 {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let first = timestamp_millis();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timestamp_millis() >= first);
    }

    #[test]
    fn test_encoded_stream_reassembles() {
        let packets = vec![
            auth_credentials_packet(b"secret"),
            Packet::new(PacketType::App, b"hello".to_vec()),
            test_packet(),
        ];
        let stream: Vec<u8> = packets.iter().flat_map(|p| p.to_bytes()).collect();

        let mut frames = FrameBuffer::new();
        frames.push(&stream);
        let decoded = frames.drain_packets(&FrameLimits::default()).unwrap();
        assert_eq!(decoded, packets);
    }
}
