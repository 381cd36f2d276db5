//! Request sub-types and the bincode payloads carried by control packets.

use crate::packet::{Packet, PacketType};
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload codec failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("expected a {expected} packet, got {found}")]
    UnexpectedType {
        expected: PacketType,
        found: PacketType,
    },

    #[error("packet carries no request type")]
    MissingRequest,

    #[error("unknown request type {0}")]
    UnknownRequest(u32),
}

/// Request types carried by AUTH packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequest {
    /// Client to cerver, credentials follow.
    ClientAuthData,
    /// Client to cerver, a UTF-8 session token follows.
    ClientAuthToken,
    /// Cerver to client, an [`AuthSuccessPayload`] follows.
    SuccessAuth,
}

impl AuthRequest {
    pub fn as_u32(self) -> u32 {
        match self {
            AuthRequest::ClientAuthData => 0,
            AuthRequest::ClientAuthToken => 1,
            AuthRequest::SuccessAuth => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(AuthRequest::ClientAuthData),
            1 => Some(AuthRequest::ClientAuthToken),
            2 => Some(AuthRequest::SuccessAuth),
            _ => None,
        }
    }
}

/// Request types carried by CLIENT packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequest {
    /// Close this connection; the client stays if it has others.
    CloseConnection,
    /// Drop the client together with all of its connections.
    Disconnect,
}

impl ClientRequest {
    pub fn as_u32(self) -> u32 {
        match self {
            ClientRequest::CloseConnection => 0,
            ClientRequest::Disconnect => 1,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ClientRequest::CloseConnection),
            1 => Some(ClientRequest::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    ServerError,
    FailedAuth,
    BadPacket,
    HandlerError,
    Busy,
}

/// Body of an ERROR packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_type: ErrorType,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::new(PacketType::Error, serialize(self)?))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        expect_type(packet, PacketType::Error)?;
        Ok(deserialize(&packet.payload)?)
    }
}

/// Body of an AUTH/SUCCESS_AUTH packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
    /// Present when the cerver keeps sessions; lets more connections join
    /// the same client.
    pub session_id: Option<String>,
}

impl AuthSuccessPayload {
    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::request(
            PacketType::Auth,
            AuthRequest::SuccessAuth.as_u32(),
            &serialize(self)?,
        ))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        expect_type(packet, PacketType::Auth)?;
        match packet.request_type().map(AuthRequest::from_u32) {
            Some(Some(AuthRequest::SuccessAuth)) => Ok(deserialize(packet.request_body())?),
            Some(_) => Err(ProtocolError::UnknownRequest(
                packet.request_type().unwrap_or_default(),
            )),
            None => Err(ProtocolError::MissingRequest),
        }
    }
}

/// Sent by the cerver as a SERVER packet right after a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CerverInfo {
    pub name: String,
    pub welcome_message: Option<String>,
    pub auth_required: bool,
    pub use_sessions: bool,
}

impl CerverInfo {
    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::new(PacketType::Server, serialize(self)?))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, ProtocolError> {
        expect_type(packet, PacketType::Server)?;
        Ok(deserialize(&packet.payload)?)
    }
}

pub fn auth_credentials_packet(credentials: &[u8]) -> Packet {
    Packet::request(
        PacketType::Auth,
        AuthRequest::ClientAuthData.as_u32(),
        credentials,
    )
}

pub fn auth_token_packet(token: &str) -> Packet {
    Packet::request(
        PacketType::Auth,
        AuthRequest::ClientAuthToken.as_u32(),
        token.as_bytes(),
    )
}

pub fn client_request_packet(request: ClientRequest) -> Packet {
    Packet::request(PacketType::Client, request.as_u32(), &[])
}

pub fn test_packet() -> Packet {
    Packet::new(PacketType::Test, Vec::new())
}

fn expect_type(packet: &Packet, expected: PacketType) -> Result<(), ProtocolError> {
    if packet.packet_type() == expected {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedType {
            expected,
            found: packet.packet_type(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_payload_through_packet() {
        let payload = ErrorPayload::new(ErrorType::FailedAuth, "Failed to authenticate!");
        let packet = payload.to_packet().unwrap();

        assert_eq!(packet.packet_type(), PacketType::Error);
        assert_eq!(ErrorPayload::from_packet(&packet).unwrap(), payload);
    }

    #[test]
    fn test_error_payload_rejects_other_types() {
        let packet = test_packet();
        let err = ErrorPayload::from_packet(&packet).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedType {
                expected: PacketType::Error,
                found: PacketType::Test
            }
        ));
    }

    #[test]
    fn test_auth_success_carries_session() {
        let payload = AuthSuccessPayload {
            session_id: Some("abc123".to_string()),
        };
        let packet = payload.to_packet().unwrap();

        assert_eq!(packet.request_type(), Some(AuthRequest::SuccessAuth.as_u32()));
        assert_eq!(AuthSuccessPayload::from_packet(&packet).unwrap(), payload);
    }

    #[test]
    fn test_auth_success_rejects_client_requests() {
        let packet = auth_credentials_packet(b"secret");
        assert!(matches!(
            AuthSuccessPayload::from_packet(&packet),
            Err(ProtocolError::UnknownRequest(0))
        ));
    }

    #[test]
    fn test_auth_request_packets() {
        let creds = auth_credentials_packet(b"user:pass");
        assert_eq!(creds.packet_type(), PacketType::Auth);
        assert_eq!(
            creds.request_type().and_then(AuthRequest::from_u32),
            Some(AuthRequest::ClientAuthData)
        );
        assert_eq!(creds.request_body(), b"user:pass");

        let token = auth_token_packet("tok");
        assert_eq!(
            token.request_type().and_then(AuthRequest::from_u32),
            Some(AuthRequest::ClientAuthToken)
        );
        assert_eq!(token.request_body(), b"tok");
    }

    #[test]
    fn test_client_request_codes() {
        for request in [ClientRequest::CloseConnection, ClientRequest::Disconnect] {
            let packet = client_request_packet(request);
            assert_eq!(
                packet.request_type().and_then(ClientRequest::from_u32),
                Some(request)
            );
        }
        assert_eq!(ClientRequest::from_u32(9), None);
    }

    #[test]
    fn test_cerver_info_packet() {
        let info = CerverInfo {
            name: "test-cerver".to_string(),
            welcome_message: Some("hello".to_string()),
            auth_required: true,
            use_sessions: false,
        };
        let packet = info.to_packet().unwrap();
        assert_eq!(packet.packet_type(), PacketType::Server);
        assert_eq!(CerverInfo::from_packet(&packet).unwrap(), info);
    }
}
