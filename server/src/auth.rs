//! On-hold authentication handshake
//!
//! When a cerver requires authentication, accepted connections wait on hold
//! until they send an AUTH packet. Every attempt resolves to exactly one
//! [`HandshakeOutcome`]:
//!
//! - **Promoted**: credentials (or a session token) were accepted and the
//!   connection moved to the active index under a client
//! - **Retry**: rejected, attempts remain, the connection stays on hold
//! - **Dropped**: rejected with no attempts left, or the connection
//!   misbehaved, and it was closed
//!
//! Packets of any other type while on hold are counted as bad packets and
//! otherwise ignored, up to `max_on_hold_bad_packets`.

use crate::cerver::CerverShared;
use crate::client::{Client, ClientData, ClientId};
use crate::connection::{Connection, ConnectionState, SockFd};
use crate::error::RegistryError;
use crate::events::CerverEventType;
use crate::worker::panic_message;
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{AuthRequest, AuthSuccessPayload, ErrorType, Packet, PacketType};
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Length of generated session ids.
pub const SESSION_ID_LEN: usize = 32;

/// Credentials presented by an on-hold connection.
#[derive(Debug)]
pub struct AuthAttempt {
    pub sock_fd: SockFd,
    pub peer_addr: SocketAddr,
    pub credentials: Vec<u8>,
}

/// What an accepted attempt hands over to the new client.
#[derive(Default)]
pub struct AuthSuccess {
    /// Session to file the client under when sessions are enabled. A fresh
    /// id is generated when `None`. Attempts naming a session that already
    /// exists join that client.
    pub session_id: Option<String>,
    /// Application data attached to the new client.
    pub data: Option<ClientData>,
}

impl fmt::Debug for AuthSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSuccess")
            .field("session_id", &self.session_id)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum AuthVerdict {
    Accept(AuthSuccess),
    Reject { reason: String },
}

impl AuthVerdict {
    pub fn accept() -> Self {
        AuthVerdict::Accept(AuthSuccess::default())
    }

    pub fn accept_session(session_id: impl Into<String>) -> Self {
        AuthVerdict::Accept(AuthSuccess {
            session_id: Some(session_id.into()),
            data: None,
        })
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        AuthVerdict::Reject {
            reason: reason.into(),
        }
    }
}

/// Application hook deciding whether credentials are valid.
///
/// Runs on the multiplexer task, so it should not block for long.
pub trait AuthMethod: Send + Sync {
    fn authenticate(&self, attempt: &AuthAttempt) -> AuthVerdict;
}

impl<F> AuthMethod for F
where
    F: Fn(&AuthAttempt) -> AuthVerdict + Send + Sync,
{
    fn authenticate(&self, attempt: &AuthAttempt) -> AuthVerdict {
        self(attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Promoted(ClientId),
    Retry { tries_left: u32 },
    Dropped,
    /// A non-AUTH packet was counted and ignored.
    Ignored { bad_packets: u32 },
}

enum Resolution {
    NewClient(AuthSuccess),
    Attach(Arc<Client>),
    Reject(String),
}

pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Runs one packet from an on-hold connection through the handshake.
pub(crate) async fn on_hold_packet(
    cerver: &Arc<CerverShared>,
    connection: &Arc<Connection>,
    packet: Packet,
) -> HandshakeOutcome {
    let sock_fd = connection.sock_fd();

    if packet.packet_type() != PacketType::Auth {
        let bad_packets = connection.add_bad_packet();
        cerver.stats.bad_packet();
        warn!(
            "{}: {} sent {} while on hold ({} bad packets)",
            cerver.name,
            sock_fd,
            packet.packet_type(),
            bad_packets
        );

        if bad_packets > cerver.config.max_on_hold_bad_packets {
            cerver
                .send_error(connection, ErrorType::BadPacket, "Too many bad packets")
                .await;
            cerver.connection_drop(sock_fd, "too many bad packets while on hold");
            return HandshakeOutcome::Dropped;
        }
        return HandshakeOutcome::Ignored { bad_packets };
    }

    let method = match cerver.auth_method() {
        Some(method) => method,
        None => {
            error!(
                "{}: authentication is required but no auth method is set",
                cerver.name
            );
            cerver
                .send_error(connection, ErrorType::ServerError, "Authentication unavailable")
                .await;
            cerver.connection_drop(sock_fd, "no auth method");
            return HandshakeOutcome::Dropped;
        }
    };

    if !connection.transition(ConnectionState::OnHold, ConnectionState::Authenticating) {
        debug!("{}: {} is no longer on hold", cerver.name, sock_fd);
        return HandshakeOutcome::Dropped;
    }

    let resolution = resolve(cerver, connection, method.as_ref(), &packet);
    match resolution {
        Resolution::NewClient(success) => promote_new(cerver, connection, success).await,
        Resolution::Attach(client) => promote_into(cerver, connection, client, false).await,
        Resolution::Reject(reason) => reject(cerver, connection, reason).await,
    }
}

fn resolve(
    cerver: &CerverShared,
    connection: &Connection,
    method: &dyn AuthMethod,
    packet: &Packet,
) -> Resolution {
    match packet.request_type().and_then(AuthRequest::from_u32) {
        Some(AuthRequest::ClientAuthData) => {
            let attempt = AuthAttempt {
                sock_fd: connection.sock_fd(),
                peer_addr: connection.peer_addr(),
                credentials: packet.request_body().to_vec(),
            };

            match panic::catch_unwind(AssertUnwindSafe(|| method.authenticate(&attempt))) {
                Ok(AuthVerdict::Accept(success)) => Resolution::NewClient(success),
                Ok(AuthVerdict::Reject { reason }) => Resolution::Reject(reason),
                Err(payload) => {
                    error!(
                        "{}: auth method panicked: {}",
                        cerver.name,
                        panic_message(payload.as_ref())
                    );
                    Resolution::Reject("Failed to authenticate".to_string())
                }
            }
        }
        Some(AuthRequest::ClientAuthToken) => {
            if !cerver.config.use_sessions {
                return Resolution::Reject("Sessions are not enabled".to_string());
            }

            let token = String::from_utf8_lossy(packet.request_body());
            match cerver.registry.client_by_session(&token) {
                Some(client) => Resolution::Attach(client),
                None => Resolution::Reject("Unknown session".to_string()),
            }
        }
        Some(AuthRequest::SuccessAuth) | None => {
            Resolution::Reject("Bad auth request".to_string())
        }
    }
}

async fn promote_new(
    cerver: &Arc<CerverShared>,
    connection: &Arc<Connection>,
    success: AuthSuccess,
) -> HandshakeOutcome {
    let session_id = if cerver.config.use_sessions {
        let session_id = success.session_id.unwrap_or_else(generate_session_id);
        if let Some(existing) = cerver.registry.client_by_session(&session_id) {
            return promote_into(cerver, connection, existing, false).await;
        }
        Some(session_id)
    } else {
        None
    };

    let client = cerver.registry.create_client(session_id);
    if let Some(data) = success.data {
        client.set_boxed_data(data);
    }
    promote_into(cerver, connection, client, true).await
}

async fn promote_into(
    cerver: &Arc<CerverShared>,
    connection: &Arc<Connection>,
    client: Arc<Client>,
    new_client: bool,
) -> HandshakeOutcome {
    let sock_fd = connection.sock_fd();

    if let Err(e) = cerver.registry.promote(sock_fd, &client) {
        warn!("{}: failed to promote {}: {}", cerver.name, sock_fd, e);
        let error_type = match e {
            RegistryError::ActiveFull { .. } => ErrorType::Busy,
            _ => ErrorType::ServerError,
        };
        cerver.send_error(connection, error_type, e.to_string()).await;
        cerver.connection_drop(sock_fd, "promotion failed");
        return HandshakeOutcome::Dropped;
    }

    cerver.stats.auth_success();
    if new_client {
        cerver.stats.client_created();
    }
    info!(
        "{}: {} authenticated as {}",
        cerver.name,
        sock_fd,
        client.id()
    );

    let payload = AuthSuccessPayload {
        session_id: client.session_id().map(str::to_string),
    };
    match payload.to_packet() {
        Ok(packet) => {
            if !cerver.send_direct(connection, &packet).await {
                warn!("{}: failed to confirm auth to {}", cerver.name, sock_fd);
                cerver.connection_drop(sock_fd, "failed to deliver auth success");
                return HandshakeOutcome::Dropped;
            }
        }
        Err(e) => error!("{}: failed to encode auth success: {}", cerver.name, e),
    }

    cerver.trigger(
        cerver
            .event(CerverEventType::ClientSuccessAuth)
            .with_connection(connection)
            .with_client(&client),
    );
    let follow_up = if new_client {
        CerverEventType::ClientConnected
    } else {
        CerverEventType::ClientNewConnection
    };
    cerver.trigger(
        cerver
            .event(follow_up)
            .with_connection(connection)
            .with_client(&client),
    );

    HandshakeOutcome::Promoted(client.id())
}

async fn reject(
    cerver: &Arc<CerverShared>,
    connection: &Arc<Connection>,
    reason: String,
) -> HandshakeOutcome {
    let sock_fd = connection.sock_fd();
    cerver.stats.auth_failure();
    let told = cerver
        .send_error(connection, ErrorType::FailedAuth, reason.clone())
        .await;

    let tries_left = connection.consume_auth_try();
    warn!(
        "{}: {} failed to authenticate: {} ({} tries left)",
        cerver.name, sock_fd, reason, tries_left
    );
    cerver.trigger(
        cerver
            .event(CerverEventType::ClientFailedAuth)
            .with_connection(connection)
            .with_message(reason),
    );

    if tries_left == 0 {
        cerver.connection_drop(sock_fd, "max auth tries reached");
        return HandshakeOutcome::Dropped;
    }
    // The reply may be cut short, so the stream cannot be trusted for a retry.
    if !told {
        cerver.connection_drop(sock_fd, "failed to deliver auth error");
        return HandshakeOutcome::Dropped;
    }

    connection.transition(ConnectionState::Authenticating, ConnectionState::OnHold);
    HandshakeOutcome::Retry { tries_left }
}
