//! Packet handlers and the job that runs them on a worker thread
//!
//! Each packet from an active connection becomes one [`Job`]. When a worker
//! runs it, the job first checks that its connection is still active and
//! discards itself otherwise. Then it dispatches:
//!
//! - CLIENT requests close the connection or disconnect the whole client
//! - TEST packets are echoed back
//! - AUTH packets from active connections are ignored
//! - everything else goes to the registered [`Handler`], looked up by
//!   `(type, request)` first and by `type` second
//!
//! A handler returning `Err` is logged and answered with an ERROR packet. A
//! panicking handler is caught by the worker, which keeps running.

use crate::cerver::CerverShared;
use crate::client::Client;
use crate::connection::Connection;
use crate::error::CerverError;
use crate::job_queue::Job;
use crate::registry::Registry;
use log::{debug, trace, warn};
use shared::{ClientRequest, ErrorPayload, ErrorType, Packet, PacketType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &PacketContext) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&PacketContext) -> HandlerResult + Send + Sync,
{
    fn handle(&self, ctx: &PacketContext) -> HandlerResult {
        self(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    /// Every packet of this type without a more specific handler.
    Type(PacketType),
    /// Packets of this type whose payload starts with this request type.
    Request(PacketType, u32),
}

/// Everything a handler gets to see about one packet.
pub struct PacketContext {
    cerver: Arc<CerverShared>,
    client: Arc<Client>,
    connection: Arc<Connection>,
    packet: Packet,
}

impl PacketContext {
    pub fn cerver_name(&self) -> &str {
        &self.cerver.name
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn registry(&self) -> &Registry {
        &self.cerver.registry
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet.packet_type()
    }

    pub fn payload(&self) -> &[u8] {
        &self.packet.payload
    }

    pub fn request_type(&self) -> Option<u32> {
        self.packet.request_type()
    }

    pub fn request_body(&self) -> &[u8] {
        self.packet.request_body()
    }

    /// Sends a packet on the connection the packet came from, blocking the
    /// worker until it is written.
    pub fn send(&self, packet: &Packet) -> Result<usize, CerverError> {
        self.connection.send_blocking(packet)
    }

    pub fn reply(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<usize, CerverError> {
        self.send(&Packet::new(packet_type, payload))
    }

    /// Sends to another connection, such as one of the client's others.
    pub fn send_to(&self, connection: &Connection, packet: &Packet) -> Result<usize, CerverError> {
        connection.send_blocking(packet)
    }
}

impl fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketContext")
            .field("client", &self.client.id())
            .field("sock_fd", &self.connection.sock_fd())
            .field("packet_type", &self.packet.packet_type())
            .field("payload_len", &self.packet.payload.len())
            .finish()
    }
}

#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a previous handler for `key` was replaced.
    pub fn register(&self, key: HandlerKey, handler: Arc<dyn Handler>) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler)
            .is_some()
    }

    pub fn unregister(&self, key: HandlerKey) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, packet: &Packet) -> Option<Arc<dyn Handler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let packet_type = packet.packet_type();

        packet
            .request_type()
            .and_then(|request| handlers.get(&HandlerKey::Request(packet_type, request)))
            .or_else(|| handlers.get(&HandlerKey::Type(packet_type)))
            .cloned()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<HandlerKey> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("HandlerTable").field("keys", &keys).finish()
    }
}

/// Wraps one received packet into a job for the worker pool, keyed by its
/// connection so handlers see a connection's packets in arrival order.
pub(crate) fn packet_job(
    cerver: Arc<CerverShared>,
    client: Arc<Client>,
    connection: Arc<Connection>,
    packet: Packet,
) -> Job {
    Job::keyed(connection.sock_fd().0, move || {
        dispatch(PacketContext {
            cerver,
            client,
            connection,
            packet,
        })
    })
}

fn dispatch(ctx: PacketContext) {
    let sock_fd = ctx.connection.sock_fd();
    if !ctx.connection.is_active() {
        debug!(
            "{}: discarding {} packet for closed {}",
            ctx.cerver.name,
            ctx.packet_type(),
            sock_fd
        );
        return;
    }

    match ctx.packet_type() {
        PacketType::Client => handle_client_request(&ctx),
        PacketType::Test => {
            trace!("{}: test packet from {}", ctx.cerver.name, sock_fd);
            if let Err(e) = ctx.send(&shared::test_packet()) {
                warn!("{}: failed to answer test packet: {}", ctx.cerver.name, e);
            }
        }
        PacketType::Auth => {
            debug!(
                "{}: ignoring AUTH packet from already active {}",
                ctx.cerver.name, sock_fd
            );
        }
        packet_type => match ctx.cerver.handlers.resolve(&ctx.packet) {
            Some(handler) => {
                if let Err(e) = handler.handle(&ctx) {
                    warn!(
                        "{}: {} handler failed for {}: {}",
                        ctx.cerver.name,
                        packet_type,
                        ctx.client.id(),
                        e
                    );
                    send_error(&ctx, ErrorType::HandlerError, e.to_string());
                }
            }
            None => {
                warn!(
                    "{}: no handler for {} packet from {}, dropping it",
                    ctx.cerver.name, packet_type, sock_fd
                );
            }
        },
    }
}

fn handle_client_request(ctx: &PacketContext) {
    match ctx.request_type().and_then(ClientRequest::from_u32) {
        Some(ClientRequest::CloseConnection) => {
            ctx.cerver.close_connection(&ctx.client, &ctx.connection);
        }
        Some(ClientRequest::Disconnect) => {
            ctx.cerver.disconnect_client(&ctx.client);
        }
        None => {
            warn!(
                "{}: unknown CLIENT request {:?} from {}",
                ctx.cerver.name,
                ctx.request_type(),
                ctx.connection.sock_fd()
            );
            send_error(ctx, ErrorType::BadPacket, "Unknown client request");
        }
    }
}

fn send_error(ctx: &PacketContext, error_type: ErrorType, message: impl Into<String>) {
    let sent = ErrorPayload::new(error_type, message)
        .to_packet()
        .map_err(CerverError::from)
        .and_then(|packet| ctx.send(&packet));
    if let Err(e) = sent {
        debug!("{}: failed to send error packet: {}", ctx.cerver.name, e);
    }
}
