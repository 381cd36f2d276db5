//! Multiplexer: the single task that owns socket readiness
//!
//! ## Event Sources
//! - the TCP listener (accept)
//! - one reader task per TCP connection, forwarding raw reads
//! - one datagram task for UDP cerver sockets
//! - adopted streams handed over by a load balancer
//! - a housekeeping tick every `poll_timeout`
//!
//! All socket tasks report through one bounded channel, so the bytes of a
//! connection reach the multiplexer in the order they were read.
//!
//! ## Routing
//! The multiplexer owns every receive buffer. Bytes are appended to the
//! connection's [`FrameBuffer`] and each complete packet is routed by a
//! registry lookup at that moment: packets from on-hold connections go to
//! the auth handshake, packets from active connections become one job each
//! for the worker pool. Because the lookup happens per packet, a packet
//! right behind a successful AUTH in the same read is already dispatched as
//! active.
//!
//! ## Housekeeping
//! Buffers of connections that left the registry are returned to the socket
//! pool and stale UDP peers are forgotten. When `on_hold_timeout` is set,
//! connections stuck on hold are dropped; when `inactive_timeout` is set,
//! clients with no traffic on any connection are dropped.
//!
//! ## Sending
//! The multiplexer writes its own packets (greetings, errors, auth replies)
//! with `Connection::send_now`: it never queues behind a worker that is
//! sending on the same connection, and gives up on a peer that does not
//! read within `send_timeout`.

use crate::cerver::CerverShared;
use crate::connection::{Connection, Sink, SockFd};
use crate::events::CerverEventType;
use crate::handler::packet_job;
use crate::registry::Lookup;
use crate::socket_pool::SocketPool;
use crate::update::UpdateLoops;
use crate::worker::WorkerPool;
use crate::{auth, auth::HandshakeOutcome};
use log::{debug, error, info, trace, warn};
use shared::{ErrorType, FrameBuffer, FrameError, FrameLimits, Packet};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

/// Largest datagram a UDP socket can deliver.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Receive buffers kept for reuse.
const MAX_POOLED_BUFFERS: usize = 64;

/// Messages from socket tasks to the multiplexer.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Received { sock_fd: SockFd, bytes: Vec<u8> },
    Closed { sock_fd: SockFd },
    Failed { sock_fd: SockFd, error: io::Error },
    Datagram { peer: SocketAddr, bytes: Vec<u8> },
    Adopt { stream: TcpStream, peer: SocketAddr },
}

pub(crate) struct Multiplexer {
    cerver: Arc<CerverShared>,
    listener: Option<TcpListener>,
    udp: Option<Arc<UdpSocket>>,
    workers: WorkerPool,
    updates: UpdateLoops,
    events_tx: mpsc::Sender<SocketEvent>,
    events_rx: mpsc::Receiver<SocketEvent>,
    shutdown: Arc<Notify>,
    buffers: HashMap<SockFd, FrameBuffer>,
    udp_peers: HashMap<SocketAddr, SockFd>,
    sockets: SocketPool,
    limits: FrameLimits,
}

impl Multiplexer {
    pub(crate) fn new(
        cerver: Arc<CerverShared>,
        listener: Option<TcpListener>,
        udp: Option<Arc<UdpSocket>>,
        workers: WorkerPool,
        updates: UpdateLoops,
        events_tx: mpsc::Sender<SocketEvent>,
        events_rx: mpsc::Receiver<SocketEvent>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let limits = cerver.config.frame_limits();
        let sockets = SocketPool::new(MAX_POOLED_BUFFERS, cerver.config.receive_buffer_size);

        Self {
            cerver,
            listener,
            udp,
            workers,
            updates,
            events_tx,
            events_rx,
            shutdown,
            buffers: HashMap::new(),
            udp_peers: HashMap::new(),
            sockets,
            limits,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(self.cerver.config.poll_timeout());
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        housekeeping.tick().await;

        let datagrams = self.udp.as_ref().map(|socket| {
            tokio::spawn(datagram_loop(
                Arc::clone(socket),
                self.events_tx.clone(),
                self.cerver.config.receive_buffer_size.max(MAX_DATAGRAM_SIZE),
            ))
        });

        let listener = self.listener.take();
        let shutdown = Arc::clone(&self.shutdown);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => self.admit_tcp(stream, peer).await,
                    Err(e) => {
                        error!("{}: accept failed: {}", self.cerver.name, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = housekeeping.tick() => self.compress(),
            }
        }

        drop(listener);
        if let Some(task) = datagrams {
            task.abort();
        }
        self.teardown().await;
    }

    async fn handle_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Received { sock_fd, bytes } => self.on_bytes(sock_fd, &bytes).await,
            SocketEvent::Closed { sock_fd } => {
                debug!("{}: {} closed by peer", self.cerver.name, sock_fd);
                self.release_buffer(sock_fd);
                self.cerver.connection_closed(sock_fd);
            }
            SocketEvent::Failed { sock_fd, error } => {
                warn!("{}: read on {} failed: {}", self.cerver.name, sock_fd, error);
                self.release_buffer(sock_fd);
                self.cerver.connection_closed(sock_fd);
            }
            SocketEvent::Datagram { peer, bytes } => {
                let known = self
                    .udp_peers
                    .get(&peer)
                    .copied()
                    .filter(|sock_fd| self.cerver.registry.contains(*sock_fd));
                let sock_fd = match known {
                    Some(sock_fd) => Some(sock_fd),
                    None => self.admit_udp(peer).await,
                };
                if let Some(sock_fd) = sock_fd {
                    self.on_bytes(sock_fd, &bytes).await;
                }
            }
            SocketEvent::Adopt { stream, peer } => {
                debug!("{}: adopting connection from {}", self.cerver.name, peer);
                self.admit_tcp(stream, peer).await;
            }
        }
    }

    async fn admit_tcp(&mut self, stream: TcpStream, peer: SocketAddr) {
        let sock_fd = self.sockets.next_sock_fd();
        let (reader, writer) = stream.into_split();
        let connection = Arc::new(self.new_connection(sock_fd, peer, Sink::Tcp(writer)));

        if !self.admit(&connection).await {
            return;
        }

        let task = tokio::spawn(read_loop(
            sock_fd,
            reader,
            self.events_tx.clone(),
            self.cerver.config.receive_buffer_size,
        ));
        connection.set_reader(task.abort_handle());
    }

    async fn admit_udp(&mut self, peer: SocketAddr) -> Option<SockFd> {
        let socket = Arc::clone(self.udp.as_ref()?);
        let sock_fd = self.sockets.next_sock_fd();
        let connection = Arc::new(self.new_connection(sock_fd, peer, Sink::Udp { socket, peer }));

        if self.admit(&connection).await {
            self.udp_peers.insert(peer, sock_fd);
            Some(sock_fd)
        } else {
            None
        }
    }

    fn new_connection(&self, sock_fd: SockFd, peer: SocketAddr, sink: Sink) -> Connection {
        Connection::new(
            sock_fd,
            peer,
            sink,
            self.cerver.config.protocol_settings(),
            self.cerver.config.max_auth_tries,
        )
    }

    /// Registers a fresh connection on hold, or straight as an active
    /// client when auth is off. Returns false if it was refused.
    async fn admit(&mut self, connection: &Arc<Connection>) -> bool {
        let cerver = Arc::clone(&self.cerver);
        let sock_fd = connection.sock_fd();
        cerver.stats.connection_accepted();

        let registered = if cerver.config.auth_required {
            cerver
                .registry
                .insert_on_hold(Arc::clone(connection))
                .map(|_| None)
        } else {
            let client = cerver.registry.create_client(None);
            cerver
                .registry
                .register_active(Arc::clone(connection), &client)
                .map(|_| Some(client))
        };

        let client = match registered {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "{}: refusing connection from {}: {}",
                    cerver.name,
                    connection.peer_addr(),
                    e
                );
                cerver.stats.connection_refused();
                cerver
                    .send_error(connection, ErrorType::Busy, e.to_string())
                    .await;
                connection.close();
                return false;
            }
        };

        self.buffers.insert(sock_fd, self.sockets.acquire());
        info!(
            "{}: new {} connection {} from {}",
            cerver.name,
            connection.protocol(),
            sock_fd,
            connection.peer_addr()
        );

        match cerver.cerver_info().to_packet() {
            Ok(packet) => {
                if !cerver.send_direct(connection, &packet).await {
                    warn!("{}: failed to greet {}", cerver.name, sock_fd);
                }
            }
            Err(e) => error!("{}: failed to encode cerver info: {}", cerver.name, e),
        }

        match client {
            None => cerver.trigger(
                cerver
                    .event(CerverEventType::OnHoldConnected)
                    .with_connection(connection),
            ),
            Some(client) => {
                cerver.stats.client_created();
                cerver.trigger(
                    cerver
                        .event(CerverEventType::ClientConnected)
                        .with_connection(connection)
                        .with_client(&client),
                );
            }
        }

        true
    }

    async fn on_bytes(&mut self, sock_fd: SockFd, bytes: &[u8]) {
        let connection = match self.cerver.registry.lookup(sock_fd) {
            Some(lookup) => Arc::clone(lookup.connection()),
            None => {
                trace!("{}: {} bytes for unknown {}", self.cerver.name, bytes.len(), sock_fd);
                self.release_buffer(sock_fd);
                return;
            }
        };
        connection.stats().record_bytes_received(bytes.len());
        connection.touch();
        self.cerver.stats.traffic().record_bytes_received(bytes.len());

        match self.buffers.get_mut(&sock_fd) {
            Some(buffer) => buffer.push(bytes),
            None => return,
        }

        loop {
            let next = match self.buffers.get_mut(&sock_fd) {
                Some(buffer) => buffer.next_packet(&self.limits),
                None => return,
            };

            match next {
                Ok(Some(packet)) => {
                    if !self.route(sock_fd, packet).await {
                        self.release_buffer(sock_fd);
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    self.frame_error(&connection, e).await;
                    return;
                }
            }
        }
    }

    /// Sends one packet where it belongs. Returns false once the connection
    /// is gone.
    async fn route(&mut self, sock_fd: SockFd, packet: Packet) -> bool {
        let packet_type = packet.packet_type();

        match self.cerver.registry.lookup(sock_fd) {
            None => false,
            Some(Lookup::OnHold(connection)) => {
                connection.stats().record_packet_received(packet_type);
                self.cerver.stats.traffic().record_packet_received(packet_type);

                let outcome = auth::on_hold_packet(&self.cerver, &connection, packet).await;
                trace!("{}: {} handshake: {:?}", self.cerver.name, sock_fd, outcome);
                outcome != HandshakeOutcome::Dropped
            }
            Some(Lookup::Active { client, connection }) => {
                connection.stats().record_packet_received(packet_type);
                self.cerver.stats.traffic().record_packet_received(packet_type);

                let job = packet_job(Arc::clone(&self.cerver), client, connection, packet);
                if let Err(e) = self.workers.push(job) {
                    warn!(
                        "{}: dropping {} packet from {}: {}",
                        self.cerver.name, packet_type, sock_fd, e
                    );
                    self.cerver.stats.job_rejected();
                }
                true
            }
        }
    }

    async fn frame_error(&mut self, connection: &Arc<Connection>, error: FrameError) {
        let sock_fd = connection.sock_fd();
        warn!(
            "{}: bad packet from {} ({}): {}",
            self.cerver.name,
            sock_fd,
            connection.peer_addr(),
            error
        );

        connection.add_bad_packet();
        self.cerver.stats.bad_packet();
        self.cerver
            .send_error(connection, ErrorType::BadPacket, error.to_string())
            .await;

        self.release_buffer(sock_fd);
        self.cerver.connection_drop(sock_fd, "bad packet");
    }

    fn release_buffer(&mut self, sock_fd: SockFd) {
        if let Some(buffer) = self.buffers.remove(&sock_fd) {
            self.sockets.release(buffer);
        }
    }

    /// Periodic housekeeping.
    fn compress(&mut self) {
        let cerver = Arc::clone(&self.cerver);
        let registry = &cerver.registry;

        if let Some(max_age) = self.cerver.config.on_hold_timeout() {
            for sock_fd in registry.expired_on_hold(max_age) {
                cerver.connection_drop(sock_fd, "on hold timeout");
            }
        }
        if let Some(max_idle) = self.cerver.config.inactive_timeout() {
            for id in registry.inactive_clients(max_idle) {
                warn!(
                    "{}: {} inactive for more than {:?}, dropping it",
                    cerver.name, id, max_idle
                );
                cerver.drop_inactive_client(id);
            }
        }

        let stale: Vec<SockFd> = self
            .buffers
            .keys()
            .filter(|sock_fd| !registry.contains(**sock_fd))
            .copied()
            .collect();
        for sock_fd in &stale {
            self.release_buffer(*sock_fd);
        }
        self.udp_peers
            .retain(|_, sock_fd| registry.contains(*sock_fd));

        if !stale.is_empty() {
            debug!(
                "{}: reclaimed {} receive buffers ({} pooled)",
                self.cerver.name,
                stale.len(),
                self.sockets.pooled()
            );
        }
        trace!(
            "{}: {} on hold, {} active, {} clients, {} queued jobs",
            self.cerver.name,
            registry.n_on_hold(),
            registry.n_active(),
            registry.n_clients(),
            self.workers.queue().len()
        );
    }

    async fn teardown(self) {
        let cerver = self.cerver;
        info!("{}: tearing down", cerver.name);
        cerver.trigger(cerver.event(CerverEventType::Teardown));

        let (on_hold, clients) = cerver.registry.drain();
        for connection in on_hold {
            connection.close();
            cerver.trigger(
                cerver
                    .event(CerverEventType::OnHoldDropped)
                    .with_connection(&connection)
                    .with_message("teardown"),
            );
        }
        for client in clients {
            for connection in client.take_connections() {
                connection.close();
            }
            cerver.trigger(
                cerver
                    .event(CerverEventType::ClientDropped)
                    .with_client(&client)
                    .with_message("teardown"),
            );
        }

        let mut workers = self.workers;
        let mut updates = self.updates;
        let ended = tokio::task::spawn_blocking(move || {
            updates.end();
            workers.end();
        })
        .await;
        if let Err(e) = ended {
            error!("{}: failed to end workers: {}", cerver.name, e);
        }

        cerver.running.store(false, Ordering::Release);
        info!("{}: teardown complete", cerver.name);
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_loop(
    sock_fd: SockFd,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<SocketEvent>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let event = match reader.read(&mut buffer).await {
            Ok(0) => SocketEvent::Closed { sock_fd },
            Ok(n) => SocketEvent::Received {
                sock_fd,
                bytes: buffer[..n].to_vec(),
            },
            Err(error) => SocketEvent::Failed { sock_fd, error },
        };

        let finished = !matches!(event, SocketEvent::Received { .. });
        if events.send(event).await.is_err() || finished {
            break;
        }
    }
}

async fn datagram_loop(socket: Arc<UdpSocket>, events: mpsc::Sender<SocketEvent>, buffer_size: usize) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, peer)) => {
                let event = SocketEvent::Datagram {
                    peer,
                    bytes: buffer[..len].to_vec(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Error receiving datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Cerver, CerverConfig, CerverHandle};
    use shared::{
        CerverInfo, ErrorPayload, ErrorType, FrameBuffer, FrameLimits, Packet, PacketType,
        ProtocolSettings,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn start(config: CerverConfig) -> CerverHandle {
        let cerver = Cerver::new(CerverConfig {
            port: 0,
            n_workers: 1,
            ..config
        })
        .unwrap();
        cerver.start().await.unwrap()
    }

    /// Next packet from the stream, or None once it is closed.
    async fn read_packet(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Option<Packet> {
        let limits = FrameLimits::default();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(packet) = buffer.next_packet(&limits).unwrap() {
                return Some(packet);
            }
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buffer.push(&chunk[..n]);
        }
    }

    async fn next(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Option<Packet> {
        timeout(Duration::from_secs(2), read_packet(stream, buffer))
            .await
            .expect("timed out waiting for a packet")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_connection_is_greeted() {
        let handle = start(CerverConfig {
            name: "greeter".to_string(),
            welcome_message: Some("welcome".to_string()),
            ..CerverConfig::default()
        })
        .await;

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        let info = CerverInfo::from_packet(&next(&mut stream, &mut buffer).await.unwrap()).unwrap();

        assert_eq!(info.name, "greeter");
        assert_eq!(info.welcome_message.as_deref(), Some("welcome"));
        assert!(!info.auth_required);
        assert_eq!(handle.cerver().registry().n_clients(), 1);

        handle.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connections_over_limit_are_refused() {
        let handle = start(CerverConfig {
            max_active_connections: 1,
            ..CerverConfig::default()
        })
        .await;

        let mut first = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut first_buffer = FrameBuffer::new();
        let greeting = next(&mut first, &mut first_buffer).await.unwrap();
        assert_eq!(greeting.packet_type(), PacketType::Server);

        let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut second_buffer = FrameBuffer::new();
        let refusal = next(&mut second, &mut second_buffer).await.unwrap();
        let error = ErrorPayload::from_packet(&refusal).unwrap();
        assert_eq!(error.error_type, ErrorType::Busy);
        assert!(next(&mut second, &mut second_buffer).await.is_none());

        let stats = handle.cerver().stats();
        assert_eq!(stats.connections_refused, 1);
        assert_eq!(handle.cerver().registry().n_active(), 1);

        handle.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_foreign_protocol_id_drops_connection() {
        let handle = start(CerverConfig::default()).await;

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        next(&mut stream, &mut buffer).await.unwrap();

        let foreign = ProtocolSettings {
            protocol_id: 0xdead_beef,
            ..ProtocolSettings::default()
        };
        let packet = Packet::new(PacketType::App, b"hello".to_vec());
        stream
            .write_all(&packet.to_bytes_with(&foreign))
            .await
            .unwrap();

        let reply = next(&mut stream, &mut buffer).await.unwrap();
        let error = ErrorPayload::from_packet(&reply).unwrap();
        assert_eq!(error.error_type, ErrorType::BadPacket);
        assert!(next(&mut stream, &mut buffer).await.is_none());
        assert_eq!(handle.cerver().registry().n_clients(), 0);
        assert_eq!(handle.cerver().stats().bad_packets, 1);

        handle.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_on_hold_timeout_drops_idle_connection() {
        let handle = start(CerverConfig {
            auth_required: true,
            on_hold_timeout_ms: Some(50),
            poll_timeout_ms: 20,
            ..CerverConfig::default()
        })
        .await;

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        let info = CerverInfo::from_packet(&next(&mut stream, &mut buffer).await.unwrap()).unwrap();
        assert!(info.auth_required);
        assert_eq!(handle.cerver().registry().n_on_hold(), 1);

        assert!(next(&mut stream, &mut buffer).await.is_none());
        assert_eq!(handle.cerver().registry().n_on_hold(), 0);

        handle.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_teardown_closes_clients() {
        let handle = start(CerverConfig::default()).await;

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        next(&mut stream, &mut buffer).await.unwrap();

        let cerver = handle.cerver().clone();
        handle.teardown().await;

        assert!(next(&mut stream, &mut buffer).await.is_none());
        assert_eq!(cerver.registry().n_clients(), 0);
        assert!(!cerver.is_running());
    }
}
