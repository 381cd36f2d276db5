//! The cerver aggregate: configuration, registry, handlers, events, and
//! the lifecycle API applications use.
//!
//! ```no_run
//! use cerver::{Cerver, CerverConfig, HandlerKey, HandlerResult, PacketContext};
//! use shared::PacketType;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cerver = Cerver::new(CerverConfig::default())?;
//! cerver.register_handler(
//!     HandlerKey::Type(PacketType::App),
//!     |ctx: &PacketContext| -> HandlerResult {
//!         ctx.reply(PacketType::App, ctx.payload().to_vec())?;
//!         Ok(())
//!     },
//! );
//!
//! let handle = cerver.start().await?;
//! println!("listening on {}", handle.local_addr());
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

use crate::auth::AuthMethod;
use crate::client::{Client, ClientId};
use crate::config::CerverConfig;
use crate::connection::{Connection, Protocol, SockFd};
use crate::error::CerverError;
use crate::events::{CerverEvent, CerverEventType, EventListener, EventOptions, EventTable};
use crate::handler::{Handler, HandlerKey, HandlerTable};
use crate::job_queue::JobQueue;
use crate::multiplexer::{Multiplexer, SocketEvent};
use crate::registry::{Registry, RemovedConnection};
use crate::stats::{CerverStats, CerverStatsSnapshot};
use crate::update::{UpdateKind, UpdateLoops, UpdateSlots, UpdateSpec, Updater};
use crate::worker::WorkerPool;
use log::{debug, error, info};
use shared::{CerverInfo, ErrorPayload, ErrorType, Packet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// State shared by the multiplexer, the workers and the application.
pub struct CerverShared {
    pub(crate) name: String,
    pub(crate) config: CerverConfig,
    pub(crate) registry: Registry,
    pub(crate) handlers: HandlerTable,
    pub(crate) events: EventTable,
    pub(crate) stats: CerverStats,
    updates: UpdateSlots,
    auth: RwLock<Option<Arc<dyn AuthMethod>>>,
    pub(crate) running: AtomicBool,
}

impl CerverShared {
    pub(crate) fn new(config: CerverConfig) -> Self {
        Self {
            name: config.name.clone(),
            registry: Registry::new(config.max_on_hold_connections, config.max_active_connections),
            handlers: HandlerTable::new(),
            events: EventTable::new(),
            stats: CerverStats::default(),
            updates: UpdateSlots::default(),
            auth: RwLock::new(None),
            running: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn auth_method(&self) -> Option<Arc<dyn AuthMethod>> {
        self.auth
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_auth_method(&self, method: Arc<dyn AuthMethod>) {
        *self.auth.write().unwrap_or_else(PoisonError::into_inner) = Some(method);
    }

    pub(crate) fn cerver_info(&self) -> CerverInfo {
        CerverInfo {
            name: self.name.clone(),
            welcome_message: self.config.welcome_message.clone(),
            auth_required: self.config.auth_required,
            use_sessions: self.config.use_sessions,
        }
    }

    pub(crate) fn event(&self, event_type: CerverEventType) -> CerverEvent {
        CerverEvent::new(event_type, &self.name)
    }

    pub(crate) fn trigger(&self, event: CerverEvent) {
        self.events.trigger(event);
    }

    /// Best-effort ERROR packet; failures are only logged.
    ///
    /// Returns false when the packet was not written.
    pub(crate) async fn send_error(
        &self,
        connection: &Connection,
        error_type: ErrorType,
        message: impl Into<String>,
    ) -> bool {
        match ErrorPayload::new(error_type, message).to_packet() {
            Ok(packet) => self.send_direct(connection, &packet).await,
            Err(e) => {
                error!("{}: failed to encode error packet: {}", self.name, e);
                false
            }
        }
    }

    /// Writes a packet of the multiplexer's own without queueing behind
    /// workers that are sending on the same connection.
    pub(crate) async fn send_direct(&self, connection: &Connection, packet: &Packet) -> bool {
        match connection.send_now(packet, self.config.send_timeout()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(
                    "{}: skipped {} packet to {}: {}",
                    self.name,
                    packet.packet_type(),
                    connection.sock_fd(),
                    e
                );
                false
            }
        }
    }

    /// Drops a connection on the cerver's initiative (bad packets, failed
    /// auth, timeouts).
    pub(crate) fn connection_drop(&self, sock_fd: SockFd, reason: &str) -> bool {
        self.remove_connection(sock_fd, Some(reason)).is_some()
    }

    /// Cleans up after the peer closed the socket or the socket failed.
    pub(crate) fn connection_closed(&self, sock_fd: SockFd) -> bool {
        self.remove_connection(sock_fd, None).is_some()
    }

    /// Handles a CLIENT/CLOSE_CONNECTION request. The client survives if it
    /// has other connections.
    pub(crate) fn close_connection(&self, client: &Client, connection: &Connection) {
        debug!(
            "{}: {} asked to close {}",
            self.name,
            client.id(),
            connection.sock_fd()
        );
        self.connection_closed(connection.sock_fd());
    }

    /// Handles a CLIENT/DISCONNECT request.
    pub(crate) fn disconnect_client(&self, client: &Client) -> bool {
        self.remove_client(client.id(), CerverEventType::ClientDisconnected, None)
    }

    pub(crate) fn drop_client(&self, id: ClientId) -> bool {
        self.remove_client(id, CerverEventType::ClientDropped, None)
    }

    /// Drops a client that has gone quiet for longer than allowed.
    pub(crate) fn drop_inactive_client(&self, id: ClientId) -> bool {
        self.remove_client(id, CerverEventType::ClientDropped, Some("inactive"))
    }

    fn remove_connection(&self, sock_fd: SockFd, reason: Option<&str>) -> Option<RemovedConnection> {
        let removed = self.registry.remove_connection(sock_fd)?;
        removed.connection.close();
        self.stats.connection_dropped();

        let event_type = match (&removed.client, removed.client_dropped, reason.is_some()) {
            (None, _, false) => CerverEventType::OnHoldDisconnected,
            (None, _, true) => CerverEventType::OnHoldDropped,
            (Some(_), false, _) => CerverEventType::ClientCloseConnection,
            (Some(_), true, false) => CerverEventType::ClientDisconnected,
            (Some(_), true, true) => CerverEventType::ClientDropped,
        };

        match reason {
            Some(reason) => info!(
                "{}: dropped {} from {}: {}",
                self.name,
                sock_fd,
                removed.connection.peer_addr(),
                reason
            ),
            None => info!(
                "{}: {} from {} closed",
                self.name,
                sock_fd,
                removed.connection.peer_addr()
            ),
        }

        let mut event = self.event(event_type).with_connection(&removed.connection);
        if let Some(client) = &removed.client {
            event = event.with_client(client);
        }
        if let Some(reason) = reason {
            event = event.with_message(reason);
        }
        self.trigger(event);

        Some(removed)
    }

    fn remove_client(&self, id: ClientId, event_type: CerverEventType, reason: Option<&str>) -> bool {
        let (client, connections) = match self.registry.remove_client(id) {
            Some(removed) => removed,
            None => return false,
        };

        for connection in &connections {
            connection.close();
            self.stats.connection_dropped();
        }
        info!(
            "{}: {} removed with {} connections ({:?}{})",
            self.name,
            id,
            connections.len(),
            event_type,
            reason.map(|r| format!(", {}", r)).unwrap_or_default()
        );

        let mut event = self.event(event_type).with_client(&client);
        if let Some(reason) = reason {
            event = event.with_message(reason);
        }
        self.trigger(event);
        true
    }
}

/// A configured cerver. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Cerver {
    shared: Arc<CerverShared>,
}

impl Cerver {
    pub fn new(config: CerverConfig) -> Result<Self, CerverError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(CerverShared::new(config)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CerverConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn stats(&self) -> CerverStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn set_auth_method(&self, method: impl AuthMethod + 'static) {
        self.shared.set_auth_method(Arc::new(method));
    }

    /// Returns true when a previous handler for `key` was replaced.
    pub fn register_handler(&self, key: HandlerKey, handler: impl Handler + 'static) -> bool {
        self.shared.handlers.register(key, Arc::new(handler))
    }

    pub fn unregister_handler(&self, key: HandlerKey) -> bool {
        self.shared.handlers.unregister(key)
    }

    /// Returns true when a previous listener for `event_type` was replaced.
    pub fn register_event(
        &self,
        event_type: CerverEventType,
        listener: impl EventListener + 'static,
        options: EventOptions,
    ) -> bool {
        self.shared
            .events
            .register(event_type, Arc::new(listener), options)
    }

    pub fn unregister_event(&self, event_type: CerverEventType) -> bool {
        self.shared.events.unregister(event_type)
    }

    /// Runs `updater` on its own thread `fps` times per second while the
    /// cerver is running. Takes effect on the next start.
    ///
    /// Returns true when a previous frame update was replaced.
    pub fn set_update(&self, updater: impl Updater + 'static, fps: u32) -> Result<bool, CerverError> {
        let spec = UpdateSpec::new(UpdateKind::Frame { fps }, Arc::new(updater))?;
        Ok(self.shared.updates.set(spec))
    }

    /// Runs `updater` on its own thread every `interval` while the cerver is
    /// running. Takes effect on the next start.
    pub fn set_update_interval(
        &self,
        updater: impl Updater + 'static,
        interval: Duration,
    ) -> Result<bool, CerverError> {
        let spec = UpdateSpec::new(UpdateKind::Interval(interval), Arc::new(updater))?;
        Ok(self.shared.updates.set(spec))
    }

    pub async fn send(&self, connection: &Connection, packet: &Packet) -> Result<usize, CerverError> {
        connection.send(packet).await
    }

    /// Sends `packet` to the first open connection of every client.
    ///
    /// Returns how many clients it reached.
    pub async fn broadcast(&self, packet: &Packet) -> usize {
        let mut reached = 0;
        for client in self.shared.registry.clients() {
            if let Some(connection) = client.main_connection() {
                match connection.send(packet).await {
                    Ok(_) => reached += 1,
                    Err(e) => debug!("{}: broadcast to {} failed: {}", self.name(), client.id(), e),
                }
            }
        }
        reached
    }

    /// Removes a client and closes all of its connections.
    pub fn drop_client(&self, id: ClientId) -> bool {
        self.shared.drop_client(id)
    }

    /// Binds the listening socket, starts the workers and spawns the
    /// multiplexer task.
    pub async fn start(&self) -> Result<CerverHandle, CerverError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(CerverError::AlreadyRunning(self.shared.name.clone()));
        }

        match self.start_inner().await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<CerverHandle, CerverError> {
        let config = &self.shared.config;
        let addr = resolve(&config.bind_address()).await?;

        let (listener, udp, local_addr) = match config.protocol {
            Protocol::Tcp => {
                let listener = bind_tcp(addr, config.connection_queue)?;
                let local_addr = listener.local_addr()?;
                (Some(listener), None, local_addr)
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await?;
                let local_addr = socket.local_addr()?;
                (None, Some(Arc::new(socket)), local_addr)
            }
        };

        let queue = Arc::new(JobQueue::new(
            config.job_queue.capacity,
            config.job_queue.policy,
        ));
        let workers = WorkerPool::start(&self.shared.name, config.n_workers, queue)?;
        let updates = UpdateLoops::start(self, self.shared.updates.specs())?;
        let n_updates = updates.len();

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_size);
        let shutdown = Arc::new(Notify::new());

        let multiplexer = Multiplexer::new(
            Arc::clone(&self.shared),
            listener,
            udp,
            workers,
            updates,
            events_tx.clone(),
            events_rx,
            Arc::clone(&shutdown),
        );
        let task = tokio::spawn(multiplexer.run());

        info!(
            "{}: listening on {} ({}), {} workers, {} update threads, auth {}",
            self.shared.name,
            local_addr,
            config.protocol,
            config.n_workers,
            n_updates,
            if config.auth_required { "required" } else { "off" }
        );
        self.shared
            .trigger(self.shared.event(CerverEventType::Started));

        Ok(CerverHandle {
            cerver: self.clone(),
            local_addr,
            events_tx,
            shutdown,
            task,
        })
    }
}

impl std::fmt::Debug for Cerver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cerver")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("clients", &self.shared.registry.n_clients())
            .finish()
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, CerverError> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| CerverError::Configuration(format!("cannot resolve {}", address)))
}

fn bind_tcp(addr: SocketAddr, backlog: u32) -> Result<TcpListener, CerverError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

/// A running cerver.
pub struct CerverHandle {
    cerver: Cerver,
    local_addr: SocketAddr,
    events_tx: mpsc::Sender<SocketEvent>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl CerverHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cerver(&self) -> &Cerver {
        &self.cerver
    }

    /// Hands an already accepted TCP stream to this cerver, as if its own
    /// listener had accepted it.
    pub async fn adopt_connection(&self, stream: TcpStream) -> Result<(), CerverError> {
        if self.cerver.config().protocol != Protocol::Tcp {
            return Err(CerverError::Configuration(format!(
                "{} does not accept TCP connections",
                self.cerver.name()
            )));
        }

        let peer = stream.peer_addr()?;
        self.events_tx
            .send(SocketEvent::Adopt { stream, peer })
            .await
            .map_err(|_| CerverError::NotRunning)
    }

    /// Asks the multiplexer to tear down. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// True once the multiplexer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the multiplexer task to finish.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("{}: multiplexer task failed: {}", self.cerver.name(), e);
        }
    }

    /// Drops every client and connection, ends the workers and waits for
    /// the multiplexer to exit.
    pub async fn teardown(self) {
        self.shutdown();
        self.wait().await;
    }
}

impl std::fmt::Debug for CerverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CerverHandle")
            .field("cerver", &self.cerver)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
