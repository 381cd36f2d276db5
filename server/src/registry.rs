//! Socket key to owner indices: on-hold connections and active clients
//!
//! The registry keeps four maps consistent under one reader-biased lock:
//!
//! - `on_hold`: socket key to connection, before authentication
//! - `active`: socket key to owning client, after promotion
//! - `clients`: client id to client, ordered for traversal
//! - `sessions`: session id to client id, when sessions are enabled
//!
//! A socket key is never present in both `on_hold` and `active`; promotion
//! moves it between them under a single write lock. When a client's lock is
//! needed too, the registry lock is always taken first.

use crate::client::{Client, ClientId};
use crate::connection::{Connection, ConnectionState, SockFd};
use crate::error::RegistryError;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// What a socket key currently resolves to.
#[derive(Debug, Clone)]
pub enum Lookup {
    OnHold(Arc<Connection>),
    Active {
        client: Arc<Client>,
        connection: Arc<Connection>,
    },
}

impl Lookup {
    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Lookup::OnHold(connection) => connection,
            Lookup::Active { connection, .. } => connection,
        }
    }
}

/// A connection taken out of the registry.
#[derive(Debug)]
pub struct RemovedConnection {
    pub connection: Arc<Connection>,
    /// Owning client, `None` for on-hold connections.
    pub client: Option<Arc<Client>>,
    /// True when this was the client's last connection and the client was
    /// removed as well.
    pub client_dropped: bool,
}

#[derive(Debug, Default)]
struct Indices {
    on_hold: HashMap<SockFd, Arc<Connection>>,
    active: HashMap<SockFd, Arc<Client>>,
    clients: BTreeMap<ClientId, Arc<Client>>,
    sessions: HashMap<String, ClientId>,
}

impl Indices {
    fn contains(&self, sock_fd: SockFd) -> bool {
        self.on_hold.contains_key(&sock_fd) || self.active.contains_key(&sock_fd)
    }

    fn check_session(&self, client: &Client) -> Result<(), RegistryError> {
        match client.session_id() {
            Some(session) => match self.sessions.get(session) {
                Some(owner) if *owner != client.id() => {
                    Err(RegistryError::SessionTaken(session.to_string()))
                }
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn attach(&mut self, connection: Arc<Connection>, client: &Arc<Client>) {
        let sock_fd = connection.sock_fd();
        client.add_connection(connection);
        self.active.insert(sock_fd, Arc::clone(client));
        self.clients
            .entry(client.id())
            .or_insert_with(|| Arc::clone(client));
        if let Some(session) = client.session_id() {
            self.sessions.insert(session.to_string(), client.id());
        }
    }

    fn forget_client(&mut self, client: &Client) {
        self.clients.remove(&client.id());
        if let Some(session) = client.session_id() {
            if self.sessions.get(session) == Some(&client.id()) {
                self.sessions.remove(session);
            }
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    indices: RwLock<Indices>,
    next_client_id: AtomicU64,
    max_on_hold: usize,
    max_active: usize,
}

impl Registry {
    pub fn new(max_on_hold: usize, max_active: usize) -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
            next_client_id: AtomicU64::new(1),
            max_on_hold,
            max_active,
        }
    }

    pub fn max_on_hold(&self) -> usize {
        self.max_on_hold
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Builds a client with a fresh id. It is not registered until one of
    /// its connections is promoted or registered as active.
    pub fn create_client(&self, session_id: Option<String>) -> Arc<Client> {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Client::new(id, session_id))
    }

    pub fn insert_on_hold(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let mut indices = self.write();
        let sock_fd = connection.sock_fd();

        if indices.contains(sock_fd) {
            return Err(RegistryError::Duplicate(sock_fd));
        }
        if indices.on_hold.len() >= self.max_on_hold {
            return Err(RegistryError::OnHoldFull {
                max: self.max_on_hold,
            });
        }

        indices.on_hold.insert(sock_fd, connection);
        Ok(())
    }

    pub fn remove_on_hold(&self, sock_fd: SockFd) -> Option<Arc<Connection>> {
        self.write().on_hold.remove(&sock_fd)
    }

    /// Moves an on-hold connection to the active index under `client`.
    ///
    /// On error nothing changes: the connection stays on hold.
    pub fn promote(&self, sock_fd: SockFd, client: &Arc<Client>) -> Result<(), RegistryError> {
        let mut indices = self.write();

        if !indices.on_hold.contains_key(&sock_fd) {
            return Err(RegistryError::NotOnHold(sock_fd));
        }
        if indices.active.len() >= self.max_active {
            return Err(RegistryError::ActiveFull {
                max: self.max_active,
            });
        }
        indices.check_session(client)?;

        if let Some(connection) = indices.on_hold.remove(&sock_fd) {
            connection.set_state(ConnectionState::Active);
            indices.attach(connection, client);
            debug!("{} promoted to {}", sock_fd, client.id());
        }
        Ok(())
    }

    /// Registers a connection that skips the on-hold stage.
    pub fn register_active(
        &self,
        connection: Arc<Connection>,
        client: &Arc<Client>,
    ) -> Result<(), RegistryError> {
        let mut indices = self.write();
        let sock_fd = connection.sock_fd();

        if indices.contains(sock_fd) {
            return Err(RegistryError::Duplicate(sock_fd));
        }
        if indices.active.len() >= self.max_active {
            return Err(RegistryError::ActiveFull {
                max: self.max_active,
            });
        }
        indices.check_session(client)?;

        connection.set_state(ConnectionState::Active);
        indices.attach(connection, client);
        Ok(())
    }

    pub fn lookup(&self, sock_fd: SockFd) -> Option<Lookup> {
        let indices = self.read();

        if let Some(connection) = indices.on_hold.get(&sock_fd) {
            return Some(Lookup::OnHold(Arc::clone(connection)));
        }

        let client = indices.active.get(&sock_fd)?;
        let connection = client.connection(sock_fd)?;
        Some(Lookup::Active {
            client: Arc::clone(client),
            connection,
        })
    }

    pub fn on_hold_connection(&self, sock_fd: SockFd) -> Option<Arc<Connection>> {
        self.read().on_hold.get(&sock_fd).cloned()
    }

    pub fn client_by_sock_fd(&self, sock_fd: SockFd) -> Option<Arc<Client>> {
        self.read().active.get(&sock_fd).cloned()
    }

    pub fn client_by_id(&self, id: ClientId) -> Option<Arc<Client>> {
        self.read().clients.get(&id).cloned()
    }

    pub fn client_by_session(&self, session_id: &str) -> Option<Arc<Client>> {
        let indices = self.read();
        let id = indices.sessions.get(session_id)?;
        indices.clients.get(id).cloned()
    }

    /// Removes one connection from whichever index holds it. An active
    /// connection is detached from its client, and a client left without
    /// connections is removed too.
    pub fn remove_connection(&self, sock_fd: SockFd) -> Option<RemovedConnection> {
        let mut indices = self.write();

        if let Some(connection) = indices.on_hold.remove(&sock_fd) {
            return Some(RemovedConnection {
                connection,
                client: None,
                client_dropped: false,
            });
        }

        let client = indices.active.remove(&sock_fd)?;
        let (connection, left) = client.remove_connection(sock_fd);
        let client_dropped = left == 0;
        if client_dropped {
            indices.forget_client(&client);
        }

        connection.map(|connection| RemovedConnection {
            connection,
            client: Some(client),
            client_dropped,
        })
    }

    /// Removes a client and all of its connections from the active index.
    pub fn remove_client(&self, id: ClientId) -> Option<(Arc<Client>, Vec<Arc<Connection>>)> {
        let mut indices = self.write();
        let client = indices.clients.get(&id).cloned()?;

        indices.forget_client(&client);
        let connections = client.take_connections();
        for connection in &connections {
            indices.active.remove(&connection.sock_fd());
        }

        Some((client, connections))
    }

    /// All clients, ordered by id.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.read().clients.values().cloned().collect()
    }

    pub fn on_hold_connections(&self) -> Vec<Arc<Connection>> {
        self.read().on_hold.values().cloned().collect()
    }

    /// On-hold connections older than `max_age`.
    pub fn expired_on_hold(&self, max_age: Duration) -> Vec<SockFd> {
        self.read()
            .on_hold
            .values()
            .filter(|connection| connection.age() > max_age)
            .map(|connection| connection.sock_fd())
            .collect()
    }

    /// Clients with no traffic on any connection for longer than `max_idle`.
    pub fn inactive_clients(&self, max_idle: Duration) -> Vec<ClientId> {
        self.clients()
            .into_iter()
            .filter(|client| {
                let connections = client.connections();
                !connections.is_empty()
                    && connections
                        .iter()
                        .all(|connection| connection.idle_for() > max_idle)
            })
            .map(|client| client.id())
            .collect()
    }

    pub fn contains(&self, sock_fd: SockFd) -> bool {
        self.read().contains(sock_fd)
    }

    pub fn is_on_hold(&self, sock_fd: SockFd) -> bool {
        self.read().on_hold.contains_key(&sock_fd)
    }

    pub fn is_active(&self, sock_fd: SockFd) -> bool {
        self.read().active.contains_key(&sock_fd)
    }

    pub fn n_on_hold(&self) -> usize {
        self.read().on_hold.len()
    }

    pub fn n_active(&self) -> usize {
        self.read().active.len()
    }

    pub fn n_clients(&self) -> usize {
        self.read().clients.len()
    }

    pub fn n_sessions(&self) -> usize {
        self.read().sessions.len()
    }

    /// Empties every index, returning what was registered.
    pub fn drain(&self) -> (Vec<Arc<Connection>>, Vec<Arc<Client>>) {
        let mut indices = self.write();
        let on_hold = indices.on_hold.drain().map(|(_, c)| c).collect();
        let clients = std::mem::take(&mut indices.clients)
            .into_values()
            .collect();
        indices.active.clear();
        indices.sessions.clear();
        (on_hold, clients)
    }

    fn read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(PoisonError::into_inner)
    }
}
