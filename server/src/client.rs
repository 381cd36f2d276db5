//! Logical peer identity owning one or more connections
//!
//! Without sessions every authenticated connection gets its own [`Client`].
//! With sessions enabled, further connections presenting the client's
//! session token attach to the same client, which lives until its last
//! connection ends.

use crate::connection::{Connection, SockFd};
use crate::stats::StatsSnapshot;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Monotonic client identifier, never reused within one cerver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Application data attached to a client. Its `Drop` runs when the client
/// is destroyed or the data is replaced.
pub type ClientData = Box<dyn Any + Send + Sync>;

pub struct Client {
    id: ClientId,
    session_id: Option<String>,
    created_at: Instant,
    connected_at_millis: u64,
    connections: Mutex<Vec<Arc<Connection>>>,
    data: Mutex<Option<ClientData>>,
}

impl Client {
    pub fn new(id: ClientId, session_id: Option<String>) -> Self {
        Self {
            id,
            session_id,
            created_at: Instant::now(),
            connected_at_millis: shared::timestamp_millis(),
            connections: Mutex::new(Vec::new()),
            data: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn connected_at_millis(&self) -> u64 {
        self.connected_at_millis
    }

    /// Connections in the order they joined.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock_connections().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    pub fn connection(&self, sock_fd: SockFd) -> Option<Arc<Connection>> {
        self.lock_connections()
            .iter()
            .find(|c| c.sock_fd() == sock_fd)
            .cloned()
    }

    /// First connection still open, handy for single-connection clients.
    pub fn main_connection(&self) -> Option<Arc<Connection>> {
        self.lock_connections()
            .iter()
            .find(|c| !c.is_dropped())
            .cloned()
    }

    pub fn has_connection(&self, sock_fd: SockFd) -> bool {
        self.lock_connections()
            .iter()
            .any(|c| c.sock_fd() == sock_fd)
    }

    pub(crate) fn add_connection(&self, connection: Arc<Connection>) {
        let mut connections = self.lock_connections();
        if !connections
            .iter()
            .any(|c| c.sock_fd() == connection.sock_fd())
        {
            connections.push(connection);
        }
    }

    /// Detaches a connection. Returns it together with the number of
    /// connections the client has left.
    pub(crate) fn remove_connection(&self, sock_fd: SockFd) -> (Option<Arc<Connection>>, usize) {
        let mut connections = self.lock_connections();
        let removed = connections
            .iter()
            .position(|c| c.sock_fd() == sock_fd)
            .map(|index| connections.remove(index));
        (removed, connections.len())
    }

    pub(crate) fn take_connections(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.lock_connections())
    }

    /// Replaces the application data, returning the previous value.
    pub fn set_data<T: Any + Send + Sync>(&self, data: T) -> Option<ClientData> {
        self.lock_data().replace(Box::new(data))
    }

    /// Like [`set_data`](Self::set_data) for data that is already boxed.
    pub fn set_boxed_data(&self, data: ClientData) -> Option<ClientData> {
        self.lock_data().replace(data)
    }

    pub fn take_data(&self) -> Option<ClientData> {
        self.lock_data().take()
    }

    pub fn has_data(&self) -> bool {
        self.lock_data().is_some()
    }

    /// Runs `f` with the data downcast to `T`, if present and of that type.
    pub fn with_data<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut data = self.lock_data();
        data.as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }

    /// Traffic summed over the client's current connections.
    pub fn stats(&self) -> StatsSnapshot {
        self.lock_connections()
            .iter()
            .map(|c| c.stats_snapshot())
            .sum()
    }

    fn lock_connections(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_data(&self) -> MutexGuard<'_, Option<ClientData>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sock_fds: Vec<SockFd> = self
            .lock_connections()
            .iter()
            .map(|c| c.sock_fd())
            .collect();

        f.debug_struct("Client")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("connections", &sock_fds)
            .field("has_data", &self.has_data())
            .finish()
    }
}
