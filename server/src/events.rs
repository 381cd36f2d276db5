//! Lifecycle events applications can subscribe to
//!
//! One listener per event type; registering again replaces the previous
//! listener. Listeners run inline on the multiplexer task unless registered
//! with `create_thread`, so inline listeners must return quickly and must
//! not use blocking sends.

use crate::client::{Client, ClientId};
use crate::connection::{Connection, SockFd};
use crate::worker::panic_message;
use log::{debug, error};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CerverEventType {
    Started,
    Teardown,
    OnHoldConnected,
    OnHoldDisconnected,
    OnHoldDropped,
    ClientSuccessAuth,
    ClientFailedAuth,
    ClientConnected,
    ClientNewConnection,
    ClientCloseConnection,
    ClientDisconnected,
    ClientDropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CerverEvent {
    pub event_type: CerverEventType,
    pub cerver_name: String,
    pub sock_fd: Option<SockFd>,
    pub peer_addr: Option<SocketAddr>,
    pub client_id: Option<ClientId>,
    pub session_id: Option<String>,
    /// Extra detail, such as the reason an auth attempt failed.
    pub message: Option<String>,
}

impl CerverEvent {
    pub fn new(event_type: CerverEventType, cerver_name: &str) -> Self {
        Self {
            event_type,
            cerver_name: cerver_name.to_string(),
            sock_fd: None,
            peer_addr: None,
            client_id: None,
            session_id: None,
            message: None,
        }
    }

    pub fn with_connection(mut self, connection: &Connection) -> Self {
        self.sock_fd = Some(connection.sock_fd());
        self.peer_addr = Some(connection.peer_addr());
        self
    }

    pub fn with_client(mut self, client: &Client) -> Self {
        self.client_id = Some(client.id());
        self.session_id = client.session_id().map(str::to_string);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CerverEvent);
}

impl<F> EventListener for F
where
    F: Fn(&CerverEvent) + Send + Sync,
{
    fn on_event(&self, event: &CerverEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOptions {
    /// Run the listener on its own detached thread.
    pub create_thread: bool,
    /// Unregister the listener after its first trigger.
    pub drop_after_trigger: bool,
}

#[derive(Clone)]
struct Registered {
    listener: Arc<dyn EventListener>,
    options: EventOptions,
}

#[derive(Default)]
pub struct EventTable {
    listeners: RwLock<HashMap<CerverEventType, Registered>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when a previous listener was replaced.
    pub fn register(
        &self,
        event_type: CerverEventType,
        listener: Arc<dyn EventListener>,
        options: EventOptions,
    ) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type, Registered { listener, options })
            .is_some()
    }

    pub fn unregister(&self, event_type: CerverEventType) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event_type)
            .is_some()
    }

    pub fn is_registered(&self, event_type: CerverEventType) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&event_type)
    }

    pub fn clear(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Delivers `event` to its listener, if any.
    pub fn trigger(&self, event: CerverEvent) {
        let registered = {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match listeners.get(&event.event_type) {
                Some(registered) => registered.clone(),
                None => return,
            }
        };

        if registered.options.drop_after_trigger {
            self.unregister(event.event_type);
        }

        debug!("{}: event {:?}", event.cerver_name, event.event_type);

        if registered.options.create_thread {
            let listener = registered.listener;
            let event_type = event.event_type;
            let spawned = thread::Builder::new()
                .name(format!("event-{:?}", event_type))
                .spawn(move || run_listener(listener.as_ref(), &event));
            if let Err(e) = spawned {
                error!("Failed to spawn thread for event {:?}: {}", event_type, e);
            }
        } else {
            run_listener(registered.listener.as_ref(), &event);
        }
    }
}

impl fmt::Debug for EventTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<CerverEventType> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        f.debug_struct("EventTable").field("registered", &types).finish()
    }
}

fn run_listener(listener: &dyn EventListener, event: &CerverEvent) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        error!(
            "{}: listener for {:?} panicked: {}",
            event.cerver_name,
            event.event_type,
            panic_message(payload.as_ref())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn counter_listener(counter: &Arc<AtomicUsize>) -> Arc<dyn EventListener> {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &CerverEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_trigger_calls_listener() {
        let table = EventTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register(
            CerverEventType::ClientConnected,
            counter_listener(&counter),
            EventOptions::default(),
        );

        table.trigger(CerverEvent::new(CerverEventType::ClientConnected, "test"));
        table.trigger(CerverEvent::new(CerverEventType::ClientDropped, "test"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_replaces_listener() {
        let table = EventTable::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(!table.register(
            CerverEventType::Started,
            counter_listener(&first),
            EventOptions::default()
        ));
        assert!(table.register(
            CerverEventType::Started,
            counter_listener(&second),
            EventOptions::default()
        ));

        table.trigger(CerverEvent::new(CerverEventType::Started, "test"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_after_trigger_is_one_shot() {
        let table = EventTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register(
            CerverEventType::Teardown,
            counter_listener(&counter),
            EventOptions {
                drop_after_trigger: true,
                ..EventOptions::default()
            },
        );

        table.trigger(CerverEvent::new(CerverEventType::Teardown, "test"));
        table.trigger(CerverEvent::new(CerverEventType::Teardown, "test"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!table.is_registered(CerverEventType::Teardown));
    }

    #[test]
    fn test_create_thread_runs_off_caller_thread() {
        let table = EventTable::new();
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        table.register(
            CerverEventType::ClientFailedAuth,
            Arc::new(move |event: &CerverEvent| {
                let name = thread::current().name().map(str::to_string);
                let _ = tx.lock().unwrap().send((name, event.message.clone()));
            }),
            EventOptions {
                create_thread: true,
                ..EventOptions::default()
            },
        );

        table.trigger(
            CerverEvent::new(CerverEventType::ClientFailedAuth, "test").with_message("bad"),
        );

        let (name, message) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("event-ClientFailedAuth"));
        assert_eq!(message.as_deref(), Some("bad"));
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let table = EventTable::new();
        table.register(
            CerverEventType::ClientDropped,
            Arc::new(|_: &CerverEvent| panic!("listener fault")),
            EventOptions::default(),
        );
        table.trigger(CerverEvent::new(CerverEventType::ClientDropped, "test"));
        assert!(table.is_registered(CerverEventType::ClientDropped));
    }

    #[test]
    fn test_unregister() {
        let table = EventTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.register(
            CerverEventType::OnHoldConnected,
            counter_listener(&counter),
            EventOptions::default(),
        );
        assert!(table.unregister(CerverEventType::OnHoldConnected));
        assert!(!table.unregister(CerverEventType::OnHoldConnected));

        table.trigger(CerverEvent::new(CerverEventType::OnHoldConnected, "test"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
