//! # Cerver
//!
//! A generic framework for building TCP and UDP servers. Applications
//! configure a [`Cerver`], register packet handlers, an optional
//! authentication method and lifecycle event listeners, then start it. The
//! framework owns sockets, framing, authentication, client bookkeeping and
//! the thread pool that runs the handlers.
//!
//! ## Architecture Overview
//!
//! ### Multiplexer
//! A single tokio task owns the listening socket and every receive buffer.
//! Per-connection reader tasks forward raw reads to it over one channel, and
//! it reassembles packets and decides where each one goes. See
//! [`multiplexer`].
//!
//! ### Authentication
//! With `auth_required` set, new connections wait on hold until they send a
//! valid AUTH packet. Failed attempts are counted against
//! `max_auth_tries`; a connection that exhausts them is dropped. With
//! sessions enabled, several connections presenting the same session token
//! join the same client.
//!
//! ### Worker Pool
//! Every packet from an authenticated connection becomes one job on a
//! shared queue, keyed by its connection so one connection's packets run in
//! order. A fixed set of worker threads pulls jobs and calls the
//! application's handler. A panicking handler kills the job, never the
//! worker.
//!
//! ### Registry
//! Maps socket keys to on-hold connections or to the clients that own them,
//! session ids to clients, and client ids to clients, all behind one lock.
//!
//! ## Module Organization
//!
//! ### Core (`cerver`, `config`, `error`)
//! - the [`Cerver`] aggregate and its lifecycle API
//! - serde-backed [`CerverConfig`] with validation
//! - `thiserror` error types shared by the whole crate
//!
//! ### Connections (`connection`, `client`, `registry`, `socket_pool`)
//! - [`Connection`]: one socket, its output half and its counters
//! - [`Client`]: an authenticated peer owning one or more connections
//! - [`Registry`]: the indexes above, kept consistent under one lock
//!
//! ### Dispatch (`auth`, `handler`, `events`)
//! - the on-hold handshake and the [`AuthMethod`] trait
//! - [`HandlerKey`] resolution and the [`PacketContext`] handlers receive
//! - lifecycle [`CerverEvent`]s and their listeners
//!
//! ### Threading (`bsem`, `job_queue`, `worker`)
//! - [`BinarySignal`], a binary semaphore
//! - [`JobQueue`] with a capacity and a backpressure policy
//! - [`WorkerPool`] and the per-worker state machine
//!
//! ### Extras (`balancer`, `stats`, `update`)
//! - a round-robin [`Balancer`] in front of several cervers
//! - atomic traffic counters per connection and per cerver
//! - frame and interval [`Updater`] loops on their own threads
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cerver::{AuthAttempt, AuthVerdict, Cerver, CerverConfig, HandlerKey, HandlerResult, PacketContext};
//! use shared::PacketType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cerver = Cerver::new(CerverConfig {
//!         port: 7000,
//!         auth_required: true,
//!         ..CerverConfig::default()
//!     })?;
//!
//!     cerver.set_auth_method(|attempt: &AuthAttempt| {
//!         if attempt.credentials == b"secret" {
//!             AuthVerdict::accept()
//!         } else {
//!             AuthVerdict::reject("wrong secret")
//!         }
//!     });
//!
//!     cerver.register_handler(
//!         HandlerKey::Type(PacketType::App),
//!         |ctx: &PacketContext| -> HandlerResult {
//!             ctx.reply(PacketType::App, ctx.payload().to_vec())?;
//!             Ok(())
//!         },
//!     );
//!
//!     let handle = cerver.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.teardown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading Rules
//!
//! Handlers run on worker threads, outside the tokio runtime, and send with
//! blocking calls. Event listeners run inline on whichever side triggered
//! them unless registered with `create_thread`. Neither should block for
//! long on the multiplexer side: the multiplexer serves every socket.

pub mod auth;
pub mod balancer;
pub mod bsem;
pub mod cerver;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod job_queue;
pub mod multiplexer;
pub mod registry;
pub mod socket_pool;
pub mod stats;
pub mod update;
pub mod worker;

pub use auth::{AuthAttempt, AuthMethod, AuthSuccess, AuthVerdict, HandshakeOutcome};
pub use balancer::Balancer;
pub use bsem::BinarySignal;
pub use cerver::{Cerver, CerverHandle};
pub use client::{Client, ClientData, ClientId};
pub use config::{CerverConfig, JobQueueConfig};
pub use connection::{Connection, ConnectionState, Protocol, SockFd};
pub use error::{CerverError, QueueError, RegistryError};
pub use events::{CerverEvent, CerverEventType, EventListener, EventOptions};
pub use handler::{Handler, HandlerError, HandlerKey, HandlerResult, PacketContext};
pub use job_queue::{Job, JobQueue, QueuePolicy};
pub use registry::Registry;
pub use stats::{CerverStatsSnapshot, ConnectionStats, StatsSnapshot};
pub use update::{UpdateKind, Updater};
pub use worker::{WorkerPool, WorkerState};
