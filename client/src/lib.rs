//! # Cerver Client Library
//!
//! Async client for cervers. It speaks the same wire protocol as the server
//! crate and reuses its [`shared::FrameBuffer`] to reassemble packets, so
//! the two sides can never disagree about framing.
//!
//! ## Connection Lifecycle
//!
//! 1. [`CerverConnection::connect`] opens the socket and reads the greeting
//!    (a SERVER packet carrying [`shared::CerverInfo`]).
//! 2. If the greeting says auth is required, [`CerverConnection::authenticate`]
//!    sends credentials. A rejected attempt can be retried until the cerver's
//!    budget runs out and it hangs up.
//! 3. With sessions on, more connections can join the same client through
//!    [`CerverConnection::authenticate_with_token`].
//! 4. [`CerverConnection::close_connection`] closes one connection,
//!    [`CerverConnection::disconnect`] the whole client.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{AuthOutcome, CerverConnection};
//! use shared::PacketType;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = CerverConnection::connect("127.0.0.1:7000").await?;
//!
//!     if connection.info().map_or(false, |info| info.auth_required) {
//!         match connection.authenticate(b"secret").await? {
//!             AuthOutcome::Accepted { .. } => {}
//!             AuthOutcome::Rejected { message } => return Err(message.into()),
//!         }
//!     }
//!
//!     connection.send_app(b"hello").await?;
//!     let reply = connection.expect(PacketType::App).await?;
//!     println!("{}", String::from_utf8_lossy(&reply.payload));
//!
//!     connection.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;

pub use connection::{AuthOutcome, CerverConnection};
pub use error::ClientError;
