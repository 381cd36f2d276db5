//! Cerver configuration
//!
//! Every field has a default, so a config can be built from
//! `CerverConfig::default()` with struct update syntax or deserialized from a
//! partial document.

use crate::connection::Protocol;
use crate::error::CerverError;
use crate::job_queue::QueuePolicy;
use serde::{Deserialize, Serialize};
use shared::{FrameLimits, ProtocolSettings, ProtocolVersion, CERVER_PROTOCOL_ID, HEADER_SIZE};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// `None` for an unbounded queue.
    pub capacity: Option<usize>,
    pub policy: QueuePolicy,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            capacity: Some(1024),
            policy: QueuePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CerverConfig {
    pub name: String,
    pub host: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub protocol: Protocol,
    /// Listen backlog.
    pub connection_queue: u32,
    /// Housekeeping period of the multiplexer, in milliseconds.
    pub poll_timeout_ms: u64,
    pub max_on_hold_connections: usize,
    pub max_active_connections: usize,
    /// Size of each socket read.
    pub receive_buffer_size: usize,
    /// Largest packet accepted, header included.
    pub max_packet_size: usize,
    pub auth_required: bool,
    pub max_auth_tries: u32,
    /// Non-AUTH packets tolerated from an on-hold connection.
    pub max_on_hold_bad_packets: u32,
    /// Drop connections that stay on hold longer than this.
    pub on_hold_timeout_ms: Option<u64>,
    /// Drop clients with no traffic on any of their connections for this long.
    pub inactive_timeout_ms: Option<u64>,
    /// Longest the multiplexer spends writing a packet of its own (greeting,
    /// error, auth reply) before giving up on the peer.
    pub send_timeout_ms: u64,
    pub use_sessions: bool,
    pub n_workers: usize,
    pub job_queue: JobQueueConfig,
    pub protocol_id: u32,
    pub protocol_version: ProtocolVersion,
    pub welcome_message: Option<String>,
    /// Capacity of the channel between socket tasks and the multiplexer.
    pub event_queue_size: usize,
}

impl Default for CerverConfig {
    fn default() -> Self {
        Self {
            name: "cerver".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7000,
            protocol: Protocol::Tcp,
            connection_queue: 10,
            poll_timeout_ms: 2_000,
            max_on_hold_connections: 100,
            max_active_connections: 1000,
            receive_buffer_size: 4096,
            max_packet_size: shared::DEFAULT_MAX_PACKET_SIZE,
            auth_required: false,
            max_auth_tries: 3,
            max_on_hold_bad_packets: 3,
            on_hold_timeout_ms: None,
            inactive_timeout_ms: None,
            send_timeout_ms: 200,
            use_sessions: false,
            n_workers: 4,
            job_queue: JobQueueConfig::default(),
            protocol_id: CERVER_PROTOCOL_ID,
            protocol_version: shared::CERVER_PROTOCOL_VERSION,
            welcome_message: None,
            event_queue_size: 1024,
        }
    }
}

impl CerverConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn on_hold_timeout(&self) -> Option<Duration> {
        self.on_hold_timeout_ms.map(Duration::from_millis)
    }

    pub fn inactive_timeout(&self) -> Option<Duration> {
        self.inactive_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        ProtocolSettings {
            protocol_id: self.protocol_id,
            version: self.protocol_version,
        }
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            settings: self.protocol_settings(),
            max_packet_size: self.max_packet_size,
        }
    }

    pub fn validate(&self) -> Result<(), CerverError> {
        let invalid = |message: &str| Err(CerverError::Configuration(message.to_string()));

        if self.name.is_empty() {
            return invalid("name must not be empty");
        }
        if self.n_workers == 0 {
            return invalid("n_workers must be at least 1");
        }
        if self.receive_buffer_size == 0 {
            return invalid("receive_buffer_size must be greater than 0");
        }
        if self.max_packet_size < HEADER_SIZE {
            return Err(CerverError::Configuration(format!(
                "max_packet_size must be at least the {} byte header",
                HEADER_SIZE
            )));
        }
        if self.max_active_connections == 0 {
            return invalid("max_active_connections must be greater than 0");
        }
        if self.auth_required && self.max_on_hold_connections == 0 {
            return invalid("max_on_hold_connections must be greater than 0 when auth is required");
        }
        if self.auth_required && self.max_auth_tries == 0 {
            return invalid("max_auth_tries must be greater than 0 when auth is required");
        }
        if self.poll_timeout_ms == 0 {
            return invalid("poll_timeout_ms must be greater than 0");
        }
        if self.send_timeout_ms == 0 {
            return invalid("send_timeout_ms must be greater than 0");
        }
        if self.inactive_timeout_ms == Some(0) {
            return invalid("inactive_timeout_ms must be greater than 0");
        }
        if self.event_queue_size == 0 {
            return invalid("event_queue_size must be greater than 0");
        }
        if self.job_queue.capacity == Some(0) {
            return invalid("job_queue.capacity must be greater than 0");
        }

        Ok(())
    }
}
