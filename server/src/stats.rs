//! Traffic counters for connections and the cerver as a whole
//!
//! All counters are atomics so the multiplexer (receive side) and worker
//! threads (send side) can update them without sharing a lock.

use serde::{Deserialize, Serialize};
use shared::PacketType;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per packet type counters, indexed by the small known type table.
#[derive(Debug, Default)]
pub struct PacketCounters {
    server: AtomicU64,
    client: AtomicU64,
    error: AtomicU64,
    request: AtomicU64,
    auth: AtomicU64,
    game: AtomicU64,
    app: AtomicU64,
    app_error: AtomicU64,
    custom: AtomicU64,
    test: AtomicU64,
    unknown: AtomicU64,
}

impl PacketCounters {
    fn slot(&self, packet_type: PacketType) -> &AtomicU64 {
        match packet_type {
            PacketType::Server => &self.server,
            PacketType::Client => &self.client,
            PacketType::Error => &self.error,
            PacketType::Request => &self.request,
            PacketType::Auth => &self.auth,
            PacketType::Game => &self.game,
            PacketType::App => &self.app,
            PacketType::AppError => &self.app_error,
            PacketType::Custom => &self.custom,
            PacketType::Test => &self.test,
            PacketType::DontCheckType | PacketType::Unknown(_) => &self.unknown,
        }
    }

    pub fn record(&self, packet_type: PacketType) {
        self.slot(packet_type).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, packet_type: PacketType) -> u64 {
        self.slot(packet_type).load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        [
            &self.server,
            &self.client,
            &self.error,
            &self.request,
            &self.auth,
            &self.game,
            &self.app,
            &self.app_error,
            &self.custom,
            &self.test,
            &self.unknown,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
    }
}

/// Traffic of one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    received_by_type: PacketCounters,
    sent_by_type: PacketCounters,
}

impl ConnectionStats {
    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_packet_received(&self, packet_type: PacketType) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.received_by_type.record(packet_type);
    }

    pub fn record_sent(&self, packet_type: PacketType, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.sent_by_type.record(packet_type);
    }

    pub fn received_by_type(&self) -> &PacketCounters {
        &self.received_by_type
    }

    pub fn sent_by_type(&self) -> &PacketCounters {
        &self.sent_by_type
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of traffic counters, summable across connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
}

impl std::ops::Add for StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, other: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received + other.bytes_received,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            packets_received: self.packets_received + other.packets_received,
            packets_sent: self.packets_sent + other.packets_sent,
        }
    }
}

impl std::iter::Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = StatsSnapshot>>(iter: I) -> Self {
        iter.fold(StatsSnapshot::default(), |acc, s| acc + s)
    }
}

/// Cerver-wide counters.
#[derive(Debug, Default)]
pub struct CerverStats {
    traffic: ConnectionStats,
    connections_accepted: AtomicU64,
    connections_refused: AtomicU64,
    connections_dropped: AtomicU64,
    clients_created: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    bad_packets: AtomicU64,
    jobs_rejected: AtomicU64,
}

/// Copy of [`CerverStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CerverStatsSnapshot {
    pub traffic: StatsSnapshot,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub connections_dropped: u64,
    pub clients_created: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub bad_packets: u64,
    pub jobs_rejected: u64,
}

impl CerverStats {
    pub fn traffic(&self) -> &ConnectionStats {
        &self.traffic
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_created(&self) {
        self.clients_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_success(&self) {
        self.auth_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_packet(&self) {
        self.bad_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CerverStatsSnapshot {
        CerverStatsSnapshot {
            traffic: self.traffic.snapshot(),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            clients_created: self.clients_created.load(Ordering::Relaxed),
            auth_successes: self.auth_successes.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            bad_packets: self.bad_packets.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
        }
    }
}
