//! One accepted socket and everything the cerver tracks about it
//!
//! A [`Connection`] is always shared as `Arc<Connection>`: the registry owns
//! one reference, queued jobs own others. Dropping a connection flips its
//! state to [`ConnectionState::Dropped`] and releases the socket; any job
//! still holding the `Arc` sees `is_active() == false` and any send returns
//! [`CerverError::ConnectionClosed`] instead of touching a dead socket.
//! Sends still waiting on a peer that stopped reading are cancelled too.

use crate::error::CerverError;
use crate::stats::{ConnectionStats, StatsSnapshot};
use serde::{Deserialize, Serialize};
use shared::{Packet, ProtocolSettings};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Socket key, unique for the lifetime of a cerver.
///
/// Keys are handed out by the socket pool from a counter and never reused,
/// so a stale key can never resolve to a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SockFd(pub u64);

impl fmt::Display for SockFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    OnHold,
    Authenticating,
    Active,
    Dropped,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::OnHold => 0,
            ConnectionState::Authenticating => 1,
            ConnectionState::Active => 2,
            ConnectionState::Dropped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::OnHold,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Active,
            _ => ConnectionState::Dropped,
        }
    }
}

/// Write half of a connection.
#[derive(Debug)]
pub enum Sink {
    Tcp(OwnedWriteHalf),
    /// UDP "connections" share the bound socket and are told apart by peer.
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl Sink {
    pub fn protocol(&self) -> Protocol {
        match self {
            Sink::Tcp(_) => Protocol::Tcp,
            Sink::Udp { .. } => Protocol::Udp,
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Tcp(writer) => writer.write_all(bytes).await,
            Sink::Udp { socket, peer } => socket.send_to(bytes, *peer).await.map(|_| ()),
        }
    }
}

pub struct Connection {
    sock_fd: SockFd,
    protocol: Protocol,
    peer_addr: SocketAddr,
    created_at: Instant,
    connected_at_millis: u64,
    state: AtomicU8,
    /// Milliseconds after `created_at` of the last packet in or out.
    last_activity: AtomicU64,
    auth_tries: AtomicU32,
    bad_packets: AtomicU32,
    settings: ProtocolSettings,
    output: tokio::sync::Mutex<Option<Sink>>,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<AbortHandle>>,
    runtime: Option<Handle>,
    stats: ConnectionStats,
}

impl Connection {
    /// Creates an on-hold connection.
    ///
    /// Must be called from within the tokio runtime when blocking sends are
    /// going to be used, since the runtime handle is captured here.
    pub fn new(
        sock_fd: SockFd,
        peer_addr: SocketAddr,
        sink: Sink,
        settings: ProtocolSettings,
        max_auth_tries: u32,
    ) -> Self {
        let (closed, _) = watch::channel(false);

        Self {
            sock_fd,
            protocol: sink.protocol(),
            peer_addr,
            created_at: Instant::now(),
            connected_at_millis: shared::timestamp_millis(),
            state: AtomicU8::new(ConnectionState::OnHold.as_u8()),
            last_activity: AtomicU64::new(0),
            auth_tries: AtomicU32::new(max_auth_tries),
            bad_packets: AtomicU32::new(0),
            settings,
            output: tokio::sync::Mutex::new(Some(sink)),
            closed,
            reader: Mutex::new(None),
            runtime: Handle::try_current().ok(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn sock_fd(&self) -> SockFd {
        self.sock_fd
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wall clock time of the accept, in milliseconds since the epoch.
    pub fn connected_at_millis(&self) -> u64 {
        self.connected_at_millis
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Marks traffic on the connection.
    pub(crate) fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last packet was received from or sent to the peer.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Moves from `from` to `to` only if the connection is still in `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_on_hold(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::OnHold | ConnectionState::Authenticating
        )
    }

    pub fn is_dropped(&self) -> bool {
        self.state() == ConnectionState::Dropped
    }

    pub fn auth_tries(&self) -> u32 {
        self.auth_tries.load(Ordering::Acquire)
    }

    /// Uses up one auth attempt and returns how many remain.
    pub fn consume_auth_try(&self) -> u32 {
        let previous = self
            .auth_tries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tries| {
                Some(tries.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn bad_packets(&self) -> u32 {
        self.bad_packets.load(Ordering::Acquire)
    }

    /// Counts a bad packet and returns the new total.
    pub fn add_bad_packet(&self) -> u32 {
        self.bad_packets.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn set_reader(&self, reader: AbortHandle) {
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
    }

    /// Writes one packet, holding the output lock for the whole packet so
    /// concurrent senders never interleave bytes.
    ///
    /// Returns the number of bytes written. Closing the connection aborts a
    /// send that is still waiting for the lock or for the peer to read.
    pub async fn send(&self, packet: &Packet) -> Result<usize, CerverError> {
        if self.is_dropped() {
            return Err(CerverError::ConnectionClosed(self.sock_fd));
        }

        let bytes = packet.to_bytes_with(&self.settings);
        let closed = self.closed.subscribe();
        tokio::select! {
            written = self.write_locked(&bytes) => written?,
            _ = wait_closed(closed) => return Err(CerverError::ConnectionClosed(self.sock_fd)),
        }

        self.sent(packet, bytes.len());
        Ok(bytes.len())
    }

    /// Sends without queueing behind other senders.
    ///
    /// Used for the packets the multiplexer writes itself. Fails with
    /// [`CerverError::SendBusy`] while another send holds the output and with
    /// [`CerverError::SendTimeout`] when the peer does not take the bytes
    /// within `timeout`. After a timeout the stream may hold a partial packet.
    pub(crate) async fn send_now(&self, packet: &Packet, timeout: Duration) -> Result<usize, CerverError> {
        if self.is_dropped() {
            return Err(CerverError::ConnectionClosed(self.sock_fd));
        }

        let bytes = packet.to_bytes_with(&self.settings);
        let mut output = self
            .output
            .try_lock()
            .map_err(|_| CerverError::SendBusy(self.sock_fd))?;
        let sink = output
            .as_mut()
            .ok_or(CerverError::ConnectionClosed(self.sock_fd))?;

        match tokio::time::timeout(timeout, sink.write(&bytes)).await {
            Ok(written) => written?,
            Err(_) => return Err(CerverError::SendTimeout(self.sock_fd)),
        }
        drop(output);

        self.sent(packet, bytes.len());
        Ok(bytes.len())
    }

    async fn write_locked(&self, bytes: &[u8]) -> Result<(), CerverError> {
        let mut output = self.output.lock().await;
        let sink = output
            .as_mut()
            .ok_or(CerverError::ConnectionClosed(self.sock_fd))?;
        sink.write(bytes).await?;
        Ok(())
    }

    fn sent(&self, packet: &Packet, len: usize) {
        self.stats.record_sent(packet.packet_type(), len);
        self.touch();
    }

    /// Blocking variant of [`send`](Self::send) for worker threads.
    ///
    /// Fails with [`CerverError::BlockingInRuntime`] when called from a
    /// thread that is already driving the runtime.
    pub fn send_blocking(&self, packet: &Packet) -> Result<usize, CerverError> {
        if Handle::try_current().is_ok() {
            return Err(CerverError::BlockingInRuntime);
        }

        match &self.runtime {
            Some(runtime) => runtime.block_on(self.send(packet)),
            None => Err(CerverError::NoRuntime),
        }
    }

    /// Marks the connection dropped and releases the socket.
    ///
    /// Safe to call more than once. In-flight sends are cancelled; if one of
    /// them still holds the output lock, the write half is released as soon
    /// as it lets go.
    pub fn close(self: &Arc<Self>) {
        self.set_state(ConnectionState::Dropped);
        self.closed.send_replace(true);

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }

        match self.output.try_lock() {
            Ok(mut output) => {
                output.take();
            }
            Err(_) => {
                if let Some(runtime) = &self.runtime {
                    let connection = Arc::clone(self);
                    runtime.spawn(async move {
                        connection.output.lock().await.take();
                    });
                }
            }
        }
    }
}

/// Resolves once the connection is closed.
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("sock_fd", &self.sock_fd)
            .field("protocol", &self.protocol)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("auth_tries", &self.auth_tries())
            .field("bad_packets", &self.bad_packets())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use shared::{FrameBuffer, FrameLimits, PacketType};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// A connection over a real loopback socket plus the peer's end.
    pub(crate) async fn tcp_pair(sock_fd: u64) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let (_read, write) = stream.into_split();

        let connection = Connection::new(
            SockFd(sock_fd),
            peer_addr,
            Sink::Tcp(write),
            ProtocolSettings::default(),
            3,
        );
        (Arc::new(connection), peer)
    }

    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut frames = FrameBuffer::new();
        let mut buf = [0u8; 256];
        loop {
            if let Some(packet) = frames.next_packet(&FrameLimits::default()).unwrap() {
                return packet;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed");
            frames.push(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_send_writes_framed_packet() {
        let (connection, mut peer) = tcp_pair(1).await;
        let packet = Packet::new(PacketType::App, b"pong".to_vec());

        let written = connection.send(&packet).await.unwrap();
        assert_eq!(written, packet.wire_size());
        assert_eq!(read_packet(&mut peer).await, packet);

        let stats = connection.stats_snapshot();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, written as u64);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_sends() {
        let (connection, mut peer) = tcp_pair(2).await;
        connection.close();
        assert!(connection.is_dropped());

        let err = connection
            .send(&Packet::new(PacketType::App, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, CerverError::ConnectionClosed(SockFd(2))));

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (connection, _peer) = tcp_pair(3).await;
        assert_eq!(connection.state(), ConnectionState::OnHold);
        assert!(connection.is_on_hold());

        assert!(connection.transition(ConnectionState::OnHold, ConnectionState::Authenticating));
        assert!(!connection.transition(ConnectionState::OnHold, ConnectionState::Active));
        assert!(connection.transition(ConnectionState::Authenticating, ConnectionState::Active));
        assert!(connection.is_active());
    }

    #[tokio::test]
    async fn test_auth_tries_and_bad_packets() {
        let (connection, _peer) = tcp_pair(4).await;
        assert_eq!(connection.auth_tries(), 3);
        assert_eq!(connection.consume_auth_try(), 2);
        assert_eq!(connection.consume_auth_try(), 1);
        assert_eq!(connection.consume_auth_try(), 0);
        assert_eq!(connection.consume_auth_try(), 0);

        assert_eq!(connection.add_bad_packet(), 1);
        assert_eq!(connection.add_bad_packet(), 2);
        assert_eq!(connection.bad_packets(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_send_from_plain_thread() {
        let (connection, mut peer) = tcp_pair(5).await;
        let packet = Packet::new(PacketType::App, b"from worker".to_vec());

        let sender = Arc::clone(&connection);
        let expected = packet.clone();
        let worker = std::thread::spawn(move || sender.send_blocking(&expected));

        assert_eq!(read_packet(&mut peer).await, packet);
        assert!(worker.join().unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_cancels_stalled_send() {
        let (connection, _peer) = tcp_pair(7).await;
        let packet = Packet::new(PacketType::App, vec![0u8; 32 * 1024 * 1024]);

        let sender = Arc::clone(&connection);
        let worker = std::thread::spawn(move || sender.send_blocking(&packet));
        tokio::time::sleep(Duration::from_millis(100)).await;
        connection.close();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || worker.join().unwrap()),
        )
        .await
        .expect("stalled send was not cancelled")
        .unwrap();
        assert!(matches!(result, Err(CerverError::ConnectionClosed(SockFd(7)))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_now_does_not_wait_for_other_senders() {
        let (connection, _peer) = tcp_pair(8).await;

        let sender = Arc::clone(&connection);
        let stalled = tokio::spawn(async move {
            let big = Packet::new(PacketType::App, vec![0u8; 32 * 1024 * 1024]);
            sender.send(&big).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let small = Packet::new(PacketType::Error, b"bad".to_vec());
        let err = connection
            .send_now(&small, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CerverError::SendBusy(SockFd(8))));

        connection.close();
        assert!(stalled.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_send_now_times_out_on_a_peer_that_does_not_read() {
        let (connection, _peer) = tcp_pair(9).await;
        let big = Packet::new(PacketType::App, vec![0u8; 32 * 1024 * 1024]);

        let err = connection
            .send_now(&big, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CerverError::SendTimeout(SockFd(9))));
    }

    #[tokio::test]
    async fn test_traffic_resets_idle_time() {
        let (connection, mut peer) = tcp_pair(10).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(connection.idle_for() >= Duration::from_millis(50));

        connection
            .send(&Packet::new(PacketType::App, b"hi".to_vec()))
            .await
            .unwrap();
        read_packet(&mut peer).await;
        assert!(connection.idle_for() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocking_send_inside_runtime_is_refused() {
        let (connection, _peer) = tcp_pair(6).await;
        let err = connection
            .send_blocking(&Packet::new(PacketType::App, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, CerverError::BlockingInRuntime));
    }
}
