use crate::error::ClientError;
use log::{debug, info, trace, warn};
use shared::{
    auth_credentials_packet, auth_token_packet, client_request_packet, test_packet,
    AuthSuccessPayload, CerverInfo, ClientRequest, ErrorPayload, ErrorType, FrameBuffer,
    FrameLimits, Packet, PacketType,
};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, ToSocketAddrs, UdpSocket};
use tokio::time::timeout;

const READ_BUFFER_SIZE: usize = 65_536;

/// How long `close_connection` and `disconnect` wait for the cerver to hang up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of an AUTH exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { session_id: Option<String> },
    Rejected { message: String },
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// One connection to a cerver.
pub struct CerverConnection {
    transport: Transport,
    peer_addr: SocketAddr,
    frames: FrameBuffer,
    limits: FrameLimits,
    read_buf: Vec<u8>,
    info: Option<CerverInfo>,
    session_id: Option<String>,
}

impl CerverConnection {
    /// Connects over TCP and reads the cerver's greeting.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        Self::connect_with(addr, FrameLimits::default()).await
    }

    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        limits: FrameLimits,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;

        let mut connection = Self::new(Transport::Tcp(stream), peer_addr, limits);
        let greeting = connection.recv().await?;
        let info = CerverInfo::from_packet(&greeting)?;
        info!(
            "Connected to {} at {} (auth {})",
            info.name,
            peer_addr,
            if info.auth_required { "required" } else { "off" }
        );
        connection.info = Some(info);
        Ok(connection)
    }

    /// Opens a UDP association. UDP cervers only learn about a peer from its
    /// first datagram, so a TEST packet is sent to get the greeting. A cerver
    /// that requires auth counts it as one ignored packet.
    pub async fn connect_udp(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let peer_addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
        let local: SocketAddr = if peer_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer_addr).await?;

        let mut connection = Self::new(Transport::Udp(socket), peer_addr, FrameLimits::default());
        connection.send(&test_packet()).await?;

        let info = CerverInfo::from_packet(&connection.recv().await?)?;
        if !info.auth_required {
            connection.expect(PacketType::Test).await?;
        }
        debug!("UDP association with {} ({})", info.name, peer_addr);
        connection.info = Some(info);
        Ok(connection)
    }

    fn new(transport: Transport, peer_addr: SocketAddr, limits: FrameLimits) -> Self {
        Self {
            transport,
            peer_addr,
            frames: FrameBuffer::new(),
            limits,
            read_buf: vec![0; READ_BUFFER_SIZE],
            info: None,
            session_id: None,
        }
    }

    /// The greeting the cerver sent when the connection was accepted.
    pub fn info(&self) -> Option<&CerverInfo> {
        self.info.as_ref()
    }

    /// Session token handed out on a successful auth, if sessions are on.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(match &self.transport {
            Transport::Tcp(stream) => stream.local_addr()?,
            Transport::Udp(socket) => socket.local_addr()?,
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let bytes = packet.to_bytes_with(&self.limits.settings);
        trace!("Sending {} packet ({} bytes)", packet.packet_type(), bytes.len());
        self.send_raw(&bytes).await
    }

    /// Writes bytes as they are. Used to send partial or malformed packets.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let written = match &mut self.transport {
            Transport::Tcp(stream) => stream.write_all(bytes).await,
            Transport::Udp(socket) => socket.send(bytes).await.map(|_| ()),
        };
        written.map_err(closed_or_io)
    }

    pub async fn send_app(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.send(&Packet::new(PacketType::App, payload.to_vec())).await
    }

    /// Sends a packet whose payload starts with a request type.
    pub async fn request(
        &mut self,
        packet_type: PacketType,
        request: u32,
        body: &[u8],
    ) -> Result<(), ClientError> {
        self.send(&Packet::request(packet_type, request, body)).await
    }

    /// Waits for the next complete packet.
    pub async fn recv(&mut self) -> Result<Packet, ClientError> {
        loop {
            if let Some(packet) = self.frames.next_packet(&self.limits)? {
                trace!("Received {} packet", packet.packet_type());
                return Ok(packet);
            }

            let read = match &mut self.transport {
                Transport::Tcp(stream) => stream.read(&mut self.read_buf).await,
                Transport::Udp(socket) => socket.recv(&mut self.read_buf).await,
            };
            let n = read.map_err(closed_or_io)?;
            if n == 0 && matches!(self.transport, Transport::Tcp(_)) {
                return Err(ClientError::Closed);
            }
            self.frames.push(&self.read_buf[..n]);
        }
    }

    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Packet, ClientError> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    /// Next packet, which must be of `packet_type`. ERROR packets are turned
    /// into [`ClientError::Server`].
    pub async fn expect(&mut self, packet_type: PacketType) -> Result<Packet, ClientError> {
        let packet = self.recv().await?;
        if packet.packet_type() == packet_type {
            return Ok(packet);
        }
        if packet.packet_type() == PacketType::Error {
            let error = ErrorPayload::from_packet(&packet)?;
            return Err(ClientError::Server {
                error_type: error.error_type,
                message: error.message,
            });
        }
        Err(ClientError::Unexpected(packet.packet_type()))
    }

    pub async fn authenticate(&mut self, credentials: &[u8]) -> Result<AuthOutcome, ClientError> {
        self.send(&auth_credentials_packet(credentials)).await?;
        self.auth_reply().await
    }

    /// Joins the client that owns `token`.
    pub async fn authenticate_with_token(&mut self, token: &str) -> Result<AuthOutcome, ClientError> {
        self.send(&auth_token_packet(token)).await?;
        self.auth_reply().await
    }

    async fn auth_reply(&mut self) -> Result<AuthOutcome, ClientError> {
        let packet = self.recv().await?;
        match packet.packet_type() {
            PacketType::Auth => {
                let success = AuthSuccessPayload::from_packet(&packet)?;
                info!("Authenticated with {}", self.peer_addr);
                self.session_id = success.session_id.clone();
                Ok(AuthOutcome::Accepted {
                    session_id: success.session_id,
                })
            }
            PacketType::Error => {
                let error = ErrorPayload::from_packet(&packet)?;
                match error.error_type {
                    ErrorType::FailedAuth => {
                        warn!("Authentication rejected: {}", error.message);
                        Ok(AuthOutcome::Rejected {
                            message: error.message,
                        })
                    }
                    error_type => Err(ClientError::Server {
                        error_type,
                        message: error.message,
                    }),
                }
            }
            other => Err(ClientError::Unexpected(other)),
        }
    }

    /// Sends a TEST packet and waits for the echo. Returns the round trip.
    pub async fn test(&mut self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.send(&test_packet()).await?;
        self.expect(PacketType::Test).await?;
        Ok(started.elapsed())
    }

    /// Asks the cerver to close this connection only. Other connections of
    /// the same client stay open.
    pub async fn close_connection(self) -> Result<(), ClientError> {
        self.hang_up(ClientRequest::CloseConnection).await
    }

    /// Asks the cerver to drop the whole client.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        self.hang_up(ClientRequest::Disconnect).await
    }

    async fn hang_up(mut self, request: ClientRequest) -> Result<(), ClientError> {
        self.send(&client_request_packet(request)).await?;
        if let Transport::Udp(_) = self.transport {
            return Ok(());
        }

        loop {
            match self.recv_timeout(CLOSE_TIMEOUT).await {
                Ok(packet) => debug!("Discarding {} packet while closing", packet.packet_type()),
                Err(ClientError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for CerverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CerverConnection")
            .field("peer_addr", &self.peer_addr)
            .field("info", &self.info)
            .field("session_id", &self.session_id)
            .finish()
    }
}

fn closed_or_io(e: io::Error) -> ClientError {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ClientError::Closed,
        _ => ClientError::Io(e),
    }
}
