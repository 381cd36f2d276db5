use cerver::{
    AuthAttempt, AuthVerdict, Cerver, CerverConfig, CerverEvent, CerverEventType, EventOptions,
    HandlerKey, HandlerResult, JobQueueConfig, PacketContext, Protocol, QueuePolicy,
};
use clap::Parser;
use log::{info, warn};
use shared::PacketType;

/// Command line arguments, mapped onto [`CerverConfig`].
#[derive(Parser, Debug)]
#[clap(author, version, about = "Echo cerver")]
struct Args {
    /// Name used in logs and in the greeting sent to clients
    #[clap(short, long, default_value = "cerver")]
    name: String,
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "7000")]
    port: u16,
    /// Serve datagrams instead of streams
    #[clap(long)]
    udp: bool,
    /// Number of worker threads
    #[clap(short, long, default_value = "4")]
    workers: usize,
    /// Require clients to send this secret before anything else
    #[clap(short, long)]
    secret: Option<String>,
    /// Let several connections share one client through a session token
    #[clap(long)]
    sessions: bool,
    /// Failed auth attempts before a connection is dropped
    #[clap(long, default_value = "3")]
    max_auth_tries: u32,
    /// Jobs queued before new packets are rejected
    #[clap(long, default_value = "1024")]
    queue_capacity: usize,
    /// Wait this long for queue space instead of rejecting right away
    #[clap(long)]
    queue_wait_ms: Option<u64>,
    /// Message sent to every new connection
    #[clap(long)]
    welcome: Option<String>,
}

impl Args {
    fn config(&self) -> CerverConfig {
        let policy = match self.queue_wait_ms {
            Some(timeout_ms) => QueuePolicy::Block { timeout_ms },
            None => QueuePolicy::Reject,
        };

        CerverConfig {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            protocol: if self.udp { Protocol::Udp } else { Protocol::Tcp },
            auth_required: self.secret.is_some(),
            max_auth_tries: self.max_auth_tries,
            use_sessions: self.sessions,
            n_workers: self.workers,
            job_queue: JobQueueConfig {
                capacity: Some(self.queue_capacity),
                policy,
            },
            welcome_message: self.welcome.clone(),
            ..CerverConfig::default()
        }
    }
}

fn log_event(event: &CerverEvent) {
    match (event.client_id, event.sock_fd) {
        (Some(client), Some(sock_fd)) => info!("[{:?}] {} on {}", event.event_type, client, sock_fd),
        (Some(client), None) => info!("[{:?}] {}", event.event_type, client),
        (None, Some(sock_fd)) => info!("[{:?}] {}", event.event_type, sock_fd),
        (None, None) => info!("[{:?}] {}", event.event_type, event.cerver_name),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let cerver = Cerver::new(args.config())?;

    if let Some(secret) = args.secret.clone() {
        cerver.set_auth_method(move |attempt: &AuthAttempt| {
            if attempt.credentials == secret.as_bytes() {
                AuthVerdict::accept()
            } else {
                warn!("rejected credentials from {}", attempt.peer_addr);
                AuthVerdict::reject("wrong secret")
            }
        });
    }

    cerver.register_handler(
        HandlerKey::Type(PacketType::App),
        |ctx: &PacketContext| -> HandlerResult {
            ctx.reply(PacketType::App, ctx.payload().to_vec())?;
            Ok(())
        },
    );

    for event_type in [
        CerverEventType::ClientConnected,
        CerverEventType::ClientNewConnection,
        CerverEventType::ClientDisconnected,
        CerverEventType::ClientDropped,
        CerverEventType::ClientFailedAuth,
        CerverEventType::OnHoldDropped,
    ] {
        cerver.register_event(event_type, log_event, EventOptions::default());
    }

    let handle = cerver.start().await?;
    println!("{} listening on {}", cerver.name(), handle.local_addr());

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down gracefully...");

    let stats = cerver.stats();
    handle.teardown().await;
    info!(
        "served {} connections, {} packets in, {} packets out",
        stats.connections_accepted, stats.traffic.packets_received, stats.traffic.packets_sent
    );

    Ok(())
}
