use clap::Parser;
use client::{AuthOutcome, CerverConnection, ClientError};
use log::{info, warn};
use shared::PacketType;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cerver address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7000")]
    server: String,

    /// Credentials for cervers that require auth
    #[arg(short = 'c', long)]
    credentials: Option<String>,

    /// Number of app packets to send
    #[arg(short = 'n', long, default_value = "5")]
    count: usize,

    /// Payload of each app packet
    #[arg(short = 'm', long, default_value = "hello")]
    message: String,

    /// Use UDP instead of TCP
    #[arg(long)]
    udp: bool,

    /// Seconds to wait for each reply
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let reply_timeout = Duration::from_secs(args.timeout);

    info!("Connecting to: {}", args.server);
    let mut connection = if args.udp {
        CerverConnection::connect_udp(&args.server).await?
    } else {
        CerverConnection::connect(&args.server).await?
    };

    if let Some(info) = connection.info() {
        println!("Connected to {}", info.name);
        if let Some(welcome) = &info.welcome_message {
            println!("{}", welcome);
        }
    }

    if connection.info().map_or(false, |info| info.auth_required) {
        let credentials = args.credentials.clone().unwrap_or_default();
        match connection.authenticate(credentials.as_bytes()).await? {
            AuthOutcome::Accepted { session_id } => match session_id {
                Some(session_id) => println!("Authenticated, session {}", session_id),
                None => println!("Authenticated"),
            },
            AuthOutcome::Rejected { message } => {
                eprintln!("Authentication failed: {}", message);
                return Ok(());
            }
        }
    }

    let round_trip = connection.test().await?;
    println!("Round trip: {:?}", round_trip);

    for i in 0..args.count {
        let payload = format!("{} {}", args.message, i);
        connection.send_app(payload.as_bytes()).await?;

        match connection.recv_timeout(reply_timeout).await {
            Ok(reply) if reply.packet_type() == PacketType::App => {
                println!("{}", String::from_utf8_lossy(&reply.payload));
            }
            Ok(reply) => warn!("Unexpected {} packet", reply.packet_type()),
            Err(ClientError::Timeout(_)) => warn!("No reply to packet {}", i),
            Err(e) => return Err(e.into()),
        }
    }

    connection.disconnect().await?;
    info!("Disconnected");
    Ok(())
}
