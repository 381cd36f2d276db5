//! Throughput smoke checks for the hot paths of the cerver
//!
//! Bounds are generous; these catch pathological regressions, not small ones.

use cerver::{Cerver, CerverConfig, HandlerKey, HandlerResult, Job, JobQueue, PacketContext, QueuePolicy, WorkerPool};
use client::CerverConnection;
use shared::{FrameBuffer, FrameLimits, Packet, PacketHeader, PacketType, ProtocolSettings};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmarks header encoding and decoding
#[test]
fn benchmark_header_codec() {
    let settings = ProtocolSettings::default();
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let header = PacketHeader::new(&settings, PacketType::App, i % 1024);
        let bytes = header.to_bytes();
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.payload_size(), i % 1024);
    }

    let duration = start.elapsed();
    println!(
        "Header codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks reassembly of a stream fed in awkward chunk sizes
#[test]
fn benchmark_frame_reassembly() {
    let packets: Vec<Packet> = (0..10_000)
        .map(|i| Packet::new(PacketType::App, vec![(i % 256) as u8; 64 + i % 200]))
        .collect();
    let stream: Vec<u8> = packets.iter().flat_map(|p| p.to_bytes()).collect();
    let limits = FrameLimits::default();

    let start = Instant::now();
    let mut frames = FrameBuffer::with_capacity(4096);
    let mut decoded = 0;
    for chunk in stream.chunks(1_337) {
        frames.push(chunk);
        while let Some(packet) = frames.next_packet(&limits).unwrap() {
            assert_eq!(packet, packets[decoded]);
            decoded += 1;
        }
    }
    let duration = start.elapsed();

    println!(
        "Frame reassembly: {} packets ({} bytes) in {:?}",
        decoded,
        stream.len(),
        duration
    );

    assert_eq!(decoded, packets.len());
    assert!(frames.is_empty());
    assert!(duration.as_secs() < 2);
}

/// Benchmarks job throughput through the queue and worker threads
#[test]
fn benchmark_worker_pool_throughput() {
    let queue = Arc::new(JobQueue::new(None, QueuePolicy::Reject));
    let mut pool = WorkerPool::start("bench", 4, Arc::clone(&queue)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let jobs = 50_000;

    let start = Instant::now();
    for _ in 0..jobs {
        let done = Arc::clone(&done);
        pool.push(Job::new(move || {
            done.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
    }
    while done.load(Ordering::Relaxed) < jobs && start.elapsed() < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(1));
    }
    let duration = start.elapsed();
    pool.end();

    println!(
        "Worker pool: {} jobs in {:?} ({:.2} μs/job)",
        jobs,
        duration,
        duration.as_micros() as f64 / jobs as f64
    );

    assert_eq!(done.load(Ordering::Relaxed), jobs);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks request/response round trips through a live cerver
#[tokio::test(flavor = "multi_thread")]
async fn benchmark_echo_round_trips() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cerver = Cerver::new(CerverConfig {
        name: "bench".to_string(),
        port: 0,
        n_workers: 2,
        ..CerverConfig::default()
    })
    .unwrap();
    cerver.register_handler(
        HandlerKey::Type(PacketType::App),
        |ctx: &PacketContext| -> HandlerResult {
            ctx.reply(PacketType::App, ctx.payload().to_vec())?;
            Ok(())
        },
    );
    let handle = cerver.start().await.unwrap();
    let mut connection = CerverConnection::connect(handle.local_addr()).await.unwrap();

    let round_trips = 1_000;
    let start = Instant::now();
    for i in 0..round_trips {
        let payload = format!("ping {}", i);
        connection.send_app(payload.as_bytes()).await.unwrap();
        let reply = connection.recv_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply.payload, payload.into_bytes());
    }
    let duration = start.elapsed();

    println!(
        "Echo: {} round trips in {:?} ({:.2} μs/round trip)",
        round_trips,
        duration,
        duration.as_micros() as f64 / round_trips as f64
    );

    let stats = cerver.stats();
    assert!(stats.traffic.packets_received >= round_trips as u64);
    assert!(duration.as_secs() < 10);

    handle.teardown().await;
}
