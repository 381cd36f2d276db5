//! Round-robin front door for several running cervers.
//!
//! The balancer only accepts. Each accepted stream is handed whole to the
//! next backend, which greets it, frames it and authenticates it exactly as
//! if its own listener had accepted it.

use crate::cerver::CerverHandle;
use crate::error::CerverError;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct Balancer {
    name: String,
    listener: TcpListener,
    backends: Vec<CerverHandle>,
    next: AtomicUsize,
    shutdown: Notify,
}

impl Balancer {
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        backends: Vec<CerverHandle>,
    ) -> Result<Self, CerverError> {
        let name = name.into();
        if backends.is_empty() {
            return Err(CerverError::Configuration(format!(
                "balancer {} needs at least one backend",
                name
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        info!(
            "{}: balancing {} on {} over {} cervers",
            name,
            addr,
            listener.local_addr()?,
            backends.len()
        );

        Ok(Self {
            name,
            listener,
            backends,
            next: AtomicUsize::new(0),
            shutdown: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CerverError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn backends(&self) -> &[CerverHandle] {
        &self.backends
    }

    /// Index of the backend that gets the next connection.
    pub fn next_backend(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len()
    }

    /// Accepts one connection and forwards it. Returns the backend index.
    pub async fn accept_one(&self) -> Result<usize, CerverError> {
        let (stream, peer) = self.listener.accept().await?;
        let index = self.next_backend();
        let backend = &self.backends[index];

        backend.adopt_connection(stream).await?;
        info!(
            "{}: {} -> {} ({})",
            self.name,
            peer,
            backend.cerver().name(),
            backend.local_addr()
        );
        Ok(index)
    }

    /// Forwards connections until [`Balancer::shutdown`] is called.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                forwarded = self.accept_one() => {
                    if let Err(e) = forwarded {
                        match e {
                            CerverError::NotRunning => warn!("{}: backend is gone: {}", self.name, e),
                            _ => error!("{}: failed to forward connection: {}", self.name, e),
                        }
                        // Accept errors such as EMFILE repeat immediately.
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
        info!("{}: stopped", self.name);
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Tears down every backend.
    pub async fn teardown(self) {
        for backend in self.backends {
            backend.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cerver, CerverConfig};
    use tokio_test::assert_err;

    async fn backend(name: &str) -> CerverHandle {
        let cerver = Cerver::new(CerverConfig {
            name: name.to_string(),
            port: 0,
            n_workers: 1,
            ..CerverConfig::default()
        })
        .unwrap();
        cerver.start().await.unwrap()
    }

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_requires_backends() {
        assert_err!(Balancer::bind("empty", any_port(), Vec::new()).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_order() {
        let balancer = Balancer::bind(
            "lb",
            any_port(),
            vec![backend("a").await, backend("b").await, backend("c").await],
        )
        .await
        .unwrap();

        let picks: Vec<usize> = (0..6).map(|_| balancer.next_backend()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);

        balancer.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_survives_a_dead_backend() {
        let balancer = std::sync::Arc::new(
            Balancer::bind("lb", any_port(), vec![backend("dead").await])
                .await
                .unwrap(),
        );
        let addr = balancer.local_addr().unwrap();
        let dead = &balancer.backends()[0];
        dead.shutdown();
        while !dead.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let running = {
            let balancer = std::sync::Arc::clone(&balancer);
            tokio::spawn(async move { balancer.run().await })
        };

        let mut peers = Vec::new();
        for _ in 0..5 {
            peers.push(tokio::net::TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!running.is_finished());

        balancer.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_accepted_stream_lands_on_backend() {
        let balancer = Balancer::bind("lb", any_port(), vec![backend("a").await, backend("b").await])
            .await
            .unwrap();
        let addr = balancer.local_addr().unwrap();

        let _first = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert_eq!(balancer.accept_one().await.unwrap(), 0);
        let _second = tokio::net::TcpStream::connect(addr).await.unwrap();
        assert_eq!(balancer.accept_one().await.unwrap(), 1);

        for _ in 0..100 {
            let counts: Vec<usize> = balancer
                .backends()
                .iter()
                .map(|b| b.cerver().registry().n_clients())
                .collect();
            if counts == [1, 1] {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        for backend in balancer.backends() {
            assert_eq!(backend.cerver().registry().n_clients(), 1);
        }

        balancer.teardown().await;
    }
}
