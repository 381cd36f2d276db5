//! Socket keys and recycled receive buffers
//!
//! Owned by the multiplexer. Keys come from a counter and are never reused;
//! receive buffers of dropped connections go back to a free list so their
//! allocations serve the next connection.

use crate::connection::SockFd;
use shared::FrameBuffer;

#[derive(Debug)]
pub struct SocketPool {
    next_sock_fd: u64,
    free: Vec<FrameBuffer>,
    max_pooled: usize,
    buffer_capacity: usize,
}

impl SocketPool {
    pub fn new(max_pooled: usize, buffer_capacity: usize) -> Self {
        Self {
            next_sock_fd: 1,
            free: Vec::with_capacity(max_pooled.min(64)),
            max_pooled,
            buffer_capacity,
        }
    }

    pub fn next_sock_fd(&mut self) -> SockFd {
        let sock_fd = SockFd(self.next_sock_fd);
        self.next_sock_fd += 1;
        sock_fd
    }

    /// A cleared receive buffer, recycled when one is available.
    pub fn acquire(&mut self) -> FrameBuffer {
        self.free
            .pop()
            .unwrap_or_else(|| FrameBuffer::with_capacity(self.buffer_capacity))
    }

    pub fn release(&mut self, mut buffer: FrameBuffer) {
        if self.free.len() < self.max_pooled {
            buffer.clear();
            self.free.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_fds_are_never_reused() {
        let mut pool = SocketPool::new(4, 64);
        let first = pool.next_sock_fd();
        let second = pool.next_sock_fd();
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn test_released_buffers_are_recycled_clean() {
        let mut pool = SocketPool::new(1, 16);
        let mut buffer = pool.acquire();
        buffer.push(&[0u8; 512]);
        let capacity = buffer.capacity();

        pool.release(buffer);
        assert_eq!(pool.pooled(), 1);

        let recycled = pool.acquire();
        assert!(recycled.is_empty());
        assert_eq!(recycled.capacity(), capacity);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn test_pool_size_is_capped() {
        let mut pool = SocketPool::new(2, 16);
        for _ in 0..5 {
            pool.release(FrameBuffer::new());
        }
        assert_eq!(pool.pooled(), 2);
    }
}
