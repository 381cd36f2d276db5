//! Bounded FIFO of jobs shared between the multiplexer and the worker pool
//!
//! The multiplexer pushes one job per completed packet and never waits on
//! application code: a push either succeeds right away or fails according to
//! the configured [`QueuePolicy`]. Workers pull jobs, sleeping on a
//! [`BinarySignal`] while the queue is empty.
//!
//! Jobs may carry an ordering key. At most one job per key is handed out at a
//! time, and jobs sharing a key are handed out in push order, so the packets
//! of one connection reach its handlers in the order they arrived while
//! other connections keep every worker busy.
//!
//! The backing `VecDeque` keeps its allocation when drained, so steady-state
//! traffic reuses the same slots instead of allocating per job.

use crate::bsem::BinarySignal;
use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How long an idle worker sleeps before re-checking its stop/end flags.
const IDLE_RECHECK: Duration = Duration::from_millis(50);

/// What `push` does when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePolicy {
    /// Fail immediately with [`QueueError::Full`].
    Reject,
    /// Wait up to `timeout_ms` for a worker to free a slot.
    Block { timeout_ms: u64 },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Reject
    }
}

/// One unit of dispatched work.
pub struct Job {
    id: u64,
    key: Option<u64>,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Job {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: 0,
            key: None,
            work: Box::new(work),
        }
    }

    /// A job that never runs alongside another job with the same key.
    pub fn keyed<F>(key: u64, work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            key: Some(key),
            ..Self::new(work)
        }
    }

    /// Sequence number assigned by the queue on push.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> Option<u64> {
        self.key
    }

    pub fn run(self) {
        (self.work)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Result of a worker's [`JobQueue::pull`].
#[derive(Debug)]
pub enum Pulled {
    Job(Job),
    /// The worker's stop flag is set; it should idle without pulling.
    Stop,
    /// The worker's end flag is set or the queue was closed.
    End,
}

#[derive(Default)]
struct QueueInner {
    jobs: VecDeque<Job>,
    /// Keys with a job currently handed out.
    busy: HashSet<u64>,
    closed: bool,
}

impl QueueInner {
    /// Removes the oldest job whose key is not busy and marks its key.
    fn take_ready(&mut self) -> Option<Job> {
        let busy = &self.busy;
        let index = self
            .jobs
            .iter()
            .position(|job| job.key.map_or(true, |key| !busy.contains(&key)))?;
        let job = self.jobs.remove(index)?;
        if let Some(key) = job.key {
            self.busy.insert(key);
        }
        Some(job)
    }
}

pub struct JobQueue {
    inner: Mutex<QueueInner>,
    space: Condvar,
    has_jobs: BinarySignal,
    capacity: Option<usize>,
    policy: QueuePolicy,
    next_id: AtomicU64,
}

impl JobQueue {
    /// Creates a queue; `capacity: None` means unbounded.
    pub fn new(capacity: Option<usize>, policy: QueuePolicy) -> Self {
        let jobs = match capacity {
            Some(capacity) => VecDeque::with_capacity(capacity),
            None => VecDeque::new(),
        };

        Self {
            inner: Mutex::new(QueueInner {
                jobs,
                busy: HashSet::new(),
                closed: false,
            }),
            space: Condvar::new(),
            has_jobs: BinarySignal::new(false),
            capacity,
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, QueuePolicy::Reject)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Enqueues a job and wakes one idle worker.
    ///
    /// Returns the id assigned to the job.
    pub fn push(&self, mut job: Job) -> Result<u64, QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        if let Some(capacity) = self.capacity {
            if inner.jobs.len() >= capacity {
                inner = match self.policy {
                    QueuePolicy::Reject => return Err(QueueError::Full { capacity }),
                    QueuePolicy::Block { timeout_ms } => {
                        let (inner, _) = self
                            .space
                            .wait_timeout_while(
                                inner,
                                Duration::from_millis(timeout_ms),
                                |inner| !inner.closed && inner.jobs.len() >= capacity,
                            )
                            .unwrap_or_else(PoisonError::into_inner);

                        if inner.closed {
                            return Err(QueueError::Closed);
                        }
                        if inner.jobs.len() >= capacity {
                            return Err(QueueError::Timeout { timeout_ms });
                        }
                        inner
                    }
                };
            }
        }

        job.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = job.id;
        inner.jobs.push_back(job);
        drop(inner);

        self.has_jobs.post();
        Ok(id)
    }

    /// Blocks until a job is available or the caller is told to stop or end.
    ///
    /// The flags are checked before the queue, so a stopped worker never takes
    /// new work even while jobs are pending. A keyed job stays queued while
    /// another job with its key is out; the caller must report it back with
    /// [`finish`](Self::finish) once it has run.
    pub fn pull(&self, stop: &AtomicBool, end: &AtomicBool) -> Pulled {
        loop {
            if end.load(Ordering::Acquire) {
                return Pulled::End;
            }
            if stop.load(Ordering::Acquire) {
                return Pulled::Stop;
            }

            {
                let mut inner = self.lock();
                if let Some(job) = inner.take_ready() {
                    // Pass the wakeup on so a second idle worker picks up the rest.
                    if !inner.jobs.is_empty() {
                        self.has_jobs.post();
                    }
                    drop(inner);
                    self.space.notify_one();
                    return Pulled::Job(job);
                }
                if inner.closed {
                    return Pulled::End;
                }
            }

            self.has_jobs.wait_timeout(IDLE_RECHECK);
        }
    }

    /// Non-blocking pull, used when draining. Keyed jobs must be finished
    /// like pulled ones.
    pub fn try_pull(&self) -> Option<Job> {
        let job = self.lock().take_ready();
        if job.is_some() {
            self.space.notify_one();
        }
        job
    }

    /// Releases the key of a job that has run, letting the next job with the
    /// same key be pulled.
    pub fn finish(&self, key: u64) {
        let waiting = {
            let mut inner = self.lock();
            inner.busy.remove(&key);
            inner.jobs.iter().any(|job| job.key == Some(key))
        };

        if waiting {
            self.has_jobs.post();
        }
    }

    /// Wakes every idle worker so it re-checks its flags.
    pub fn wake_all(&self) {
        self.has_jobs.post_all();
    }

    /// Rejects further pushes, wakes blocked pushers and idle workers.
    ///
    /// Jobs still queued are dropped and their count returned.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.lock();
            inner.closed = true;
            let discarded = inner.jobs.len();
            inner.jobs.clear();
            inner.busy.clear();
            discarded
        };

        self.space.notify_all();
        self.has_jobs.post_all();
        discarded
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}
