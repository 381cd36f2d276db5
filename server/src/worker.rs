//! Fixed pool of OS threads executing jobs from a shared [`JobQueue`]
//!
//! Each worker runs a small state machine:
//!
//! ```text
//! None -> Available <-> Working
//!             |   ^
//!             v   |
//!           Stopped        (any) -> Ended
//! ```
//!
//! `stop` quiesces a worker after its in-flight job; `resume` brings it back.
//! `end` is terminal: the thread exits and is joined. A panicking job is
//! caught at the job boundary so the worker survives it, and its ordering
//! key is released either way.

use crate::bsem::BinarySignal;
use crate::error::CerverError;
use crate::job_queue::{Job, JobQueue, Pulled};
use log::{debug, error, info, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    None,
    Available,
    Working,
    Stopped,
    Ended,
}

/// Shared between a worker thread and the pool.
struct WorkerControl {
    id: usize,
    state: Mutex<WorkerState>,
    stop: AtomicBool,
    end: AtomicBool,
    resume: BinarySignal,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerControl {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(WorkerState::None),
            stop: AtomicBool::new(false),
            end: AtomicBool::new(false),
            resume: BinarySignal::new(false),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        }
    }

    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

struct Worker {
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    name: String,
    queue: Arc<JobQueue>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawns `n_workers` threads named `{name}-worker-{id}`.
    pub fn start(name: &str, n_workers: usize, queue: Arc<JobQueue>) -> Result<Self, CerverError> {
        let mut pool = Self {
            name: name.to_string(),
            queue,
            workers: Vec::with_capacity(n_workers),
        };

        for id in 0..n_workers {
            let control = Arc::new(WorkerControl::new(id));
            let thread_control = Arc::clone(&control);
            let thread_queue = Arc::clone(&pool.queue);

            // On spawn failure, dropping `pool` ends the workers already started.
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{}", name, id))
                .spawn(move || worker_loop(thread_control, thread_queue))?;

            pool.workers.push(Worker {
                control,
                thread: Some(thread),
            });
        }

        info!("{}: started {} workers", name, n_workers);
        Ok(pool)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn push(&self, job: Job) -> Result<u64, CerverError> {
        Ok(self.queue.push(job)?)
    }

    pub fn worker_state(&self, id: usize) -> Option<WorkerState> {
        self.workers.get(id).map(|worker| worker.control.state())
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.control.state()).collect()
    }

    pub fn n_working(&self) -> usize {
        self.states()
            .into_iter()
            .filter(|state| *state == WorkerState::Working)
            .count()
    }

    pub fn jobs_completed(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.control.completed.load(Ordering::Relaxed))
            .sum()
    }

    pub fn jobs_panicked(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.control.panicked.load(Ordering::Relaxed))
            .sum()
    }

    /// Quiesces one worker. Its in-flight job, if any, runs to completion.
    pub fn stop_worker(&self, id: usize) -> bool {
        match self.workers.get(id) {
            Some(worker) => {
                worker.control.stop.store(true, Ordering::Release);
                self.queue.wake_all();
                true
            }
            None => false,
        }
    }

    pub fn resume_worker(&self, id: usize) -> bool {
        match self.workers.get(id) {
            Some(worker) => {
                worker.control.stop.store(false, Ordering::Release);
                worker.control.resume.post();
                true
            }
            None => false,
        }
    }

    /// Ends every worker and joins the threads. Pending jobs are discarded.
    pub fn end(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        for worker in &self.workers {
            worker.control.end.store(true, Ordering::Release);
            worker.control.resume.post();
        }

        let discarded = self.queue.close();
        if discarded > 0 {
            warn!("{}: discarded {} queued jobs on end", self.name, discarded);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("{}: worker {} panicked on exit", self.name, worker.control.id);
                }
            }
        }

        info!("{}: all workers ended", self.name);
        self.workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("states", &self.states())
            .field("queue", &self.queue)
            .finish()
    }
}

fn worker_loop(control: Arc<WorkerControl>, queue: Arc<JobQueue>) {
    control.set_state(WorkerState::Available);
    debug!("worker {} available", control.id);

    loop {
        match queue.pull(&control.stop, &control.end) {
            Pulled::Job(job) => {
                control.set_state(WorkerState::Working);
                let job_id = job.id();
                let key = job.key();

                match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                    Ok(()) => {
                        control.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(payload) => {
                        control.panicked.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "worker {}: job {} panicked: {}",
                            control.id,
                            job_id,
                            panic_message(payload.as_ref())
                        );
                    }
                }
                if let Some(key) = key {
                    queue.finish(key);
                }

                control.set_state(WorkerState::Available);
            }
            Pulled::Stop => {
                control.set_state(WorkerState::Stopped);
                debug!("worker {} stopped", control.id);

                while control.stop.load(Ordering::Acquire) && !control.end.load(Ordering::Acquire)
                {
                    control.resume.wait_timeout(Duration::from_millis(100));
                }

                if !control.end.load(Ordering::Acquire) {
                    control.set_state(WorkerState::Available);
                    debug!("worker {} resumed", control.id);
                }
            }
            Pulled::End => break,
        }
    }

    control.set_state(WorkerState::Ended);
    debug!("worker {} ended", control.id);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
