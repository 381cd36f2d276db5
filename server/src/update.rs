//! Application update loops
//!
//! A cerver can run two periodic callbacks while it is up: a frame update
//! ticking a fixed number of times per second, and an interval update for
//! slower chores. Each gets its own OS thread, so a slow update never delays
//! packet handling, and each ticks once right at start.
//!
//! A tick that overruns its period is followed by the next one immediately;
//! missed ticks are not replayed.

use crate::bsem::BinarySignal;
use crate::cerver::Cerver;
use crate::error::CerverError;
use crate::worker::panic_message;
use log::{debug, error, info};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Periodic application callback.
pub trait Updater: Send + Sync {
    fn update(&self, cerver: &Cerver);
}

impl<F> Updater for F
where
    F: Fn(&Cerver) + Send + Sync,
{
    fn update(&self, cerver: &Cerver) {
        self(cerver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Ticks `fps` times per second.
    Frame { fps: u32 },
    Interval(Duration),
}

impl UpdateKind {
    pub fn period(&self) -> Duration {
        match self {
            UpdateKind::Frame { fps } => Duration::from_secs(1) / (*fps).max(1),
            UpdateKind::Interval(interval) => *interval,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            UpdateKind::Frame { .. } => "update",
            UpdateKind::Interval(_) => "update-interval",
        }
    }

    fn validate(&self) -> Result<(), CerverError> {
        match self {
            UpdateKind::Frame { fps: 0 } => Err(CerverError::Configuration(
                "update fps must be greater than 0".to_string(),
            )),
            UpdateKind::Interval(interval) if interval.is_zero() => Err(CerverError::Configuration(
                "update interval must be greater than 0".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub(crate) struct UpdateSpec {
    kind: UpdateKind,
    updater: Arc<dyn Updater>,
}

impl UpdateSpec {
    pub(crate) fn new(kind: UpdateKind, updater: Arc<dyn Updater>) -> Result<Self, CerverError> {
        kind.validate()?;
        Ok(Self { kind, updater })
    }
}

/// The two update slots of a cerver. Setting a slot replaces its callback.
#[derive(Default)]
pub(crate) struct UpdateSlots {
    frame: Mutex<Option<UpdateSpec>>,
    interval: Mutex<Option<UpdateSpec>>,
}

impl UpdateSlots {
    /// Returns true when a previous update was replaced.
    pub(crate) fn set(&self, spec: UpdateSpec) -> bool {
        let slot = match spec.kind {
            UpdateKind::Frame { .. } => &self.frame,
            UpdateKind::Interval(_) => &self.interval,
        };
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(spec)
            .is_some()
    }

    pub(crate) fn specs(&self) -> Vec<UpdateSpec> {
        [&self.frame, &self.interval]
            .iter()
            .filter_map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }
}

struct UpdateThread {
    kind: UpdateKind,
    stop: Arc<BinarySignal>,
    ticks: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

/// The running update threads of one cerver.
pub(crate) struct UpdateLoops {
    name: String,
    threads: Vec<UpdateThread>,
}

impl UpdateLoops {
    pub(crate) fn start(cerver: &Cerver, specs: Vec<UpdateSpec>) -> Result<Self, CerverError> {
        let mut loops = Self {
            name: cerver.name().to_string(),
            threads: Vec::with_capacity(specs.len()),
        };

        for spec in specs {
            let stop = Arc::new(BinarySignal::new(false));
            let ticks = Arc::new(AtomicU64::new(0));
            let kind = spec.kind;

            let thread = {
                let cerver = cerver.clone();
                let stop = Arc::clone(&stop);
                let ticks = Arc::clone(&ticks);
                thread::Builder::new()
                    .name(format!("{}-{}", cerver.name(), kind.label()))
                    .spawn(move || update_loop(cerver, spec, stop, ticks))?
            };

            info!(
                "{}: {} thread running every {:?}",
                loops.name,
                kind.label(),
                kind.period()
            );
            loops.threads.push(UpdateThread {
                kind,
                stop,
                ticks,
                thread: Some(thread),
            });
        }

        Ok(loops)
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn ticks(&self) -> Vec<(UpdateKind, u64)> {
        self.threads
            .iter()
            .map(|t| (t.kind, t.ticks.load(Ordering::Relaxed)))
            .collect()
    }

    /// Stops every loop after its current tick and joins the threads.
    pub(crate) fn end(&mut self) {
        for update in &self.threads {
            update.stop.post();
        }
        for update in &mut self.threads {
            if let Some(thread) = update.thread.take() {
                if thread.join().is_err() {
                    error!("{}: {} thread panicked on exit", self.name, update.kind.label());
                }
            }
        }
        if !self.threads.is_empty() {
            debug!("{}: update threads ended", self.name);
        }
        self.threads.clear();
    }
}

impl Drop for UpdateLoops {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for UpdateLoops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateLoops")
            .field("name", &self.name)
            .field("ticks", &self.ticks())
            .finish()
    }
}

fn update_loop(cerver: Cerver, spec: UpdateSpec, stop: Arc<BinarySignal>, ticks: Arc<AtomicU64>) {
    let period = spec.kind.period();
    let mut next_tick = Instant::now();

    loop {
        if stop.wait_timeout(next_tick.saturating_duration_since(Instant::now())) {
            break;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| spec.updater.update(&cerver))) {
            error!(
                "{}: {} panicked: {}",
                cerver.name(),
                spec.kind.label(),
                panic_message(payload.as_ref())
            );
        }
        ticks.fetch_add(1, Ordering::Relaxed);

        next_tick += period;
        let now = Instant::now();
        if next_tick < now {
            next_tick = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CerverConfig;

    fn cerver() -> Cerver {
        Cerver::new(CerverConfig {
            name: "updates".to_string(),
            ..CerverConfig::default()
        })
        .unwrap()
    }

    fn counting(kind: UpdateKind) -> (UpdateSpec, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let spec = UpdateSpec::new(
            kind,
            Arc::new(move |_: &Cerver| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (spec, count)
    }

    fn wait_for(count: &AtomicU64, at_least: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frame_update_ticks_until_ended() {
        let (spec, count) = counting(UpdateKind::Frame { fps: 100 });
        let mut loops = UpdateLoops::start(&cerver(), vec![spec]).unwrap();
        assert_eq!(loops.len(), 1);

        assert!(wait_for(&count, 5));
        loops.end();
        let after_end = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_end);
        assert_eq!(loops.len(), 0);
    }

    #[test]
    fn test_interval_update_ticks_at_start() {
        let (spec, count) = counting(UpdateKind::Interval(Duration::from_secs(60)));
        let mut loops = UpdateLoops::start(&cerver(), vec![spec]).unwrap();

        assert!(wait_for(&count, 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        loops.end();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_update_keeps_ticking() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let spec = UpdateSpec::new(
            UpdateKind::Interval(Duration::from_millis(10)),
            Arc::new(move |_: &Cerver| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            }),
        )
        .unwrap();

        let loops = UpdateLoops::start(&cerver(), vec![spec]).unwrap();
        assert!(wait_for(&count, 3));
        drop(loops);
    }

    #[test]
    fn test_zero_rates_are_rejected() {
        let updater: Arc<dyn Updater> = Arc::new(|_: &Cerver| {});
        assert!(UpdateSpec::new(UpdateKind::Frame { fps: 0 }, Arc::clone(&updater)).is_err());
        assert!(UpdateSpec::new(UpdateKind::Interval(Duration::ZERO), updater).is_err());
    }

    #[test]
    fn test_slots_replace_by_kind() {
        let slots = UpdateSlots::default();
        let (frame, _) = counting(UpdateKind::Frame { fps: 30 });
        let (interval, _) = counting(UpdateKind::Interval(Duration::from_secs(1)));
        let (again, _) = counting(UpdateKind::Frame { fps: 60 });

        assert!(!slots.set(frame));
        assert!(!slots.set(interval));
        assert!(slots.set(again));

        let kinds: Vec<UpdateKind> = slots.specs().iter().map(|spec| spec.kind).collect();
        assert_eq!(
            kinds,
            vec![
                UpdateKind::Frame { fps: 60 },
                UpdateKind::Interval(Duration::from_secs(1))
            ]
        );
    }

    #[test]
    fn test_frame_period() {
        assert_eq!(UpdateKind::Frame { fps: 50 }.period(), Duration::from_millis(20));
        assert_eq!(
            UpdateKind::Interval(Duration::from_secs(3)).period(),
            Duration::from_secs(3)
        );
    }
}
