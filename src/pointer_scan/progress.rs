//! Progress reporting and cancellation plumbing.
//!
//! The engine never talks to a UI directly. It reports through [`ProgressSink`],
//! and the search workers only bump the atomic counters in [`ScanCounters`];
//! a ticker on the driver runtime turns those counters into progress text.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::core::globals::TOKIO_RUNTIME;
use crate::pointer_scan::types::ScanPhase;

/// Cooperative cancellation signal shared between the host and the engine.
pub type CancelToken = tokio_util::sync::CancellationToken;

/// How often the ticker refreshes the progress text during a scan.
pub const PROGRESS_TICK: Duration = Duration::from_millis(200);

/// Receives progress from the engine. Called from worker threads, so the host
/// must marshal to its UI thread itself if it needs to.
pub trait ProgressSink: Send + Sync {
    fn set_caption(&self, caption: &str);

    fn set_text(&self, text: &str);

    /// Completion of the current phase in `0.0..=1.0`.
    fn report_fraction(&self, done: f64);
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn set_caption(&self, _caption: &str) {}

    fn set_text(&self, _text: &str) {}

    fn report_fraction(&self, _done: f64) {}
}

/// Forwards progress to the `log` facade, one line per caption or text change.
#[derive(Debug, Default)]
pub struct LogProgress {
    last_percent: AtomicI32,
}

impl ProgressSink for LogProgress {
    fn set_caption(&self, caption: &str) {
        self.last_percent.store(-1, Ordering::Relaxed);
        info!("{}", caption);
    }

    fn set_text(&self, text: &str) {
        info!("{}", text);
    }

    fn report_fraction(&self, done: f64) {
        let percent = (done.clamp(0.0, 1.0) * 100.0) as i32;
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            debug!("{}%", percent);
        }
    }
}

/// Counters shared by every search worker. Only ever incremented or swapped atomically.
#[derive(Debug, Default)]
pub struct ScanCounters {
    phase: AtomicI32,
    addresses_visited: AtomicU64,
    paths_found: AtomicU64,
    entries_done: AtomicU64,
    heartbeat: AtomicU32,
}

impl ScanCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn visit(&self) {
        self.addresses_visited.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn path_found(&self) {
        self.paths_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks a base entry finished and returns how many are finished now.
    #[inline]
    pub fn entry_done(&self) -> u64 {
        self.entries_done.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn addresses_visited(&self) -> u64 {
        self.addresses_visited.load(Ordering::Relaxed)
    }

    pub fn paths_found(&self) -> u64 {
        self.paths_found.load(Ordering::Relaxed)
    }

    pub fn entries_done(&self) -> u64 {
        self.entries_done.load(Ordering::Relaxed)
    }

    pub fn set_phase(&self, phase: ScanPhase) {
        self.phase.store(phase as i32, Ordering::SeqCst);
    }

    pub fn phase(&self) -> ScanPhase {
        ScanPhase::from(self.phase.load(Ordering::SeqCst))
    }

    /// Bumped by the ticker so a host can tell a slow scan from a stuck one.
    pub fn heartbeat(&self) -> u32 {
        self.heartbeat.load(Ordering::Relaxed)
    }

    fn beat(&self) {
        self.heartbeat.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawns the periodic progress ticker. Abort the returned handle to stop it.
pub fn spawn_progress_ticker(counters: Arc<ScanCounters>, progress: Arc<dyn ProgressSink>) -> JoinHandle<()> {
    TOKIO_RUNTIME.spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            counters.beat();
            progress.set_text(&format!("Scanned {} valid addresses", counters.addresses_visited()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProgress {
        texts: Mutex<Vec<String>>,
    }

    impl ProgressSink for RecordingProgress {
        fn set_caption(&self, _caption: &str) {}

        fn set_text(&self, text: &str) {
            self.texts.lock().unwrap().push(text.to_string());
        }

        fn report_fraction(&self, _done: f64) {}
    }

    #[test]
    fn test_counters() {
        let counters = ScanCounters::new();
        assert_eq!(counters.phase(), ScanPhase::Idle);
        counters.visit();
        counters.visit();
        counters.path_found();
        assert_eq!(counters.entry_done(), 1);
        assert_eq!(counters.entry_done(), 2);
        counters.set_phase(ScanPhase::SearchingChains);

        assert_eq!(counters.addresses_visited(), 2);
        assert_eq!(counters.paths_found(), 1);
        assert_eq!(counters.entries_done(), 2);
        assert_eq!(counters.phase(), ScanPhase::SearchingChains);
    }

    #[test]
    fn test_ticker_reports_visited_addresses() {
        let counters = Arc::new(ScanCounters::new());
        for _ in 0..7 {
            counters.visit();
        }
        let progress = Arc::new(RecordingProgress::default());

        let handle = spawn_progress_ticker(counters.clone(), progress.clone());
        std::thread::sleep(PROGRESS_TICK * 2);
        handle.abort();

        assert!(counters.heartbeat() >= 1);
        let texts = progress.texts.lock().unwrap();
        assert!(texts.iter().any(|t| t == "Scanned 7 valid addresses"));
    }
}
