//! Pointer Scan Manager
//!
//! `PointerScanner` owns the snapshot and the pointer map built from it, and
//! coordinates the two build phases and the chain search. Scans run on the
//! driver runtime and stream their results through a [`ScanHandle`].

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, log_enabled, warn, Level};

use crate::core::globals::TOKIO_RUNTIME;
use crate::pointer_scan::chain_builder::search_pointer_chains;
use crate::pointer_scan::error::{BuildError, LoadError, ScanError};
use crate::pointer_scan::pointer_map::PointerMap;
use crate::pointer_scan::progress::{spawn_progress_ticker, CancelToken, ProgressSink, ScanCounters};
use crate::pointer_scan::snapshot::Snapshot;
use crate::pointer_scan::types::{AddressableRange, PointerPath, ScanConfig, ScanPhase};

/// Manages the snapshot, the pointer map and the scans running on it.
#[derive(Default)]
pub struct PointerScanner {
    /// Memory image, `None` until loaded or after disposal
    snapshot: Option<Arc<Snapshot>>,
    /// Pointer map from the last successful build
    pointer_map: Option<Arc<PointerMap>>,
    /// Number of scans started by this instance that have not finished yet
    active_scans: Arc<AtomicUsize>,
}

impl PointerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current snapshot. The pointer map belongs to the old snapshot and is dropped.
    pub fn load_snapshot(&mut self, bytes: impl Into<Vec<u8>>, virtual_base: u32, is_little_endian: bool) -> Result<(), LoadError> {
        let snapshot = Snapshot::from_bytes(bytes, virtual_base, is_little_endian)?;
        self.install_snapshot(snapshot);
        Ok(())
    }

    pub fn load_snapshot_reader<R: Read>(&mut self, reader: R, virtual_base: u32, is_little_endian: bool) -> Result<(), LoadError> {
        let snapshot = Snapshot::from_reader(reader, virtual_base, is_little_endian)?;
        self.install_snapshot(snapshot);
        Ok(())
    }

    pub fn load_snapshot_file(&mut self, path: impl AsRef<Path>, virtual_base: u32, is_little_endian: bool) -> Result<(), LoadError> {
        let snapshot = Snapshot::map_file(path, virtual_base, is_little_endian)?;
        self.install_snapshot(snapshot);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        info!(
            "Loaded snapshot: {} bytes at 0x{:08X}, {} endian",
            snapshot.len(),
            snapshot.virtual_base(),
            if snapshot.is_little_endian() { "little" } else { "big" }
        );
        self.snapshot = Some(Arc::new(snapshot));
        if self.pointer_map.take().is_some() {
            info!("Pointer map dropped, rebuild it for the new snapshot");
        }
    }

    /// Releases the snapshot. Builds and scans fail with `NoSnapshotLoaded` afterwards.
    pub fn dispose_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// Drops the pointer map.
    pub fn clear(&mut self) {
        self.pointer_map = None;
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_deref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn has_pointer_map(&self) -> bool {
        self.pointer_map.is_some()
    }

    pub fn pointer_map(&self) -> Option<&PointerMap> {
        self.pointer_map.as_deref()
    }

    /// Alignment the current pointer map was built with.
    pub fn loaded_alignment(&self) -> Option<u32> {
        self.pointer_map.as_ref().map(|map| map.alignment())
    }

    /// Range covering the loaded snapshot.
    pub fn addressable_range(&self) -> Option<AddressableRange> {
        self.snapshot.as_ref().map(|snapshot| snapshot.addressable_range())
    }

    /// Default config for the loaded snapshot.
    pub fn default_config(&self, search_address: u32) -> Option<ScanConfig> {
        self.snapshot.as_ref().map(|snapshot| ScanConfig::for_snapshot(snapshot, search_address))
    }

    pub fn is_scan_running(&self) -> bool {
        self.active_scans.load(Ordering::SeqCst) > 0
    }

    /// Builds the pointer map from scratch.
    ///
    /// Any previous map is dropped first, so a failed or cancelled build leaves
    /// the scanner without a map. Scans already running keep the map they started with.
    pub fn build_pointer_map(
        &mut self,
        config: &ScanConfig,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), BuildError> {
        let snapshot = self.snapshot.clone().ok_or(BuildError::NoSnapshotLoaded)?;
        self.pointer_map = None;

        match PointerMap::build(&snapshot, config, progress, cancel) {
            Ok(map) => {
                self.pointer_map = Some(Arc::new(map));
                Ok(())
            },
            Err(BuildError::Cancelled) => {
                warn!("Pointer map build cancelled, partial map discarded");
                Err(BuildError::Cancelled)
            },
            Err(e) => {
                error!("Pointer map build failed: {}", e);
                Err(e)
            },
        }
    }

    /// Starts a chain search and returns immediately.
    ///
    /// Setup problems are reported here; everything after that arrives through
    /// the returned handle.
    pub fn run_scan(
        &self,
        config: &ScanConfig,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<ScanHandle, ScanError> {
        if self.snapshot.is_none() {
            return Err(ScanError::NoSnapshotLoaded);
        }
        let map = self.pointer_map.clone().ok_or(ScanError::NoPointerMap)?;
        config.validate().map_err(|e| ScanError::InvalidConfig(e.to_string()))?;
        check_map_matches(&map, config)?;

        let config = config.clone();
        let (tx, rx) = unbounded::<PointerPath>();
        let (outcome_tx, outcome_rx) = bounded::<ScanOutcome>(1);
        let counters = Arc::new(ScanCounters::new());
        let active_scans = self.active_scans.clone();
        // Owned by the handle: cancelling or dropping it stops this scan only.
        let scan_cancel = cancel.child_token();

        active_scans.fetch_add(1, Ordering::SeqCst);
        counters.set_phase(ScanPhase::SearchingChains);

        if log_enabled!(Level::Debug) {
            debug!(
                "Starting pointer scan: target=0x{:08X}, depth={}, offsets=[0x{:X}, 0x{:X}), align={}",
                config.search_address, config.max_depth, config.min_offset, config.max_offset, config.alignment
            );
        }

        TOKIO_RUNTIME.spawn({
            let counters = counters.clone();
            let cancel = scan_cancel.clone();
            async move {
                let outcome = Self::run_scan_task(map, config, counters, progress, cancel, tx).await;
                active_scans.fetch_sub(1, Ordering::SeqCst);
                let _ = outcome_tx.send(outcome);
            }
        });

        Ok(ScanHandle {
            results: rx,
            outcome: outcome_rx,
            counters,
            cancel: scan_cancel,
        })
    }

    /// Runs the search on the blocking pool while a ticker reports progress.
    async fn run_scan_task(
        map: Arc<PointerMap>,
        config: ScanConfig,
        counters: Arc<ScanCounters>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
        tx: crossbeam_channel::Sender<PointerPath>,
    ) -> ScanOutcome {
        let timer = Instant::now();
        let ticker = spawn_progress_ticker(counters.clone(), progress.clone());

        // Faults stop the siblings through this child token without touching the caller's.
        let workers_cancel = cancel.child_token();

        let search = tokio::task::spawn_blocking({
            let counters = counters.clone();
            let workers_cancel = workers_cancel.clone();
            move || search_pointer_chains(&map, &config, &counters, progress.as_ref(), &workers_cancel, &tx)
        })
        .await;

        ticker.abort();
        drop(workers_cancel);

        let paths_found = counters.paths_found();
        let outcome = match search {
            Ok(None) if cancel.is_cancelled() => {
                warn!("Pointer scan cancelled after {} paths", paths_found);
                counters.set_phase(ScanPhase::Cancelled);
                ScanOutcome::Cancelled { paths_found }
            },
            Ok(None) => {
                counters.set_phase(ScanPhase::Completed);
                ScanOutcome::Completed { paths_found }
            },
            Ok(Some(fault)) => {
                error!("Pointer scan failed: {}", fault);
                counters.set_phase(ScanPhase::Error);
                ScanOutcome::Failed {
                    paths_found,
                    error: anyhow!("search worker failed at {}", fault),
                }
            },
            Err(e) => {
                error!("Pointer scan task panicked: {}", e);
                counters.set_phase(ScanPhase::Error);
                ScanOutcome::Failed {
                    paths_found,
                    error: anyhow!("scan task failed: {}", e),
                }
            },
        };

        info!(
            "Pointer scan finished: {} paths, {} addresses visited, {:.3}s",
            paths_found,
            counters.addresses_visited(),
            timer.elapsed().as_secs_f64()
        );

        outcome
    }
}

/// Rejects configs that differ from what the map was built with.
fn check_map_matches(map: &PointerMap, config: &ScanConfig) -> Result<(), ScanError> {
    let stale = |field: &'static str, built: String, requested: String| ScanError::StalePointerMap { field, built, requested };

    if map.alignment() != config.alignment {
        return Err(stale("alignment", map.alignment().to_string(), config.alignment.to_string()));
    }
    if map.slot_window() != config.slot_window() {
        let (lo, hi) = map.slot_window();
        let align = map.alignment();
        return Err(stale(
            "offset window",
            format!("[0x{:X}, 0x{:X})", lo * align, hi * align),
            format!("[0x{:X}, 0x{:X})", config.min_offset, config.max_offset),
        ));
    }
    if map.addressable_range() != config.addressable_range {
        let range = |r: AddressableRange| format!("[0x{:08X}, 0x{:08X})", r.base(), r.end());
        return Err(stale(
            "addressable range",
            range(map.addressable_range()),
            range(config.addressable_range),
        ));
    }
    Ok(())
}

/// How a scan ended. Cancellation is not an error.
#[derive(Debug)]
pub enum ScanOutcome {
    Completed { paths_found: u64 },
    Cancelled { paths_found: u64 },
    Failed { paths_found: u64, error: anyhow::Error },
}

impl ScanOutcome {
    pub fn paths_found(&self) -> u64 {
        match self {
            ScanOutcome::Completed { paths_found }
            | ScanOutcome::Cancelled { paths_found }
            | ScanOutcome::Failed { paths_found, .. } => *paths_found,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ScanOutcome::Completed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanOutcome::Cancelled { .. })
    }
}

/// Push-based stream of paths from a running scan.
///
/// Paths arrive while the scan runs; iteration ends once the scan has finished
/// and every path was received.
pub struct ScanHandle {
    results: Receiver<PointerPath>,
    outcome: Receiver<ScanOutcome>,
    counters: Arc<ScanCounters>,
    cancel: CancelToken,
}

impl ScanHandle {
    /// Blocks for the next path, `None` once the scan is over and drained.
    pub fn recv(&self) -> Option<PointerPath> {
        self.results.recv().ok()
    }

    pub fn try_recv(&self) -> Option<PointerPath> {
        match self.results.try_recv() {
            Ok(path) => Some(path),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PointerPath> {
        match self.results.recv_timeout(timeout) {
            Ok(path) => Some(path),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Blocking iterator over the remaining paths.
    pub fn iter(&self) -> impl Iterator<Item = PointerPath> + '_ {
        self.results.iter()
    }

    /// Requests cancellation; the outcome will be `Cancelled`. The caller's token is left alone.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn counters(&self) -> &ScanCounters {
        &self.counters
    }

    pub fn phase(&self) -> ScanPhase {
        self.counters.phase()
    }

    /// Waits for the scan to finish. Paths not yet received stay available.
    pub fn wait(&self) -> ScanOutcome {
        self.outcome.recv().unwrap_or_else(|_| ScanOutcome::Failed {
            paths_found: self.counters.paths_found(),
            error: anyhow!("scan driver stopped without reporting an outcome"),
        })
    }

    /// Drains every path and waits for the outcome.
    pub fn collect(self) -> (Vec<PointerPath>, ScanOutcome) {
        let paths: Vec<PointerPath> = self.results.iter().collect();
        let outcome = self.wait();
        (paths, outcome)
    }
}

impl Drop for ScanHandle {
    /// Nobody can receive the paths anymore, so stop searching for them.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
