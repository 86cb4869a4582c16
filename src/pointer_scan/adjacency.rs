//! Adjacency precomputation.
//!
//! For every slot holding a pointer-like value we store the slot deltas inside the
//! offset window that also hold a value. The chain search then walks these lists
//! instead of rescanning the whole window at every recursion step.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, log_enabled, Level};
use rayon::prelude::*;

use crate::core::globals::ADJACENCY_POOL;
use crate::pointer_scan::error::{panic_message, BuildError};
use crate::pointer_scan::progress::{CancelToken, ProgressSink};

/// Report progress once every this many slots.
const PROGRESS_INTERVAL: usize = 4096;

/// Valid slot -> ascending list of slot deltas that hold a non-zero value.
#[derive(Debug, Default)]
pub struct Adjacency {
    nearby: HashMap<u32, Box<[u32]>>,
}

impl Adjacency {
    #[inline]
    pub fn get(&self, slot: u32) -> Option<&[u32]> {
        self.nearby.get(&slot).map(|deltas| &deltas[..])
    }

    /// Number of slots that have at least one neighbour.
    pub fn len(&self) -> usize {
        self.nearby.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nearby.is_empty()
    }

    /// Total number of stored deltas across all slots.
    pub fn edge_count(&self) -> usize {
        self.nearby.values().map(|deltas| deltas.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> {
        self.nearby.iter().map(|(&slot, deltas)| (slot, &deltas[..]))
    }
}

/// Deltas `d` in `window` with `slots[slot + d] != 0`, ascending.
pub fn nearby_slots(slots: &[u32], slot: u32, (lo, hi): (u32, u32)) -> Vec<u32> {
    let remaining = (slots.len() as u64).saturating_sub(slot as u64);
    let hi = (hi as u64).min(remaining) as u32;
    (lo..hi).filter(|&d| slots[(slot + d) as usize] != 0).collect()
}

/// Builds the adjacency lists for `valid_slots` on the adjacency pool.
///
/// Slots are independent, so each worker produces whole lists; slots with no
/// neighbours are left out. Cancellation discards everything computed so far.
pub fn precompute_adjacency(
    slots: &[u32],
    valid_slots: &[u32],
    window: (u32, u32),
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<Adjacency, BuildError> {
    progress.set_text("Pre-computing valid offsets");
    progress.report_fraction(0.0);

    let total = valid_slots.len().max(1);
    let done = AtomicUsize::new(0);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        ADJACENCY_POOL.install(|| {
            valid_slots
                .par_iter()
                .filter_map(|&slot| {
                    if cancel.is_cancelled() {
                        return None;
                    }

                    let deltas = nearby_slots(slots, slot, window);

                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if finished % PROGRESS_INTERVAL == 0 {
                        progress.report_fraction(finished as f64 / total as f64);
                    }

                    if deltas.is_empty() {
                        None
                    } else {
                        Some((slot, deltas.into_boxed_slice()))
                    }
                })
                .collect::<HashMap<_, _>>()
        })
    }));

    let nearby = match result {
        Ok(nearby) => nearby,
        Err(payload) => return Err(BuildError::WorkerFault(panic_message(payload.as_ref()))),
    };

    if cancel.is_cancelled() {
        info!("Offset precomputation cancelled after {} slots", done.load(Ordering::Relaxed));
        return Err(BuildError::Cancelled);
    }

    progress.report_fraction(1.0);

    let adjacency = Adjacency { nearby };
    if log_enabled!(Level::Debug) {
        debug!(
            "Adjacency: {} of {} slots have neighbours, {} deltas total",
            adjacency.len(),
            valid_slots.len(),
            adjacency.edge_count()
        );
    }

    Ok(adjacency)
}
