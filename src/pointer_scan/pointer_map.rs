//! Base pointer map.
//!
//! Every pointer-like location of the snapshot is recorded twice:
//!
//! - aligned: virtual address (`virtual_base + i * alignment`) -> value, ordered,
//!   used to enumerate base entries for the chain search.
//! - unaligned: slot `i` -> value in a dense array, used for O(1) dereferences
//!   while following chains. Zero means "not a pointer".
//!
//! Both describe the same set of locations. The map also remembers the
//! parameters it was built with, since the slot indexing and the adjacency
//! lists are only meaningful for those.

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info, log_enabled, Level};

use crate::pointer_scan::adjacency::{precompute_adjacency, Adjacency};
use crate::pointer_scan::error::BuildError;
use crate::pointer_scan::progress::{CancelToken, ProgressSink};
use crate::pointer_scan::snapshot::Snapshot;
use crate::pointer_scan::types::{AddressableRange, ScanConfig};

/// Report progress once every this many strides.
const PROGRESS_INTERVAL: usize = 1 << 16;

pub struct PointerMap {
    virtual_base: u32,
    alignment: u32,
    addressable_range: AddressableRange,
    slot_window: (u32, u32),
    aligned_addr_to_value: BTreeMap<u32, u32>,
    unaligned_slot_to_value: Box<[u32]>,
    valid_unaligned_slots: Vec<u32>,
    adjacency: Adjacency,
}

/// Output of the sequential pass, before adjacency is known.
struct BaseMap {
    aligned_addr_to_value: BTreeMap<u32, u32>,
    unaligned_slot_to_value: Box<[u32]>,
    valid_unaligned_slots: Vec<u32>,
}

impl PointerMap {
    /// Runs both build phases. Either returns a complete map or nothing at all.
    pub fn build(
        snapshot: &Snapshot,
        config: &ScanConfig,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<PointerMap, BuildError> {
        config.validate().map_err(|e| BuildError::InvalidConfig(e.to_string()))?;

        let timer = Instant::now();
        progress.set_caption("Pointer map");

        let base = build_base_map(snapshot, config, progress, cancel)?;
        info!(
            "Base pointer map: {} pointers in {} bytes, {:.3}s",
            base.valid_unaligned_slots.len(),
            snapshot.len(),
            timer.elapsed().as_secs_f64()
        );

        let slot_window = config.slot_window();
        let adjacency = precompute_adjacency(
            &base.unaligned_slot_to_value,
            &base.valid_unaligned_slots,
            slot_window,
            progress,
            cancel,
        )?;

        info!(
            "Pointer map ready: {} pointers, {} branch slots, {:.3}s",
            base.valid_unaligned_slots.len(),
            adjacency.len(),
            timer.elapsed().as_secs_f64()
        );

        Ok(PointerMap {
            virtual_base: snapshot.virtual_base(),
            alignment: config.alignment,
            addressable_range: config.addressable_range,
            slot_window,
            aligned_addr_to_value: base.aligned_addr_to_value,
            unaligned_slot_to_value: base.unaligned_slot_to_value,
            valid_unaligned_slots: base.valid_unaligned_slots,
            adjacency,
        })
    }

    #[inline]
    pub fn virtual_base(&self) -> u32 {
        self.virtual_base
    }

    /// Alignment captured when the map was built.
    #[inline]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    #[inline]
    pub fn addressable_range(&self) -> AddressableRange {
        self.addressable_range
    }

    /// Unaligned delta window the adjacency lists were computed for.
    #[inline]
    pub fn slot_window(&self) -> (u32, u32) {
        self.slot_window
    }

    /// Virtual address -> pointer-like value, ascending by address.
    pub fn aligned_entries(&self) -> &BTreeMap<u32, u32> {
        &self.aligned_addr_to_value
    }

    #[inline]
    pub fn slot_values(&self) -> &[u32] {
        &self.unaligned_slot_to_value
    }

    pub fn valid_slots(&self) -> &[u32] {
        &self.valid_unaligned_slots
    }

    #[inline]
    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    pub fn len(&self) -> usize {
        self.aligned_addr_to_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aligned_addr_to_value.is_empty()
    }

    /// Slot index of a virtual address, `None` below the snapshot base.
    #[inline]
    pub fn slot_of(&self, address: u32) -> Option<u32> {
        address.checked_sub(self.virtual_base).map(|offset| offset / self.alignment)
    }

    /// Pointer-like value stored at `address`, if the map recorded one.
    pub fn dereference(&self, address: u32) -> Option<u32> {
        let slot = self.slot_of(address)? as usize;
        match self.unaligned_slot_to_value.get(slot) {
            Some(&value) if value != 0 => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PointerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerMap")
            .field("virtual_base", &format_args!("0x{:08X}", self.virtual_base))
            .field("alignment", &self.alignment)
            .field("pointers", &self.aligned_addr_to_value.len())
            .field("slots", &self.unaligned_slot_to_value.len())
            .field("branch_slots", &self.adjacency.len())
            .finish()
    }
}

/// Sequential pass over the snapshot. Each stride writes into the ordered map and
/// the dense array, which is why this part stays on one thread.
fn build_base_map(
    snapshot: &Snapshot,
    config: &ScanConfig,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<BaseMap, BuildError> {
    progress.set_text("Generating base-level pointer map...");
    progress.report_fraction(0.0);

    let align = config.alignment as usize;
    let range = config.addressable_range;
    let virtual_base = snapshot.virtual_base();
    let len = snapshot.len();

    let mut aligned_addr_to_value = BTreeMap::new();
    // One slot per stride that still holds a whole u32.
    let slot_count = if len >= 4 { (len - 4) / align + 1 } else { 0 };
    let mut unaligned_slot_to_value = vec![0u32; slot_count].into_boxed_slice();
    let mut valid_unaligned_slots = Vec::new();

    for (slot, offset) in (0..len).step_by(align).enumerate() {
        if cancel.is_cancelled() {
            info!("Pointer map build cancelled at offset 0x{:X}", offset);
            return Err(BuildError::Cancelled);
        }

        if offset + 4 > len {
            break;
        }

        let value = snapshot.read_u32_at(offset);
        if value != 0 && range.contains(value) {
            aligned_addr_to_value.insert(virtual_base + offset as u32, value);
            unaligned_slot_to_value[slot] = value;
            valid_unaligned_slots.push(slot as u32);
        }

        if slot % PROGRESS_INTERVAL == 0 {
            progress.report_fraction(offset as f64 / len as f64);
        }
    }

    progress.report_fraction(1.0);

    if log_enabled!(Level::Debug) {
        debug!(
            "Base map: {} slots, {} pointer-like values, align={}",
            unaligned_slot_to_value.len(),
            valid_unaligned_slots.len(),
            align
        );
    }

    Ok(BaseMap {
        aligned_addr_to_value,
        unaligned_slot_to_value,
        valid_unaligned_slots,
    })
}
