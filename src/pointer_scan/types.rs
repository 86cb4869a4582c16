use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pointer_scan::snapshot::Snapshot;

/// Half-open `[base, base + length)` window deciding whether a raw u32 could be a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RangeRepr", into = "RangeRepr")]
pub struct AddressableRange {
    base: u32,
    length: u32,
    end: u32,
}

#[derive(Serialize, Deserialize)]
struct RangeRepr {
    base: u32,
    length: u32,
}

impl From<RangeRepr> for AddressableRange {
    fn from(repr: RangeRepr) -> Self {
        AddressableRange::new(repr.base, repr.length)
    }
}

impl From<AddressableRange> for RangeRepr {
    fn from(range: AddressableRange) -> Self {
        RangeRepr {
            base: range.base,
            length: range.length,
        }
    }
}

impl AddressableRange {
    /// `end` wraps like a u32 address would; snapshot loading rejects layouts where it does.
    pub const fn new(base: u32, length: u32) -> Self {
        Self {
            base,
            length,
            end: base.wrapping_add(length),
        }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[inline]
    pub fn contains(&self, value: u32) -> bool {
        value >= self.base && value < self.end
    }

    pub fn with_base(&self, base: u32) -> Self {
        Self::new(base, self.length)
    }

    pub fn with_length(&self, length: u32) -> Self {
        Self::new(self.base, length)
    }
}

/// Configuration for a pointer map build and the scans that run on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Values outside this window are never treated as pointers
    pub addressable_range: AddressableRange,
    /// Maximum number of links after the base pointer (default: 6)
    pub max_depth: u8,
    /// Smallest offset tried from a dereferenced pointer (default: 4)
    pub min_offset: u32,
    /// Offsets must stay strictly below this (default: 0x4000)
    pub max_offset: u32,
    /// The address we want to reach, e.g. the address of an ammo counter
    pub search_address: u32,
    /// Pointer alignment in bytes (default: 4)
    pub alignment: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            addressable_range: AddressableRange::default(),
            max_depth: 6,
            min_offset: 4,
            max_offset: 0x4000,
            search_address: 0,
            alignment: 4,
        }
    }
}

impl ScanConfig {
    pub fn new(search_address: u32) -> Self {
        Self {
            search_address,
            ..Default::default()
        }
    }

    /// Config whose addressable range covers the whole snapshot.
    pub fn for_snapshot(snapshot: &Snapshot, search_address: u32) -> Self {
        Self {
            addressable_range: snapshot.addressable_range(),
            search_address,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ScanConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_range(mut self, range: AddressableRange) -> Self {
        self.addressable_range = range;
        self
    }

    pub fn with_depth(mut self, depth: u8) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_offsets(mut self, min_offset: u32, max_offset: u32) -> Self {
        self.min_offset = min_offset;
        self.max_offset = max_offset;
        self
    }

    pub fn with_align(mut self, align: u32) -> Self {
        self.alignment = align;
        self
    }

    pub fn with_search_address(mut self, address: u32) -> Self {
        self.search_address = address;
        self
    }

    /// Rejects settings the map builder can't work with.
    pub fn validate(&self) -> Result<()> {
        if self.alignment == 0 {
            return Err(anyhow!("alignment must be non-zero"));
        }
        if self.min_offset > self.max_offset {
            return Err(anyhow!(
                "min_offset 0x{:X} exceeds max_offset 0x{:X}",
                self.min_offset,
                self.max_offset
            ));
        }
        if self.max_offset > i32::MAX as u32 {
            return Err(anyhow!("max_offset 0x{:X} does not fit a signed offset", self.max_offset));
        }
        Ok(())
    }

    /// Slot delta window. The lower bound rounds up so no offset falls below
    /// `min_offset`; the upper bound rounds down so every offset stays below `max_offset`.
    #[inline]
    pub fn slot_window(&self) -> (u32, u32) {
        (self.min_offset.div_ceil(self.alignment), self.max_offset / self.alignment)
    }
}

/// A resolved pointer path: `[[base] + off0] + off1 ... -> target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointerPath {
    /// Address of the static slot holding the first pointer
    pub base_address: u32,
    /// Offsets applied after each dereference, empty for a direct hit
    pub offsets: Vec<i32>,
}

impl PointerPath {
    pub fn new(base_address: u32, offsets: Vec<i32>) -> Self {
        Self { base_address, offsets }
    }

    /// Number of pointers followed, a direct hit counts as one.
    pub fn depth(&self) -> usize {
        self.offsets.len() + 1
    }

    /// Walks the path through `snapshot` and checks it lands on `target`.
    ///
    /// A path matches the same way the scan found it: the last link may either
    /// point exactly at `target` or hold a pointer whose value is `target`.
    pub fn reaches(&self, snapshot: &Snapshot, target: u32) -> bool {
        let Some(mut value) = snapshot.try_read_u32(self.base_address) else {
            return false;
        };

        let Some((last, links)) = self.offsets.split_last() else {
            return value == target;
        };

        for &offset in links {
            let address = value.wrapping_add(offset as u32);
            match snapshot.try_read_u32(address) {
                Some(next) => value = next,
                None => return false,
            }
        }

        let address = value.wrapping_add(*last as u32);
        address == target || snapshot.try_read_u32(address) == Some(target)
    }
}

impl fmt::Display for PointerPath {
    /// Formats as `8262AA00->FC->-24`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.base_address)?;
        for offset in &self.offsets {
            if *offset >= 0 {
                write!(f, "->{:X}", offset)?;
            } else {
                write!(f, "->-{:X}", offset.unsigned_abs())?;
            }
        }
        Ok(())
    }
}

/// One followed pointer in the chain currently being explored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainFrame {
    /// The base the offset is applied to
    pub addr: u32,
    /// Offset from `addr`
    pub offset: u32,
    /// The dereferenced u32 at `addr + offset`
    pub value: u32,
}

impl ChainFrame {
    pub fn new(addr: u32, offset: u32, value: u32) -> Self {
        Self { addr, offset, value }
    }
}

impl fmt::Display for ChainFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08X} + {:X}] -> {:08X}", self.addr, self.offset, self.value)
    }
}

/// Scan phase enumeration for progress tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ScanPhase {
    /// Nothing running
    Idle = 0,
    /// Walking the snapshot for pointer-like values
    BuildingPointerMap = 1,
    /// Precomputing nearby valid slots
    PrecomputingOffsets = 2,
    /// Searching chains from every base entry
    SearchingChains = 3,
    /// Scan completed successfully
    Completed = 4,
    /// Scan was cancelled by user
    Cancelled = 5,
    /// A worker failed
    Error = 6,
}

impl From<i32> for ScanPhase {
    fn from(value: i32) -> Self {
        match value {
            1 => ScanPhase::BuildingPointerMap,
            2 => ScanPhase::PrecomputingOffsets,
            3 => ScanPhase::SearchingChains,
            4 => ScanPhase::Completed,
            5 => ScanPhase::Cancelled,
            6 => ScanPhase::Error,
            _ => ScanPhase::Idle,
        }
    }
}
