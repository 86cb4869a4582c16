//! Chain search: follows pointers forward from every base map entry until the
//! search address is reached or the depth budget runs out.
//!
//! ## Algorithm
//! - Recursive DFS per base entry, one rayon task per entry
//! - Per-task state is a fixed-capacity [`ChainStack`], reused across entries

pub mod recursive_dfs;

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::Sender;
use log::{debug, info, log_enabled, warn, Level};
use once_cell::sync::OnceCell;
use rayon::prelude::*;

use crate::core::globals::SEARCH_POOL;
use crate::pointer_scan::adjacency::Adjacency;
use crate::pointer_scan::error::panic_message;
use crate::pointer_scan::pointer_map::PointerMap;
use crate::pointer_scan::progress::{CancelToken, ProgressSink, ScanCounters};
use crate::pointer_scan::types::{ChainFrame, PointerPath, ScanConfig};

pub use recursive_dfs::search_pointer_chains;

/// Fixed-capacity stack of the pointers followed so far.
///
/// Sized once for `max_depth + 1` frames and reused for every base entry a worker
/// handles, so following a pointer never allocates.
#[derive(Debug, Clone)]
pub struct ChainStack {
    frames: Box<[ChainFrame]>,
    depth: usize,
}

impl ChainStack {
    pub fn with_max_depth(max_depth: u8) -> Self {
        Self {
            frames: vec![ChainFrame::default(); max_depth as usize + 1].into_boxed_slice(),
            depth: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Resets the stack to a single base frame.
    pub fn begin(&mut self, base: ChainFrame) {
        self.depth = 0;
        self.push(base);
    }

    #[inline]
    pub fn push(&mut self, frame: ChainFrame) {
        self.frames[self.depth] = frame;
        self.depth += 1;
    }

    #[inline]
    pub fn pop(&mut self) {
        self.depth -= 1;
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn top(&self) -> ChainFrame {
        self.frames[self.depth - 1]
    }

    #[inline]
    pub fn frames(&self) -> &[ChainFrame] {
        &self.frames[..self.depth]
    }

    /// True if `value` was already dereferenced somewhere in the current chain.
    #[inline]
    pub fn has_visited(&self, value: u32) -> bool {
        self.frames().iter().any(|frame| frame.value == value)
    }

    /// Materializes the current chain, optionally with one trailing offset.
    pub fn to_path(&self, trailing_offset: Option<u32>) -> PointerPath {
        let frames = self.frames();
        let base = frames[0].addr.wrapping_add(frames[0].offset);
        let mut offsets = Vec::with_capacity(frames.len());
        offsets.extend(frames[1..].iter().map(|frame| frame.offset as i32));
        if let Some(offset) = trailing_offset {
            offsets.push(offset as i32);
        }
        PointerPath::new(base, offsets)
    }
}
