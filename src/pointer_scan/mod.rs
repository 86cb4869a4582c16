//! Pointer Scan Module
//!
//! Finds pointer paths from a static base region of a memory snapshot to a
//! target address, e.g. `8262AA00->FC->24` reaching the address of a live counter.
//!
//! # Architecture
//!
//! - `snapshot`: the raw memory image and its virtual load address
//! - `pointer_map`: Phase 1, a sequential pass recording every pointer-like value
//! - `adjacency`: Phase 2, per-slot lists of nearby pointer slots (parallel)
//! - `chain_builder`: Phase 3, recursive DFS from every base entry (parallel)
//! - `progress`: progress sink, shared counters and the cancellation token
//! - `manager`: the `PointerScanner` engine tying the phases together
//!
//! # Usage
//!
//! ```ignore
//! let mut scanner = PointerScanner::new();
//! scanner.load_snapshot_file("dump.bin", 0x8200_0000, false)?;
//!
//! let config = scanner.default_config(0x8262_AA10).unwrap();
//! scanner.build_pointer_map(&config, &LogProgress::default(), &CancelToken::new())?;
//!
//! let handle = scanner.run_scan(&config, Arc::new(LogProgress::default()), CancelToken::new())?;
//! for path in handle.iter() {
//!     println!("{}", path);
//! }
//! ```

pub mod adjacency;
pub mod chain_builder;
pub mod error;
pub mod manager;
pub mod pointer_map;
pub mod progress;
pub mod snapshot;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{BuildError, LoadError, ScanError};
pub use manager::{PointerScanner, ScanHandle, ScanOutcome};
pub use pointer_map::PointerMap;
pub use progress::{CancelToken, LogProgress, NullProgress, ProgressSink, ScanCounters};
pub use snapshot::Snapshot;
pub use types::*;
