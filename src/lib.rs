//! Static-base pointer path scanner for 32-bit memory snapshots.

pub mod core;
pub mod pointer_scan;

pub use pointer_scan::{
    AddressableRange, BuildError, CancelToken, LoadError, LogProgress, NullProgress, PointerMap, PointerPath,
    PointerScanner, ProgressSink, ScanConfig, ScanError, ScanHandle, ScanOutcome, Snapshot,
};
