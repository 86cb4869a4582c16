//! Process-wide runtime and worker pools.
//!
//! The scan driver and the progress ticker run on `TOKIO_RUNTIME`; the CPU-bound
//! phases run on dedicated rayon pools that only take a fraction of the machine so
//! the host stays responsive while a scan is running.

use lazy_static::lazy_static;
use log::warn;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::num::NonZeroUsize;
use tokio::runtime::{Builder, Runtime};

/// Share of hardware threads given to the adjacency precomputation (7/8).
const ADJACENCY_POOL_SHARE: (usize, usize) = (7, 8);

/// Share of hardware threads given to the chain search (3/4).
const SEARCH_POOL_SHARE: (usize, usize) = (3, 4);

lazy_static! {
    pub static ref TOKIO_RUNTIME: Runtime = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ptrscan-driver")
        .enable_time()
        .build()
        .expect("failed to build the scan driver runtime");

    pub static ref ADJACENCY_POOL: ThreadPool = build_pool("ptrscan-adjacency", ADJACENCY_POOL_SHARE);

    pub static ref SEARCH_POOL: ThreadPool = build_pool("ptrscan-search", SEARCH_POOL_SHARE);
}

/// Number of hardware threads, falling back to 1 when the platform can't tell.
pub fn hardware_threads() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

/// Applies a `numerator / denominator` share to the hardware thread count, never below one.
pub fn pool_size((numerator, denominator): (usize, usize)) -> usize {
    (hardware_threads() * numerator / denominator).max(1)
}

fn build_pool(name: &'static str, share: (usize, usize)) -> ThreadPool {
    let threads = pool_size(share);
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()
        .unwrap_or_else(|e| {
            warn!("{} pool with {} threads failed to start ({}), using a single thread", name, threads, e);
            ThreadPoolBuilder::new()
                .num_threads(1)
                .build()
                .expect("failed to build a single-threaded rayon pool")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_never_zero() {
        assert!(pool_size((1, 1_000_000)) >= 1);
        assert!(pool_size(SEARCH_POOL_SHARE) <= hardware_threads());
        assert!(pool_size(ADJACENCY_POOL_SHARE) <= hardware_threads());
    }
}
