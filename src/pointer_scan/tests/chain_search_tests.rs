//! Chain search tests, driving `search_pointer_chains` directly on a built map

use std::collections::HashSet;

use crossbeam_channel::unbounded;

use crate::pointer_scan::chain_builder::{search_pointer_chains, ChainStack};
use crate::pointer_scan::pointer_map::PointerMap;
use crate::pointer_scan::progress::{CancelToken, NullProgress, ScanCounters};
use crate::pointer_scan::snapshot::Snapshot;
use crate::pointer_scan::tests::mock_snapshot::{dense_snapshot, dereferenced_values, p, path_set, MockSnapshot};
use crate::pointer_scan::types::{ChainFrame, PointerPath, ScanConfig};

const BASE: u32 = 0x8000_0000;

/// 0x80000010 -> 0x80000200, [0x80000200 + 8] -> 0x80000400, [0x80000400 + 0x10] -> 0x80000800
fn three_link_chain() -> MockSnapshot {
    let mut mock = MockSnapshot::new(BASE, 0x1000);
    mock.write_u32(0x8000_0010, 0x8000_0200)
        .write_u32(0x8000_0208, 0x8000_0400)
        .write_u32(0x8000_0410, 0x8000_0800);
    mock
}

fn search(snapshot: &Snapshot, config: &ScanConfig) -> (Vec<PointerPath>, ScanCounters) {
    let map = PointerMap::build(snapshot, config, &NullProgress, &CancelToken::new()).unwrap();
    let counters = ScanCounters::new();
    let (tx, rx) = unbounded();

    let fault = search_pointer_chains(&map, config, &counters, &NullProgress, &CancelToken::new(), &tx);
    assert_eq!(fault, None);
    drop(tx);

    (rx.iter().collect(), counters)
}

fn expect(paths: &[&str]) -> HashSet<PointerPath> {
    paths.iter().map(|text| p(text)).collect()
}

#[test]
fn test_three_link_chain() {
    let snapshot = three_link_chain().build();
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(4, 0x100);

    let (paths, counters) = search(&snapshot, &config);

    assert_eq!(path_set(&paths), expect(&["80000410", "80000208->10", "80000010->8->10"]));
    assert_eq!(paths.len(), 3);
    assert_eq!(counters.paths_found(), 3);
    assert_eq!(counters.entries_done(), 3);
    for path in &paths {
        assert!(path.reaches(&snapshot, 0x8000_0800), "{} does not reach the target", path);
    }
}

#[test]
fn test_depth_limit() {
    let snapshot = three_link_chain().build();
    let base_config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(4, 0x100);

    let (paths, _) = search(&snapshot, &base_config.clone().with_depth(0));
    assert_eq!(path_set(&paths), expect(&["80000410"]));

    let (paths, _) = search(&snapshot, &base_config.clone().with_depth(1));
    assert_eq!(path_set(&paths), expect(&["80000410", "80000208->10"]));

    let (paths, _) = search(&snapshot, &base_config.with_depth(2));
    assert_eq!(paths.len(), 3);
}

#[test]
fn test_target_address_itself_matches() {
    // 0x80000410 holds a pointer, so it is a slot the search can land on.
    let snapshot = three_link_chain().build();
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0410).with_offsets(4, 0x100);

    let (paths, _) = search(&snapshot, &config);

    assert_eq!(path_set(&paths), expect(&["80000208->10", "80000010->8->10"]));
    for path in &paths {
        assert!(path.reaches(&snapshot, 0x8000_0410));
    }
}

#[test]
fn test_offsets_outside_window_are_not_followed() {
    let snapshot = three_link_chain().build();

    // [0x80000400 + 0x10] is the last link; 0x10 is below min_offset here.
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(0x14, 0x100);
    let (paths, _) = search(&snapshot, &config);
    assert_eq!(path_set(&paths), expect(&["80000410"]));

    // max_offset is exclusive.
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(4, 0x10);
    let (paths, _) = search(&snapshot, &config);
    assert_eq!(path_set(&paths), expect(&["80000410"]));
}

#[test]
fn test_unaligned_min_offset_is_a_hard_floor() {
    let snapshot = three_link_chain().build();

    // 9 is not a multiple of 4, so the 8 of the first link must not sneak through.
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(9, 0x100);
    let (paths, _) = search(&snapshot, &config);

    assert_eq!(path_set(&paths), expect(&["80000410", "80000208->10"]));
    for path in &paths {
        assert!(path.offsets.iter().all(|&offset| offset >= 9), "{} goes below min_offset", path);
    }
}

#[test]
fn test_cycle_is_not_followed_twice() {
    const A: u32 = 0x8000_0100;
    const B: u32 = 0x8000_0200;
    const T: u32 = 0x8000_0F00;

    let mut mock = MockSnapshot::new(BASE, 0x1000);
    mock.write_u32(0x8000_0100, B)
        .write_u32(0x8000_0108, B)
        .write_u32(0x8000_0204, A)
        .write_u32(0x8000_0208, T);
    let snapshot = mock.build();
    let config = ScanConfig::for_snapshot(&snapshot, T).with_offsets(4, 0x100);

    let (paths, _) = search(&snapshot, &config);

    assert_eq!(
        path_set(&paths),
        expect(&["80000100->8", "80000108->8", "80000204->8->8", "80000208"])
    );
    for path in &paths {
        let values = dereferenced_values(&snapshot, path);
        let distinct: HashSet<u32> = values.iter().copied().collect();
        assert_eq!(distinct.len(), values.len(), "{} revisits a pointer: {:X?}", path, values);
    }
}

#[test]
fn test_dense_snapshot_invariants() {
    let snapshot = dense_snapshot(BASE, 0x400, 0x5EED).build();
    let target = BASE + 0x100;
    let config = ScanConfig::for_snapshot(&snapshot, target).with_offsets(8, 0x20).with_depth(3);

    let (paths, counters) = search(&snapshot, &config);

    assert!(!paths.is_empty());
    assert_eq!(path_set(&paths).len(), paths.len(), "duplicate paths emitted");
    assert_eq!(counters.paths_found(), paths.len() as u64);
    assert!(counters.addresses_visited() >= paths.len() as u64);

    for path in &paths {
        assert!(snapshot.addressable_range().contains(path.base_address));
        assert!(path.offsets.len() <= config.max_depth as usize);
        for &offset in &path.offsets {
            assert!(offset >= 8 && offset < 0x20 && offset % 4 == 0, "bad offset in {}", path);
        }
        assert!(path.reaches(&snapshot, target), "{} does not reach the target", path);

        let values = dereferenced_values(&snapshot, path);
        let distinct: HashSet<u32> = values.iter().copied().collect();
        assert_eq!(distinct.len(), values.len());
    }
}

#[test]
fn test_search_is_deterministic_as_a_set() {
    let snapshot = dense_snapshot(BASE, 0x400, 42).build();
    let config = ScanConfig::for_snapshot(&snapshot, BASE + 0x80).with_offsets(4, 0x18).with_depth(3);

    let (first, _) = search(&snapshot, &config);
    let (second, _) = search(&snapshot, &config);

    assert_eq!(path_set(&first), path_set(&second));
    assert_eq!(first.len(), second.len());
}

#[test]
fn test_cancelled_token_stops_before_any_entry() {
    let snapshot = three_link_chain().build();
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(4, 0x100);
    let map = PointerMap::build(&snapshot, &config, &NullProgress, &CancelToken::new()).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let counters = ScanCounters::new();
    let (tx, rx) = unbounded();

    let fault = search_pointer_chains(&map, &config, &counters, &NullProgress, &cancel, &tx);
    drop(tx);

    assert_eq!(fault, None);
    assert_eq!(rx.iter().count(), 0);
    assert_eq!(counters.entries_done(), 0);
}

#[test]
fn test_search_survives_dropped_receiver() {
    let snapshot = three_link_chain().build();
    let config = ScanConfig::for_snapshot(&snapshot, 0x8000_0800).with_offsets(4, 0x100);
    let map = PointerMap::build(&snapshot, &config, &NullProgress, &CancelToken::new()).unwrap();

    let counters = ScanCounters::new();
    let (tx, rx) = unbounded();
    drop(rx);

    let fault = search_pointer_chains(&map, &config, &counters, &NullProgress, &CancelToken::new(), &tx);
    assert_eq!(fault, None);
    assert_eq!(counters.paths_found(), 3);
}

#[test]
fn test_chain_stack_to_path() {
    let mut stack = ChainStack::with_max_depth(2);
    assert_eq!(stack.capacity(), 3);

    stack.begin(ChainFrame::new(BASE, 0x10, 0x8000_0200));
    assert_eq!(stack.to_path(None), p("80000010"));
    assert_eq!(stack.to_path(Some(8)), p("80000010->8"));

    stack.push(ChainFrame::new(0x8000_0200, 8, 0x8000_0400));
    assert_eq!(stack.depth(), 2);
    assert!(stack.has_visited(0x8000_0400));
    assert!(!stack.has_visited(0x8000_0800));
    assert_eq!(stack.to_path(Some(0x10)), p("80000010->8->10"));

    stack.pop();
    assert_eq!(stack.top().value, 0x8000_0200);

    // Reuse for another base entry.
    stack.begin(ChainFrame::new(BASE, 0x20, 0x8000_0300));
    assert_eq!(stack.depth(), 1);
    assert_eq!(stack.frames().len(), 1);
}
