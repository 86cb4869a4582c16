//! Pointer scan tests built on synthetic snapshots.


mod chain_search_tests;
