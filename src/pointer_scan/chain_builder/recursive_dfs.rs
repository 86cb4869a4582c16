use super::*;

/// Read-only state shared by every search task.
pub struct DfsContext<'a> {
    pub slot_values: &'a [u32],
    pub adjacency: &'a Adjacency,
    pub virtual_base: u32,
    pub alignment: u32,
    pub max_depth: usize,
    pub search_address: u32,
    pub counters: &'a ScanCounters,
    pub cancel: &'a CancelToken,
    pub tx: &'a Sender<PointerPath>,
}

impl<'a> DfsContext<'a> {
    pub fn new(
        map: &'a PointerMap,
        config: &ScanConfig,
        counters: &'a ScanCounters,
        cancel: &'a CancelToken,
        tx: &'a Sender<PointerPath>,
    ) -> Self {
        Self {
            slot_values: map.slot_values(),
            adjacency: map.adjacency(),
            virtual_base: map.virtual_base(),
            alignment: map.alignment(),
            max_depth: config.max_depth as usize,
            search_address: config.search_address,
            counters,
            cancel,
            tx,
        }
    }

    #[inline]
    fn emit(&self, path: PointerPath) {
        self.counters.path_found();
        // The receiver may already be gone if the host stopped listening.
        let _ = self.tx.send(path);
    }
}

/// Searches every base map entry in parallel on the search pool.
///
/// Returns the first worker fault, if any. A fault cancels `cancel` so sibling
/// tasks wind down; paths already sent stay sent.
pub fn search_pointer_chains(
    map: &PointerMap,
    config: &ScanConfig,
    counters: &ScanCounters,
    progress: &dyn ProgressSink,
    cancel: &CancelToken,
    tx: &Sender<PointerPath>,
) -> Option<String> {
    let entries: Vec<(u32, u32)> = map.aligned_entries().iter().map(|(&addr, &value)| (addr, value)).collect();
    let total = entries.len().max(1) as f64;
    let ctx = DfsContext::new(map, config, counters, cancel, tx);
    let fault: OnceCell<String> = OnceCell::new();

    progress.set_caption("Pointer scan");
    progress.set_text("Running full pointer scan...");
    progress.report_fraction(0.0);

    info!(
        "Searching chains: target=0x{:08X}, depth={}, entries={}",
        config.search_address,
        config.max_depth,
        entries.len()
    );

    SEARCH_POOL.install(|| {
        entries.par_iter().for_each_init(
            || ChainStack::with_max_depth(config.max_depth),
            |stack, &(addr, value)| {
                if cancel.is_cancelled() {
                    return;
                }

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    search_from_entry(&ctx, stack, addr, value);
                    let done = counters.entry_done();
                    progress.report_fraction(done as f64 / total);
                }));

                if let Err(payload) = result {
                    let message = panic_message(payload.as_ref());
                    warn!("Search worker failed on base 0x{:08X}: {}", addr, message);
                    let _ = fault.set(format!("base 0x{:08X}: {}", addr, message));
                    cancel.cancel();
                }
            },
        );
    });

    if log_enabled!(Level::Debug) {
        debug!(
            "Chain search finished: {} entries, {} addresses visited, {} paths",
            counters.entries_done(),
            counters.addresses_visited(),
            counters.paths_found()
        );
    }

    fault.into_inner()
}

/// Searches one base map entry. `stack` is reset here, so it can be reused.
pub fn search_from_entry(ctx: &DfsContext, stack: &mut ChainStack, addr: u32, value: u32) {
    stack.begin(ChainFrame::new(ctx.virtual_base, addr - ctx.virtual_base, value));

    if value == ctx.search_address {
        ctx.emit(stack.to_path(None));
    } else if ctx.max_depth > 0 {
        dfs_recursive(ctx, stack);
    }
}

/// Follows every precomputed neighbour of the top frame's value.
fn dfs_recursive(ctx: &DfsContext, stack: &mut ChainStack) {
    if ctx.cancel.is_cancelled() {
        return;
    }

    let top = stack.top();
    // Pointers below the snapshot base are in range but have nothing to follow.
    let Some(relative) = top.value.checked_sub(ctx.virtual_base) else {
        return;
    };
    let slot = relative / ctx.alignment;
    let Some(deltas) = ctx.adjacency.get(slot) else {
        return;
    };

    for &delta in deltas {
        let offset = delta * ctx.alignment;
        let address = top.value.wrapping_add(offset);

        if address == ctx.search_address {
            ctx.counters.visit();
            ctx.emit(stack.to_path(Some(offset)));
            continue;
        }

        let next = ctx.slot_values[(slot + delta) as usize];
        if next == ctx.search_address {
            ctx.counters.visit();
            ctx.emit(stack.to_path(Some(offset)));
        } else if stack.depth() < ctx.max_depth && !stack.has_visited(next) {
            ctx.counters.visit();
            stack.push(ChainFrame::new(top.value, offset, next));
            dfs_recursive(ctx, stack);
            stack.pop();

            if ctx.cancel.is_cancelled() {
                return;
            }
        }
    }
}
