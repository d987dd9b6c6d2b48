use std::sync::atomic::{AtomicBool, Ordering};

// Process-wide, not thread-local: the storage fan-out runs one thread per
// tier and every one of them must observe the same dry-run decision. The
// flag is set once at startup and never flipped mid-run, so tests that
// exercise mutating paths can rely on the default.
static DRY_RUN: AtomicBool = AtomicBool::new(false);

pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::Relaxed)
}

/// Called once from `main` after CLI parsing, before any phase runs.
pub fn set_dry_run(enabled: bool) {
    DRY_RUN.store(enabled, Ordering::Relaxed);
}
