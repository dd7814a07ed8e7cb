// Cooperative cancellation and coarse progress for a load.
//
// The caller shares a LoadControl with the loader through an Arc.  The loader checks the cancel
// flag between files and records, never in the middle of one, and bumps the done counter as it
// goes; the caller polls `progress`.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct LoadControl {
    cancelled: AtomicBool,
    done: AtomicUsize,
    total: AtomicUsize,
}

impl LoadControl {
    pub fn new() -> LoadControl {
        Default::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns an error if the load has been cancelled.

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("Load cancelled");
        }
        Ok(())
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    pub fn add_to_total(&self, n: usize) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn advance(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of the work done, in [0,1].  Before the total is known this is 0.

    pub fn progress(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.done.load(Ordering::Relaxed);
        f64::min(done as f64 / total as f64, 1.0)
    }
}

#[test]
fn test_progress_and_cancel() {
    let c = LoadControl::new();
    assert!(c.progress() == 0.0);
    c.set_total(4);
    c.advance();
    assert!(c.progress() == 0.25);
    c.add_to_total(4);
    c.advance();
    c.advance();
    c.advance();
    assert!(c.progress() == 0.5);
    assert!(c.check().is_ok());
    c.cancel();
    assert!(c.is_cancelled());
    assert!(c.check().is_err());
}
