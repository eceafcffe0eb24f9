use std::sync::atomic::{AtomicU32, Ordering};

pub const DEFAULT_CEILING: u32 = 200;

/// Per-session count of model calls against a fixed ceiling.
#[derive(Debug)]
pub struct QuotaGuard {
    issued: AtomicU32,
    ceiling: u32,
}

impl QuotaGuard {
    pub fn new(ceiling: u32) -> Self {
        Self {
            issued: AtomicU32::new(0),
            ceiling,
        }
    }

    /// Counts one model call and returns the new total.
    pub fn record_call(&self) -> u32 {
        self.issued.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn exhausted(&self) -> bool {
        self.issued() >= self.ceiling
    }

    pub fn force_exhausted(&self) {
        self.issued.fetch_max(self.ceiling, Ordering::AcqRel);
    }
}

impl Default for QuotaGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CEILING)
    }
}
