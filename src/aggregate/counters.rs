//! Lock-free per-variant counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// `f64` accumulator stored as raw bits and updated by compare-and-swap.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

/// Running totals for one variant.
#[derive(Debug)]
pub(crate) struct VariantCounters {
    participants: AtomicU64,
    conversions: AtomicU64,
    sum: AtomicF64,
    sum_sq: AtomicF64,
    last_updated_us: AtomicI64,
}

impl Default for VariantCounters {
    fn default() -> Self {
        Self {
            participants: AtomicU64::new(0),
            conversions: AtomicU64::new(0),
            sum: AtomicF64::default(),
            sum_sq: AtomicF64::default(),
            last_updated_us: AtomicI64::new(i64::MIN),
        }
    }
}

impl VariantCounters {
    pub(crate) fn add_participant(&self) {
        self.participants.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn add_conversion(&self) {
        self.conversions.fetch_add(1, Ordering::AcqRel);
    }

    /// Move a visitor's total from `before` to `after`.
    pub(crate) fn shift_total(&self, before: f64, after: f64) {
        self.sum.add(after - before);
        self.sum_sq.add(after.mul_add(after, -(before * before)));
    }

    pub(crate) fn touch(&self, at: DateTime<Utc>) {
        self.last_updated_us
            .fetch_max(at.timestamp_micros(), Ordering::AcqRel);
    }

    pub(crate) fn participants(&self) -> u64 {
        self.participants.load(Ordering::Acquire)
    }

    pub(crate) fn conversions(&self) -> u64 {
        self.conversions.load(Ordering::Acquire)
    }

    pub(crate) fn sum(&self) -> f64 {
        self.sum.load()
    }

    pub(crate) fn sum_sq(&self) -> f64 {
        self.sum_sq.load()
    }

    pub(crate) fn last_updated(&self) -> Option<DateTime<Utc>> {
        let us = self.last_updated_us.load(Ordering::Acquire);
        if us == i64::MIN {
            None
        } else {
            DateTime::from_timestamp_micros(us)
        }
    }
}
