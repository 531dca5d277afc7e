//! Process-wide counters and meters
//!
//! Counters are plain atomics; each meter sits behind its own lock so the
//! `(sum, sumsq, count)` triple never tears. Nothing serializes unrelated keys.

use crate::metrics::types::{Meter, MetricKey, MetricsSnapshot, NUM_COUNTERS, NUM_METERS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

static GLOBAL_REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

pub struct MetricsRegistry {
    counters: [AtomicI64; NUM_COUNTERS],
    meters: [Mutex<Meter>; NUM_METERS],
}

impl MetricsRegistry {
    /// Create an isolated, zeroed registry
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            meters: std::array::from_fn(|_| Mutex::new(Meter::default())),
        }
    }

    /// Shared registry, created on first use
    pub fn global() -> Arc<MetricsRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(MetricsRegistry::new()))
            .clone()
    }

    /// Count one occurrence
    pub fn count(&self, key: MetricKey) {
        self.count_by(key, 1);
    }

    /// Count `value` occurrences. Meter keys are ignored.
    pub fn count_by(&self, key: MetricKey, value: i64) {
        if let Some(idx) = key.counter_index() {
            self.counters[idx].fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Fold a measurement into a meter. Counter keys are ignored.
    pub fn measure(&self, key: MetricKey, value: f64) {
        if let Some(idx) = key.meter_index() {
            self.meters[idx].lock().record(value);
        }
    }

    /// Current counter value (0 for meter keys)
    pub fn counter(&self, key: MetricKey) -> i64 {
        key.counter_index()
            .map(|idx| self.counters[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current meter value (empty for counter keys)
    pub fn meter(&self, key: MetricKey) -> Meter {
        key.meter_index()
            .map(|idx| *self.meters[idx].lock())
            .unwrap_or_default()
    }

    /// Visit every counter in declaration order
    pub fn enumerate_counters<F>(&self, mut visit: F)
    where
        F: FnMut(MetricKey, i64),
    {
        for (key, slot) in MetricKey::COUNTERS.iter().zip(self.counters.iter()) {
            visit(*key, slot.load(Ordering::Relaxed));
        }
    }

    /// Visit every meter in declaration order
    pub fn enumerate_meters<F>(&self, mut visit: F)
    where
        F: FnMut(MetricKey, &Meter),
    {
        for (key, slot) in MetricKey::METERS.iter().zip(self.meters.iter()) {
            let meter = *slot.lock();
            visit(*key, &meter);
        }
    }

    /// Zero every counter and meter
    pub fn reset(&self) {
        for slot in &self.counters {
            slot.store(0, Ordering::Relaxed);
        }
        for slot in &self.meters {
            *slot.lock() = Meter::default();
        }
    }

    /// Read and zero every key in one step per key.
    ///
    /// An update racing with this call lands either in the returned snapshot
    /// or in the registry afterwards, never both and never neither.
    pub fn take_snapshot(&self) -> MetricsSnapshot {
        let counters = MetricKey::COUNTERS
            .iter()
            .zip(self.counters.iter())
            .map(|(key, slot)| (*key, slot.swap(0, Ordering::Relaxed)))
            .collect();

        let meters = MetricKey::METERS
            .iter()
            .zip(self.meters.iter())
            .map(|(key, slot)| (*key, std::mem::take(&mut *slot.lock())))
            .collect();

        MetricsSnapshot { counters, meters }
    }

    /// Copy of every key without resetting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        self.enumerate_counters(|key, value| snapshot.counters.push((key, value)));
        self.enumerate_meters(|key, meter| snapshot.meters.push((key, *meter)));
        snapshot
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
