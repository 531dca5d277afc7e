//! Metric keys and meter values

use serde::{Deserialize, Serialize};

/// Number of counter keys
pub const NUM_COUNTERS: usize = 10;

/// Number of meter keys
pub const NUM_METERS: usize = 1;

/// Closed set of metric keys.
///
/// Counters come first, then meters. Storage in the registry is a pair of
/// fixed-size arrays indexed by the same key space, so adding a key means
/// adding a variant here and to the matching `COUNTERS`/`METERS` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKey {
    // Counters
    NumDataCorruptionErrors,
    NumFileIoErrors,
    NumFileOperationErrors,
    NumHttpErrors,
    NumMiscErrors,
    NumNetworkErrors,
    NumEvents,
    NumEventsDropped,
    NumUploads,
    NumUploadsSucceeded,

    // Meters
    RecordSize,
}

impl MetricKey {
    /// All counter keys, in declaration order
    pub const COUNTERS: [MetricKey; NUM_COUNTERS] = [
        MetricKey::NumDataCorruptionErrors,
        MetricKey::NumFileIoErrors,
        MetricKey::NumFileOperationErrors,
        MetricKey::NumHttpErrors,
        MetricKey::NumMiscErrors,
        MetricKey::NumNetworkErrors,
        MetricKey::NumEvents,
        MetricKey::NumEventsDropped,
        MetricKey::NumUploads,
        MetricKey::NumUploadsSucceeded,
    ];

    /// All meter keys, in declaration order
    pub const METERS: [MetricKey; NUM_METERS] = [MetricKey::RecordSize];

    /// Slot in the counter array, `None` for meter keys
    pub fn counter_index(self) -> Option<usize> {
        let idx = self as usize;
        (idx < NUM_COUNTERS).then_some(idx)
    }

    /// Slot in the meter array, `None` for counter keys
    pub fn meter_index(self) -> Option<usize> {
        (self as usize).checked_sub(NUM_COUNTERS)
    }

    pub fn is_counter(self) -> bool {
        self.counter_index().is_some()
    }

    pub fn is_meter(self) -> bool {
        self.meter_index().is_some()
    }

    /// Key name as reported upstream
    pub fn name(self) -> &'static str {
        match self {
            MetricKey::NumDataCorruptionErrors => "NumDataCorruptionErrors",
            MetricKey::NumFileIoErrors => "NumFileIoErrors",
            MetricKey::NumFileOperationErrors => "NumFileOperationErrors",
            MetricKey::NumHttpErrors => "NumHttpErrors",
            MetricKey::NumMiscErrors => "NumMiscErrors",
            MetricKey::NumNetworkErrors => "NumNetworkErrors",
            MetricKey::NumEvents => "NumEvents",
            MetricKey::NumEventsDropped => "NumEventsDropped",
            MetricKey::NumUploads => "NumUploads",
            MetricKey::NumUploadsSucceeded => "NumUploadsSucceeded",
            MetricKey::RecordSize => "RecordSize",
        }
    }

    /// Name used when exporting through the `metrics` facade
    pub fn metric_name(self) -> &'static str {
        match self {
            MetricKey::NumDataCorruptionErrors => "event_uplink_data_corruption_errors_total",
            MetricKey::NumFileIoErrors => "event_uplink_file_io_errors_total",
            MetricKey::NumFileOperationErrors => "event_uplink_file_operation_errors_total",
            MetricKey::NumHttpErrors => "event_uplink_http_errors_total",
            MetricKey::NumMiscErrors => "event_uplink_misc_errors_total",
            MetricKey::NumNetworkErrors => "event_uplink_network_errors_total",
            MetricKey::NumEvents => "event_uplink_events_total",
            MetricKey::NumEventsDropped => "event_uplink_events_dropped_total",
            MetricKey::NumUploads => "event_uplink_uploads_total",
            MetricKey::NumUploadsSucceeded => "event_uplink_uploads_succeeded_total",
            MetricKey::RecordSize => "event_uplink_record_size_bytes",
        }
    }
}

impl std::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Running first and second moment of a stream of measurements
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub sum: f64,
    pub sumsq: f64,
    pub count: u64,
}

impl Meter {
    /// Fold one measurement in
    pub fn record(&mut self, value: f64) {
        self.sum += value;
        self.sumsq += value * value;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Population variance, clamped at zero against rounding
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sumsq / self.count as f64 - mean * mean).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Combine two windows of the same stream
    pub fn merge(&mut self, other: &Meter) {
        self.sum += other.sum;
        self.sumsq += other.sumsq;
        self.count += other.count;
    }
}

/// Values of every key taken at one point per key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(MetricKey, i64)>,
    pub meters: Vec<(MetricKey, Meter)>,
}

impl MetricsSnapshot {
    pub fn counter(&self, key: MetricKey) -> i64 {
        self.counters
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    pub fn meter(&self, key: MetricKey) -> Meter {
        self.meters
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, m)| *m)
            .unwrap_or_default()
    }

    /// True when nothing was counted or measured
    pub fn is_empty(&self) -> bool {
        self.counters.iter().all(|(_, v)| *v == 0) && self.meters.iter().all(|(_, m)| m.is_empty())
    }

    /// Add a later snapshot into this one, key by key
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        for (key, value) in &other.counters {
            match self.counters.iter_mut().find(|(k, _)| k == key) {
                Some((_, total)) => *total += value,
                None => self.counters.push((*key, *value)),
            }
        }
        for (key, meter) in &other.meters {
            match self.meters.iter_mut().find(|(k, _)| k == key) {
                Some((_, total)) => total.merge(meter),
                None => self.meters.push((*key, *meter)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_space_is_partitioned() {
        for (i, key) in MetricKey::COUNTERS.iter().enumerate() {
            assert_eq!(key.counter_index(), Some(i));
            assert!(!key.is_meter());
        }
        for (i, key) in MetricKey::METERS.iter().enumerate() {
            assert_eq!(key.meter_index(), Some(i));
            assert!(!key.is_counter());
        }
    }

    #[test]
    fn test_meter_moments() {
        let mut meter = Meter::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            meter.record(v);
        }

        assert_eq!(meter.count, 8);
        assert!((meter.mean() - 5.0).abs() < 1e-9);
        assert!((meter.variance() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_meter() {
        let meter = Meter::default();
        assert!(meter.is_empty());
        assert_eq!(meter.mean(), 0.0);
        assert_eq!(meter.variance(), 0.0);
    }

    #[test]
    fn test_names() {
        assert_eq!(MetricKey::NumUploads.name(), "NumUploads");
        assert_eq!(MetricKey::RecordSize.to_string(), "RecordSize");
        assert!(MetricKey::NumHttpErrors.metric_name().starts_with("event_uplink_"));
    }

    #[test]
    fn test_snapshot_merge_adds_per_key() {
        let mut window = Meter::default();
        window.record(10.0);
        let mut total = MetricsSnapshot {
            counters: vec![(MetricKey::NumUploads, 2)],
            meters: vec![(MetricKey::RecordSize, window)],
        };

        let mut later = Meter::default();
        later.record(30.0);
        total.merge(&MetricsSnapshot {
            counters: vec![(MetricKey::NumUploads, 1), (MetricKey::NumHttpErrors, 4)],
            meters: vec![(MetricKey::RecordSize, later)],
        });

        assert_eq!(total.counter(MetricKey::NumUploads), 3);
        assert_eq!(total.counter(MetricKey::NumHttpErrors), 4);
        let meter = total.meter(MetricKey::RecordSize);
        assert_eq!(meter.count, 2);
        assert!((meter.mean() - 20.0).abs() < 1e-9);
    }
}
