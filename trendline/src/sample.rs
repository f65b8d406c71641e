use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One named reading carried by a sample (elevation, speed, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Measure {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub accuracy: Option<f64>,
}

impl Measure {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            value,
            accuracy: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }
}

/// Running statistics that can be attached to a sample, per measure.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatisticKind {
    /// Signed sum of deltas since the first sample.
    CumulativeDelta,
    /// Sum of positive deltas since the first sample.
    CumulativeGain,
    /// Sum of negative deltas (as a positive number) since the first sample.
    CumulativeLoss,
    RunningMin,
    RunningMax,
    RunningMean,
}

impl StatisticKind {
    pub const ALL: [StatisticKind; 6] = [
        StatisticKind::CumulativeDelta,
        StatisticKind::CumulativeGain,
        StatisticKind::CumulativeLoss,
        StatisticKind::RunningMin,
        StatisticKind::RunningMax,
        StatisticKind::RunningMean,
    ];
}

/// Write-once memo keyed by `(measure index, kind)`.
///
/// Lookups take the read lock; a miss re-checks under the write lock before
/// inserting, so concurrent first accesses agree on a single stored value.
#[derive(Default)]
pub struct SampleStatistics {
    values: RwLock<HashMap<(usize, StatisticKind), f64>>,
}

impl SampleStatistics {
    pub fn get(&self, measure: usize, kind: StatisticKind) -> Option<f64> {
        self.values.read().get(&(measure, kind)).copied()
    }

    pub fn get_or_insert_with<F>(&self, measure: usize, kind: StatisticKind, compute: F) -> f64
    where
        F: FnOnce() -> f64,
    {
        if let Some(value) = self.get(measure, kind) {
            return value;
        }
        let mut values = self.values.write();
        *values.entry((measure, kind)).or_insert_with(compute)
    }
}

impl Clone for SampleStatistics {
    fn clone(&self) -> Self {
        Self {
            values: RwLock::new(self.values.read().clone()),
        }
    }
}

impl fmt::Debug for SampleStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.read().iter()).finish()
    }
}

/// A timestamped observation carrying one or more measures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sample {
    pub id: u64,
    pub timestamp_ms: i64,
    pub measures: Vec<Measure>,
    pub extra: Option<JsonValue>,
    #[serde(skip)]
    statistics: SampleStatistics,
}

impl Sample {
    pub fn new(id: u64, timestamp_ms: i64, measures: Vec<Measure>) -> Self {
        Self {
            id,
            timestamp_ms,
            measures,
            extra: None,
            statistics: SampleStatistics::default(),
        }
    }

    /// Single-measure sample, mostly useful for tests and synthetic series.
    pub fn scalar(id: u64, timestamp_ms: i64, value: f64) -> Self {
        Self::new(id, timestamp_ms, vec![Measure::new("value", "", value)])
    }

    pub fn with_extra(mut self, extra: JsonValue) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn measure(&self, index: usize) -> Option<&Measure> {
        self.measures.get(index)
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.measures.get(index).map(|m| m.value)
    }

    pub fn statistic(&self, measure: usize, kind: StatisticKind) -> Option<f64> {
        self.statistics.get(measure, kind)
    }

    /// Returns the stored statistic, computing and storing it on first access.
    pub fn statistic_or_insert_with<F>(&self, measure: usize, kind: StatisticKind, compute: F) -> f64
    where
        F: FnOnce() -> f64,
    {
        self.statistics.get_or_insert_with(measure, kind, compute)
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.timestamp_ms == other.timestamp_ms
            && self.measures == other.measures
            && self.extra == other.extra
    }
}
