use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Bucketing;
use crate::detect::{Segment, TrendKind};
use crate::sequence::SampleSequence;
use crate::stats::{accumulate, ValueAccumulator};
use crate::TrendError;

/// Half-open value interval `[lower, upper)`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValueRange {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoundaryStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub sample_count: usize,
    pub segment_count: usize,
    /// Sum of start-to-end amplitudes of the member segments.
    pub abs_delta: f64,
    /// Running amplitude total over every segment of the same trend, up to
    /// and including this boundary's last member.
    pub cumulative_abs_delta: f64,
}

/// A bucketed value range aggregating segments of one trend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrendBoundary {
    pub id: usize,
    pub label: String,
    pub value_range: ValueRange,
    pub trend: TrendKind,
    pub statistics: BoundaryStatistics,
    /// Indices into the segment list this boundary was built from.
    pub segments: Vec<usize>,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Clone, Copy, Debug)]
struct BucketGrid {
    origin: f64,
    width: f64,
}

impl BucketGrid {
    fn new(bucketing: Bucketing, observed_min: f64, observed_max: f64) -> Self {
        match bucketing {
            Bucketing::Step(width) => Self { origin: 0.0, width },
            Bucketing::Count(count) => {
                let width = (observed_max - observed_min) / count as f64;
                Self {
                    origin: observed_min,
                    width: if width.is_finite() && width > 0.0 { width } else { 1.0 },
                }
            }
        }
    }

    fn bucket(&self, value: f64) -> i64 {
        ((value - self.origin) / self.width).floor() as i64
    }

    fn range(&self, first: i64, last: i64) -> ValueRange {
        ValueRange {
            lower: self.origin + first as f64 * self.width,
            upper: self.origin + (last + 1) as f64 * self.width,
        }
    }
}

struct Draft {
    boundary: TrendBoundary,
    values: ValueAccumulator,
}

/// Groups segments into trend boundaries.
///
/// Each segment's start/end value range is widened to bucket edges; segments
/// with the same trend and bucket span share one boundary. Output is ordered
/// by first appearance. Segments without any finite value join no boundary.
pub fn build_boundaries(
    sequence: &SampleSequence,
    segments: &[Segment],
    measure: usize,
    bucketing: Bucketing,
) -> Result<Vec<TrendBoundary>, TrendError> {
    bucketing.validate()?;
    let Some((observed_min, observed_max)) = sequence.value_range(measure) else {
        return Ok(Vec::new());
    };
    let grid = BucketGrid::new(bucketing, observed_min, observed_max);

    let mut drafts: Vec<Draft> = Vec::new();
    let mut by_key: HashMap<(TrendKind, i64, i64), usize> = HashMap::new();
    let mut trend_totals: HashMap<TrendKind, f64> = HashMap::new();

    for (segment_index, segment) in segments.iter().enumerate() {
        let values = accumulate(sequence, segment, measure)?;
        let Some((lo, hi, amplitude)) = segment_extent(segment, &values) else {
            continue;
        };
        let key = (segment.trend, grid.bucket(lo), grid.bucket(hi));
        let total = trend_totals.entry(segment.trend).or_insert(0.0);
        *total += amplitude;

        match by_key.get(&key).copied() {
            Some(at) => {
                let draft = &mut drafts[at];
                draft.values.merge(&values);
                let b = &mut draft.boundary;
                b.segments.push(segment_index);
                b.start_time = b.start_time.min(segment.start_time);
                b.end_time = b.end_time.max(segment.end_time);
                b.statistics.segment_count += 1;
                b.statistics.abs_delta += amplitude;
                b.statistics.cumulative_abs_delta = *total;
            }
            None => {
                let id = drafts.len();
                by_key.insert(key, id);
                drafts.push(Draft {
                    boundary: TrendBoundary {
                        id,
                        label: id.to_string(),
                        value_range: grid.range(key.1, key.2),
                        trend: segment.trend,
                        statistics: BoundaryStatistics {
                            min: f64::NAN,
                            max: f64::NAN,
                            mean: f64::NAN,
                            sample_count: 0,
                            segment_count: 1,
                            abs_delta: amplitude,
                            cumulative_abs_delta: *total,
                        },
                        segments: vec![segment_index],
                        start_time: segment.start_time,
                        end_time: segment.end_time,
                    },
                    values,
                });
            }
        }
    }

    Ok(drafts
        .into_iter()
        .map(|Draft { mut boundary, values }| {
            let stats = &mut boundary.statistics;
            stats.min = values.min().unwrap_or(f64::NAN);
            stats.max = values.max().unwrap_or(f64::NAN);
            stats.mean = values.mean().unwrap_or(f64::NAN);
            stats.sample_count = values.count();
            boundary
        })
        .collect())
}

/// `(low, high, amplitude)` of a segment, preferring its endpoint values and
/// falling back to the finite extremes inside it.
fn segment_extent(segment: &Segment, values: &ValueAccumulator) -> Option<(f64, f64, f64)> {
    if segment.start_value.is_finite() && segment.end_value.is_finite() {
        let lo = segment.start_value.min(segment.end_value);
        let hi = segment.start_value.max(segment.end_value);
        return Some((lo, hi, hi - lo));
    }
    let (lo, hi) = (values.min()?, values.max()?);
    Some((lo, hi, hi - lo))
}
