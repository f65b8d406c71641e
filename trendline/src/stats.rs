use serde::{Deserialize, Serialize};

use crate::detect::Segment;
use crate::sample::StatisticKind;
use crate::sequence::SampleSequence;
use crate::TrendError;

/// Min/max/sum over finite values only.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ValueAccumulator {
    min: f64,
    max: f64,
    sum: f64,
    count: usize,
}

impl ValueAccumulator {
    pub(crate) fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn merge(&mut self, other: &ValueAccumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub(crate) fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub(crate) fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Statistics of one segment over its inclusive index range.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentSummary {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Samples in the segment, finite or not.
    pub sample_count: usize,
    /// Samples that contributed to min/max/mean.
    pub finite_count: usize,
    pub delta: f64,
    pub duration_ms: i64,
    /// For each member sample, the summed change between consecutive finite
    /// values since the segment's first sample. Starts at zero; a non-finite
    /// sample repeats the previous total.
    pub from_segment_start: Vec<f64>,
}

pub(crate) fn accumulate(
    sequence: &SampleSequence,
    segment: &Segment,
    measure: usize,
) -> Result<ValueAccumulator, TrendError> {
    if segment.start_index > segment.end_index || segment.end_index >= sequence.count() {
        return Err(TrendError::invalid_input(format!(
            "segment [{}, {}] outside sequence of {} samples",
            segment.start_index,
            segment.end_index,
            sequence.count()
        )));
    }
    let mut acc = ValueAccumulator::default();
    for index in segment.start_index..=segment.end_index {
        let value = sequence
            .get(index)
            .and_then(|s| s.value(measure))
            .ok_or_else(|| {
                TrendError::invalid_input(format!(
                    "measure index {measure} out of bounds at sample {index}"
                ))
            })?;
        acc.push(value);
    }
    Ok(acc)
}

/// Min, max and arithmetic mean of `measure` over the segment's samples.
/// Non-finite values are skipped but still counted as members.
pub fn summarize(
    sequence: &SampleSequence,
    segment: &Segment,
    measure: usize,
) -> Result<SegmentSummary, TrendError> {
    let acc = accumulate(sequence, segment, measure)?;
    Ok(SegmentSummary {
        min: acc.min(),
        max: acc.max(),
        mean: acc.mean(),
        sample_count: segment.sample_count(),
        finite_count: acc.count(),
        delta: segment.delta(),
        duration_ms: segment.duration_ms(),
        from_segment_start: running_delta(sequence, segment, measure),
    })
}

/// Caller has checked the segment against the sequence bounds.
fn running_delta(sequence: &SampleSequence, segment: &Segment, measure: usize) -> Vec<f64> {
    let members = &sequence.samples()[segment.start_index..=segment.end_index];
    let mut totals = Vec::with_capacity(members.len());
    let mut prev: Option<f64> = None;
    let mut total = 0.0;
    for sample in members {
        let value = sample.value(measure).unwrap_or(f64::NAN);
        if value.is_finite() {
            if let Some(p) = prev {
                total += value - p;
            }
            prev = Some(value);
        }
        totals.push(total);
    }
    totals
}

/// Attaches running statistics of `measure` to every sample.
///
/// Values already stored on a sample are kept as they are.
pub fn annotate_running(sequence: &SampleSequence, measure: usize) -> Result<(), TrendError> {
    sequence.check_measure(measure)?;

    let mut acc = ValueAccumulator::default();
    let mut prev: Option<f64> = None;
    let mut cumulative_delta = 0.0;
    let mut gain = 0.0;
    let mut loss = 0.0;

    for sample in sequence {
        let value = sample.value(measure).unwrap_or(f64::NAN);
        if value.is_finite() {
            if let Some(p) = prev {
                let delta = value - p;
                cumulative_delta += delta;
                if delta > 0.0 {
                    gain += delta;
                } else {
                    loss -= delta;
                }
            }
            prev = Some(value);
            acc.push(value);
        }

        for kind in StatisticKind::ALL {
            let computed = match kind {
                StatisticKind::CumulativeDelta => cumulative_delta,
                StatisticKind::CumulativeGain => gain,
                StatisticKind::CumulativeLoss => loss,
                StatisticKind::RunningMin => acc.min().unwrap_or(f64::NAN),
                StatisticKind::RunningMax => acc.max().unwrap_or(f64::NAN),
                StatisticKind::RunningMean => acc.mean().unwrap_or(f64::NAN),
            };
            sample.statistic_or_insert_with(measure, kind, || computed);
        }
    }
    Ok(())
}
