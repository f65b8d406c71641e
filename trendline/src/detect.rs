use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DetectorConfig;
use crate::sequence::SampleSequence;
use crate::signal::detection_signal;
use crate::TrendError;

/// Direction of a run of samples. Carries no display data.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TrendKind {
    Rising,
    Flat,
    Falling,
}

impl TrendKind {
    pub const ALL: [TrendKind; 3] = [TrendKind::Rising, TrendKind::Flat, TrendKind::Falling];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendKind::Rising => "rising",
            TrendKind::Flat => "flat",
            TrendKind::Falling => "falling",
        }
    }

    /// Classifies a value difference; anything within `eps` of zero is flat.
    pub fn classify(delta: f64, eps: f64) -> TrendKind {
        if delta > eps {
            TrendKind::Rising
        } else if delta < -eps {
            TrendKind::Falling
        } else {
            TrendKind::Flat
        }
    }
}

impl fmt::Display for TrendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximal run of samples sharing one trend. Indices are inclusive and a
/// segment's end index is the next segment's start index.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub start_index: usize,
    pub end_index: usize,
    pub start_time: i64,
    pub end_time: i64,
    pub start_value: f64,
    pub end_value: f64,
    pub trend: TrendKind,
}

impl Segment {
    pub fn sample_count(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    pub fn delta(&self) -> f64 {
        self.end_value - self.start_value
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_time - self.start_time
    }
}

/// Partitions the sequence into rising, flat and falling runs of `measure`.
///
/// Each step is compared against the last finite value; non-finite samples
/// never decide a trend and never break a run. Segment endpoint values are
/// taken from the cleaned signal (accuracy mask, then smoothing).
pub fn detect(
    sequence: &SampleSequence,
    measure: usize,
    config: &DetectorConfig,
) -> Result<Vec<Segment>, TrendError> {
    config.validate()?;
    let values = detection_signal(sequence, measure, config)?;
    let span = finite_span(&values);
    let eps = config.tolerance.epsilon(span);

    let mut segments = scan_runs(sequence, &values, eps);
    if let Some(min_amplitude) = config.min_amplitude {
        flatten_small(&mut segments, min_amplitude);
    }
    Ok(merge_adjacent(segments))
}

fn finite_span(values: &[f64]) -> f64 {
    let mut finite = values.iter().copied().filter(|v| v.is_finite());
    let Some(first) = finite.next() else {
        return 0.0;
    };
    let (lo, hi) = finite.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
    hi - lo
}

fn scan_runs(sequence: &SampleSequence, values: &[f64], eps: f64) -> Vec<Segment> {
    let n = values.len();
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut trend: Option<TrendKind> = None;
    let mut anchor: Option<usize> = values[0].is_finite().then_some(0);

    for (i, &value) in values.iter().enumerate().skip(1) {
        if !value.is_finite() {
            continue;
        }
        let Some(prev) = anchor else {
            anchor = Some(i);
            continue;
        };
        let step = TrendKind::classify(value - values[prev], eps);
        match trend {
            None => trend = Some(step),
            Some(current) if current == step => {}
            Some(current) => {
                segments.push(make_segment(sequence, values, start, prev, current));
                start = prev;
                trend = Some(step);
            }
        }
        anchor = Some(i);
    }

    segments.push(make_segment(
        sequence,
        values,
        start,
        n - 1,
        trend.unwrap_or(TrendKind::Flat),
    ));
    segments
}

fn make_segment(
    sequence: &SampleSequence,
    values: &[f64],
    start: usize,
    end: usize,
    trend: TrendKind,
) -> Segment {
    let time_at = |i: usize| sequence.get(i).map(|s| s.timestamp_ms).unwrap_or_default();
    Segment {
        start_index: start,
        end_index: end,
        start_time: time_at(start),
        end_time: time_at(end),
        start_value: values[start],
        end_value: values[end],
        trend,
    }
}

fn flatten_small(segments: &mut [Segment], min_amplitude: f64) {
    for segment in segments.iter_mut() {
        if segment.trend != TrendKind::Flat && segment.delta().abs() < min_amplitude {
            segment.trend = TrendKind::Flat;
        }
    }
}

/// Collapses neighbours that share a trend into one segment.
pub fn merge_adjacent(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match merged.last_mut() {
            Some(last) if last.trend == segment.trend => {
                last.end_index = segment.end_index;
                last.end_time = segment.end_time;
                last.end_value = segment.end_value;
            }
            _ => merged.push(segment),
        }
    }
    merged
}

/// Verifies that `segments` partition `[0, len - 1]` with shared boundary
/// samples and no equal-trend neighbours.
pub fn check_partition(segments: &[Segment], len: usize) -> Result<(), TrendError> {
    if len == 0 {
        return Err(TrendError::invalid_input("cannot partition an empty sequence"));
    }
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return Err(TrendError::invalid_input("no segments for a non-empty sequence"));
    };
    if first.start_index != 0 || last.end_index != len - 1 {
        return Err(TrendError::invalid_input(format!(
            "segments cover [{}, {}], expected [0, {}]",
            first.start_index,
            last.end_index,
            len - 1
        )));
    }
    for segment in segments {
        if segment.start_index > segment.end_index {
            return Err(TrendError::invalid_input(format!(
                "segment start {} after end {}",
                segment.start_index, segment.end_index
            )));
        }
    }
    for pair in segments.windows(2) {
        if pair[0].end_index != pair[1].start_index {
            return Err(TrendError::invalid_input(format!(
                "gap or overlap between segment ending at {} and segment starting at {}",
                pair[0].end_index, pair[1].start_index
            )));
        }
        if pair[0].trend == pair[1].trend {
            return Err(TrendError::invalid_input(format!(
                "adjacent segments share trend {} at index {}",
                pair[0].trend, pair[0].end_index
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Smoothing, Tolerance, WindowKind};
    use crate::sample::{Measure, Sample};

    fn seq(values: &[f64]) -> SampleSequence {
        let times: Vec<i64> = (0..values.len() as i64).map(|i| i * 10).collect();
        SampleSequence::from_series(&times, values).expect("series should build")
    }

    fn spans(segments: &[Segment]) -> Vec<(usize, usize, TrendKind)> {
        segments
            .iter()
            .map(|s| (s.start_index, s.end_index, s.trend))
            .collect()
    }

    fn run(values: &[f64]) -> Vec<Segment> {
        detect(&seq(values), 0, &DetectorConfig::default()).expect("detection should succeed")
    }

    #[test]
    fn peak_splits_into_rising_then_falling() {
        let segments = run(&[1.0, 2.0, 3.0, 2.0, 1.0]);
        assert_eq!(
            spans(&segments),
            vec![(0, 2, TrendKind::Rising), (2, 4, TrendKind::Falling)]
        );
        assert_eq!(segments[0].start_time, 0);
        assert_eq!(segments[0].end_time, 20);
        assert_eq!(segments[1].end_time, 40);
        assert_eq!(segments[1].start_value, 3.0);
        assert_eq!(segments[1].end_value, 1.0);
    }

    #[test]
    fn constant_series_is_one_flat_segment() {
        assert_eq!(spans(&run(&[5.0, 5.0, 5.0])), vec![(0, 2, TrendKind::Flat)]);
    }

    #[test]
    fn single_sample_is_flat() {
        assert_eq!(spans(&run(&[42.0])), vec![(0, 0, TrendKind::Flat)]);
    }

    #[test]
    fn strictly_monotonic_is_one_segment() {
        assert_eq!(
            spans(&run(&[9.0, 7.0, 4.0, 0.0, -3.0])),
            vec![(0, 4, TrendKind::Falling)]
        );
    }

    #[test]
    fn steps_within_tolerance_are_flat_regardless_of_sign() {
        // Default tolerance is 1e-3.
        let segments = run(&[10.0, 10.0004, 9.9997, 10.0002]);
        assert_eq!(spans(&segments), vec![(0, 3, TrendKind::Flat)]);
    }

    #[test]
    fn nan_does_not_break_a_rising_run() {
        let segments = run(&[1.0, 2.0, f64::NAN, 3.0, 4.0]);
        assert_eq!(spans(&segments), vec![(0, 4, TrendKind::Rising)]);
    }

    #[test]
    fn leading_and_trailing_non_finite_samples_stay_covered() {
        let segments = run(&[f64::NAN, 1.0, 2.0, 1.0, f64::INFINITY]);
        assert_eq!(
            spans(&segments),
            vec![(0, 2, TrendKind::Rising), (2, 4, TrendKind::Falling)]
        );
        check_partition(&segments, 5).expect("partition should hold");
    }

    #[test]
    fn all_non_finite_is_flat() {
        assert_eq!(
            spans(&run(&[f64::NAN, f64::NAN])),
            vec![(0, 1, TrendKind::Flat)]
        );
    }

    #[test]
    fn plateau_between_climbs() {
        let segments = run(&[0.0, 1.0, 2.0, 2.0, 2.0, 3.0]);
        assert_eq!(
            spans(&segments),
            vec![
                (0, 2, TrendKind::Rising),
                (2, 4, TrendKind::Flat),
                (4, 5, TrendKind::Rising)
            ]
        );
    }

    #[test]
    fn empty_sequence_is_invalid_input() {
        let empty = SampleSequence::new(Vec::new(), 0);
        let err = detect(&empty, 0, &DetectorConfig::default()).unwrap_err();
        assert!(matches!(err, TrendError::InvalidInput(_)));
    }

    #[test]
    fn out_of_range_measure_is_invalid_input() {
        let err = detect(&seq(&[1.0, 2.0]), 3, &DetectorConfig::default()).unwrap_err();
        assert!(matches!(err, TrendError::InvalidInput(_)));
    }

    #[test]
    fn relative_tolerance_flattens_noise_on_large_spans() {
        let values = [0.0, 500.0, 500.2, 499.9, 1000.0];
        let absolute = detect(&seq(&values), 0, &DetectorConfig::default()).expect("absolute");
        assert_eq!(absolute.len(), 3);

        let config = DetectorConfig {
            tolerance: Tolerance::relative(3),
            ..DetectorConfig::default()
        };
        let relative = detect(&seq(&values), 0, &config).expect("relative");
        assert_eq!(
            spans(&relative),
            vec![
                (0, 1, TrendKind::Rising),
                (1, 3, TrendKind::Flat),
                (3, 4, TrendKind::Rising)
            ]
        );
    }

    #[test]
    fn min_amplitude_flattens_and_merges_small_runs() {
        let values = [0.0, 0.5, 0.2, 0.6, 0.1, 10.0];
        let config = DetectorConfig {
            min_amplitude: Some(1.0),
            ..DetectorConfig::default()
        };
        let segments = detect(&seq(&values), 0, &config).expect("detection should succeed");
        assert_eq!(
            spans(&segments),
            vec![(0, 4, TrendKind::Flat), (4, 5, TrendKind::Rising)]
        );
        check_partition(&segments, values.len()).expect("partition should hold");
    }

    #[test]
    fn inaccurate_spike_is_ignored_when_limited() {
        let readings = [(100.0, 4.0), (101.0, 4.0), (160.0, 90.0), (102.0, 4.0), (103.0, 5.0)];
        let samples = readings
            .iter()
            .enumerate()
            .map(|(i, &(value, accuracy))| {
                Sample::new(
                    i as u64,
                    i as i64 * 10,
                    vec![Measure::new("elevation", "m", value).with_accuracy(accuracy)],
                )
            })
            .collect();
        let s = SampleSequence::new(samples, 0);

        let raw = detect(&s, 0, &DetectorConfig::default()).expect("raw");
        assert_eq!(raw.len(), 3);

        let config = DetectorConfig {
            max_accuracy: Some(50.0),
            ..DetectorConfig::default()
        };
        let cleaned = detect(&s, 0, &config).expect("cleaned");
        assert_eq!(spans(&cleaned), vec![(0, 4, TrendKind::Rising)]);
        assert_eq!(cleaned[0].end_value, 103.0);
    }

    #[test]
    fn smoothing_absorbs_single_sample_dips() {
        let values = [0.0, 10.0, 20.0, 30.0, 28.0, 50.0, 60.0, 70.0, 80.0];
        assert_eq!(run(&values).len(), 3);

        let config = DetectorConfig {
            smoothing: Some(Smoothing::new(WindowKind::Triangular, 5)),
            ..DetectorConfig::default()
        };
        let segments = detect(&seq(&values), 0, &config).expect("smoothed");
        assert_eq!(spans(&segments), vec![(0, 8, TrendKind::Rising)]);
        check_partition(&segments, values.len()).expect("partition should hold");
    }

    #[test]
    fn even_smoothing_window_is_rejected() {
        let config = DetectorConfig {
            smoothing: Some(Smoothing::new(WindowKind::Gaussian, 4)),
            ..DetectorConfig::default()
        };
        assert!(matches!(
            detect(&seq(&[1.0, 2.0]), 0, &config),
            Err(TrendError::InvalidInput(_))
        ));
    }

    #[test]
    fn merge_adjacent_joins_equal_neighbours() {
        let a = Segment {
            start_index: 0,
            end_index: 2,
            start_time: 0,
            end_time: 20,
            start_value: 1.0,
            end_value: 3.0,
            trend: TrendKind::Rising,
        };
        let b = Segment {
            start_index: 2,
            end_index: 5,
            start_time: 20,
            end_time: 50,
            start_value: 3.0,
            end_value: 8.0,
            trend: TrendKind::Rising,
        };
        let merged = merge_adjacent(vec![a, b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].end_index, 5);
        assert_eq!(merged[0].end_value, 8.0);
        assert_eq!(merged[0].duration_ms(), 50);
        assert_eq!(merged[0].sample_count(), 6);
    }

    #[test]
    fn check_partition_flags_gaps() {
        let mut segments = run(&[1.0, 2.0, 3.0, 2.0, 1.0]);
        segments[1].start_index = 3;
        assert!(check_partition(&segments, 5).is_err());
    }
}
