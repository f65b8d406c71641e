//! Cleaning a measure into the signal the detector segments.

use crate::config::{DetectorConfig, Smoothing};
use crate::sequence::SampleSequence;
use crate::TrendError;

/// Values of `measure` as the detector sees them: readings above the
/// accuracy limit become NaN, then the optional moving window is applied.
pub fn detection_signal(
    sequence: &SampleSequence,
    measure: usize,
    config: &DetectorConfig,
) -> Result<Vec<f64>, TrendError> {
    let mut values = sequence.values(measure)?;
    if let Some(max_accuracy) = config.max_accuracy {
        mask_inaccurate(sequence, measure, max_accuracy, &mut values);
    }
    match &config.smoothing {
        Some(smoothing) => Ok(smooth(&values, smoothing)),
        None => Ok(values),
    }
}

fn mask_inaccurate(sequence: &SampleSequence, measure: usize, max_accuracy: f64, values: &mut [f64]) {
    for (value, sample) in values.iter_mut().zip(sequence) {
        let accuracy = sample.measure(measure).and_then(|m| m.accuracy);
        if matches!(accuracy, Some(a) if a.is_nan() || a > max_accuracy) {
            *value = f64::NAN;
        }
    }
}

/// Weighted moving average over the finite neighbours of each finite value.
///
/// Window positions falling outside the series or on a non-finite value drop
/// out and the remaining weights are renormalized. Non-finite values stay
/// non-finite.
pub fn smooth(values: &[f64], smoothing: &Smoothing) -> Vec<f64> {
    let weights = smoothing.weights();
    let radius = weights.len() / 2;
    let mut out = Vec::with_capacity(values.len());
    for (i, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            out.push(value);
            continue;
        }
        let start = i.saturating_sub(radius);
        let end = (i + radius + 1).min(values.len());
        let mut weighted = 0.0;
        let mut used = 0.0;
        for (j, &neighbour) in values.iter().enumerate().take(end).skip(start) {
            if !neighbour.is_finite() {
                continue;
            }
            let w = weights[j + radius - i];
            weighted += neighbour * w;
            used += w;
        }
        out.push(if used > 0.0 { weighted / used } else { value });
    }
    out
}
