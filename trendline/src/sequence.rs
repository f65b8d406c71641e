use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::sample::Sample;
use crate::TrendError;

pub const DEFAULT_PRIMARY_MEASURE_INDEX: usize = 0;

/// Ordered, read-only collection of samples with a primary measure used for
/// segmentation.
///
/// The fingerprint is computed once at construction from the primary measure
/// index and every sample's id, timestamp and measure values, in order.
#[derive(Clone, Debug, Serialize)]
pub struct SampleSequence {
    samples: Vec<Sample>,
    primary_measure_index: usize,
    fingerprint: u64,
}

impl SampleSequence {
    pub fn new(samples: Vec<Sample>, primary_measure_index: usize) -> Self {
        let fingerprint = fingerprint_samples(&samples, primary_measure_index);
        Self {
            samples,
            primary_measure_index,
            fingerprint,
        }
    }

    /// Builds a single-measure sequence from parallel timestamp/value slices.
    pub fn from_series(timestamps_ms: &[i64], values: &[f64]) -> Result<Self, TrendError> {
        if timestamps_ms.len() != values.len() {
            return Err(TrendError::invalid_input(format!(
                "series length mismatch: {} timestamps, {} values",
                timestamps_ms.len(),
                values.len()
            )));
        }
        let samples = timestamps_ms
            .iter()
            .zip(values)
            .enumerate()
            .map(|(i, (&t, &v))| Sample::scalar(i as u64, t, v))
            .collect();
        Ok(Self::new(samples, DEFAULT_PRIMARY_MEASURE_INDEX))
    }

    /// Same samples, different primary measure.
    pub fn with_primary_measure(self, primary_measure_index: usize) -> Self {
        Self::new(self.samples, primary_measure_index)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn primary_measure_index(&self) -> usize {
        self.primary_measure_index
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Fails when the sequence is empty or any sample lacks `measure`.
    pub fn check_measure(&self, measure: usize) -> Result<(), TrendError> {
        if self.is_empty() {
            return Err(TrendError::invalid_input("sequence is empty"));
        }
        if let Some(pos) = self.samples.iter().position(|s| s.measure(measure).is_none()) {
            return Err(TrendError::invalid_input(format!(
                "measure index {measure} out of bounds at sample {pos} ({} measures)",
                self.samples[pos].measures.len()
            )));
        }
        Ok(())
    }

    /// All values of `measure`, in order.
    pub fn values(&self, measure: usize) -> Result<Vec<f64>, TrendError> {
        self.check_measure(measure)?;
        Ok(self
            .samples
            .iter()
            .filter_map(|s| s.value(measure))
            .collect())
    }

    /// Finite minimum and maximum of `measure`, if any value is finite.
    pub fn value_range(&self, measure: usize) -> Option<(f64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| s.value(measure))
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

impl<'a> IntoIterator for &'a SampleSequence {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

fn fingerprint_samples(samples: &[Sample], primary_measure_index: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update((primary_measure_index as u64).to_le_bytes());
    hasher.update((samples.len() as u64).to_le_bytes());
    for sample in samples {
        hasher.update(sample.id.to_le_bytes());
        hasher.update(sample.timestamp_ms.to_le_bytes());
        hasher.update((sample.measures.len() as u64).to_le_bytes());
        for measure in &sample.measures {
            hasher.update(measure.value.to_bits().to_le_bytes());
            match measure.accuracy {
                Some(accuracy) => {
                    hasher.update([1u8]);
                    hasher.update(accuracy.to_bits().to_le_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
    }
    fold_digest(hasher)
}

/// First eight bytes of a finished SHA-256, little endian.
pub(crate) fn fold_digest(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
