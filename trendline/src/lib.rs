//! Trend segmentation of recorded track measurements, with a content-addressed
//! cache so repeated requests for the same dataset are served without
//! recomputation.

use thiserror::Error;

pub mod boundary;
pub mod cache;
pub mod config;
pub mod detect;
pub mod pipeline;
pub mod sample;
pub mod sequence;
pub mod signal;
pub mod stats;

pub use boundary::{build_boundaries, BoundaryStatistics, TrendBoundary, ValueRange};
pub use cache::{CacheEntry, CacheSlot};
pub use config::{
    Bucketing, DetectorConfig, Smoothing, Tolerance, ToleranceMode, TrendConfig, WindowKind,
};
pub use detect::{check_partition, detect, merge_adjacent, Segment, TrendKind};
pub use pipeline::{derive, derive_measure, DerivedBundle, SlotId, TrendPipeline};
pub use sample::{Measure, Sample, StatisticKind};
pub use sequence::SampleSequence;
pub use signal::{detection_signal, smooth};
pub use stats::{annotate_running, summarize, SegmentSummary};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrendError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("computation failed: {0}")]
    ComputationFailure(String),
}

impl TrendError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        TrendError::InvalidInput(message.into())
    }

    pub fn computation_failure(message: impl Into<String>) -> Self {
        TrendError::ComputationFailure(message.into())
    }

    /// Failures of this kind leave the cache slot empty and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrendError::ComputationFailure(_))
    }
}
