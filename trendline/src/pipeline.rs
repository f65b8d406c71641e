use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::boundary::{build_boundaries, TrendBoundary};
use crate::cache::CacheSlot;
use crate::config::TrendConfig;
use crate::detect::{detect, Segment};
use crate::sequence::SampleSequence;
use crate::stats::{annotate_running, summarize, SegmentSummary};
use crate::TrendError;

/// Identifies one consumer of derived data, e.g. a chart and the measure it
/// plots.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub name: String,
    /// Measure to segment on; `None` uses the sequence's primary measure.
    pub measure_index: Option<usize>,
}

impl SlotId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            measure_index: None,
        }
    }

    pub fn for_measure(name: impl Into<String>, measure_index: usize) -> Self {
        Self {
            name: name.into(),
            measure_index: Some(measure_index),
        }
    }
}

/// Everything derived from one sequence in one pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedBundle {
    pub fingerprint: u64,
    pub measure_index: usize,
    /// Settings the bundle was derived with.
    pub config: TrendConfig,
    pub segments: Vec<Segment>,
    /// One summary per segment, same order.
    pub summaries: Vec<SegmentSummary>,
    pub boundaries: Vec<TrendBoundary>,
}

impl DerivedBundle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Uncached derivation on the sequence's primary measure.
pub fn derive(sequence: &SampleSequence, config: &TrendConfig) -> Result<DerivedBundle, TrendError> {
    derive_measure(sequence, sequence.primary_measure_index(), config)
}

/// Uncached derivation: detect segments, attach running statistics,
/// summarize each segment and group them into boundaries.
pub fn derive_measure(
    sequence: &SampleSequence,
    measure: usize,
    config: &TrendConfig,
) -> Result<DerivedBundle, TrendError> {
    config.validate()?;
    let segments = detect(sequence, measure, &config.detector())?;
    annotate_running(sequence, measure)?;
    let summaries = segments
        .iter()
        .map(|segment| summarize(sequence, segment, measure))
        .collect::<Result<Vec<_>, _>>()?;
    let boundaries = build_boundaries(sequence, &segments, measure, config.buckets)?;
    debug!(
        samples = sequence.count(),
        measure,
        segments = segments.len(),
        boundaries = boundaries.len(),
        "derived bundle"
    );
    Ok(DerivedBundle {
        fingerprint: sequence.fingerprint(),
        measure_index: measure,
        config: *config,
        segments,
        summaries,
        boundaries,
    })
}

/// Routes requests to per-consumer cache slots, created on first use.
///
/// Entries are keyed by the sequence fingerprint and the config fingerprint
/// together, so a slot never serves a bundle derived with other settings.
#[derive(Debug, Default)]
pub struct TrendPipeline {
    slots: RwLock<HashMap<SlotId, Arc<CacheSlot>>>,
}

impl TrendPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derived bundle for `sequence`, served from the slot when current.
    ///
    /// Without a sequence, returns whatever the slot last computed, or an
    /// empty bundle.
    pub fn provide(
        &self,
        slot: &SlotId,
        sequence: Option<Arc<SampleSequence>>,
        config: &TrendConfig,
    ) -> Result<Arc<DerivedBundle>, TrendError> {
        let cache = self.slot(slot);
        let Some(sequence) = sequence else {
            return Ok(cache
                .latest()
                .map(|entry| Arc::clone(&entry.bundle))
                .unwrap_or_else(|| Arc::new(DerivedBundle::empty())));
        };

        config.validate()?;
        let variant = config.fingerprint()?;
        let measure = slot
            .measure_index
            .unwrap_or_else(|| sequence.primary_measure_index());
        debug!(slot = %slot.name, measure, "providing derived bundle");
        let config = *config;
        let entry = cache.provide_variant(sequence, variant, move |seq| {
            derive_measure(seq, measure, &config)
        })?;
        Ok(Arc::clone(&entry.bundle))
    }

    pub fn invalidate(&self, slot: &SlotId) {
        if let Some(cache) = self.slots.read().get(slot) {
            cache.invalidate();
        }
    }

    /// Drops every slot and its cached entry.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Computations started for `slot` so far.
    pub fn builds(&self, slot: &SlotId) -> u64 {
        self.slots
            .read()
            .get(slot)
            .map(|cache| cache.builds())
            .unwrap_or(0)
    }

    fn slot(&self, slot: &SlotId) -> Arc<CacheSlot> {
        if let Some(cache) = self.slots.read().get(slot) {
            return Arc::clone(cache);
        }
        Arc::clone(self.slots.write().entry(slot.clone()).or_default())
    }
}
