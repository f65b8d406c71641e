//! Single-slot, content-addressed cache of derived bundles.
//!
//! A slot holds at most one [`CacheEntry`]. Readers load it without locking;
//! on a miss, callers asking for the same `(fingerprint, variant, generation)`
//! share a single computation and all receive the same `Arc`.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::pipeline::DerivedBundle;
use crate::sequence::SampleSequence;
use crate::TrendError;

/// A computed bundle together with the input it was derived from.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: u64,
    /// Caller-chosen key for the settings the bundle was computed with.
    pub variant: u64,
    pub generation: u64,
    pub sequence: Arc<SampleSequence>,
    pub bundle: Arc<DerivedBundle>,
}

type Outcome = Result<Arc<CacheEntry>, TrendError>;

#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Flight {
    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(done) = outcome.as_ref() {
                return done.clone();
            }
            self.ready.wait(&mut outcome);
        }
    }

    fn complete(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }
}

#[derive(Default)]
pub struct CacheSlot {
    entry: ArcSwapOption<CacheEntry>,
    generation: AtomicU64,
    flights: Mutex<HashMap<(u64, u64, u64), Arc<Flight>>>,
    builds: AtomicU64,
}

impl CacheSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `sequence`, computing it if the slot holds
    /// nothing current.
    pub fn provide<F>(&self, sequence: Arc<SampleSequence>, compute: F) -> Outcome
    where
        F: FnOnce(&SampleSequence) -> Result<DerivedBundle, TrendError>,
    {
        self.provide_variant(sequence, 0, compute)
    }

    /// Like [`provide`](Self::provide), but an entry only matches when it was
    /// computed for the same `variant` as well as the same content.
    ///
    /// `compute` runs at most once per `(fingerprint, variant, generation)`
    /// across all concurrent callers. If it fails or panics, the slot is
    /// emptied (unless a newer entry has been stored meanwhile) and every
    /// caller of that flight receives the error. A result finished after
    /// [`invalidate`](Self::invalidate) goes to its callers but is not stored.
    pub fn provide_variant<F>(
        &self,
        sequence: Arc<SampleSequence>,
        variant: u64,
        compute: F,
    ) -> Outcome
    where
        F: FnOnce(&SampleSequence) -> Result<DerivedBundle, TrendError>,
    {
        let fingerprint = sequence.fingerprint();
        let generation = self.generation.load(Ordering::Acquire);
        if let Some(entry) = self.current(fingerprint, variant, generation) {
            debug!(fingerprint = %Hex(fingerprint), variant = %Hex(variant), "cache hit");
            return Ok(entry);
        }

        let key = (fingerprint, variant, generation);
        let (flight, leader) = {
            let mut flights = self.flights.lock();
            // A leader may have stored between the load above and this lock.
            if let Some(entry) = self.current(fingerprint, variant, generation) {
                return Ok(entry);
            }
            match flights.entry(key) {
                Entry::Occupied(joined) => (Arc::clone(joined.get()), false),
                Entry::Vacant(vacant) => {
                    let flight = Arc::new(Flight::default());
                    vacant.insert(Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            debug!(fingerprint = %Hex(fingerprint), "joining in-flight computation");
            return flight.wait();
        }

        let observed = self.entry.load_full();
        let build = self.builds.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            fingerprint = %Hex(fingerprint),
            variant = %Hex(variant),
            generation,
            samples = sequence.count(),
            build,
            "computing derived bundle"
        );

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| compute(&sequence))) {
            Ok(Ok(bundle)) => {
                let entry = Arc::new(CacheEntry {
                    fingerprint,
                    variant,
                    generation,
                    sequence: Arc::clone(&sequence),
                    bundle: Arc::new(bundle),
                });
                self.store(&entry);
                Ok(entry)
            }
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(TrendError::computation_failure(panic_message(payload))),
        };

        if let Err(err) = &outcome {
            warn!(fingerprint = %Hex(fingerprint), error = %err, "computation failed, slot reset");
            self.entry.compare_and_swap(&observed, None::<Arc<CacheEntry>>);
        }

        self.flights.lock().remove(&key);
        flight.complete(outcome.clone());
        outcome
    }

    /// Forces the next `provide` to recompute, whatever its fingerprint.
    /// Computations already running keep their result out of the slot.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.entry.store(None);
        info!(generation, "cache slot invalidated");
    }

    /// Publishes `entry` unless the slot moved to a newer generation.
    ///
    /// The generation is re-read after the swap: an `invalidate` whose bump
    /// lands after that read also clears the slot after our swap, and one
    /// whose bump lands before it is caught here and undone.
    fn store(&self, entry: &Arc<CacheEntry>) {
        if self.generation.load(Ordering::Acquire) != entry.generation {
            debug!(generation = entry.generation, "stale result not stored");
            return;
        }
        let previous = self.entry.swap(Some(Arc::clone(entry)));
        let now = self.generation.load(Ordering::Acquire);
        if now != entry.generation {
            // Put back a current-generation entry we displaced, if any.
            let restore = previous.filter(|p| p.generation == now);
            self.entry.compare_and_swap(entry, restore);
            debug!(generation = entry.generation, "stale result withdrawn");
            return;
        }
        if let Some(previous) = previous {
            if previous.fingerprint != entry.fingerprint || previous.variant != entry.variant {
                info!(
                    old = %Hex(previous.fingerprint),
                    new = %Hex(entry.fingerprint),
                    variant = %Hex(entry.variant),
                    "cache entry superseded"
                );
            }
        }
    }

    pub fn latest(&self) -> Option<Arc<CacheEntry>> {
        self.entry.load_full()
    }

    /// Number of computations started on this slot.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn current(&self, fingerprint: u64, variant: u64, generation: u64) -> Option<Arc<CacheEntry>> {
        self.entry.load_full().filter(|e| {
            e.fingerprint == fingerprint && e.variant == variant && e.generation == generation
        })
    }
}

impl std::fmt::Debug for CacheSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("entry", &self.entry.load_full())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("builds", &self.builds())
            .finish()
    }
}

/// Fingerprints and variants are logged as fixed-width hex.
struct Hex(u64);

impl std::fmt::Display for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("computation panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("computation panicked: {msg}")
    } else {
        "computation panicked".to_string()
    }
}
