use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use trendline::{
    derive, Bucketing, CacheSlot, SampleSequence, SlotId, TrendConfig, TrendError, TrendPipeline,
};

fn sequence(values: &[f64]) -> Arc<SampleSequence> {
    let times: Vec<i64> = (0..values.len() as i64).map(|i| i * 1_000).collect();
    Arc::new(SampleSequence::from_series(&times, values).expect("series should build"))
}

fn climb(n: usize) -> Vec<f64> {
    (0..n).map(|i| ((i as f64) * 0.3).sin() * 50.0 + i as f64).collect()
}

#[test]
fn concurrent_callers_share_one_computation() {
    const THREADS: usize = 8;
    let slot = Arc::new(CacheSlot::new());
    let seq = sequence(&climb(500));
    let barrier = Arc::new(Barrier::new(THREADS));
    let computed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let seq = Arc::clone(&seq);
            let barrier = Arc::clone(&barrier);
            let computed = Arc::clone(&computed);
            thread::spawn(move || {
                barrier.wait();
                slot.provide(seq, |s| {
                    computed.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    derive(s, &TrendConfig::default())
                })
                .expect("provide should succeed")
            })
        })
        .collect();

    let entries: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().expect("thread should join cleanly"))
        .collect();

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    assert_eq!(slot.builds(), 1);
    for entry in &entries[1..] {
        assert!(Arc::ptr_eq(&entries[0], entry));
    }
}

#[test]
fn failed_computation_reaches_every_caller() {
    const THREADS: usize = 6;
    let slot = Arc::new(CacheSlot::new());
    let seq = sequence(&climb(50));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let seq = Arc::clone(&seq);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                slot.provide(seq, |_| {
                    thread::sleep(Duration::from_millis(20));
                    Err(TrendError::computation_failure("backend unavailable"))
                })
            })
        })
        .collect();

    for worker in workers {
        let outcome = worker.join().expect("thread should join cleanly");
        assert!(matches!(outcome, Err(TrendError::ComputationFailure(_))));
    }
    assert!(slot.latest().is_none());

    let entry = slot
        .provide(Arc::clone(&seq), |s| derive(s, &TrendConfig::default()))
        .expect("retry should succeed");
    assert_eq!(entry.fingerprint, seq.fingerprint());
}

#[test]
fn pipeline_slots_compute_independently_under_load() {
    const SLOTS: usize = 4;
    const PER_SLOT: usize = 6;
    let pipeline = Arc::new(TrendPipeline::new());
    let seq = sequence(&climb(300));
    let barrier = Arc::new(Barrier::new(SLOTS * PER_SLOT));

    let workers: Vec<_> = (0..SLOTS * PER_SLOT)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let seq = Arc::clone(&seq);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let slot = SlotId::new(format!("chart-{}", i % SLOTS));
                barrier.wait();
                pipeline
                    .provide(&slot, Some(seq), &TrendConfig::default())
                    .expect("provide should succeed")
            })
        })
        .collect();

    for worker in workers {
        let bundle = worker.join().expect("thread should join cleanly");
        assert_eq!(bundle.fingerprint, seq.fingerprint());
        assert!(!bundle.segments.is_empty());
    }
    assert_eq!(pipeline.slot_count(), SLOTS);
    for i in 0..SLOTS {
        assert_eq!(pipeline.builds(&SlotId::new(format!("chart-{i}"))), 1);
    }
}

#[test]
fn racing_fingerprints_each_get_their_own_bundle() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 25;
    let slot = Arc::new(CacheSlot::new());
    let inputs = [sequence(&climb(120)), sequence(&climb(121))];
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let slot = Arc::clone(&slot);
            let seq = Arc::clone(&inputs[i % 2]);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let expected = seq.fingerprint();
                for _ in 0..ROUNDS {
                    let entry = slot
                        .provide(Arc::clone(&seq), |s| derive(s, &TrendConfig::default()))
                        .expect("provide should succeed");
                    assert_eq!(entry.fingerprint, expected);
                    assert_eq!(entry.bundle.fingerprint, expected);
                    assert_eq!(entry.sequence.fingerprint(), expected);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("thread should join cleanly");
    }
    let latest = slot.latest().expect("some entry should be stored");
    assert!(inputs.iter().any(|s| s.fingerprint() == latest.fingerprint));

    // Once the race is over, each input is served for itself and then cached.
    for seq in &inputs {
        let entry = slot
            .provide(Arc::clone(seq), |s| derive(s, &TrendConfig::default()))
            .expect("provide should succeed");
        assert_eq!(entry.bundle.fingerprint, seq.fingerprint());
        let again = slot
            .provide(Arc::clone(seq), |_| panic!("must be served from the slot"))
            .expect("cached");
        assert!(Arc::ptr_eq(&entry, &again));
    }
}

#[test]
fn invalidate_while_computing_discards_the_running_result() {
    let slot = Arc::new(CacheSlot::new());
    let seq = sequence(&climb(80));
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let leader = {
        let slot = Arc::clone(&slot);
        let seq = Arc::clone(&seq);
        thread::spawn(move || {
            slot.provide(seq, move |s| {
                started_tx.send(()).expect("main thread is listening");
                resume_rx.recv().expect("main thread resumes the computation");
                derive(s, &TrendConfig::default())
            })
            .expect("leader still receives its result")
        })
    };

    started_rx.recv().expect("computation should start");
    slot.invalidate();
    resume_tx.send(()).expect("leader is waiting");
    let stale = leader.join().expect("thread should join cleanly");

    assert_eq!(stale.generation, 0);
    assert!(slot.latest().is_none(), "invalidated result must not be stored");

    let fresh = slot
        .provide(Arc::clone(&seq), |s| derive(s, &TrendConfig::default()))
        .expect("recompute");
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert_eq!(fresh.generation, 1);
    assert_eq!(slot.builds(), 2);
}

#[test]
fn new_variant_during_computation_is_never_served_the_old_one() {
    let slot = Arc::new(CacheSlot::new());
    let seq = sequence(&climb(60));
    let (started_tx, started_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let slow = {
        let slot = Arc::clone(&slot);
        let seq = Arc::clone(&seq);
        thread::spawn(move || {
            slot.provide_variant(seq, 1, move |s| {
                started_tx.send(()).expect("main thread is listening");
                resume_rx.recv().expect("main thread resumes the computation");
                derive(s, &TrendConfig::default())
            })
            .expect("slow caller")
        })
    };

    started_rx.recv().expect("computation should start");
    let fast = slot
        .provide_variant(Arc::clone(&seq), 2, |s| derive(s, &TrendConfig::default()))
        .expect("fast caller computes its own variant");
    assert_eq!(fast.variant, 2);

    resume_tx.send(()).expect("slow caller is waiting");
    let old = slow.join().expect("thread should join cleanly");
    assert_eq!(old.variant, 1);

    // The slow result landed last; asking for variant 2 must not return it.
    let served = slot
        .provide_variant(Arc::clone(&seq), 2, |s| derive(s, &TrendConfig::default()))
        .expect("variant 2 again");
    assert_eq!(served.variant, 2);
    assert!(!Arc::ptr_eq(&served, &old));
}

#[test]
fn config_changes_and_invalidations_under_load_serve_matching_bundles() {
    const PER_CONFIG: usize = 4;
    const ROUNDS: usize = 40;
    let pipeline = Arc::new(TrendPipeline::new());
    let slot = SlotId::new("profile");
    let seq = sequence(&climb(200));
    let configs = [
        TrendConfig::default(),
        TrendConfig {
            buckets: Bucketing::Step(5.0),
            min_amplitude: Some(2.0),
            ..TrendConfig::default()
        },
    ];
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(2 * PER_CONFIG + 1));

    let invalidator = {
        let pipeline = Arc::clone(&pipeline);
        let slot = slot.clone();
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            while !done.load(Ordering::Acquire) {
                pipeline.invalidate(&slot);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let workers: Vec<_> = (0..2 * PER_CONFIG)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let slot = slot.clone();
            let seq = Arc::clone(&seq);
            let cfg = configs[i % 2];
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let bundle = pipeline
                        .provide(&slot, Some(Arc::clone(&seq)), &cfg)
                        .expect("provide should succeed");
                    assert_eq!(bundle.config, cfg);
                    assert_eq!(bundle.fingerprint, seq.fingerprint());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("thread should join cleanly");
    }
    done.store(true, Ordering::Release);
    invalidator.join().expect("invalidator should join cleanly");

    for cfg in &configs {
        let expected = derive(&seq, cfg).expect("derive");
        let served = pipeline
            .provide(&slot, Some(Arc::clone(&seq)), cfg)
            .expect("provide should succeed");
        assert_eq!(served.boundaries, expected.boundaries);
        assert_eq!(served.segments, expected.segments);
    }
}
