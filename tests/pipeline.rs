//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end pipeline scenarios against the host engine: backpressure,
//! round-trip accuracy per layout, slot independence, and full-pool
//! batch runs.

use std::sync::Arc;
use std::time::Duration;

use fftpool::{FftDispatcher, FftError, FftJob, HostFftEngine, SampleLayout, SubmitError};

fn dispatcher(size: usize, layout: SampleLayout, slots: usize) -> FftDispatcher {
    let engine = Arc::new(HostFftEngine::new(size, layout).unwrap());
    FftDispatcher::new(engine, slots).unwrap()
}

fn random_job(layout: SampleLayout, size: usize) -> FftJob {
    let mut job = FftJob::new(layout, size);
    job.randomize(25.0, 0.0);
    job
}

#[test]
fn full_pool_rejects_with_the_job_handed_back() {
    let mut dispatcher = dispatcher(64, SampleLayout::Interleaved, 3);
    let slots: Vec<_> = (0..3)
        .map(|_| {
            dispatcher
                .submit_forward(random_job(SampleLayout::Interleaved, 64))
                .unwrap()
        })
        .collect();
    assert_eq!(dispatcher.in_flight(), 3);

    let mut extra = FftJob::new(SampleLayout::Interleaved, 64);
    extra.periodic();
    let mut reference = FftJob::new(SampleLayout::Interleaved, 64);
    reference.copy_from(&extra);

    let rejected = match dispatcher.submit_forward(extra) {
        Err(SubmitError::Backpressure(job)) => job,
        other => panic!("expected backpressure, got {:?}", other.map(|_| ())),
    };
    // The rejected job comes back untouched.
    assert_eq!(rejected.rms(&reference), 0.0);

    // Draining one slot makes room again, and the freed slot is reused.
    dispatcher.wait(slots[1]).unwrap();
    let reused = dispatcher.submit_forward(rejected).unwrap();
    assert_eq!(reused, slots[1]);
}

#[test]
fn wait_all_collects_everything_and_frees_the_pool() {
    let mut dispatcher = dispatcher(128, SampleLayout::Interleaved, 4);
    for _ in 0..4 {
        dispatcher
            .submit_forward(random_job(SampleLayout::Interleaved, 128))
            .unwrap();
    }
    let jobs = dispatcher.wait_all().unwrap();
    assert_eq!(jobs.len(), 4);
    assert_eq!(dispatcher.in_flight(), 0);
    // Idempotent on an idle pool.
    assert!(dispatcher.wait_all().unwrap().is_empty());
}

#[test]
fn wait_all_for_with_headroom_collects_everything() {
    let mut dispatcher = dispatcher(128, SampleLayout::Interleaved, 4);
    for _ in 0..4 {
        dispatcher
            .submit_forward(random_job(SampleLayout::Interleaved, 128))
            .unwrap();
    }
    let jobs = dispatcher.wait_all_for(Duration::from_secs(30)).unwrap();
    assert_eq!(jobs.len(), 4);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[test]
fn wait_all_for_expiry_loses_no_job() {
    let size = 1 << 20;
    let mut dispatcher = dispatcher(size, SampleLayout::Interleaved, 2);
    for _ in 0..2 {
        dispatcher
            .submit_forward(random_job(SampleLayout::Interleaved, size))
            .unwrap();
    }
    assert_eq!(
        dispatcher.wait_all_for(Duration::ZERO).unwrap_err(),
        FftError::Timeout
    );
    // Both pipelines are still collectable after the expiry.
    let jobs = dispatcher.wait_all().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(dispatcher.in_flight(), 0);
}

fn assert_round_trip(layout: SampleLayout, size: usize) {
    let mut dispatcher = dispatcher(size, layout, 1);

    let mut original = FftJob::new(layout, size);
    original.randomize(2.0, -1.0);
    let mut job = FftJob::new(layout, size);
    job.copy_from(&original);

    let slot = dispatcher.submit_forward(job).unwrap();
    let spectrum = dispatcher.wait(slot).unwrap();
    assert!(
        original.average_abs_diff(&spectrum) > 0.0,
        "{:?}: forward transform left the samples unchanged",
        layout
    );

    let slot = dispatcher.submit_backward(spectrum).unwrap();
    let mut restored = dispatcher.wait(slot).unwrap();
    restored.scale(1.0 / size as f64);

    let rms = original.rms(&restored);
    assert!(rms < 1e-3, "{:?}: round-trip rms {} too large", layout, rms);
    assert!(
        original.signal_to_quant_error(&restored) > 60.0,
        "{:?}: round-trip SQER too low",
        layout
    );
}

#[test]
fn interleaved_round_trip_restores_the_signal() {
    assert_round_trip(SampleLayout::Interleaved, 1024);
}

#[test]
fn planar_round_trip_restores_the_signal() {
    assert_round_trip(SampleLayout::Planar, 1024);
}

#[test]
fn real_round_trip_restores_the_signal() {
    assert_round_trip(SampleLayout::Real, 1024);
}

#[test]
fn concurrent_slots_do_not_bleed_into_each_other() {
    let size = 256;
    let mut dispatcher = dispatcher(size, SampleLayout::Interleaved, 4);

    // Four distinguishable inputs: a constant DC level per job, whose
    // forward transform concentrates all energy in bin zero with an
    // amplitude proportional to the level.
    let mut slots = Vec::new();
    for level in 1..=4 {
        let mut job = FftJob::new(SampleLayout::Interleaved, size);
        for i in 0..size {
            job.buffer_mut(0)[2 * i] = level as f32;
        }
        slots.push((level, dispatcher.submit_forward(job).unwrap()));
    }

    // Collect out of submission order.
    slots.reverse();
    for (level, slot) in slots {
        let spectrum = dispatcher.wait(slot).unwrap();
        let dc = spectrum.buffer(0)[0];
        let expected = (level * size) as f32;
        assert!(
            (dc - expected).abs() < 1e-2 * expected,
            "slot for level {} returned dc bin {}, expected {}",
            level,
            dc,
            expected
        );
        // Every other bin is empty for a constant input.
        assert!(spectrum.buffer(0)[2..].iter().all(|&s| s.abs() < 1e-2));
    }
}

#[test]
fn benchmark_scale_batch_transforms_every_job() {
    let size = 8192;
    let parallel = 16;
    let mut dispatcher = dispatcher(size, SampleLayout::Interleaved, parallel);

    let mut originals = Vec::new();
    for _ in 0..parallel {
        let job = random_job(SampleLayout::Interleaved, size);
        let mut keep = FftJob::new(SampleLayout::Interleaved, size);
        keep.copy_from(&job);
        originals.push(keep);
        dispatcher.submit_forward(job).unwrap();
    }
    assert_eq!(dispatcher.in_flight(), parallel);

    let spectra = dispatcher.wait_all().unwrap();
    assert_eq!(spectra.len(), parallel);
    assert_eq!(dispatcher.in_flight(), 0);
    for (original, spectrum) in originals.iter().zip(&spectra) {
        assert!(original.average_abs_diff(spectrum) > 0.0);
    }
}
