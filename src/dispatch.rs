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

//! Drives the upload → transform → download pipeline for each submitted
//! job and exposes the per-slot and wait-all barriers.
//!
//! Submission runs on the caller's thread and only enqueues; it returns
//! once every stage is issued, not once it completes. Blocking happens
//! exclusively inside the wait paths. Submission is single-threaded by
//! construction (`&mut self`), which is what keeps the slot table free of
//! locks.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{Direction, TransformEngine};
use crate::error::{FftError, Result};
use crate::job::FftJob;
use crate::pool::{BufferPool, BufferSlot, SlotState};

/// Identifies one slot for later waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A rejected submission. `Backpressure` and `InvalidJob` hand the job
/// back untouched; a `Device` failure leaves the job captive in the now
/// tainted slot until `reset_tainted` drains it.
pub enum SubmitError {
    Backpressure(FftJob),
    InvalidJob { job: FftJob, reason: String },
    Device { slot: SlotId, error: FftError },
}

impl SubmitError {
    /// The error value without the payload.
    pub fn error(&self) -> FftError {
        match self {
            SubmitError::Backpressure(_) => FftError::Backpressure,
            SubmitError::InvalidJob { reason, .. } => FftError::InvalidInput(reason.clone()),
            SubmitError::Device { error, .. } => error.clone(),
        }
    }

    /// Recover the job, if this rejection handed it back.
    pub fn into_job(self) -> Option<FftJob> {
        match self {
            SubmitError::Backpressure(job) => Some(job),
            SubmitError::InvalidJob { job, .. } => Some(job),
            SubmitError::Device { .. } => None,
        }
    }
}

impl fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Backpressure(_) => f.write_str("Backpressure"),
            SubmitError::InvalidJob { reason, .. } => {
                f.debug_struct("InvalidJob").field("reason", reason).finish()
            }
            SubmitError::Device { slot, error } => f
                .debug_struct("Device")
                .field("slot", slot)
                .field("error", error)
                .finish(),
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error())
    }
}

/// Pipeline dispatcher over a fixed buffer pool.
pub struct FftDispatcher {
    pool: BufferPool,
}

impl FftDispatcher {
    /// Build a pool of `slot_count` slots against `engine`.
    pub fn new(engine: Arc<dyn TransformEngine>, slot_count: usize) -> Result<Self> {
        Ok(Self {
            pool: BufferPool::new(engine, slot_count)?,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.pool.slot_count()
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.pool.state(slot.0)
    }

    /// Slots currently carrying a pipeline.
    pub fn in_flight(&self) -> usize {
        (0..self.pool.slot_count())
            .filter(|&i| self.pool.state(i) == SlotState::InUse)
            .count()
    }

    /// Scratch bytes the engine's plan wants per slot (zero: none).
    pub fn scratch_buffer_size(&self) -> usize {
        self.pool.engine().scratch_buffer_size()
    }

    pub fn submit_forward(&mut self, job: FftJob) -> std::result::Result<SlotId, SubmitError> {
        self.submit(job, Direction::Forward)
    }

    pub fn submit_backward(&mut self, job: FftJob) -> std::result::Result<SlotId, SubmitError> {
        self.submit(job, Direction::Backward)
    }

    /// Acquire a slot, bind the job, and issue all three stages. Returns
    /// once issued. With no free slot the job comes straight back as
    /// `Backpressure` and nothing is consumed.
    fn submit(
        &mut self,
        job: FftJob,
        direction: Direction,
    ) -> std::result::Result<SlotId, SubmitError> {
        let engine = Arc::clone(self.pool.engine());
        if job.layout() != engine.layout() {
            return Err(SubmitError::InvalidJob {
                reason: format!(
                    "job layout {:?} does not match engine layout {:?}",
                    job.layout(),
                    engine.layout()
                ),
                job,
            });
        }
        if job.transform_size() != engine.transform_size() {
            return Err(SubmitError::InvalidJob {
                reason: format!(
                    "job length {} does not match transform size {}",
                    job.transform_size(),
                    engine.transform_size()
                ),
                job,
            });
        }

        let Some(index) = self.pool.acquire() else {
            return Err(SubmitError::Backpressure(job));
        };

        let slot = self.pool.slot_mut(index);
        slot.job = Some(job);
        match issue_pipeline(engine.as_ref(), slot, direction) {
            Ok(()) => {
                log::debug!("slot {}: issued {:?} pipeline", index, direction);
                Ok(SlotId(index))
            }
            Err(error) => {
                // Already-issued ops may still touch the job's buffers, so
                // the job stays captive until reset_tainted drains them.
                self.pool.taint(index);
                log::warn!("slot {}: pipeline issue failed, slot tainted: {}", index, error);
                Err(SubmitError::Device {
                    slot: SlotId(index),
                    error,
                })
            }
        }
    }

    /// Block until the slot's most recent pipeline completes, then free
    /// the slot and hand the transformed job back.
    pub fn wait(&mut self, slot: SlotId) -> Result<FftJob> {
        self.wait_until(slot, None)
    }

    /// Bounded wait. On expiry the slot stays in flight with its tokens
    /// intact; a later wait can still collect it.
    pub fn wait_for(&mut self, slot: SlotId, timeout: Duration) -> Result<FftJob> {
        self.wait_until(slot, Some(Instant::now() + timeout))
    }

    fn wait_until(&mut self, slot: SlotId, deadline: Option<Instant>) -> Result<FftJob> {
        let index = slot.0;
        if index >= self.pool.slot_count() {
            return Err(FftError::InvalidInput(format!(
                "slot {} out of range (pool holds {})",
                index,
                self.pool.slot_count()
            )));
        }
        match self.pool.state(index) {
            SlotState::Free => Err(FftError::InvalidInput(format!(
                "slot {} is not in flight",
                index
            ))),
            SlotState::Tainted => Err(FftError::InvalidInput(format!(
                "slot {} is tainted; reclaim it with reset_tainted",
                index
            ))),
            SlotState::InUse => {
                let tokens = self.pool.slot(index).tokens.clone();
                let engine = Arc::clone(self.pool.engine());
                let outcome = match deadline {
                    None => engine.wait(&tokens),
                    Some(d) => {
                        engine.wait_for(&tokens, d.saturating_duration_since(Instant::now()))
                    }
                };
                match outcome {
                    Ok(()) => {
                        let job = self
                            .pool
                            .slot_mut(index)
                            .job
                            .take()
                            .expect("in-use slot holds its job");
                        self.pool.release(index);
                        Ok(job)
                    }
                    Err(FftError::Timeout) => Err(FftError::Timeout),
                    Err(e) => {
                        // Every token resolved, so the failure is final;
                        // the job is reclaimable, the slot is not reusable
                        // until reset.
                        self.pool.slot_mut(index).tokens.clear();
                        self.pool.taint(index);
                        log::warn!("slot {}: pipeline failed during wait: {}", index, e);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Wait every in-flight slot in pool order and collect the jobs in
    /// that order. Wall time tracks the slowest slot, not the sum: each
    /// per-slot wait blocks only until that slot's own completion.
    pub fn wait_all(&mut self) -> Result<Vec<FftJob>> {
        let mut jobs = Vec::new();
        for index in 0..self.pool.slot_count() {
            if self.pool.state(index) == SlotState::InUse {
                jobs.push(self.wait_until(SlotId(index), None)?);
            }
        }
        Ok(jobs)
    }

    /// `wait_all` under one shared deadline. Completion is confirmed for
    /// every slot before anything is released, so expiry returns
    /// `Timeout` with every job still collectable later.
    pub fn wait_all_for(&mut self, timeout: Duration) -> Result<Vec<FftJob>> {
        let deadline = Instant::now() + timeout;
        let engine = Arc::clone(self.pool.engine());
        for index in 0..self.pool.slot_count() {
            if self.pool.state(index) != SlotState::InUse {
                continue;
            }
            let tokens = self.pool.slot(index).tokens.clone();
            match engine.wait_for(&tokens, deadline.saturating_duration_since(Instant::now())) {
                Ok(()) => self.pool.slot_mut(index).tokens.clear(),
                Err(FftError::Timeout) => return Err(FftError::Timeout),
                Err(e) => {
                    self.pool.slot_mut(index).tokens.clear();
                    self.pool.taint(index);
                    log::warn!("slot {}: pipeline failed during wait_all: {}", index, e);
                    return Err(e);
                }
            }
        }
        let mut jobs = Vec::new();
        for index in 0..self.pool.slot_count() {
            if self.pool.state(index) == SlotState::InUse {
                let job = self
                    .pool
                    .slot_mut(index)
                    .job
                    .take()
                    .expect("in-use slot holds its job");
                self.pool.release(index);
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Drain whatever a failed pipeline managed to issue, then return the
    /// captive job and put the slot back into rotation.
    pub fn reset_tainted(&mut self, slot: SlotId) -> Result<FftJob> {
        let index = slot.0;
        if index >= self.pool.slot_count() {
            return Err(FftError::InvalidInput(format!(
                "slot {} out of range (pool holds {})",
                index,
                self.pool.slot_count()
            )));
        }
        if self.pool.state(index) != SlotState::Tainted {
            return Err(FftError::InvalidInput(format!(
                "slot {} is not tainted",
                index
            )));
        }
        let tokens = self.pool.slot(index).tokens.clone();
        if !tokens.is_empty() {
            let engine = Arc::clone(self.pool.engine());
            // The failure is already recorded; only completion matters here.
            if let Err(e) = engine.wait(&tokens) {
                log::debug!("slot {}: drained failed pipeline: {}", index, e);
            }
        }
        let job = self
            .pool
            .slot_mut(index)
            .job
            .take()
            .expect("tainted slot holds its job");
        self.pool.release(index);
        Ok(job)
    }
}

/// Issue the three stages against the engine, threading completion tokens
/// between them: uploads first, the transform waiting on every upload,
/// downloads waiting on the transform. All issued tokens are recorded on
/// the slot so a partial failure can still be drained.
fn issue_pipeline(
    engine: &dyn TransformEngine,
    slot: &mut BufferSlot,
    direction: Direction,
) -> Result<()> {
    slot.tokens.clear();
    let buffer_count = slot
        .job
        .as_ref()
        .expect("job bound before issue")
        .buffer_count();

    let mut upload_tokens = Vec::with_capacity(buffer_count);
    for i in 0..buffer_count {
        let (ptr, len) = {
            let buf = slot.job.as_ref().expect("job bound before issue").buffer(i);
            (buf.as_ptr(), buf.len())
        };
        // SAFETY: the job is owned by the slot until a wait path detaches
        // it; the buffer outlives the op and no host-side writer exists
        // while the worker reads it.
        let token = unsafe { engine.enqueue_upload(slot.data[i], ptr, len, None) }?;
        slot.tokens.push(token);
        upload_tokens.push(token);
    }

    let transform = engine.enqueue_transform(direction, &slot.data, slot.scratch, &upload_tokens)?;
    slot.tokens.push(transform);

    for i in 0..buffer_count {
        let (ptr, len) = {
            let buf = slot
                .job
                .as_mut()
                .expect("job bound before issue")
                .buffer_mut(i);
            (buf.as_mut_ptr(), buf.len())
        };
        // SAFETY: as above, and the worker is the sole writer of this
        // buffer until the download token signals.
        let token = unsafe { engine.enqueue_download(slot.data[i], ptr, len, transform) }?;
        slot.tokens.push(token);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::host::HostFftEngine;
    use crate::job::SampleLayout;

    fn dispatcher(size: usize, layout: SampleLayout, slots: usize) -> FftDispatcher {
        let engine = Arc::new(HostFftEngine::new(size, layout).unwrap());
        FftDispatcher::new(engine, slots).unwrap()
    }

    #[test]
    fn submit_and_wait_transforms_in_place() {
        let mut dispatcher = dispatcher(64, SampleLayout::Interleaved, 2);
        let mut job = FftJob::new(SampleLayout::Interleaved, 64);
        job.periodic();
        let mut original = FftJob::new(SampleLayout::Interleaved, 64);
        original.copy_from(&job);

        let slot = dispatcher.submit_forward(job).unwrap();
        assert_eq!(dispatcher.state(slot), SlotState::InUse);
        let job = dispatcher.wait(slot).unwrap();
        assert_eq!(dispatcher.state(slot), SlotState::Free);
        assert!(original.average_abs_diff(&job) > 0.0);
    }

    #[test]
    fn mismatched_layout_is_rejected_with_job_returned() {
        let mut dispatcher = dispatcher(64, SampleLayout::Interleaved, 1);
        let job = FftJob::new(SampleLayout::Planar, 64);
        let err = dispatcher.submit_forward(job).unwrap_err();
        assert!(matches!(err.error(), FftError::InvalidInput(_)));
        assert!(err.into_job().is_some());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[test]
    fn mismatched_length_is_rejected_with_job_returned() {
        let mut dispatcher = dispatcher(64, SampleLayout::Interleaved, 1);
        let job = FftJob::new(SampleLayout::Interleaved, 128);
        let err = dispatcher.submit_forward(job).unwrap_err();
        assert!(matches!(err.error(), FftError::InvalidInput(_)));
        assert!(err.into_job().is_some());
    }

    #[test]
    fn waiting_an_idle_slot_is_an_input_error() {
        let mut dispatcher = dispatcher(64, SampleLayout::Interleaved, 1);
        assert!(matches!(
            dispatcher.wait(SlotId(0)),
            Err(FftError::InvalidInput(_))
        ));
    }

    #[test]
    fn wait_for_expiry_leaves_the_slot_collectable() {
        // Big enough that the pipeline cannot finish before a zero timeout.
        let size = 1 << 20;
        let mut dispatcher = dispatcher(size, SampleLayout::Interleaved, 1);
        let mut job = FftJob::new(SampleLayout::Interleaved, size);
        job.randomize(1.0, -0.5);
        let slot = dispatcher.submit_forward(job).unwrap();
        assert_eq!(
            dispatcher.wait_for(slot, Duration::ZERO).unwrap_err(),
            FftError::Timeout
        );
        assert_eq!(dispatcher.state(slot), SlotState::InUse);
        dispatcher.wait(slot).unwrap();
        assert_eq!(dispatcher.state(slot), SlotState::Free);
    }
}
