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

//! Fixed-size pool of reusable device buffer slots.
//!
//! Every slot's device buffers are allocated once at pool construction and
//! released once at teardown; nothing is reallocated mid-run. Acquisition
//! is non-blocking and deterministic: lowest free index wins.

use std::sync::Arc;

use crate::engine::{BufferHandle, Token, TransformEngine};
use crate::error::{FftError, Result};
use crate::job::FftJob;

/// Lifecycle state of one slot.
///
/// `Tainted` marks a slot whose pipeline failed mid-issue: it is excluded
/// from acquisition until explicitly reclaimed, so a failure neither
/// corrupts the pool nor silently shrinks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InUse,
    Tainted,
}

/// One reusable device buffer unit: data buffer(s) sized for the engine's
/// transform, an optional scratch buffer sized by the plan, the job
/// currently in flight, and the token set of the most recent pipeline.
pub struct BufferSlot {
    pub(crate) data: Vec<BufferHandle>,
    pub(crate) scratch: Option<BufferHandle>,
    pub(crate) state: SlotState,
    pub(crate) job: Option<FftJob>,
    pub(crate) tokens: Vec<Token>,
}

impl BufferSlot {
    fn allocate(engine: &dyn TransformEngine) -> Result<Self> {
        let layout = engine.layout();
        let byte_size =
            layout.floats_per_buffer(engine.transform_size()) * std::mem::size_of::<f32>();

        let mut data = Vec::with_capacity(layout.buffer_count());
        for _ in 0..layout.buffer_count() {
            match engine.allocate_buffer(byte_size) {
                Ok(handle) => data.push(handle),
                Err(e) => {
                    for handle in data {
                        engine.release_buffer(handle);
                    }
                    return Err(FftError::Setup(format!(
                        "slot data buffer allocation failed: {}",
                        e
                    )));
                }
            }
        }

        let scratch = match engine.scratch_buffer_size() {
            0 => None,
            bytes => match engine.allocate_buffer(bytes) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    for handle in data {
                        engine.release_buffer(handle);
                    }
                    return Err(FftError::Setup(format!(
                        "slot scratch buffer allocation failed: {}",
                        e
                    )));
                }
            },
        };

        Ok(Self {
            data,
            scratch,
            state: SlotState::Free,
            job: None,
            tokens: Vec::new(),
        })
    }

    fn release_buffers(&mut self, engine: &dyn TransformEngine) {
        if let Some(handle) = self.scratch.take() {
            engine.release_buffer(handle);
        }
        for handle in self.data.drain(..).rev() {
            engine.release_buffer(handle);
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Ordered fixed-size sequence of slots sharing one engine.
///
/// The engine is borrowed via `Arc`, never owned, so independent pools can
/// coexist against the same engine and the engine always outlives the pool.
pub struct BufferPool {
    engine: Arc<dyn TransformEngine>,
    slots: Vec<BufferSlot>,
}

impl BufferPool {
    /// Allocate `slot_count` slots against `engine`. On any allocation
    /// failure, already-built slots are released before the error
    /// propagates: startup failure leaks no device buffers.
    pub fn new(engine: Arc<dyn TransformEngine>, slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(FftError::Setup("pool needs at least one slot".into()));
        }
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            match BufferSlot::allocate(engine.as_ref()) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for mut slot in slots.into_iter().rev() {
                        slot.release_buffers(engine.as_ref());
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { engine, slots })
    }

    pub fn engine(&self) -> &Arc<dyn TransformEngine> {
        &self.engine
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, index: usize) -> SlotState {
        self.slots[index].state
    }

    /// First free slot in ascending index order, marked in use. Tainted
    /// slots are skipped. Returns `None` when everything is occupied; the
    /// caller decides whether to retry after a wait.
    pub(crate) fn acquire(&mut self) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Free)?;
        self.slots[index].state = SlotState::InUse;
        Some(index)
    }

    /// Clear the in-use mark and detach job and tokens. Only reachable
    /// from the dispatcher's wait paths, after the pipeline completed.
    pub(crate) fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Free;
        slot.job = None;
        slot.tokens.clear();
    }

    pub(crate) fn taint(&mut self, index: usize) {
        self.slots[index].state = SlotState::Tainted;
    }

    pub(crate) fn slot(&self, index: usize) -> &BufferSlot {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut BufferSlot {
        &mut self.slots[index]
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.state != SlotState::Free {
                log::warn!(
                    "dropping pool with slot {} still {:?}; device work may be outstanding",
                    index,
                    slot.state
                );
            }
            slot.release_buffers(self.engine.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::host::HostFftEngine;
    use crate::job::SampleLayout;

    fn pool(slot_count: usize) -> BufferPool {
        let engine = Arc::new(HostFftEngine::new(64, SampleLayout::Interleaved).unwrap());
        BufferPool::new(engine, slot_count).unwrap()
    }

    #[test]
    fn acquire_yields_ascending_indices_on_idle_pool() {
        let mut pool = pool(4);
        let order: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn release_recycles_the_lowest_index_first() {
        let mut pool = pool(3);
        for _ in 0..3 {
            pool.acquire().unwrap();
        }
        pool.release(2);
        pool.release(0);
        assert_eq!(pool.acquire(), Some(0));
        assert_eq!(pool.acquire(), Some(2));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn tainted_slots_are_skipped() {
        let mut pool = pool(2);
        assert_eq!(pool.acquire(), Some(0));
        pool.taint(0);
        assert_eq!(pool.acquire(), Some(1));
        pool.release(1);
        // Slot 0 stays out of rotation until reclaimed.
        assert_eq!(pool.acquire(), Some(1));
        assert_eq!(pool.state(0), SlotState::Tainted);
    }

    #[test]
    fn zero_slots_is_a_setup_failure() {
        let engine = Arc::new(HostFftEngine::new(64, SampleLayout::Interleaved).unwrap());
        assert!(matches!(
            BufferPool::new(engine, 0),
            Err(FftError::Setup(_))
        ));
    }

    #[test]
    fn planar_slots_carry_a_buffer_pair() {
        let engine = Arc::new(HostFftEngine::new(64, SampleLayout::Planar).unwrap());
        let pool = BufferPool::new(engine, 1).unwrap();
        assert_eq!(pool.slot(0).data.len(), 2);
    }
}
