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

//! Asynchronous buffer-pool dispatcher for staged FFT jobs.
//!
//! The dispatcher keeps a fixed pool of pre-allocated device buffer slots
//! and pipelines each submitted job through upload, in-place transform,
//! and download stages on a [`TransformEngine`]. Submission never blocks:
//! a full pool rejects the job with backpressure and hands it back, and
//! all blocking is confined to the explicit wait calls.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fftpool::{FftDispatcher, FftJob, HostFftEngine, SampleLayout};
//!
//! let engine = Arc::new(HostFftEngine::new(8192, SampleLayout::Interleaved)?);
//! let mut dispatcher = FftDispatcher::new(engine, 16)?;
//!
//! let mut job = FftJob::new(SampleLayout::Interleaved, 8192);
//! job.randomize(25.0, 0.0);
//! let slot = dispatcher.submit_forward(job).expect("pool is idle");
//! let spectrum = dispatcher.wait(slot)?;
//! # let _ = spectrum;
//! # Ok::<(), fftpool::FftError>(())
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod job;
pub mod pool;

pub use dispatch::{FftDispatcher, SlotId, SubmitError};
pub use engine::host::HostFftEngine;
pub use engine::{BufferHandle, Direction, Token, TransformEngine};
pub use error::{FftError, Result};
pub use job::{FftJob, SampleLayout};
pub use pool::{BufferPool, BufferSlot, SlotState};
