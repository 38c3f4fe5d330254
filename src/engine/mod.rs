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

//! The transform-engine collaborator interface.
//!
//! An engine owns one in-order execution queue and one compiled plan
//! (fixed size and layout). Enqueue operations return opaque completion
//! tokens; dependencies between stages are expressed by passing earlier
//! tokens as `wait_on`.

pub mod host;

use std::time::Duration;

use crate::error::Result;
use crate::job::SampleLayout;

/// Transform direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Opaque completion token for one enqueued operation.
///
/// Tokens are one-shot: a successful `wait` consumes them. Waiting the
/// same token twice is an input error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub(crate) u64);

impl Token {
    /// Mint a token from an engine-chosen id. Engines own the id space;
    /// the dispatcher never inspects it.
    pub fn new(raw: u64) -> Self {
        Token(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Handle to one engine-owned device buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

impl BufferHandle {
    pub fn new(raw: u64) -> Self {
        BufferHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Engine-side operations the pool and dispatcher consume.
///
/// Ops are serialized in submission order on the engine's queue, so a
/// `wait_on` token obtained from an earlier enqueue on the same engine is
/// always satisfied before the dependent op runs.
pub trait TransformEngine: Send + Sync {
    /// Transform length in points the compiled plan was built for.
    fn transform_size(&self) -> usize;

    /// Sample layout the compiled plan expects.
    fn layout(&self) -> SampleLayout;

    /// Allocate a device buffer of `byte_size` bytes.
    fn allocate_buffer(&self, byte_size: usize) -> Result<BufferHandle>;

    /// Release a buffer obtained from `allocate_buffer`. Releasing an
    /// unknown handle is ignored (logged by implementations).
    fn release_buffer(&self, handle: BufferHandle);

    /// Scratch bytes the compiled plan needs per in-flight transform.
    /// Zero means no scratch buffer is required.
    fn scratch_buffer_size(&self) -> usize;

    /// Enqueue an async host-to-device copy of `len` floats.
    ///
    /// # Safety
    /// `src` must be valid for `len` floats and must stay valid and
    /// unaliased for writes until the returned token signals.
    unsafe fn enqueue_upload(
        &self,
        dst: BufferHandle,
        src: *const f32,
        len: usize,
        wait_on: Option<Token>,
    ) -> Result<Token>;

    /// Enqueue the in-place transform over `data` (one buffer, or the
    /// real/imag pair for planar layouts), started once every `wait_on`
    /// token has signalled.
    fn enqueue_transform(
        &self,
        direction: Direction,
        data: &[BufferHandle],
        scratch: Option<BufferHandle>,
        wait_on: &[Token],
    ) -> Result<Token>;

    /// Enqueue an async device-to-host copy of `len` floats.
    ///
    /// # Safety
    /// `dst` must be valid for `len` floats and must stay valid and
    /// unaliased until the returned token signals.
    unsafe fn enqueue_download(
        &self,
        src: BufferHandle,
        dst: *mut f32,
        len: usize,
        wait_on: Token,
    ) -> Result<Token>;

    /// Block until every token has signalled. Consumes the tokens.
    fn wait(&self, tokens: &[Token]) -> Result<()>;

    /// Bounded wait. On expiry returns `FftError::Timeout` and leaves the
    /// tokens pending so a later wait can still observe them.
    fn wait_for(&self, tokens: &[Token], timeout: Duration) -> Result<()>;
}
