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

//! Host-side reference engine: one dedicated worker thread drains a
//! bounded in-order op queue and signals completion tokens through a
//! condvar-backed table. Transforms run on rustfft plans compiled once at
//! construction; the plan's in-place scratch requirement is what
//! `scratch_buffer_size` reports, so slot scratch buffers are real
//! operands rather than decoration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::engine::{BufferHandle, Direction, Token, TransformEngine};
use crate::error::{FftError, Result};
use crate::job::SampleLayout;

/// Host pointer captured into a queued upload.
// Safe to send: the dispatcher keeps the job sequestered in its slot until
// the pipeline's tokens are waited, so the pointee outlives the op and is
// never aliased for writes while the worker reads it.
struct SendConstPtr(*const f32);
unsafe impl Send for SendConstPtr {}

/// Host pointer captured into a queued download. Same contract as above,
/// with the worker holding the only write access until the token signals.
struct SendMutPtr(*mut f32);
unsafe impl Send for SendMutPtr {}

enum EngineOp {
    Upload {
        src: SendConstPtr,
        len: usize,
        dst: u64,
        token: u64,
    },
    Transform {
        direction: Direction,
        data: Vec<u64>,
        scratch: Option<u64>,
        token: u64,
    },
    Download {
        src: u64,
        len: usize,
        dst: SendMutPtr,
        token: u64,
    },
}

#[derive(Clone, Debug)]
enum TokenState {
    Pending,
    Done,
    Failed(String),
}

/// Completion tokens, signalled by the worker and consumed by `wait`.
struct TokenTable {
    states: Mutex<HashMap<u64, TokenState>>,
    signal: Condvar,
}

impl TokenTable {
    fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            signal: Condvar::new(),
        }
    }

    fn register(&self, id: u64) {
        self.states.lock().unwrap().insert(id, TokenState::Pending);
    }

    fn unregister(&self, id: u64) {
        self.states.lock().unwrap().remove(&id);
    }

    fn is_known(&self, id: u64) -> bool {
        self.states.lock().unwrap().contains_key(&id)
    }

    fn complete(&self, id: u64, outcome: std::result::Result<(), String>) {
        let mut states = self.states.lock().unwrap();
        let state = match outcome {
            Ok(()) => TokenState::Done,
            Err(msg) => TokenState::Failed(msg),
        };
        states.insert(id, state);
        self.signal.notify_all();
    }

    /// Block until every listed token is signalled, then consume them all.
    /// With a deadline, expiry returns `Timeout` and consumes nothing.
    fn wait(&self, tokens: &[Token], deadline: Option<Instant>) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut states = self.states.lock().unwrap();
        loop {
            let mut all_signalled = true;
            for t in tokens {
                match states.get(&t.0) {
                    None => {
                        return Err(FftError::InvalidInput(format!(
                            "unknown or already-consumed token {}",
                            t.0
                        )))
                    }
                    Some(TokenState::Pending) => {
                        all_signalled = false;
                        break;
                    }
                    Some(_) => {}
                }
            }
            if all_signalled {
                let mut failure: Option<String> = None;
                for t in tokens {
                    if let Some(TokenState::Failed(msg)) = states.remove(&t.0) {
                        failure.get_or_insert(msg);
                    }
                }
                return match failure {
                    Some(msg) => Err(FftError::DeviceOp(msg)),
                    None => Ok(()),
                };
            }
            match deadline {
                None => states = self.signal.wait(states).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(FftError::Timeout);
                    }
                    let (guard, _) = self.signal.wait_timeout(states, d - now).unwrap();
                    states = guard;
                }
            }
        }
    }
}

struct EngineShared {
    buffers: Mutex<HashMap<u64, Vec<f32>>>,
    tokens: TokenTable,
}

struct Plans {
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Plans {
    fn for_direction(&self, direction: Direction) -> &Arc<dyn Fft<f32>> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.inverse,
        }
    }
}

/// Reference `TransformEngine` running transforms on a host worker thread.
///
/// The queue is bounded: when it fills, enqueue calls block until the
/// worker catches up. That is the accepted bounded in-flight depth of the
/// collaborator, not a property of the pool.
pub struct HostFftEngine {
    size: usize,
    layout: SampleLayout,
    scratch_bytes: usize,
    shared: Arc<EngineShared>,
    op_tx: Sender<EngineOp>,
    next_buffer: AtomicU64,
    next_token: AtomicU64,
    _worker: thread::JoinHandle<()>,
}

impl HostFftEngine {
    /// Queue capacity from env `FFTPOOL_QUEUE_CAPACITY` (default 32),
    /// clamped to 4..=256.
    pub fn queue_capacity_from_env() -> usize {
        std::env::var("FFTPOOL_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(|n: usize| n.clamp(4, 256))
            .unwrap_or(32)
    }

    /// Compile plans for `size` points in `layout` and start the worker.
    pub fn new(size: usize, layout: SampleLayout) -> Result<Self> {
        Self::with_queue_capacity(size, layout, Self::queue_capacity_from_env())
    }

    pub fn with_queue_capacity(
        size: usize,
        layout: SampleLayout,
        queue_capacity: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(FftError::Setup("transform size must be non-zero".into()));
        }
        if layout == SampleLayout::Real && size % 2 != 0 {
            return Err(FftError::Setup(format!(
                "real layout needs an even transform size for halfcomplex packing, got {}",
                size
            )));
        }
        if queue_capacity == 0 {
            return Err(FftError::Setup("queue capacity must be non-zero".into()));
        }

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_complex = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        let scratch_bytes = scratch_complex * std::mem::size_of::<Complex<f32>>();

        let shared = Arc::new(EngineShared {
            buffers: Mutex::new(HashMap::new()),
            tokens: TokenTable::new(),
        });
        let plans = Plans { forward, inverse };

        let (op_tx, op_rx) = bounded(queue_capacity);
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("fftpool-engine".to_string())
            .spawn(move || worker_loop(op_rx, worker_shared, plans, size, layout))
            .map_err(|e| FftError::Setup(format!("failed to spawn engine worker: {}", e)))?;

        Ok(Self {
            size,
            layout,
            scratch_bytes,
            shared,
            op_tx,
            next_buffer: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
            _worker: worker,
        })
    }

    fn new_token(&self) -> u64 {
        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared.tokens.register(id);
        id
    }

    /// Queue an op; blocks while the bounded queue is full. On a closed
    /// queue (worker gone) the token registration is rolled back.
    fn send(&self, token: u64, op: EngineOp) -> Result<()> {
        self.op_tx.send(op).map_err(|_| {
            self.shared.tokens.unregister(token);
            FftError::EngineGone("op queue closed; engine worker has exited".into())
        })
    }

    fn check_buffer(&self, handle: BufferHandle, len: usize, what: &str) -> Result<()> {
        let buffers = self.shared.buffers.lock().unwrap();
        match buffers.get(&handle.0) {
            None => Err(FftError::InvalidInput(format!(
                "{}: unknown buffer handle {}",
                what, handle.0
            ))),
            Some(buf) if buf.len() < len => Err(FftError::InvalidInput(format!(
                "{}: buffer {} holds {} floats, op needs {}",
                what,
                handle.0,
                buf.len(),
                len
            ))),
            Some(_) => Ok(()),
        }
    }

    fn check_wait_on(&self, tokens: &[Token]) -> Result<()> {
        for t in tokens {
            if !self.shared.tokens.is_known(t.0) {
                return Err(FftError::InvalidInput(format!(
                    "wait_on references unknown token {}",
                    t.0
                )));
            }
        }
        Ok(())
    }
}

impl TransformEngine for HostFftEngine {
    fn transform_size(&self) -> usize {
        self.size
    }

    fn layout(&self) -> SampleLayout {
        self.layout
    }

    fn allocate_buffer(&self, byte_size: usize) -> Result<BufferHandle> {
        if byte_size == 0 || byte_size % std::mem::size_of::<f32>() != 0 {
            return Err(FftError::InvalidInput(format!(
                "buffer size must be a non-zero multiple of 4 bytes, got {}",
                byte_size
            )));
        }
        let id = self.next_buffer.fetch_add(1, Ordering::Relaxed);
        let floats = byte_size / std::mem::size_of::<f32>();
        self.shared
            .buffers
            .lock()
            .unwrap()
            .insert(id, vec![0.0; floats]);
        Ok(BufferHandle(id))
    }

    fn release_buffer(&self, handle: BufferHandle) {
        if self
            .shared
            .buffers
            .lock()
            .unwrap()
            .remove(&handle.0)
            .is_none()
        {
            log::warn!("release_buffer: unknown handle {}", handle.0);
        }
    }

    fn scratch_buffer_size(&self) -> usize {
        self.scratch_bytes
    }

    unsafe fn enqueue_upload(
        &self,
        dst: BufferHandle,
        src: *const f32,
        len: usize,
        wait_on: Option<Token>,
    ) -> Result<Token> {
        self.check_buffer(dst, len, "upload")?;
        if let Some(t) = wait_on {
            self.check_wait_on(&[t])?;
        }
        let token = self.new_token();
        self.send(
            token,
            EngineOp::Upload {
                src: SendConstPtr(src),
                len,
                dst: dst.0,
                token,
            },
        )?;
        Ok(Token(token))
    }

    fn enqueue_transform(
        &self,
        direction: Direction,
        data: &[BufferHandle],
        scratch: Option<BufferHandle>,
        wait_on: &[Token],
    ) -> Result<Token> {
        if data.len() != self.layout.buffer_count() {
            return Err(FftError::InvalidInput(format!(
                "transform: {:?} layout takes {} operand buffers, got {}",
                self.layout,
                self.layout.buffer_count(),
                data.len()
            )));
        }
        let floats = self.layout.floats_per_buffer(self.size);
        for handle in data {
            self.check_buffer(*handle, floats, "transform")?;
        }
        if let Some(s) = scratch {
            self.check_buffer(s, self.scratch_bytes / std::mem::size_of::<f32>(), "scratch")?;
        }
        self.check_wait_on(wait_on)?;
        let token = self.new_token();
        self.send(
            token,
            EngineOp::Transform {
                direction,
                data: data.iter().map(|h| h.0).collect(),
                scratch: scratch.map(|h| h.0),
                token,
            },
        )?;
        Ok(Token(token))
    }

    unsafe fn enqueue_download(
        &self,
        src: BufferHandle,
        dst: *mut f32,
        len: usize,
        wait_on: Token,
    ) -> Result<Token> {
        self.check_buffer(src, len, "download")?;
        self.check_wait_on(&[wait_on])?;
        let token = self.new_token();
        self.send(
            token,
            EngineOp::Download {
                src: src.0,
                len,
                dst: SendMutPtr(dst),
                token,
            },
        )?;
        Ok(Token(token))
    }

    fn wait(&self, tokens: &[Token]) -> Result<()> {
        self.shared.tokens.wait(tokens, None)
    }

    fn wait_for(&self, tokens: &[Token], timeout: Duration) -> Result<()> {
        self.shared.tokens.wait(tokens, Some(Instant::now() + timeout))
    }
}

/// Drains the op queue in submission order. Because execution is strictly
/// in order, a `wait_on` token from an earlier enqueue is complete before
/// its dependent op reaches the front of the queue; ops therefore run
/// without re-checking their dependencies, like an in-order device
/// command queue.
fn worker_loop(
    op_rx: Receiver<EngineOp>,
    shared: Arc<EngineShared>,
    plans: Plans,
    size: usize,
    layout: SampleLayout,
) {
    while let Ok(op) = op_rx.recv() {
        match op {
            EngineOp::Upload {
                src,
                len,
                dst,
                token,
            } => {
                let outcome = run_upload(&shared, src, len, dst);
                shared.tokens.complete(token, outcome);
            }
            EngineOp::Transform {
                direction,
                data,
                scratch,
                token,
            } => {
                let outcome = run_transform(&shared, &plans, size, layout, direction, &data, scratch);
                shared.tokens.complete(token, outcome);
            }
            EngineOp::Download {
                src,
                len,
                dst,
                token,
            } => {
                let outcome = run_download(&shared, src, len, dst);
                shared.tokens.complete(token, outcome);
            }
        }
    }
}

fn run_upload(
    shared: &EngineShared,
    src: SendConstPtr,
    len: usize,
    dst: u64,
) -> std::result::Result<(), String> {
    let mut buffers = shared.buffers.lock().unwrap();
    let buf = buffers
        .get_mut(&dst)
        .ok_or_else(|| format!("upload: buffer {} released mid-flight", dst))?;
    if buf.len() < len {
        return Err(format!(
            "upload: buffer {} holds {} floats, op needs {}",
            dst,
            buf.len(),
            len
        ));
    }
    // SAFETY: enqueue_upload's contract keeps src valid and unaliased for
    // writes until this op's token signals.
    unsafe { std::ptr::copy_nonoverlapping(src.0, buf.as_mut_ptr(), len) };
    Ok(())
}

fn run_download(
    shared: &EngineShared,
    src: u64,
    len: usize,
    dst: SendMutPtr,
) -> std::result::Result<(), String> {
    let buffers = shared.buffers.lock().unwrap();
    let buf = buffers
        .get(&src)
        .ok_or_else(|| format!("download: buffer {} released mid-flight", src))?;
    if buf.len() < len {
        return Err(format!(
            "download: buffer {} holds {} floats, op needs {}",
            src,
            buf.len(),
            len
        ));
    }
    // SAFETY: enqueue_download's contract keeps dst valid and exclusively
    // ours until this op's token signals.
    unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), dst.0, len) };
    Ok(())
}

/// Take operands out of the table so the transform runs outside the lock,
/// then put them back whatever the outcome.
fn run_transform(
    shared: &EngineShared,
    plans: &Plans,
    size: usize,
    layout: SampleLayout,
    direction: Direction,
    data: &[u64],
    scratch: Option<u64>,
) -> std::result::Result<(), String> {
    let mut operands: Vec<(u64, Vec<f32>)> = Vec::with_capacity(data.len() + 1);
    {
        let mut buffers = shared.buffers.lock().unwrap();
        for &id in data.iter().chain(scratch.iter()) {
            match buffers.remove(&id) {
                Some(buf) => operands.push((id, buf)),
                None => {
                    for (id, buf) in operands {
                        buffers.insert(id, buf);
                    }
                    return Err(format!("transform: buffer {} released mid-flight", id));
                }
            }
        }
    }

    let mut scratch_buf = if scratch.is_some() {
        operands.pop()
    } else {
        None
    };
    let plan = plans.for_direction(direction);
    let outcome = apply_transform(
        plan,
        size,
        layout,
        direction,
        &mut operands,
        scratch_buf.as_mut().map(|(_, buf)| buf),
    );

    let mut buffers = shared.buffers.lock().unwrap();
    for (id, buf) in operands.into_iter().chain(scratch_buf) {
        buffers.insert(id, buf);
    }
    outcome
}

fn apply_transform(
    plan: &Arc<dyn Fft<f32>>,
    size: usize,
    layout: SampleLayout,
    direction: Direction,
    operands: &mut [(u64, Vec<f32>)],
    scratch: Option<&mut Vec<f32>>,
) -> std::result::Result<(), String> {
    match layout {
        SampleLayout::Interleaved => {
            let buf = &mut operands[0].1;
            let spectrum: &mut [Complex<f32>] = bytemuck::cast_slice_mut(&mut buf[..2 * size]);
            run_plan(plan, spectrum, scratch);
        }
        SampleLayout::Planar => {
            let mut stage: Vec<Complex<f32>> = {
                let real = &operands[0].1;
                let imag = &operands[1].1;
                real[..size]
                    .iter()
                    .zip(&imag[..size])
                    .map(|(&re, &im)| Complex::new(re, im))
                    .collect()
            };
            run_plan(plan, &mut stage, scratch);
            for (i, c) in stage.iter().enumerate() {
                operands[0].1[i] = c.re;
                operands[1].1[i] = c.im;
            }
        }
        SampleLayout::Real => {
            let buf = &mut operands[0].1;
            match direction {
                Direction::Forward => real_forward(plan, size, buf, scratch),
                Direction::Backward => real_backward(plan, size, buf, scratch),
            }
        }
    }
    Ok(())
}

fn run_plan(plan: &Arc<dyn Fft<f32>>, data: &mut [Complex<f32>], scratch: Option<&mut Vec<f32>>) {
    let needed = plan.get_inplace_scratch_len();
    match scratch {
        Some(buf) if needed > 0 && buf.len() >= 2 * needed => {
            let complex_scratch: &mut [Complex<f32>] =
                bytemuck::cast_slice_mut(&mut buf[..2 * needed]);
            plan.process_with_scratch(data, complex_scratch);
        }
        _ => plan.process(data),
    }
}

/// Real-to-halfcomplex in place: r0, r1..r_{N/2}, i_{N/2-1}..i_1 packed
/// into the same N floats. Losslessly invertible for real input.
fn real_forward(
    plan: &Arc<dyn Fft<f32>>,
    size: usize,
    data: &mut [f32],
    scratch: Option<&mut Vec<f32>>,
) {
    let mut stage: Vec<Complex<f32>> = data[..size]
        .iter()
        .map(|&re| Complex::new(re, 0.0))
        .collect();
    run_plan(plan, &mut stage, scratch);
    let half = size / 2;
    data[0] = stage[0].re;
    data[half] = stage[half].re;
    for k in 1..half {
        data[k] = stage[k].re;
        data[size - k] = stage[k].im;
    }
}

fn real_backward(
    plan: &Arc<dyn Fft<f32>>,
    size: usize,
    data: &mut [f32],
    scratch: Option<&mut Vec<f32>>,
) {
    let half = size / 2;
    let mut stage = vec![Complex::new(0.0, 0.0); size];
    stage[0] = Complex::new(data[0], 0.0);
    stage[half] = Complex::new(data[half], 0.0);
    for k in 1..half {
        let bin = Complex::new(data[k], data[size - k]);
        stage[k] = bin;
        stage[size - k] = bin.conj();
    }
    run_plan(plan, &mut stage, scratch);
    for (i, c) in stage.iter().enumerate() {
        data[i] = c.re;
    }
}
