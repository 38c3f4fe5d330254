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

//! Error taxonomy for the pool and dispatcher.
//!
//! Submission-time failures are returned as values so a caller can keep
//! going after a single rejected job; only pool construction is fatal to
//! the pool instance.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FftError>;

#[derive(Debug, Clone, PartialEq)]
pub enum FftError {
    /// Buffer or plan allocation failed at pool construction. The pool
    /// instance must not be used.
    Setup(String),
    /// No free slot at submission time. Recoverable: wait, then retry.
    Backpressure,
    /// An enqueue step failed on the engine. The affected slot is tainted.
    DeviceOp(String),
    /// A bounded wait expired. The slot stays in flight.
    Timeout,
    /// Caller handed in something the pool cannot use.
    InvalidInput(String),
    /// The engine's worker is gone (queue closed mid-operation).
    EngineGone(String),
}

impl fmt::Display for FftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FftError::Setup(msg) => write!(f, "Setup failure: {}", msg),
            FftError::Backpressure => write!(f, "Backpressure: no free slot available"),
            FftError::DeviceOp(msg) => write!(f, "Device operation failed: {}", msg),
            FftError::Timeout => write!(f, "Wait timed out"),
            FftError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            FftError::EngineGone(msg) => write!(f, "Engine gone: {}", msg),
        }
    }
}

impl std::error::Error for FftError {}
