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

//! Host-resident sample buffers submitted for transformation.
//!
//! A job's buffers are overwritten in place by a completed pipeline.
//! Callers that need the original must `copy_from` it into a separate job
//! before submission. Statistics accumulate in f64 over the f32 samples.

use std::fmt;

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// How samples are laid out in host and device memory.
///
/// Selected once per transform configuration; the engine's plan and the
/// pool's buffer sizing both follow it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleLayout {
    /// N real samples in one buffer; spectra use halfcomplex packing.
    Real,
    /// N complex samples as 2N floats (re, im pairs) in one buffer.
    Interleaved,
    /// N complex samples as separate real and imaginary buffers.
    Planar,
}

impl SampleLayout {
    /// Number of host/device buffers a job of this layout carries.
    pub fn buffer_count(self) -> usize {
        match self {
            SampleLayout::Planar => 2,
            _ => 1,
        }
    }

    /// Float count of each buffer for a transform of `size` points.
    pub fn floats_per_buffer(self, size: usize) -> usize {
        match self {
            SampleLayout::Real => size,
            SampleLayout::Interleaved => 2 * size,
            SampleLayout::Planar => size,
        }
    }
}

enum SampleStore {
    Packed(Vec<f32>),
    Planar { real: Vec<f32>, imag: Vec<f32> },
}

/// One transform job: fixed-length sample storage tagged with its layout.
///
/// Buffer length never changes after construction. The pipeline only reads
/// and writes the samples; it never allocates or frees them.
pub struct FftJob {
    layout: SampleLayout,
    size: usize,
    store: SampleStore,
}

impl FftJob {
    /// Create a zero-filled job for a transform of `size` points.
    pub fn new(layout: SampleLayout, size: usize) -> Self {
        let floats = layout.floats_per_buffer(size);
        let store = match layout {
            SampleLayout::Planar => SampleStore::Planar {
                real: vec![0.0; floats],
                imag: vec![0.0; floats],
            },
            _ => SampleStore::Packed(vec![0.0; floats]),
        };
        Self {
            layout,
            size,
            store,
        }
    }

    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    /// Transform length in points (not floats).
    pub fn transform_size(&self) -> usize {
        self.size
    }

    pub fn buffer_count(&self) -> usize {
        self.layout.buffer_count()
    }

    /// Sample buffer `index` (0 = packed or real, 1 = imaginary for planar).
    pub fn buffer(&self, index: usize) -> &[f32] {
        match (&self.store, index) {
            (SampleStore::Packed(data), 0) => data,
            (SampleStore::Planar { real, .. }, 0) => real,
            (SampleStore::Planar { imag, .. }, 1) => imag,
            _ => panic!("buffer index {} out of range for {:?}", index, self.layout),
        }
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [f32] {
        match (&mut self.store, index) {
            (SampleStore::Packed(data), 0) => data,
            (SampleStore::Planar { real, .. }, 0) => real,
            (SampleStore::Planar { imag, .. }, 1) => imag,
            _ => panic!("buffer index {} out of range for {:?}", index, self.layout),
        }
    }

    /// Deep-copy another job's samples. Same layout and length required;
    /// a mismatch is a precondition violation, not a recoverable error.
    pub fn copy_from(&mut self, other: &FftJob) {
        assert_eq!(self.layout, other.layout, "copy_from: layout mismatch");
        assert_eq!(self.size, other.size, "copy_from: length mismatch");
        for i in 0..self.buffer_count() {
            self.buffer_mut(i).copy_from_slice(other.buffer(i));
        }
    }

    /// Deterministic periodic waveform: sin(2π · 0.002 · i) per sample,
    /// imaginary parts zeroed.
    pub fn periodic(&mut self) {
        for i in 0..self.size {
            let t = i as f64 * 0.002;
            let amp = (2.0 * std::f64::consts::PI * t).sin() as f32;
            match &mut self.store {
                SampleStore::Packed(data) => match self.layout {
                    SampleLayout::Real => data[i] = amp,
                    _ => {
                        data[2 * i] = amp;
                        data[2 * i + 1] = 0.0;
                    }
                },
                SampleStore::Planar { real, imag } => {
                    real[i] = amp;
                    imag[i] = 0.0;
                }
            }
        }
    }

    /// Uniform random samples in `[min, min + range)` across every float.
    pub fn randomize(&mut self, range: f64, min: f64) {
        let mut rng = rand::thread_rng();
        for s in self.floats_mut() {
            *s = (rng.gen::<f64>() * range + min) as f32;
        }
    }

    /// Normally distributed samples with the given mean and deviation.
    pub fn gaussian(&mut self, mean: f64, deviation: f64) {
        let normal = Normal::new(mean, deviation).expect("deviation must be finite and positive");
        let mut rng = rand::thread_rng();
        for s in self.floats_mut() {
            *s = normal.sample(&mut rng) as f32;
        }
    }

    /// Scale every sample by `factor` (e.g. 1/N after a backward transform).
    pub fn scale(&mut self, factor: f64) {
        for s in self.floats_mut() {
            *s = (*s as f64 * factor) as f32;
        }
    }

    /// Average of |(|a| - |b|)| over all samples.
    pub fn average_abs_diff(&self, other: &FftJob) -> f64 {
        let mut diff = 0.0;
        let mut count = 0usize;
        for (a, b) in self.floats().zip(other.floats()) {
            diff += (a.abs() as f64 - b.abs() as f64).abs();
            count += 1;
        }
        diff / count as f64
    }

    /// Root-mean-square difference against another job.
    pub fn rms(&self, other: &FftJob) -> f64 {
        let count = self.layout.floats_per_buffer(self.size) * self.buffer_count();
        (self.quant_error_energy(other) / count as f64).sqrt()
    }

    pub fn signal_energy(&self) -> f64 {
        self.floats().map(|s| s as f64 * s as f64).sum()
    }

    pub fn quant_error_energy(&self, other: &FftJob) -> f64 {
        self.floats()
            .zip(other.floats())
            .map(|(a, b)| {
                let d = a as f64 - b as f64;
                d * d
            })
            .sum()
    }

    /// Signal-to-quantization-error ratio in dB against a round-tripped job.
    pub fn signal_to_quant_error(&self, inverse: &FftJob) -> f64 {
        10.0 * (self.signal_energy() / self.quant_error_energy(inverse)).log10()
    }

    fn floats(&self) -> impl Iterator<Item = f32> + '_ {
        let (first, second): (&[f32], &[f32]) = match &self.store {
            SampleStore::Packed(data) => (data, &[]),
            SampleStore::Planar { real, imag } => (real, imag),
        };
        first.iter().chain(second.iter()).copied()
    }

    fn floats_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        let (first, second): (&mut [f32], &mut [f32]) = match &mut self.store {
            SampleStore::Packed(data) => (data, &mut []),
            SampleStore::Planar { real, imag } => (real, imag),
        };
        first.iter_mut().chain(second.iter_mut())
    }
}

// Samples are elided; a megapoint job is not printable output.
impl fmt::Debug for FftJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftJob")
            .field("layout", &self.layout)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_is_deterministic() {
        let mut a = FftJob::new(SampleLayout::Real, 64);
        let mut b = FftJob::new(SampleLayout::Real, 64);
        a.periodic();
        b.periodic();
        assert_eq!(a.buffer(0), b.buffer(0));
        assert!(a.rms(&b) == 0.0);
    }

    #[test]
    fn periodic_zeroes_imaginary_parts() {
        let mut job = FftJob::new(SampleLayout::Planar, 32);
        job.randomize(5.0, -2.5);
        job.periodic();
        assert!(job.buffer(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn randomize_stays_in_range() {
        let mut job = FftJob::new(SampleLayout::Interleaved, 256);
        job.randomize(25.0, 0.0);
        assert!(job.buffer(0).iter().all(|&s| (0.0..25.0).contains(&s)));
    }

    #[test]
    fn gaussian_mean_is_roughly_centered() {
        let mut job = FftJob::new(SampleLayout::Real, 4096);
        job.gaussian(10.0, 2.0);
        let mean: f64 = job.buffer(0).iter().map(|&s| s as f64).sum::<f64>() / 4096.0;
        // 2/sqrt(4096) ≈ 0.03 standard error; 0.5 leaves plenty of slack.
        assert!((mean - 10.0).abs() < 0.5, "mean was {}", mean);
    }

    #[test]
    fn copy_then_scale_round_trips() {
        let mut original = FftJob::new(SampleLayout::Interleaved, 128);
        original.randomize(2.0, -1.0);
        let mut copy = FftJob::new(SampleLayout::Interleaved, 128);
        copy.copy_from(&original);
        copy.scale(4.0);
        copy.scale(0.25);
        assert!(original.rms(&copy) < 1e-6);
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn copy_from_rejects_mismatched_lengths() {
        let mut a = FftJob::new(SampleLayout::Real, 64);
        let b = FftJob::new(SampleLayout::Real, 128);
        a.copy_from(&b);
    }

    #[test]
    fn sqer_is_high_for_near_identical_signals() {
        let mut a = FftJob::new(SampleLayout::Real, 512);
        a.periodic();
        let mut b = FftJob::new(SampleLayout::Real, 512);
        b.copy_from(&a);
        for s in b.buffer_mut(0) {
            *s += 1e-4;
        }
        assert!(a.signal_to_quant_error(&b) > 40.0);
    }
}
