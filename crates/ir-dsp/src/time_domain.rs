//! Direct time-domain head convolver
//!
//! Holds up to 64 IR taps and convolves them directly. Used only for the
//! partial-block hot path: when a host delivers a chunk that does not
//! complete an engine quantum, the frequency-domain tail is read out with
//! `tailonly` and this head fills the leading samples.

use ir_core::Sample;

const TAPS: usize = 64;

#[derive(Clone)]
pub struct TimeDomainConvolver {
    ir: [Sample; TAPS],
    enabled: bool,
}

impl Default for TimeDomainConvolver {
    fn default() -> Self {
        Self {
            ir: [0.0; TAPS],
            enabled: false,
        }
    }
}

impl TimeDomainConvolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.ir = [0.0; TAPS];
        self.enabled = false;
    }

    /// Load taps at offset `delay` inside the 64-tap window, scaled by
    /// `gain`. Taps that fall outside the window are dropped; with a delay
    /// of 64 or more the head stays disabled.
    pub fn configure(&mut self, taps: &[Sample], gain: f32, delay: u32) {
        if delay as usize >= TAPS {
            return;
        }
        let delay = delay as usize;
        let to_copy = taps.len().min(TAPS - delay);
        if to_copy == 0 {
            return;
        }
        for (dst, src) in self.ir[delay..delay + to_copy].iter_mut().zip(taps) {
            *dst = gain * src;
        }
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Triangular direct convolution of `n` input samples into `out`.
    /// Only the part of the response landing inside the current chunk is
    /// produced; the engine recomputes the full window at the next quantum
    /// boundary.
    pub fn run(&self, out: &mut [Sample], inp: &[Sample], n: usize) {
        if !self.enabled {
            return;
        }
        for i in 0..n {
            let reach = (n - i).min(TAPS);
            for j in 0..reach {
                out[i + j] += inp[i] * self.ir[j];
            }
        }
    }
}
