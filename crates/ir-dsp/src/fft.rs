//! Process-global FFT planner
//!
//! All real/complex transform pairs are created through a single planner
//! cache behind a process-global lock. Plan creation happens only during
//! engine configure and teardown, never on the audio thread. An instance
//! counter clears the cache when the last engine releases it, so a host
//! running several convolver instances only drops the plan cache once.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

struct PlannerCache {
    planner: RealFftPlanner<f32>,
    instances: usize,
}

static PLANNER: Lazy<Mutex<PlannerCache>> = Lazy::new(|| {
    Mutex::new(PlannerCache {
        planner: RealFftPlanner::new(),
        instances: 0,
    })
});

/// A matched forward/inverse transform pair of one FFT size.
#[derive(Clone)]
pub struct FftPair {
    pub forward: Arc<dyn RealToComplex<f32>>,
    pub inverse: Arc<dyn ComplexToReal<f32>>,
}

impl FftPair {
    /// Length of the real (time-domain) side of the transform.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plan a transform pair for `fft_size` real samples.
pub fn plan_pair(fft_size: usize) -> FftPair {
    let mut cache = PLANNER.lock();
    FftPair {
        forward: cache.planner.plan_fft_forward(fft_size),
        inverse: cache.planner.plan_fft_inverse(fft_size),
    }
}

/// Register one engine instance against the planner cache.
pub fn retain_planner() {
    PLANNER.lock().instances += 1;
}

/// Release one engine instance. The cached plans are dropped when the last
/// instance releases; plans still held by live levels stay valid (they are
/// reference counted).
pub fn release_planner() {
    let mut cache = PLANNER.lock();
    cache.instances = cache.instances.saturating_sub(1);
    if cache.instances == 0 {
        cache.planner = RealFftPlanner::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_roundtrip_scaling() {
        let pair = plan_pair(128);
        let mut time: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).sin()).collect();
        let original = time.clone();
        let mut freq = vec![rustfft::num_complex::Complex::new(0.0f32, 0.0); 65];

        pair.forward.process(&mut time, &mut freq).unwrap();
        pair.inverse.process(&mut freq, &mut time).unwrap();

        // realfft leaves the 1/N scaling to the caller
        for (a, b) in time.iter().zip(&original) {
            assert!((a / 128.0 - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_retain_release_keeps_existing_plans_valid() {
        retain_planner();
        let pair = plan_pair(64);
        release_planner();

        let mut time = vec![0.0f32; 64];
        time[0] = 1.0;
        let mut freq = vec![rustfft::num_complex::Complex::new(0.0f32, 0.0); 33];
        pair.forward.process(&mut time, &mut freq).unwrap();
        assert!((freq[0].re - 1.0).abs() < 1e-6);
    }
}
