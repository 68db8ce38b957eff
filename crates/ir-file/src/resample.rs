//! Streaming sample-rate adapter
//!
//! Presents an owned single-channel source at the engine rate through a
//! best-quality sinc resampler. Sequential reads stream; a read at any other
//! position resets the resampler and re-derives the source position as
//! `pos / ratio`, tracking the fractional remainder so output positions stay
//! sample-accurate. At end of input the source is zero-padded until the
//! reported length is served.

use std::collections::VecDeque;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use ir_core::Sample;

use crate::error::{FileError, FileResult};
use crate::source::AudioSource;

/// Source frames fed to the resampler per process call.
const CHUNK: usize = 1024;

pub struct ResampledSource {
    inner: Box<AudioSource>,
    target_rate: u32,
    ratio: f64,
    resampler: SincFixedIn<Sample>,
    in_buf: Vec<Sample>,

    fifo: VecDeque<Sample>,
    /// Output frames still to discard after a reset (filter delay plus the
    /// fractional-position offset).
    skip: usize,
    source_pos: u64,
    target_pos: u64,
    fract_position: f64,
    /// Zero chunks fed past the end of the source, to flush the filter.
    tail_pads: u32,
    exhausted: bool,
}

impl ResampledSource {
    pub fn new(inner: Box<AudioSource>, target_rate: u32) -> FileResult<Self> {
        if inner.n_channels() != 1 {
            return Err(FileError::InvalidFile(
                "resampler requires a single-channel source".into(),
            ));
        }
        let ratio = target_rate as f64 / inner.sample_rate() as f64;

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::new(ratio, 2.0, params, CHUNK, 1)
            .map_err(|e| FileError::Resample(e.to_string()))?;

        let mut src = Self {
            inner,
            target_rate,
            ratio,
            resampler,
            in_buf: vec![0.0; CHUNK],
            fifo: VecDeque::new(),
            skip: 0,
            source_pos: 0,
            target_pos: 0,
            fract_position: 0.0,
            tail_pads: 0,
            exhausted: false,
        };
        src.seek_to(0);
        Ok(src)
    }

    pub fn read(&mut self, dst: &mut [Sample], pos: u64, cnt: usize) -> usize {
        let total = self.readable_length();
        if pos >= total {
            return 0;
        }
        if pos != self.target_pos {
            self.seek_to(pos);
        }

        let want = cnt.min((total - pos) as usize);
        while self.fifo.len() < want && !self.exhausted {
            self.fill_once();
        }

        let produced = want.min(self.fifo.len());
        for d in dst[..produced].iter_mut() {
            // fifo holds at least `produced` samples here
            *d = self.fifo.pop_front().unwrap_or(0.0);
        }
        self.target_pos += produced as u64;
        produced
    }

    pub fn readable_length(&self) -> u64 {
        let len = (self.inner.readable_length() as f64 * self.ratio).ceil() as u64;
        len.saturating_sub(1)
    }

    pub fn n_channels(&self) -> u32 {
        1
    }

    pub fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn duplicate(&self) -> FileResult<ResampledSource> {
        ResampledSource::new(Box::new(self.inner.duplicate()?), self.target_rate)
    }

    fn seek_to(&mut self, pos: u64) {
        self.resampler.reset();
        self.fifo.clear();
        self.tail_pads = 0;
        self.exhausted = false;

        let src_exact = pos as f64 / self.ratio;
        self.source_pos = src_exact.floor() as u64;
        self.fract_position = src_exact - src_exact.floor();
        self.skip =
            self.resampler.output_delay() + (self.fract_position * self.ratio).round() as usize;
        self.target_pos = pos;
    }

    fn fill_once(&mut self) {
        let need = self.resampler.input_frames_next();
        self.in_buf.resize(need, 0.0);
        self.in_buf.fill(0.0);

        let got = self
            .inner
            .read(&mut self.in_buf, self.source_pos, need, 0);
        self.source_pos += got as u64;
        if got == 0 {
            self.tail_pads += 1;
            if self.tail_pads > 2 {
                self.exhausted = true;
                return;
            }
        }

        match self
            .resampler
            .process(std::slice::from_ref(&self.in_buf), None)
        {
            Ok(mut out) => {
                let chunk = out.remove(0);
                let skip = self.skip.min(chunk.len());
                self.skip -= skip;
                self.fifo.extend(&chunk[skip..]);
            }
            Err(e) => {
                log::warn!("resampler process failed: {}", e);
                self.exhausted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChanWrap, MemSource};

    fn mem_channel() -> Box<AudioSource> {
        let base = AudioSource::Mem(MemSource::new());
        Box::new(AudioSource::Chan(
            ChanWrap::new(Box::new(base), 0).unwrap(),
        ))
    }

    #[test]
    fn test_reported_length() {
        // 16 frames at 44100 -> 88200 gives ceil(16 * 2) - 1 = 31
        let src = ResampledSource::new(mem_channel(), 88_200).unwrap();
        assert_eq!(src.readable_length(), 31);
        assert_eq!(src.sample_rate(), 88_200);
        assert_eq!(src.n_channels(), 1);
    }

    #[test]
    fn test_serves_reported_length() {
        let mut src = ResampledSource::new(mem_channel(), 88_200).unwrap();
        let mut buf = vec![0.0; 64];
        let n = src.read(&mut buf, 0, 64);
        assert_eq!(n, 31);
        assert_eq!(src.read(&mut buf, 31, 8), 0);
    }

    #[test]
    fn test_sequential_reads_continue_stream() {
        let mut a = ResampledSource::new(mem_channel(), 88_200).unwrap();
        let mut whole = vec![0.0; 31];
        assert_eq!(a.read(&mut whole, 0, 31), 31);

        let mut b = ResampledSource::new(mem_channel(), 88_200).unwrap();
        let mut first = vec![0.0; 16];
        let mut second = vec![0.0; 15];
        assert_eq!(b.read(&mut first, 0, 16), 16);
        assert_eq!(b.read(&mut second, 16, 15), 15);

        for (i, v) in first.iter().chain(second.iter()).enumerate() {
            assert!((v - whole[i]).abs() < 1e-6, "sample {} differs", i);
        }
    }

    #[test]
    fn test_repeated_read_identical_after_reseek() {
        let mut src = ResampledSource::new(mem_channel(), 96_000).unwrap();
        let mut a = vec![0.0; 12];
        let mut b = vec![0.0; 12];
        let n1 = src.read(&mut a, 4, 12);
        let n2 = src.read(&mut b, 4, 12);
        assert_eq!(n1, n2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_multichannel_source() {
        let base = Box::new(AudioSource::Mem(MemSource::new()));
        assert!(ResampledSource::new(base, 48_000).is_err());
    }
}
