//! Audio source variants
//!
//! `AudioSource` is the supply interface for IR data: a read-only PCM
//! stream with random access by frame position. Repeated reads with
//! identical arguments return identical samples. The stream cursor of the
//! stateful variants (MP3, resampler) is explicit mutable state, so `read`
//! takes `&mut self`.

use ir_core::Sample;

use crate::error::{FileError, FileResult};
use crate::mp3::Mp3Source;
use crate::resample::ResampledSource;
use crate::sound_file::SoundFileSource;

pub enum AudioSource {
    /// Seekable sound file (WAV and symphonia-decoded formats).
    File(SoundFileSource),
    /// Memory-mapped MP3 with parse-forward random access.
    Mp3(Mp3Source),
    /// Built-in 4-channel test IR, selected by `mem:` paths.
    Mem(MemSource),
    /// Single-channel view over one channel of an owned source.
    Chan(ChanWrap),
    /// Owned source presented at a different sample rate.
    Resampled(ResampledSource),
}

impl AudioSource {
    /// Read `cnt` frames of `channel` starting at `pos`; returns the number
    /// of frames produced (short at end of stream).
    pub fn read(&mut self, dst: &mut [Sample], pos: u64, cnt: usize, channel: u32) -> usize {
        match self {
            AudioSource::File(s) => s.read(dst, pos, cnt, channel),
            AudioSource::Mp3(s) => s.read(dst, pos, cnt, channel),
            AudioSource::Mem(s) => s.read(dst, pos, cnt, channel),
            AudioSource::Chan(s) => s.read(dst, pos, cnt),
            AudioSource::Resampled(s) => s.read(dst, pos, cnt),
        }
    }

    /// Total stream length in frames.
    pub fn readable_length(&self) -> u64 {
        match self {
            AudioSource::File(s) => s.readable_length(),
            AudioSource::Mp3(s) => s.readable_length(),
            AudioSource::Mem(s) => s.readable_length(),
            AudioSource::Chan(s) => s.readable_length(),
            AudioSource::Resampled(s) => s.readable_length(),
        }
    }

    pub fn n_channels(&self) -> u32 {
        match self {
            AudioSource::File(s) => s.n_channels(),
            AudioSource::Mp3(s) => s.n_channels(),
            AudioSource::Mem(s) => s.n_channels(),
            AudioSource::Chan(_) => 1,
            AudioSource::Resampled(s) => s.n_channels(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioSource::File(s) => s.sample_rate(),
            AudioSource::Mp3(s) => s.sample_rate(),
            AudioSource::Mem(s) => s.sample_rate(),
            AudioSource::Chan(s) => s.sample_rate(),
            AudioSource::Resampled(s) => s.sample_rate(),
        }
    }

    /// Open an independent second handle onto the same stream. Decoded
    /// sample buffers and file mappings are shared; decoder state is not.
    pub fn duplicate(&self) -> FileResult<AudioSource> {
        match self {
            AudioSource::File(s) => s.duplicate().map(AudioSource::File),
            AudioSource::Mp3(s) => s.duplicate().map(AudioSource::Mp3),
            AudioSource::Mem(_) => Ok(AudioSource::Mem(MemSource::new())),
            AudioSource::Chan(s) => s.duplicate().map(AudioSource::Chan),
            AudioSource::Resampled(s) => s.duplicate().map(AudioSource::Resampled),
        }
    }
}

/// Built-in test impulse: 4 channels, 16 frames. The first frame carries
/// the routing gains (L->L 1.0, L->R 0.1, R->L 0.5, R->R 0.3), the rest is
/// silence.
pub struct MemSource {
    buf: [Sample; 4 * 16],
}

impl Default for MemSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemSource {
    pub const CHANNELS: u32 = 4;
    pub const FRAMES: u64 = 16;

    pub fn new() -> Self {
        let mut buf = [0.0; 4 * 16];
        buf[0] = 1.0;
        buf[1] = 0.1;
        buf[2] = 0.5;
        buf[3] = 0.3;
        Self { buf }
    }

    pub fn read(&self, dst: &mut [Sample], pos: u64, cnt: usize, channel: u32) -> usize {
        if channel >= Self::CHANNELS || pos >= Self::FRAMES {
            return 0;
        }
        let cnt = cnt.min((Self::FRAMES - pos) as usize);
        for (i, d) in dst[..cnt].iter_mut().enumerate() {
            *d = self.buf[(pos as usize + i) * Self::CHANNELS as usize + channel as usize];
        }
        cnt
    }

    pub fn readable_length(&self) -> u64 {
        Self::FRAMES
    }

    pub fn n_channels(&self) -> u32 {
        Self::CHANNELS
    }

    pub fn sample_rate(&self) -> u32 {
        44_100
    }
}

/// Narrows an owned multi-channel source to one bound channel.
pub struct ChanWrap {
    inner: Box<AudioSource>,
    channel: u32,
}

impl ChanWrap {
    pub fn new(inner: Box<AudioSource>, channel: u32) -> FileResult<Self> {
        if channel >= inner.n_channels() {
            return Err(FileError::InvalidFile(format!(
                "channel {} out of bounds ({} channels)",
                channel,
                inner.n_channels()
            )));
        }
        Ok(Self { inner, channel })
    }

    pub fn read(&mut self, dst: &mut [Sample], pos: u64, cnt: usize) -> usize {
        self.inner.read(dst, pos, cnt, self.channel)
    }

    pub fn readable_length(&self) -> u64 {
        self.inner.readable_length()
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    pub fn duplicate(&self) -> FileResult<ChanWrap> {
        Ok(ChanWrap {
            inner: Box::new(self.inner.duplicate()?),
            channel: self.channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_source_routing_gains() {
        let src = MemSource::new();
        let mut buf = [0.0; 16];
        for (ch, expect) in [(0, 1.0), (1, 0.1), (2, 0.5), (3, 0.3)] {
            let n = src.read(&mut buf, 0, 16, ch);
            assert_eq!(n, 16);
            assert_eq!(buf[0], expect);
            assert!(buf[1..].iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_mem_source_bounds() {
        let src = MemSource::new();
        let mut buf = [0.0; 32];
        assert_eq!(src.read(&mut buf, 0, 16, 4), 0);
        assert_eq!(src.read(&mut buf, 16, 4, 0), 0);
        assert_eq!(src.read(&mut buf, 12, 32, 0), 4);
    }

    #[test]
    fn test_repeated_reads_identical() {
        let mut src = AudioSource::Mem(MemSource::new());
        let mut a = [0.0; 16];
        let mut b = [0.0; 16];
        src.read(&mut a, 0, 16, 2);
        src.read(&mut b, 0, 16, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_chan_wrap_narrows() {
        let base = AudioSource::Mem(MemSource::new());
        let mut wrap = ChanWrap::new(Box::new(base), 3).unwrap();
        let mut buf = [0.0; 4];
        assert_eq!(wrap.read(&mut buf, 0, 4), 4);
        assert_eq!(buf[0], 0.3);
        assert_eq!(wrap.readable_length(), 16);
    }

    #[test]
    fn test_chan_wrap_rejects_out_of_range() {
        let base = AudioSource::Mem(MemSource::new());
        assert!(ChanWrap::new(Box::new(base), 4).is_err());
    }
}
