//! IR loader
//!
//! Maps an IR path to per-channel, engine-rate sources: `mem:` paths select
//! the built-in test impulse, `.mp3` the memory-mapped MP3 decoder, and
//! everything else the sound-file backends. Each channel gets its own
//! source handle, wrapped to a single channel and resampled when the file
//! rate differs from the engine rate.

use std::path::Path;

use ir_core::MAX_IR_FRAMES;

use crate::error::{FileError, FileResult};
use crate::mp3::Mp3Source;
use crate::resample::ResampledSource;
use crate::source::{AudioSource, ChanWrap, MemSource};
use crate::sound_file::SoundFileSource;

/// Open the raw (multi-channel, native-rate) source behind an IR path.
pub fn open_source(path: &str) -> FileResult<AudioSource> {
    if path.starts_with("mem:") {
        return Ok(AudioSource::Mem(MemSource::new()));
    }

    let p = Path::new(path);
    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if ext == "mp3" {
        Mp3Source::open(p).map(AudioSource::Mp3)
    } else {
        SoundFileSource::open(p).map(AudioSource::File)
    }
}

/// Open an IR as one single-channel source per file channel, each presented
/// at `target_rate`.
pub fn open_ir_channels(path: &str, target_rate: u32) -> FileResult<Vec<AudioSource>> {
    let base = open_source(path)?;

    let frames = base.readable_length();
    if frames > MAX_IR_FRAMES {
        return Err(FileError::TooLong(frames));
    }
    let n_channels = base.n_channels();
    if n_channels == 0 || frames == 0 {
        return Err(FileError::InvalidFile(format!(
            "{}: no usable audio channels",
            path
        )));
    }

    let mut bases = Vec::with_capacity(n_channels as usize);
    for _ in 1..n_channels {
        bases.push(base.duplicate()?);
    }
    bases.insert(0, base);

    let mut out = Vec::with_capacity(n_channels as usize);
    for (ch, b) in bases.into_iter().enumerate() {
        let native_rate = b.sample_rate();
        let wrapped = AudioSource::Chan(ChanWrap::new(Box::new(b), ch as u32)?);
        let src = if native_rate != target_rate {
            log::info!(
                "resampling IR channel {} from {} Hz to {} Hz",
                ch,
                native_rate,
                target_rate
            );
            AudioSource::Resampled(ResampledSource::new(Box::new(wrapped), target_rate)?)
        } else {
            wrapped
        };
        out.push(src);
    }
    Ok(out)
}
