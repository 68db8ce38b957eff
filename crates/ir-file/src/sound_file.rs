//! Seekable sound-file source
//!
//! WAV files read through hound with true seeking and per-read channel
//! extraction. Other formats go through symphonia: the whole file is
//! decoded once at construction and reads are served from the shared
//! buffer, so per-channel duplicates cost nothing.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use ir_core::Sample;

use crate::error::{FileError, FileResult};

enum Backend {
    Wav(hound::WavReader<std::io::BufReader<File>>),
    /// De-interleaved channels, shared between duplicates.
    Decoded(Arc<Vec<Vec<Sample>>>),
}

pub struct SoundFileSource {
    backend: Backend,
    path: PathBuf,
    channels: u32,
    sample_rate: u32,
    frames: u64,
}

impl SoundFileSource {
    pub fn open(path: &Path) -> FileResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        if ext == "wav" || ext == "wave" {
            Self::open_wav(path)
        } else {
            Self::open_decoded(path)
        }
    }

    fn open_wav(path: &Path) -> FileResult<Self> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let frames = reader.duration() as u64;
        if frames == 0 || spec.channels == 0 {
            return Err(FileError::InvalidFile(path.display().to_string()));
        }
        Ok(Self {
            channels: spec.channels as u32,
            sample_rate: spec.sample_rate,
            frames,
            path: path.to_path_buf(),
            backend: Backend::Wav(reader),
        })
    }

    fn open_decoded(path: &Path) -> FileResult<Self> {
        let file =
            File::open(path).map_err(|_| FileError::NotFound(path.display().to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| FileError::InvalidFile("no audio track".into()))?;
        let track_id = track.id;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(0);
        let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
        if channels == 0 || sample_rate == 0 {
            return Err(FileError::InvalidFile(path.display().to_string()));
        }

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())?;

        let mut interleaved: Vec<Sample> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf =
                        SampleBuffer::<Sample>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    interleaved.extend_from_slice(buf.samples());
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    log::debug!("skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let chans: Vec<Vec<Sample>> = (0..channels)
            .map(|ch| ir_core::deinterleave_channel(&interleaved, channels, ch))
            .collect();
        let frames = chans.first().map(|c| c.len() as u64).unwrap_or(0);
        if frames == 0 {
            return Err(FileError::InvalidFile(path.display().to_string()));
        }

        Ok(Self {
            channels: channels as u32,
            sample_rate,
            frames,
            path: path.to_path_buf(),
            backend: Backend::Decoded(Arc::new(chans)),
        })
    }

    pub fn read(&mut self, dst: &mut [Sample], pos: u64, cnt: usize, channel: u32) -> usize {
        if channel >= self.channels || pos >= self.frames {
            return 0;
        }
        let cnt = cnt.min((self.frames - pos) as usize);

        match &mut self.backend {
            Backend::Decoded(chans) => {
                let src = &chans[channel as usize][pos as usize..pos as usize + cnt];
                dst[..cnt].copy_from_slice(src);
                cnt
            }
            Backend::Wav(reader) => {
                if reader.seek(pos as u32).is_err() {
                    return 0;
                }
                let spec = reader.spec();
                let n_chn = spec.channels as usize;
                let wanted = cnt * n_chn;
                let mut produced = 0;

                match spec.sample_format {
                    hound::SampleFormat::Float => {
                        for (i, s) in reader.samples::<f32>().take(wanted).enumerate() {
                            let s = s.unwrap_or(0.0);
                            if i % n_chn == channel as usize {
                                dst[produced] = s;
                                produced += 1;
                            }
                        }
                    }
                    hound::SampleFormat::Int => {
                        let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                        for (i, s) in reader.samples::<i32>().take(wanted).enumerate() {
                            let s = s.unwrap_or(0);
                            if i % n_chn == channel as usize {
                                dst[produced] = s as f32 * scale;
                                produced += 1;
                            }
                        }
                    }
                }
                produced
            }
        }
    }

    pub fn readable_length(&self) -> u64 {
        self.frames
    }

    pub fn n_channels(&self) -> u32 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Second handle onto the same file. WAV reopens the reader; decoded
    /// formats share the sample buffer.
    pub fn duplicate(&self) -> FileResult<SoundFileSource> {
        match &self.backend {
            Backend::Wav(_) => Self::open_wav(&self.path),
            Backend::Decoded(chans) => Ok(SoundFileSource {
                backend: Backend::Decoded(chans.clone()),
                path: self.path.clone(),
                channels: self.channels,
                sample_rate: self.sample_rate,
                frames: self.frames,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for ch in 0..channels {
                // distinct, reproducible ramp per channel
                let v = (i as i32 % 100) * 100 + ch as i32;
                writer.write_sample(v as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_read_deinterleaves_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir.wav");
        write_wav(&path, 2, 256);

        let mut src = SoundFileSource::open(&path).unwrap();
        assert_eq!(src.n_channels(), 2);
        assert_eq!(src.sample_rate(), 48_000);
        assert_eq!(src.readable_length(), 256);

        let mut left = [0.0f32; 8];
        let mut right = [0.0f32; 8];
        assert_eq!(src.read(&mut left, 10, 8, 0), 8);
        assert_eq!(src.read(&mut right, 10, 8, 1), 8);
        for i in 0..8 {
            let frame = (10 + i) as i32 % 100;
            assert!((left[i] - (frame * 100) as f32 / 32768.0).abs() < 1e-6);
            assert!((right[i] - (frame * 100 + 1) as f32 / 32768.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_wav_read_clamps_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_wav(&path, 1, 20);

        let mut src = SoundFileSource::open(&path).unwrap();
        let mut buf = [0.0f32; 64];
        assert_eq!(src.read(&mut buf, 16, 64, 0), 4);
        assert_eq!(src.read(&mut buf, 20, 4, 0), 0);
    }

    #[test]
    fn test_wav_repeated_read_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep.wav");
        write_wav(&path, 2, 128);

        let mut src = SoundFileSource::open(&path).unwrap();
        let mut a = [0.0f32; 32];
        let mut b = [0.0f32; 32];
        src.read(&mut a, 50, 32, 1);
        src.read(&mut b, 50, 32, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_reads_same_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.wav");
        write_wav(&path, 2, 64);

        let mut src = SoundFileSource::open(&path).unwrap();
        let mut dup = src.duplicate().unwrap();
        let mut a = [0.0f32; 16];
        let mut b = [0.0f32; 16];
        src.read(&mut a, 5, 16, 0);
        dup.read(&mut b, 5, 16, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(SoundFileSource::open(Path::new("/nonexistent/ir.wav")).is_err());
    }
}
