//! Memory-mapped MP3 source
//!
//! MP3 offers no reliable random access, so the source maps the whole file
//! and walks packets. Construction does one full parse to establish the
//! exact frame count. Seeking rewinds to the start when moving backwards,
//! then walks forward, decoding only from three frames before the target so
//! the decoder has enough context while the skipped frames stay parse-only.

use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use ir_core::Sample;

use crate::error::{FileError, FileResult};

/// Shared view of the mapped file bytes.
#[derive(Clone)]
struct MapSlice(Arc<Mmap>);

impl AsRef<[u8]> for MapSlice {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub struct Mp3Source {
    map: MapSlice,
    path: PathBuf,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: u32,
    sample_rate: u32,
    len: u64,

    /// Absolute frame index of `pcm[pcm_off]`.
    read_position: u64,
    /// Interleaved samples of the current frame.
    pcm: Vec<Sample>,
    /// Frame offset of the unconsumed part of `pcm`.
    pcm_off: usize,
    /// Frames remaining from `pcm_off` on. Parse-only windows count here
    /// backed by silence; seeking consumes them before any copy.
    frames_avail: usize,
}

impl Mp3Source {
    pub fn open(path: &Path) -> FileResult<Self> {
        let file = File::open(path).map_err(|_| FileError::NotFound(path.display().to_string()))?;
        let map = MapSlice(Arc::new(unsafe { Mmap::map(&file)? }));

        // Full parse to count frames; MP3 headers alone cannot tell.
        let (mut reader, track_id, channels, sample_rate) = make_reader(&map)?;
        let mut len = 0u64;
        while let Ok(packet) = reader.next_packet() {
            if packet.track_id() == track_id {
                len += packet.dur;
            }
        }
        if len == 0 {
            return Err(FileError::InvalidFile(path.display().to_string()));
        }
        log::debug!(
            "mp3: {} frames, {} Hz, {} channels",
            len,
            sample_rate,
            channels
        );

        let (reader, track_id, _, _) = make_reader(&map)?;
        let decoder = make_decoder(reader.as_ref(), track_id)?;

        let mut src = Self {
            map,
            path: path.to_path_buf(),
            reader,
            decoder,
            track_id,
            channels,
            sample_rate,
            len,
            read_position: 0,
            pcm: Vec::new(),
            pcm_off: 0,
            frames_avail: 0,
        };
        src.decode_frame(false);
        Ok(src)
    }

    pub fn read(&mut self, dst: &mut [Sample], pos: u64, cnt: usize, channel: u32) -> usize {
        if channel >= self.channels || cnt == 0 || pos >= self.len {
            return 0;
        }
        if pos != self.read_position {
            self.seek(pos);
        }

        let n_chn = self.channels as usize;
        let mut done = 0;
        while done < cnt {
            if self.frames_avail == 0 && self.decode_frame(false) == 0 {
                break;
            }
            let take = (cnt - done).min(self.frames_avail);
            for i in 0..take {
                dst[done + i] = self.pcm[(self.pcm_off + i) * n_chn + channel as usize];
            }
            self.pcm_off += take;
            self.frames_avail -= take;
            self.read_position += take as u64;
            done += take;
        }
        done
    }

    pub fn readable_length(&self) -> u64 {
        self.len
    }

    pub fn n_channels(&self) -> u32 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Second handle sharing the mapping and the known length.
    pub fn duplicate(&self) -> FileResult<Mp3Source> {
        let (reader, track_id, channels, sample_rate) = make_reader(&self.map)?;
        let decoder = make_decoder(reader.as_ref(), track_id)?;
        let mut src = Self {
            map: self.map.clone(),
            path: self.path.clone(),
            reader,
            decoder,
            track_id,
            channels,
            sample_rate,
            len: self.len,
            read_position: 0,
            pcm: Vec::new(),
            pcm_off: 0,
            frames_avail: 0,
        };
        src.decode_frame(false);
        Ok(src)
    }

    /// Decode (or merely parse) the next frame into `pcm`. Returns the
    /// frame count, 0 at end of stream.
    fn decode_frame(&mut self, parse_only: bool) -> usize {
        self.pcm_off = 0;
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(_) => {
                    self.frames_avail = 0;
                    return 0;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let dur = packet.dur as usize;

            if parse_only {
                // skip the decode; keep pcm sized so a stray read of this
                // window serves silence instead of stale data
                self.pcm.clear();
                self.pcm.resize(dur * self.channels as usize, 0.0);
                self.frames_avail = dur;
                return dur;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<Sample>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    self.pcm.clear();
                    self.pcm.extend_from_slice(buf.samples());
                    self.frames_avail = self.pcm.len() / self.channels as usize;
                    return self.frames_avail;
                }
                Err(symphonia::core::errors::Error::DecodeError(_)) => {
                    // context lost after a parse-only skip: account the
                    // frame as silence so positions stay exact
                    self.pcm.clear();
                    self.pcm.resize(dur * self.channels as usize, 0.0);
                    self.frames_avail = dur;
                    return dur;
                }
                Err(_) => {
                    self.frames_avail = 0;
                    return 0;
                }
            }
        }
    }

    fn seek(&mut self, pos: u64) {
        if pos == self.read_position {
            return;
        }

        if pos < self.read_position {
            // rewind, then walk forward
            if let Ok((reader, track_id, _, _)) = make_reader(&self.map) {
                if let Ok(decoder) = make_decoder(reader.as_ref(), track_id) {
                    self.reader = reader;
                    self.decoder = decoder;
                    self.track_id = track_id;
                    self.read_position = 0;
                    self.pcm_off = 0;
                    self.frames_avail = 0;
                    self.decode_frame(false);
                }
            }
        }

        // Skip ahead until the frame holding `pos`, decoding only the last
        // three frames before the target so the decoder regains context.
        while self.read_position + self.frames_avail as u64 <= pos {
            let window = self.frames_avail as u64;
            let parse_only = self.read_position + 3 * window <= pos;
            let next_start = self.read_position + window;
            if self.decode_frame(parse_only) == 0 {
                break;
            }
            self.read_position = next_start;
        }

        if self.frames_avail > 0 {
            let delta = (pos.saturating_sub(self.read_position)) as usize;
            let delta = delta.min(self.frames_avail);
            self.pcm_off += delta;
            self.frames_avail -= delta;
            self.read_position = pos;
        }
    }
}

fn make_reader(map: &MapSlice) -> FileResult<(Box<dyn FormatReader>, u32, u32, u32)> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(map.clone())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| FileError::InvalidFile("no audio track".into()))?;
    let track_id = track.id;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0) as u32;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    if channels == 0 || sample_rate == 0 {
        return Err(FileError::InvalidFile("mp3 missing stream parameters".into()));
    }
    Ok((reader, track_id, channels, sample_rate))
}

fn make_decoder(reader: &dyn FormatReader, track_id: u32) -> FileResult<Box<dyn Decoder>> {
    let track = reader
        .tracks()
        .iter()
        .find(|t| t.id == track_id)
        .ok_or_else(|| FileError::InvalidFile("mp3 track disappeared".into()))?;
    Ok(symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?)
}
