//! ir-file: Impulse response sources for IRForge
//!
//! Supplies IR data to the convolution engine as random-access,
//! single-channel float streams at the engine rate:
//! - `source` - the `AudioSource` variants (file, MP3, memory, channel
//!   wrap, resampled) and the supply interface
//! - `sound_file` - WAV via hound, other formats decoded via symphonia
//! - `mp3` - memory-mapped MP3 with parse-forward random access
//! - `resample` - best-quality sinc rate adapter
//! - `loader` - path to per-channel sources

mod error;
pub mod loader;
mod mp3;
mod resample;
mod sound_file;
mod source;

pub use error::{FileError, FileResult};
pub use loader::{open_ir_channels, open_source};
pub use mp3::Mp3Source;
pub use resample::ResampledSource;
pub use sound_file::SoundFileSource;
pub use source::{AudioSource, ChanWrap, MemSource};
