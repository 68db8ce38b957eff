//! ir-engine: Convolver facade and host boundary for IRForge
//!
//! Ties the partitioned convolution engine (`ir-dsp`) to loaded impulse
//! responses (`ir-file`) and presents the surface an audio host drives:
//! - `convolver` - routing, per-impulse gain/delay, dry/wet smoothing and
//!   the buffered/unbuffered run paths
//! - `instance` - online/offline engine pair, queued loads, hot-swap and
//!   the worker command protocol
//! - `state` - persisted key/value settings

mod convolver;
mod error;
mod instance;
mod state;

pub use convolver::{Convolver, IrChannelConfig, IrSettings};
pub use error::{LoadError, LoadResult};
pub use instance::{ConvoInstance, InstanceShared, SwapOutcome, WorkOutcome, WorkRequest};
pub use state::PersistedState;
