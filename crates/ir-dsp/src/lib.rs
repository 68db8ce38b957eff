//! ir-dsp: Non-uniformly partitioned convolution for IRForge
//!
//! The engine splits a long impulse response into partitions of
//! exponentially increasing size. The head of the IR is convolved in small
//! partitions at low latency on the audio thread's schedule; the tail runs
//! in larger partitions on dedicated worker threads at decreasing realtime
//! priority. Output is delivered per engine quantum, with lateness measured
//! rather than causing dropouts.
//!
//! ## Modules
//! - `engine` - the `Convproc` engine: lifecycle, IR seeding, realtime I/O
//! - `plan` - cost-model driven partition planner
//! - `fft` - process-global transform planner cache
//! - `time_domain` - 64-tap direct head for partial-block output
//! - `delay_line` - dry-path alignment delay
//! - `semaphore` / `thread_priority` - worker handshake and scheduling

pub mod delay_line;
pub mod engine;
mod error;
pub mod fft;
mod level;
pub mod plan;
pub mod semaphore;
pub mod thread_priority;
pub mod time_domain;

pub use delay_line::DelayLine;
pub use engine::{
    Convproc, ProcState, FL_LATE, FL_LOAD, MAXDIVIS, MAXINP, MAXLEV, MAXOUT, MAXPART, MAXQUANT,
    MINPART, MINQUANT, OPT_FFTW_MEASURE, OPT_LATE_CONTIN,
};
pub use error::{EngineError, EngineResult};
pub use plan::{LevelPlan, PartitionPlan, PlanParams};
pub use thread_priority::SchedPolicy;
pub use time_domain::TimeDomainConvolver;
