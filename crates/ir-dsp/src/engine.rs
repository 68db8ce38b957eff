//! Convolution engine
//!
//! `Convproc` owns the partition levels, the shared input history rings and
//! the summed output buffers, and drives the realtime side: `process()`
//! advances the stream by one quantum and, when a full minimum partition has
//! accumulated, runs every level's readout. `tailonly()` is the partial-block
//! path used by unbuffered hosts.
//!
//! Lifecycle: `Idle --configure--> Stop --start_process--> Proc
//! --stop_process--> Wait --(workers drained)--> Stop --cleanup--> Idle`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::fft;
use crate::level::{Convlevel, InputRings, ST_IDLE, ST_PROC};
use crate::plan::{PartitionPlan, PlanParams};
use crate::thread_priority::SchedPolicy;

/// Ask for more planning effort when seeding spectra (accepted, currently a
/// no-op with the realfft planner).
pub const OPT_FFTW_MEASURE: u32 = 1;

/// Keep processing after five consecutive late ticks instead of stopping.
pub const OPT_LATE_CONTIN: u32 = 4;

/// Lateness bits in the `process` return value, one set of bits per level.
pub const FL_LATE: u32 = 0x0000_FFFF;

/// Set when the engine hit the consecutive-lateness limit.
pub const FL_LOAD: u32 = 0x0100_0000;

pub const MAXINP: u32 = 64;
pub const MAXOUT: u32 = 64;
pub const MAXLEV: u32 = 8;
pub const MINPART: u32 = 64;
pub const MAXPART: u32 = 8192;
pub const MAXDIVIS: u32 = 16;
pub const MINQUANT: u32 = 16;
pub const MAXQUANT: u32 = 8192;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Not configured.
    Idle,
    /// Configured, workers not running; IR data may be seeded.
    Stop,
    /// Stopping, waiting for workers to drain.
    Wait,
    /// Running; `process`/`tailonly` are legal.
    Proc,
}

pub struct Convproc {
    state: ProcState,
    options: u32,
    ninp: u32,
    nout: u32,
    quantum: u32,
    minpart: u32,
    maxpart: u32,
    inpsize: u32,
    inpoffs: u32,
    outoffs: u32,
    latecnt: u32,
    planner_held: bool,
    inpbuff: Option<Arc<InputRings>>,
    outbuff: Vec<Box<[f32]>>,
    levels: Vec<Convlevel>,
}

impl Default for Convproc {
    fn default() -> Self {
        Self::new()
    }
}

impl Convproc {
    pub fn new() -> Self {
        Self {
            state: ProcState::Idle,
            options: 0,
            ninp: 0,
            nout: 0,
            quantum: 0,
            minpart: 0,
            maxpart: 0,
            inpsize: 0,
            inpoffs: 0,
            outoffs: 0,
            latecnt: 0,
            planner_held: false,
            inpbuff: None,
            outbuff: Vec::new(),
            levels: Vec::new(),
        }
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn set_options(&mut self, options: u32) {
        self.options = options;
    }

    pub fn n_inputs(&self) -> u32 {
        self.ninp
    }

    pub fn n_outputs(&self) -> u32 {
        self.nout
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn min_part(&self) -> u32 {
        self.minpart
    }

    /// Largest partition size in the active plan.
    pub fn max_part(&self) -> u32 {
        self.maxpart
    }

    /// Build the partition levels and allocate the stream buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        ninp: u32,
        nout: u32,
        maxsize: u32,
        quantum: u32,
        minpart: u32,
        maxpart: u32,
        density: f32,
    ) -> EngineResult<()> {
        if self.state != ProcState::Idle {
            return Err(EngineError::BadState);
        }
        if !(1..=MAXINP).contains(&ninp)
            || !(1..=MAXOUT).contains(&nout)
            || maxsize == 0
            || maxsize as u64 > ir_core::MAX_IR_FRAMES
            || !quantum.is_power_of_two()
            || !(MINQUANT..=MAXQUANT).contains(&quantum)
            || !minpart.is_power_of_two()
            || minpart < MINPART
            || minpart < quantum
            || minpart > MAXDIVIS * quantum
            || !maxpart.is_power_of_two()
            || maxpart > MAXPART
            || maxpart < minpart
        {
            return Err(EngineError::BadParam);
        }

        let plan = PartitionPlan::compute(&PlanParams {
            n_inp: ninp,
            n_out: nout,
            max_ir_len: maxsize,
            quantum,
            minpart,
            maxpart,
            density,
        });
        debug_assert!(plan.levels.len() <= MAXLEV as usize);
        debug_assert!(plan.covered() >= maxsize as u64);

        fft::retain_planner();
        self.planner_held = true;

        self.levels = plan
            .levels
            .iter()
            .map(|l| Convlevel::new(l.prio, l.offs, l.npar, l.size))
            .collect();
        for l in &self.levels {
            log::debug!(
                "level: prio = {:3}, offs = {:7}, parsize = {:5}, npar = {:3}",
                l.prio(),
                l.offs(),
                l.parsize(),
                l.npar()
            );
        }

        self.ninp = ninp;
        self.nout = nout;
        self.quantum = quantum;
        self.minpart = minpart;
        self.maxpart = plan.maxpart;
        self.latecnt = 0;
        self.inpsize = 2 * plan.maxpart;
        self.inpbuff = Some(Arc::new(InputRings::new(
            ninp as usize,
            self.inpsize as usize,
        )));
        self.outbuff = (0..nout)
            .map(|_| vec![0.0f32; minpart as usize].into_boxed_slice())
            .collect();

        self.state = ProcState::Stop;
        Ok(())
    }

    /// Seed IR frames `[ind0, ind1)` for one (input, output) pair into every
    /// level. `data` holds the frames at stride `step`; repeated calls
    /// accumulate, so an IR can be built in chunks.
    pub fn impdata_create(
        &mut self,
        inp: u32,
        out: u32,
        step: i32,
        data: &[f32],
        ind0: i32,
        ind1: i32,
    ) -> EngineResult<()> {
        if self.state != ProcState::Stop {
            return Err(EngineError::BadState);
        }
        if inp >= self.ninp || out >= self.nout || step < 1 {
            return Err(EngineError::BadParam);
        }
        for level in &mut self.levels {
            level.impdata_write(inp, out, step, data, ind0, ind1, true);
        }
        Ok(())
    }

    /// Zero the seeded spectra of one (input, output) pair.
    pub fn impdata_clear(&mut self, inp: u32, out: u32) -> EngineResult<()> {
        if self.state == ProcState::Idle {
            return Err(EngineError::BadState);
        }
        for level in &mut self.levels {
            level.impdata_clear(inp, out);
        }
        Ok(())
    }

    /// Clear all stream state. Legal in any configured state.
    pub fn reset(&mut self) -> EngineResult<()> {
        if self.state == ProcState::Idle {
            return Err(EngineError::BadState);
        }
        let rings = match &self.inpbuff {
            Some(r) => r.clone(),
            None => return Err(EngineError::BadState),
        };
        for ch in 0..self.ninp as usize {
            unsafe { rings.slice_mut(ch).fill(0.0) };
        }
        for out in &mut self.outbuff {
            out.fill(0.0);
        }
        for level in &mut self.levels {
            level.reset(self.inpsize, self.minpart, &rings);
        }
        Ok(())
    }

    /// Start the level workers and enter `Proc`.
    ///
    /// `quantum_period_ns` is the duration of one quantum at the stream
    /// rate; levels scale it to their own tick period for platforms with
    /// time-constraint scheduling.
    pub fn start_process(
        &mut self,
        abspri: i32,
        policy: SchedPolicy,
        quantum_period_ns: f64,
    ) -> EngineResult<()> {
        if self.state != ProcState::Stop {
            return Err(EngineError::BadState);
        }
        self.restart_process(abspri, policy, quantum_period_ns)
    }

    /// Like `start_process`, but also legal while running or draining: a
    /// running engine is stopped and drained first.
    pub fn restart_process(
        &mut self,
        abspri: i32,
        policy: SchedPolicy,
        quantum_period_ns: f64,
    ) -> EngineResult<()> {
        match self.state {
            ProcState::Stop | ProcState::Wait => {}
            ProcState::Proc => {
                self.stop_process()?;
                while !self.check_stop() {
                    thread::sleep(Duration::from_millis(40));
                }
            }
            ProcState::Idle => return Err(EngineError::BadState),
        }

        self.latecnt = 0;
        self.inpoffs = 0;
        self.outoffs = 0;
        self.reset()?;

        let first = if self.minpart == self.quantum { 1 } else { 0 };
        let quantum = self.quantum;
        let started = self
            .levels
            .iter_mut()
            .skip(first)
            .all(|level| level.start(abspri, policy, quantum_period_ns, quantum));
        if !started {
            self.force_stop();
            self.cleanup();
            return Err(EngineError::BadState);
        }

        while !self.check_started(first) {
            thread::sleep(Duration::from_millis(40));
        }

        self.state = ProcState::Proc;
        Ok(())
    }

    /// Window of the input ring the caller writes the next quantum into.
    pub fn inpdata(&mut self, ch: usize) -> &mut [f32] {
        let (offs, quantum) = (self.inpoffs as usize, self.quantum as usize);
        match &self.inpbuff {
            Some(rings) => unsafe { &mut rings.slice_mut(ch)[offs..offs + quantum] },
            None => &mut [],
        }
    }

    /// Window of the summed output for the current quantum.
    pub fn outdata(&self, ch: usize) -> &[f32] {
        let offs = self.outoffs as usize;
        &self.outbuff[ch][offs..offs + self.quantum as usize]
    }

    /// Mutable output window; the partial-block head convolver adds into it.
    pub fn outdata_mut(&mut self, ch: usize) -> &mut [f32] {
        let offs = self.outoffs as usize;
        &mut self.outbuff[ch][offs..offs + self.quantum as usize]
    }

    /// Advance the stream by one quantum. Returns `FL_LATE` bits for levels
    /// whose worker overran, plus `FL_LOAD` once lateness persists for five
    /// consecutive ticks (the engine then stops itself unless
    /// `OPT_LATE_CONTIN` is set).
    pub fn process(&mut self) -> u32 {
        if self.state != ProcState::Proc {
            return 0;
        }

        self.inpoffs += self.quantum;
        if self.inpoffs == self.inpsize {
            self.inpoffs = 0;
        }

        let mut flags = 0;
        self.outoffs += self.quantum;
        if self.outoffs == self.minpart {
            self.outoffs = 0;
            for out in &mut self.outbuff {
                out.fill(0.0);
            }
            for level in &mut self.levels {
                flags |= level.readout(&mut self.outbuff);
            }
            if flags != 0 {
                self.latecnt += 1;
                if self.latecnt >= 5 {
                    if self.options & OPT_LATE_CONTIN == 0 {
                        let _ = self.stop_process();
                    }
                    flags |= FL_LOAD;
                }
            } else {
                self.latecnt = 0;
            }
        }
        flags
    }

    /// Fill the first `n_samples` of the output buffers from the levels'
    /// already-computed tails, without consuming a quantum. Only meaningful
    /// while the current output window has not wrapped.
    pub fn tailonly(&mut self, n_samples: usize) -> u32 {
        if self.state != ProcState::Proc {
            return 0;
        }

        if self.outoffs + self.quantum == self.minpart {
            for out in &mut self.outbuff {
                out[..n_samples].fill(0.0);
            }
            for level in &mut self.levels {
                level.readtail(n_samples, &mut self.outbuff);
            }
        }
        0
    }

    /// Ask all workers to terminate; the engine enters `Wait` until they
    /// drain (see `cleanup` / `check_stop`).
    pub fn stop_process(&mut self) -> EngineResult<()> {
        if self.state != ProcState::Proc {
            return Err(EngineError::BadState);
        }
        self.force_stop();
        Ok(())
    }

    fn force_stop(&mut self) {
        for level in &self.levels {
            level.stop();
        }
        self.state = ProcState::Wait;
    }

    /// Drain the workers and release everything; the engine returns to
    /// `Idle` and may be configured again.
    pub fn cleanup(&mut self) {
        if self.state == ProcState::Idle {
            return;
        }
        while !self.check_stop() {
            thread::sleep(Duration::from_millis(40));
        }
        self.levels.clear();
        self.inpbuff = None;
        self.outbuff.clear();
        if self.planner_held {
            fft::release_planner();
            self.planner_held = false;
        }

        self.state = ProcState::Idle;
        self.options = 0;
        self.ninp = 0;
        self.nout = 0;
        self.quantum = 0;
        self.minpart = 0;
        self.maxpart = 0;
        self.inpsize = 0;
        self.latecnt = 0;
    }

    /// True once every worker from `first` on reports running.
    fn check_started(&self, first: usize) -> bool {
        self.levels.iter().skip(first).all(|l| l.stat() == ST_PROC)
    }

    /// True once every worker has exited; transitions `Wait` to `Stop`.
    pub fn check_stop(&mut self) -> bool {
        if self.levels.iter().all(|l| l.stat() == ST_IDLE) {
            if self.state == ProcState::Wait {
                self.state = ProcState::Stop;
            }
            true
        } else {
            false
        }
    }
}

impl Drop for Convproc {
    fn drop(&mut self) {
        if self.state == ProcState::Proc {
            self.force_stop();
        }
        self.cleanup();
    }
}
