//! One convolution level
//!
//! A level owns the frequency-domain state for all partitions of one size:
//! per input a ring of input spectra covering the most recent
//! `npar * parsize` samples, per (input, output) pair a matching ring of IR
//! spectra, and per output a triple-buffered time-domain accumulator.
//!
//! Every `parsize` input samples the level "ticks": it transforms the newest
//! input window, multiply-accumulates it against the IR spectra, inverse
//! transforms and overlap-adds the result. Non-inline levels run their tick
//! on a dedicated worker thread; the audio thread and the worker hand the
//! level state back and forth through the `trig`/`done` semaphore pair.
//!
//! Access protocol for the shared state block: the worker touches it only
//! between receiving `trig` and posting `done`, and during a tick it owns
//! the transform scratch, the input spectra and the two output buffers
//! after the current readout index. The audio thread owns its cursor
//! fields and the readout buffer, rotates indices only after draining
//! `done` for every posted `trig`, and never touches the worker's side of
//! the triple buffer mid-tick. The semaphore pair provides the
//! release/acquire ordering.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use realfft::{ComplexToReal, RealToComplex};
use rustfft::num_complex::Complex;

use crate::fft;
use crate::semaphore::Semaphore;
use crate::thread_priority::{self, SchedPolicy};

pub(crate) const ST_IDLE: u32 = 0;
pub(crate) const ST_TERM: u32 = 1;
pub(crate) const ST_PROC: u32 = 2;

/// Input history rings, one per engine input channel.
///
/// The audio thread writes the window at the engine's current input offset;
/// level workers read strictly older windows. The per-level semaphore
/// handshake orders those accesses.
pub(crate) struct InputRings {
    bufs: Vec<UnsafeCell<Box<[f32]>>>,
}

unsafe impl Send for InputRings {}
unsafe impl Sync for InputRings {}

impl InputRings {
    pub(crate) fn new(channels: usize, size: usize) -> Self {
        Self {
            bufs: (0..channels)
                .map(|_| UnsafeCell::new(vec![0.0; size].into_boxed_slice()))
                .collect(),
        }
    }

    /// # Safety
    /// The caller must be the single writer for the accessed region
    /// (engine input window, audio thread only).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, ch: usize) -> &mut [f32] {
        &mut *self.bufs[ch].get()
    }

    /// # Safety
    /// The caller must not read a region concurrently written by the audio
    /// thread (workers only read windows older than the write position).
    pub(crate) unsafe fn slice(&self, ch: usize) -> &[f32] {
        &*self.bufs[ch].get()
    }
}

/// Input node: FFT history ring for one input channel.
struct Inpnode {
    inp: u32,
    /// `npar` spectra of `parsize + 1` bins.
    ffta: Vec<Box<[Complex<f32>]>>,
}

impl Inpnode {
    fn new(inp: u32, npar: u32, parsize: u32) -> Self {
        Self {
            inp,
            ffta: (0..npar)
                .map(|_| vec![Complex::new(0.0, 0.0); parsize as usize + 1].into_boxed_slice())
                .collect(),
        }
    }
}

/// Multiply-accumulate node: IR spectra for one (input, output) pair.
/// Partitions with no IR overlap stay unallocated.
struct Macnode {
    inp_idx: usize,
    fftb: Vec<Option<Box<[Complex<f32>]>>>,
}

/// Output node: triple-buffered overlap-add accumulator for one output.
struct Outnode {
    out: u32,
    buff: [Box<[f32]>; 3],
    macs: Vec<Macnode>,
}

impl Outnode {
    fn new(out: u32, parsize: u32) -> Self {
        let buf = || vec![0.0f32; parsize as usize].into_boxed_slice();
        Self {
            out,
            buff: [buf(), buf(), buf()],
            macs: Vec::new(),
        }
    }
}

struct LevelState {
    npar: u32,
    parsize: u32,

    inp_nodes: Vec<Inpnode>,
    out_nodes: Vec<Outnode>,

    plan_r2c: Arc<dyn RealToComplex<f32>>,
    plan_c2r: Arc<dyn ComplexToReal<f32>>,
    time_data: Box<[f32]>,
    prep_data: Box<[f32]>,
    freq_data: Box<[Complex<f32>]>,
    fwd_scratch: Vec<Complex<f32>>,
    inv_scratch: Vec<Complex<f32>>,

    inpbuff: Option<Arc<InputRings>>,
    inpsize: u32,
    outsize: u32,
    inpoffs: u32,
    outoffs: u32,
    ptind: u32,
    opind: u32,
    bits: u32,
    wait: u32,
}

struct LevelShared {
    stat: AtomicU32,
    trig: Semaphore,
    done: Semaphore,
    state: UnsafeCell<LevelState>,
    /// Artificial worker lag in milliseconds, for lateness tests.
    #[cfg(test)]
    test_lag_ms: AtomicU32,
}

// The state block alternates between the audio thread and the worker under
// the trig/done protocol documented at the top of this module.
unsafe impl Send for LevelShared {}
unsafe impl Sync for LevelShared {}

pub(crate) struct Convlevel {
    shared: Arc<LevelShared>,
    prio: i32,
    offs: u32,
    npar: u32,
    parsize: u32,
}

impl Convlevel {
    pub(crate) fn new(prio: i32, offs: u32, npar: u32, parsize: u32) -> Self {
        let pair = fft::plan_pair(2 * parsize as usize);
        let fwd_scratch = vec![Complex::new(0.0, 0.0); pair.forward.get_scratch_len()];
        let inv_scratch = vec![Complex::new(0.0, 0.0); pair.inverse.get_scratch_len()];

        let state = LevelState {
            npar,
            parsize,
            inp_nodes: Vec::new(),
            out_nodes: Vec::new(),
            plan_r2c: pair.forward,
            plan_c2r: pair.inverse,
            time_data: vec![0.0; 2 * parsize as usize].into_boxed_slice(),
            prep_data: vec![0.0; 2 * parsize as usize].into_boxed_slice(),
            freq_data: vec![Complex::new(0.0, 0.0); parsize as usize + 1].into_boxed_slice(),
            fwd_scratch,
            inv_scratch,
            inpbuff: None,
            inpsize: 0,
            outsize: 0,
            inpoffs: 0,
            outoffs: 0,
            ptind: 0,
            opind: 0,
            bits: 0,
            wait: 0,
        };

        Self {
            shared: Arc::new(LevelShared {
                stat: AtomicU32::new(ST_IDLE),
                trig: Semaphore::new(),
                done: Semaphore::new(),
                state: UnsafeCell::new(state),
                #[cfg(test)]
                test_lag_ms: AtomicU32::new(0),
            }),
            prio,
            offs,
            npar,
            parsize,
        }
    }

    pub(crate) fn prio(&self) -> i32 {
        self.prio
    }

    pub(crate) fn offs(&self) -> u32 {
        self.offs
    }

    pub(crate) fn npar(&self) -> u32 {
        self.npar
    }

    pub(crate) fn parsize(&self) -> u32 {
        self.parsize
    }

    pub(crate) fn stat(&self) -> u32 {
        self.shared.stat.load(Ordering::Acquire)
    }

    /// # Safety
    /// Only while no worker tick is outstanding, or from the worker itself.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state_mut(&self) -> &mut LevelState {
        &mut *self.shared.state.get()
    }

    /// Seed (accumulate) IR data into the spectra of this level's partitions.
    ///
    /// `data` holds `ind1 - ind0` frames at stride `step`, representing IR
    /// frames `[ind0, ind1)`. Partitions outside that range are untouched.
    pub(crate) fn impdata_write(
        &mut self,
        inp: u32,
        out: u32,
        step: i32,
        data: &[f32],
        ind0: i32,
        ind1: i32,
        create: bool,
    ) {
        let n = ind1 - ind0;
        let mut i0 = self.offs as i32 - ind0;
        let i1 = i0 + (self.npar * self.parsize) as i32;
        if i0 >= n || i1 <= 0 {
            return;
        }

        let st = unsafe { self.state_mut() };
        let (oi, mi) = match st.find_macnode(inp, out, create) {
            Some(idx) => idx,
            None => return,
        };

        let parsize = self.parsize as usize;
        let norm = 0.5 / self.parsize as f32;
        let LevelState {
            out_nodes,
            prep_data,
            freq_data,
            plan_r2c,
            ..
        } = st;
        let mac = &mut out_nodes[oi].macs[mi];

        for k in 0..self.npar as usize {
            let i1 = i0 + self.parsize as i32;
            if i0 < n && i1 > 0 {
                let fftb = mac.fftb[k].get_or_insert_with(|| {
                    vec![Complex::new(0.0, 0.0); parsize + 1].into_boxed_slice()
                });
                prep_data.fill(0.0);
                let j0 = i0.max(0);
                let j1 = i1.min(n);
                for j in j0..j1 {
                    prep_data[(j - i0) as usize] = norm * data[(j as isize * step as isize) as usize];
                }
                // off the realtime path, the allocating process() is fine
                if plan_r2c.process(prep_data, freq_data).is_ok() {
                    for (b, f) in fftb.iter_mut().zip(freq_data.iter()) {
                        *b += *f;
                    }
                }
            }
            i0 = i1;
        }
    }

    /// Zero the IR spectra of one (input, output) pair without freeing them.
    pub(crate) fn impdata_clear(&mut self, inp: u32, out: u32) {
        let st = unsafe { self.state_mut() };
        let (oi, mi) = match st.find_macnode(inp, out, false) {
            Some(idx) => idx,
            None => return,
        };
        for fftb in st.out_nodes[oi].macs[mi].fftb.iter_mut().flatten() {
            fftb.fill(Complex::new(0.0, 0.0));
        }
    }

    /// Clear all runtime state and (re)bind the engine's buffers.
    pub(crate) fn reset(&mut self, inpsize: u32, outsize: u32, inpbuff: &Arc<InputRings>) {
        let st = unsafe { self.state_mut() };
        st.inpsize = inpsize;
        st.outsize = outsize;
        st.inpbuff = Some(inpbuff.clone());
        for x in &mut st.inp_nodes {
            for s in &mut x.ffta {
                s.fill(Complex::new(0.0, 0.0));
            }
        }
        for y in &mut st.out_nodes {
            for b in &mut y.buff {
                b.fill(0.0);
            }
        }
        if self.parsize == outsize {
            st.outoffs = 0;
            st.inpoffs = 0;
        } else {
            st.outoffs = self.parsize / 2;
            st.inpoffs = inpsize - st.outoffs;
        }
        st.bits = self.parsize / outsize;
        st.wait = 0;
        st.ptind = 0;
        st.opind = 0;
        self.shared.trig.reset();
        self.shared.done.reset();
    }

    /// Spawn the worker thread for this level. `quantum_period_ns` is the
    /// engine quantum period; the level scales it to its own tick period.
    pub(crate) fn start(
        &mut self,
        abspri: i32,
        policy: SchedPolicy,
        quantum_period_ns: f64,
        quantum: u32,
    ) -> bool {
        let (min, max) = thread_priority::priority_range(policy);
        let prio = (abspri + self.prio).clamp(min, max);
        let period_ns = quantum_period_ns * (self.parsize / quantum) as f64;
        let shared = self.shared.clone();

        let spawned = thread::Builder::new()
            .name(format!("conv-{}", self.parsize))
            .stack_size(0x800000)
            .spawn(move || {
                if !thread_priority::set_realtime(policy, prio, period_ns)
                    && policy != SchedPolicy::Other
                {
                    log::warn!(
                        "convolution worker: no realtime permission, running at default priority"
                    );
                }
                shared.stat.store(ST_PROC, Ordering::Release);
                loop {
                    shared.trig.wait();
                    if shared.stat.load(Ordering::Acquire) == ST_TERM {
                        shared.stat.store(ST_IDLE, Ordering::Release);
                        return;
                    }
                    #[cfg(test)]
                    {
                        let lag = shared.test_lag_ms.load(Ordering::Relaxed);
                        if lag > 0 {
                            thread::sleep(std::time::Duration::from_millis(lag as u64));
                        }
                    }
                    unsafe { (*shared.state.get()).process() };
                    shared.done.post();
                }
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                log::warn!("failed to spawn convolution worker: {}", e);
                false
            }
        }
    }

    /// Make the worker oversleep each tick by `ms` (lateness tests only).
    #[cfg(test)]
    pub(crate) fn set_test_lag(&self, ms: u32) {
        self.shared.test_lag_ms.store(ms, Ordering::Relaxed);
    }

    /// Ask the worker to exit at its next loop head.
    pub(crate) fn stop(&self) {
        if self.shared.stat.load(Ordering::Acquire) != ST_IDLE {
            self.shared.stat.store(ST_TERM, Ordering::Release);
            self.shared.trig.post();
        }
    }

    /// Advance the level by one engine quantum and add its contribution to
    /// the output buffers. Returns this level's lateness bits when the
    /// worker had not finished the previous tick in time.
    pub(crate) fn readout(&mut self, outbuff: &mut [Box<[f32]>]) -> u32 {
        let st = unsafe { self.state_mut() };
        let mut late = 0u32;

        st.outoffs += st.outsize;
        if st.outoffs == self.parsize {
            st.outoffs = 0;
            if self.shared.stat.load(Ordering::Acquire) == ST_PROC {
                while st.wait > 0 {
                    if !self.shared.done.try_wait() {
                        // worker overran its period; block to keep the
                        // output correct and report the miss
                        late = st.bits;
                        self.shared.done.wait();
                    }
                    st.wait -= 1;
                }
                st.opind = (st.opind + 1) % 3;
                self.shared.trig.post();
                st.wait += 1;
            } else {
                st.process();
                st.opind = (st.opind + 1) % 3;
            }
        }

        for y in &st.out_nodes {
            let p = &y.buff[st.opind as usize]
                [st.outoffs as usize..(st.outoffs + st.outsize) as usize];
            let q = &mut outbuff[y.out as usize];
            for (qi, pi) in q[..st.outsize as usize].iter_mut().zip(p) {
                *qi += pi;
            }
        }

        late
    }

    /// Peek up to `n_samples` from the already-computed tail without
    /// advancing the level: the virtual wrap drains outstanding work but
    /// does not rotate the output index or kick the worker.
    pub(crate) fn readtail(&mut self, n_samples: usize, outbuff: &mut [Box<[f32]>]) {
        let st = unsafe { self.state_mut() };
        let mut opind = st.opind;
        let mut outoffs = st.outoffs + st.outsize;
        if outoffs == self.parsize {
            while st.wait > 0 {
                self.shared.done.wait();
                st.wait -= 1;
            }
            outoffs = 0;
            opind = (opind + 1) % 3;
        }

        for y in &st.out_nodes {
            let p = &y.buff[opind as usize][outoffs as usize..];
            let q = &mut outbuff[y.out as usize];
            for (qi, pi) in q[..n_samples].iter_mut().zip(p) {
                *qi += pi;
            }
        }
    }
}

impl LevelState {
    /// Locate the (output, mac) arena indices for an (input, output) pair,
    /// creating the nodes on demand.
    fn find_macnode(&mut self, inp: u32, out: u32, create: bool) -> Option<(usize, usize)> {
        let xi = match self.inp_nodes.iter().position(|x| x.inp == inp) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                self.inp_nodes.push(Inpnode::new(inp, self.npar, self.parsize));
                self.inp_nodes.len() - 1
            }
        };

        let yi = match self.out_nodes.iter().position(|y| y.out == out) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                self.out_nodes.push(Outnode::new(out, self.parsize));
                self.out_nodes.len() - 1
            }
        };

        let macs = &mut self.out_nodes[yi].macs;
        let mi = match macs.iter().position(|m| m.inp_idx == xi) {
            Some(i) => i,
            None => {
                if !create {
                    return None;
                }
                macs.push(Macnode {
                    inp_idx: xi,
                    fftb: (0..self.npar).map(|_| None).collect(),
                });
                macs.len() - 1
            }
        };

        Some((yi, mi))
    }

    /// One level tick: transform the newest input window, accumulate all
    /// partition products, inverse transform and overlap-add.
    fn process(&mut self) {
        let parsize = self.parsize as usize;
        let npar = self.npar as usize;

        let i1 = self.inpoffs as usize;
        let mut n1 = parsize;
        let mut n2 = 0usize;
        self.inpoffs += self.parsize;
        if self.inpoffs >= self.inpsize {
            self.inpoffs -= self.inpsize;
            n2 = self.inpoffs as usize;
            n1 -= n2;
        }

        let opi1 = ((self.opind + 1) % 3) as usize;
        let opi2 = ((self.opind + 2) % 3) as usize;
        let ptind = self.ptind as usize;

        let rings = match &self.inpbuff {
            Some(r) => r.clone(),
            None => return,
        };

        let LevelState {
            inp_nodes,
            out_nodes,
            plan_r2c,
            plan_c2r,
            time_data,
            freq_data,
            fwd_scratch,
            inv_scratch,
            ..
        } = self;

        for x in inp_nodes.iter_mut() {
            let inpd = unsafe { rings.slice(x.inp as usize) };
            time_data[..n1].copy_from_slice(&inpd[i1..i1 + n1]);
            if n2 > 0 {
                time_data[n1..n1 + n2].copy_from_slice(&inpd[..n2]);
            }
            time_data[parsize..].fill(0.0);
            let _ = plan_r2c.process_with_scratch(time_data, &mut x.ffta[ptind], fwd_scratch);
        }

        let inp_nodes = &*inp_nodes;
        for y in out_nodes.iter_mut() {
            freq_data.fill(Complex::new(0.0, 0.0));
            for m in &y.macs {
                let x = &inp_nodes[m.inp_idx];
                let mut i = ptind;
                for fftb in m.fftb.iter().take(npar) {
                    if let Some(fftb) = fftb {
                        cmac(freq_data, &x.ffta[i], fftb);
                    }
                    if i == 0 {
                        i = npar;
                    }
                    i -= 1;
                }
            }

            // the DC and Nyquist bins are mathematically real
            freq_data[0].im = 0.0;
            freq_data[parsize].im = 0.0;
            let _ = plan_c2r.process_with_scratch(freq_data, time_data, inv_scratch);

            let outd = &mut y.buff[opi1];
            for (o, t) in outd.iter_mut().zip(&time_data[..parsize]) {
                *o += t;
            }
            y.buff[opi2].copy_from_slice(&time_data[parsize..]);
        }

        self.ptind += 1;
        if self.ptind == self.npar {
            self.ptind = 0;
        }
    }
}

/// `acc[k] += a[k] * b[k]` over half spectra.
fn cmac(acc: &mut [Complex<f32>], a: &[Complex<f32>], b: &[Complex<f32>]) {
    for ((d, a), b) in acc.iter_mut().zip(a).zip(b) {
        *d += a * b;
    }
}
