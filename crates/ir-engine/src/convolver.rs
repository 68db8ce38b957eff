//! Convolver facade
//!
//! Binds the partitioned engine to a loaded impulse response: channel
//! routing, per-impulse gain and pre-delay, dry/wet mixing with one-pole
//! gain smoothing, and the buffered/unbuffered run paths. The unbuffered
//! paths use the time-domain heads to fill partial blocks ahead of the next
//! quantum boundary.

use ir_core::Sample;
use ir_dsp::{Convproc, DelayLine, ProcState, SchedPolicy, TimeDomainConvolver, MAXPART};
use ir_file::{open_ir_channels, AudioSource};

use crate::error::{LoadError, LoadResult};

/// Seeding chunk size, in frames.
const SEED_CHUNK: usize = 8192;

/// Channel routing of the impulse response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IrChannelConfig {
    /// 1 in, 1 out; 1-channel IR.
    Mono,
    /// 1 in, 2 out; M->L, M->R.
    MonoToStereo,
    /// 2 in, 2 out; L->L, R->R, or the full 4-channel matrix.
    Stereo,
}

impl IrChannelConfig {
    pub fn n_inputs(self) -> u32 {
        if self < IrChannelConfig::Stereo {
            1
        } else {
            2
        }
    }

    pub fn n_outputs(self) -> u32 {
        if self == IrChannelConfig::Mono {
            1
        } else {
            2
        }
    }
}

/// Per-IR gain, delay and routing settings. Channel slots are indexed by
/// the impulse's position in the routing matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IrSettings {
    /// Master gain, linear.
    pub gain: f32,
    /// Global pre-delay, frames.
    pub pre_delay: u32,
    /// Per-impulse gain, linear.
    pub channel_gain: [f32; 4],
    /// Per-impulse delay, frames.
    pub channel_delay: [u32; 4],
    /// Stereo routing: pre-sum L+R to mono.
    pub sum_inputs: bool,
    /// Frames added to the reported latency for host compensation.
    pub artificial_latency: u32,
}

impl Default for IrSettings {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pre_delay: 0,
            channel_gain: [1.0; 4],
            channel_delay: [0; 4],
            sum_inputs: false,
            artificial_latency: 0,
        }
    }
}

pub struct Convolver {
    path: String,
    irc: IrChannelConfig,
    sched_policy: SchedPolicy,
    sched_priority: i32,
    settings: IrSettings,
    sample_rate: u32,

    sources: Vec<AudioSource>,
    proc: Convproc,

    n_samples: u32,
    max_size: u32,
    offset: u32,
    configured: bool,

    dry: f32,
    wet: f32,
    dry_target: f32,
    wet_target: f32,
    /// One-pole smoothing coefficient, ~20 Hz at 90%.
    a: f32,

    tdc: [TimeDomainConvolver; 4],
    dly: [DelayLine; 2],
}

impl Convolver {
    pub fn new(
        path: &str,
        sample_rate: u32,
        sched_policy: SchedPolicy,
        sched_priority: i32,
        irc: IrChannelConfig,
        settings: IrSettings,
    ) -> LoadResult<Self> {
        let sources = open_ir_channels(path, sample_rate)?;

        Ok(Self {
            path: path.to_string(),
            irc,
            sched_policy,
            sched_priority,
            settings,
            sample_rate,
            sources,
            proc: Convproc::new(),
            n_samples: 0,
            max_size: 0,
            offset: 0,
            configured: false,
            dry: 0.0,
            wet: 1.0,
            dry_target: 0.0,
            wet_target: 1.0,
            a: 2950.0 / sample_rate as f32,
            tdc: Default::default(),
            dly: Default::default(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn settings(&self) -> &IrSettings {
        &self.settings
    }

    pub fn sum_inputs(&self) -> bool {
        self.settings.sum_inputs
    }

    pub fn artificial_latency(&self) -> u32 {
        self.settings.artificial_latency
    }

    /// Engine-side latency of the buffered run paths.
    pub fn latency(&self) -> u32 {
        self.n_samples
    }

    pub fn n_inputs(&self) -> u32 {
        self.irc.n_inputs()
    }

    pub fn n_outputs(&self) -> u32 {
        self.irc.n_outputs()
    }

    pub fn ready(&self) -> bool {
        self.configured && self.proc.state() == ProcState::Proc
    }

    /// (Re)build the engine for a block size: partition the IR, seed the
    /// spectra for every routed impulse, configure the head convolvers and
    /// start the workers. `threaded` selects the 64-sample quantum with
    /// background levels; otherwise a single partition the size of the
    /// block is used.
    pub fn reconfigure(&mut self, block_size: u32, threaded: bool) -> LoadResult<()> {
        let _ = self.proc.stop_process();
        self.proc.cleanup();
        self.proc.set_options(0);
        self.configured = false;

        let n_part;
        if threaded {
            self.n_samples = 64;
            n_part = MAXPART;
        } else {
            self.n_samples = block_size.next_power_of_two();
            n_part = self.n_samples;
        }

        self.offset = 0;
        self.max_size = self.sources[0].readable_length() as u32;

        let n_in = self.n_inputs();
        let n_out = self.n_outputs();
        self.proc.configure(
            n_in,
            n_out,
            self.max_size,
            self.n_samples,
            self.n_samples,
            n_part,
            0.0,
        )?;

        // Channel mapping:
        // - Mono: always the first IR channel.
        // - MonoToStereo: mono file feeds both M->L and M->R, otherwise the
        //   first two channels are used.
        // - Stereo: 1- or 2-channel files map straight L->L, R->R with no
        //   cross terms; a 3rd channel is ignored; a 4-channel file is the
        //   full matrix (L->L, L->R, R->L, R->R).
        let mut n_imp = n_in * n_out;
        let mut n_chn = self.sources.len() as u32;
        if self.irc == IrChannelConfig::Stereo && n_chn == 3 {
            n_chn = 2;
        }
        if self.irc == IrChannelConfig::Stereo && n_chn <= 2 {
            n_imp = 2;
        }
        log::debug!(
            "convolver: n_in={} n_out={} n_imp={} n_chn={}",
            n_in,
            n_out,
            n_imp,
            n_chn
        );

        for tdc in &mut self.tdc {
            tdc.reset();
        }
        self.dly[0].reset(self.n_samples as usize);
        self.dly[1].reset(self.n_samples as usize);

        let mut seed = vec![0.0f32; SEED_CHUNK];
        for c in 0..n_imp {
            let ir_c = (c % n_chn) as usize;
            let io_o = c % n_out;
            let io_i = if n_imp == 2 && self.irc == IrChannelConfig::Stereo {
                c % n_in
            } else {
                (c / n_out) % n_in
            };

            let chan_gain = self.settings.gain * self.settings.channel_gain[c as usize];
            let chan_delay = self.settings.pre_delay + self.settings.channel_delay[c as usize];

            // A zero gain skips the impulse entirely; this lets a 4-channel
            // file run in the cheaper straight-stereo configuration.
            if chan_gain == 0.0 {
                continue;
            }
            log::debug!(
                "convolver map: IR-chn {} in {} -> out {} (gain {:.3}, delay {})",
                ir_c + 1,
                io_i + 1,
                io_o + 1,
                chan_gain,
                chan_delay
            );

            let source = &mut self.sources[ir_c];
            debug_assert_eq!(source.readable_length() as u32, self.max_size);

            // head taps for the partial-block path
            if (chan_delay as usize) < 64 {
                let mut taps = [0.0f32; 64];
                let to_read = (64 - chan_delay as usize).min(self.max_size as usize);
                let got = source.read(&mut taps[..to_read], 0, to_read, 0);
                self.tdc[(io_i * 2 + io_o) as usize].configure(&taps[..got], chan_gain, chan_delay);
            }

            let mut pos: u32 = 0;
            loop {
                let to_read = (SEED_CHUNK as u32).min(self.max_size - pos) as usize;
                let ns = source.read(&mut seed[..to_read], pos as u64, to_read, 0);
                if ns == 0 {
                    break;
                }
                if chan_gain != 1.0 {
                    for v in &mut seed[..ns] {
                        *v *= chan_gain;
                    }
                }
                self.proc.impdata_create(
                    io_i,
                    io_o,
                    1,
                    &seed[..ns],
                    (chan_delay + pos) as i32,
                    (chan_delay + pos) as i32 + ns as i32,
                )?;
                pos += ns as u32;
                if pos >= self.max_size {
                    break;
                }
            }
        }

        let period_ns = self.n_samples as f64 / self.sample_rate as f64 * 1e9;
        if let Err(e) = self
            .proc
            .start_process(self.sched_priority, self.sched_policy, period_ns)
        {
            let _ = self.proc.stop_process();
            self.proc.cleanup();
            return Err(LoadError::Engine(e));
        }

        self.configured = true;
        Ok(())
    }

    /// Set the dry/wet targets; without `interpolate` the current gains
    /// jump immediately.
    pub fn set_output_gain(&mut self, dry: f32, wet: f32, interpolate: bool) {
        self.dry_target = dry;
        self.wet_target = wet;
        if !interpolate {
            self.dry = dry;
            self.wet = wet;
        }
    }

    fn interpolate_gain(&mut self) {
        if self.dry != self.dry_target {
            self.dry += self.a * (self.dry_target - self.dry) + 1e-10;
            if (self.dry - self.dry_target).abs() < 1e-5 {
                self.dry = self.dry_target;
            }
        }
        if self.wet != self.wet_target {
            self.wet += self.a * (self.wet_target - self.wet) + 1e-10;
            if (self.wet - self.wet_target).abs() < 1e-5 {
                self.wet = self.wet_target;
            }
        }
    }

    /// Buffered mono run: always aligned to engine quanta, one quantum of
    /// buffering latency.
    pub fn run_buffered_mono(&mut self, buf: &mut [Sample], n_samples: usize) {
        debug_assert_eq!(self.proc.state(), ProcState::Proc);
        debug_assert_eq!(self.irc, IrChannelConfig::Mono);

        let mut done = 0;
        let mut remain = n_samples;
        while remain > 0 {
            let ns = remain.min((self.n_samples - self.offset) as usize);
            let off = self.offset as usize;

            self.proc.inpdata(0)[off..off + ns].copy_from_slice(&buf[done..done + ns]);

            if self.dry == self.dry_target && self.dry == 0.0 {
                self.dly[0].clear();
            } else {
                self.dly[0].run(&mut buf[done..done + ns]);
            }

            self.interpolate_gain();
            let (dry, wet) = (self.dry, self.wet);
            mix_output(
                dry,
                wet,
                &mut buf[done..done + ns],
                &self.proc.outdata(0)[off..off + ns],
            );

            self.offset += ns as u32;
            done += ns;
            remain -= ns;

            if self.offset == self.n_samples {
                self.proc.process();
                self.offset = 0;
            }
        }
    }

    /// Buffered stereo / mono-to-stereo run.
    pub fn run_buffered_stereo(&mut self, left: &mut [Sample], right: &mut [Sample], n_samples: usize) {
        debug_assert_eq!(self.proc.state(), ProcState::Proc);
        debug_assert_ne!(self.irc, IrChannelConfig::Mono);

        let mut done = 0;
        let mut remain = n_samples;
        while remain > 0 {
            let ns = remain.min((self.n_samples - self.offset) as usize);
            let off = self.offset as usize;

            self.proc.inpdata(0)[off..off + ns].copy_from_slice(&left[done..done + ns]);
            if self.irc == IrChannelConfig::Stereo {
                self.proc.inpdata(1)[off..off + ns].copy_from_slice(&right[done..done + ns]);
            }

            if self.dry == self.dry_target && self.dry == 0.0 {
                self.dly[0].clear();
                self.dly[1].clear();
            } else {
                self.dly[0].run(&mut left[done..done + ns]);
                self.dly[1].run(&mut right[done..done + ns]);
            }

            self.interpolate_gain();
            let (dry, wet) = (self.dry, self.wet);
            mix_output(
                dry,
                wet,
                &mut left[done..done + ns],
                &self.proc.outdata(0)[off..off + ns],
            );
            mix_output(
                dry,
                wet,
                &mut right[done..done + ns],
                &self.proc.outdata(1)[off..off + ns],
            );

            self.offset += ns as u32;
            done += ns;
            remain -= ns;

            if self.offset == self.n_samples {
                self.proc.process();
                self.offset = 0;
            }
        }
    }

    /// Unbuffered mono run: full quanta are processed in place; partial
    /// chunks are served from the computed tail plus the time-domain head.
    pub fn run_mono(&mut self, buf: &mut [Sample], n_samples: usize) {
        debug_assert_eq!(self.proc.state(), ProcState::Proc);
        debug_assert_eq!(self.irc, IrChannelConfig::Mono);

        let mut done = 0;
        let mut remain = n_samples;
        while remain > 0 {
            let ns = remain.min((self.n_samples - self.offset) as usize);
            let off = self.offset as usize;

            self.proc.inpdata(0)[off..off + ns].copy_from_slice(&buf[done..done + ns]);

            if self.offset as usize + ns == self.n_samples as usize {
                self.proc.process();
                self.interpolate_gain();
                let (dry, wet) = (self.dry, self.wet);
                mix_output(
                    dry,
                    wet,
                    &mut buf[done..done + ns],
                    &self.proc.outdata(0)[off..off + ns],
                );
                self.offset = 0;
            } else {
                debug_assert_eq!(remain, ns);
                self.proc.tailonly(off + ns);
                {
                    let out = self.proc.outdata_mut(0);
                    self.tdc[0].run(&mut out[off..off + ns], &buf[done..done + ns], ns);
                }
                self.interpolate_gain();
                let (dry, wet) = (self.dry, self.wet);
                mix_output(
                    dry,
                    wet,
                    &mut buf[done..done + ns],
                    &self.proc.outdata(0)[off..off + ns],
                );
                self.offset += ns as u32;
            }
            done += ns;
            remain -= ns;
        }
    }

    /// Unbuffered stereo / mono-to-stereo run. Only heads whose impulse was
    /// actually seeded contribute to partial chunks.
    pub fn run_stereo(&mut self, left: &mut [Sample], right: &mut [Sample], n_samples: usize) {
        debug_assert_eq!(self.proc.state(), ProcState::Proc);
        debug_assert_ne!(self.irc, IrChannelConfig::Mono);

        let mut done = 0;
        let mut remain = n_samples;
        while remain > 0 {
            let ns = remain.min((self.n_samples - self.offset) as usize);
            let off = self.offset as usize;

            self.proc.inpdata(0)[off..off + ns].copy_from_slice(&left[done..done + ns]);
            if self.irc == IrChannelConfig::Stereo {
                self.proc.inpdata(1)[off..off + ns].copy_from_slice(&right[done..done + ns]);
            }

            if self.offset as usize + ns == self.n_samples as usize {
                self.proc.process();
                self.interpolate_gain();
                let (dry, wet) = (self.dry, self.wet);
                mix_output(
                    dry,
                    wet,
                    &mut left[done..done + ns],
                    &self.proc.outdata(0)[off..off + ns],
                );
                mix_output(
                    dry,
                    wet,
                    &mut right[done..done + ns],
                    &self.proc.outdata(1)[off..off + ns],
                );
                self.offset = 0;
            } else {
                debug_assert_eq!(remain, ns);
                self.proc.tailonly(off + ns);
                {
                    let out_l = self.proc.outdata_mut(0);
                    self.tdc[0].run(&mut out_l[off..off + ns], &left[done..done + ns], ns);
                    self.tdc[2].run(&mut out_l[off..off + ns], &right[done..done + ns], ns);
                }
                {
                    let out_r = self.proc.outdata_mut(1);
                    self.tdc[1].run(&mut out_r[off..off + ns], &left[done..done + ns], ns);
                    self.tdc[3].run(&mut out_r[off..off + ns], &right[done..done + ns], ns);
                }
                self.interpolate_gain();
                let (dry, wet) = (self.dry, self.wet);
                mix_output(
                    dry,
                    wet,
                    &mut left[done..done + ns],
                    &self.proc.outdata(0)[off..off + ns],
                );
                mix_output(
                    dry,
                    wet,
                    &mut right[done..done + ns],
                    &self.proc.outdata(1)[off..off + ns],
                );
                self.offset += ns as u32;
            }
            done += ns;
            remain -= ns;
        }
    }
}

/// `dst = dry * dst + wet * src`, with a straight copy on the common
/// wet-only case. `dst` carries the delayed dry signal on entry.
fn mix_output(dry: f32, wet: f32, dst: &mut [Sample], src: &[Sample]) {
    if dry == 0.0 && wet == 1.0 {
        dst.copy_from_slice(src);
    } else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d = dry * *d + wet * *s;
        }
    }
}
