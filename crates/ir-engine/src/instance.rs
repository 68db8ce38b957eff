//! Host boundary and hot-swap
//!
//! One plugin-style instance owns two convolver slots: `online` handles the
//! realtime stream, `offline` is built on the host's worker thread. A load
//! request constructs the offline convolver (or parks the path in a
//! single-slot queue when a build is already in flight); when the build
//! succeeds, the host delivers `work_response` between audio blocks, which
//! swaps the slots and schedules a `Free` command to drop the previous
//! engine and drain the queue.
//!
//! The swap is never concurrent with `run`: `work` runs on the worker
//! thread under the state lock, `work_response` and `run` on the audio
//! side, sequenced by the host.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ir_core::{db_to_coeff, Sample, MAX_BLOCK, MIN_BLOCK};
use ir_dsp::SchedPolicy;

use crate::convolver::{Convolver, IrChannelConfig, IrSettings};
use crate::state::PersistedState;

/// Command executed on the host's worker thread.
#[derive(Debug, Clone)]
pub enum WorkRequest {
    /// Build a convolver for `path` into the offline slot.
    Load {
        path: String,
        settings: IrSettings,
        /// User change (notify the host on swap) as opposed to a state
        /// restore (swap silently). Travels with the request through the
        /// queue so concurrent loads cannot mix up each other's intent.
        user_initiated: bool,
    },
    /// Drop the previous engine, then start any queued load.
    Free,
}

/// Result of a worker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A convolver was built; deliver `work_response` between audio blocks.
    NeedsResponse,
    /// A build is in flight; the path was queued.
    Queued,
    /// The load failed; the online engine is untouched.
    Failed,
    /// Nothing further to do.
    Done,
}

/// Result of `work_response`.
#[derive(Debug)]
pub struct SwapOutcome {
    /// The online engine was replaced.
    pub swapped: bool,
    /// The host should emit a state-changed notification (user-initiated
    /// loads only, not state restore).
    pub state_changed: bool,
    /// Command to schedule back onto the worker.
    pub follow_up: Option<WorkRequest>,
}

/// A convolver built on the worker, waiting to be swapped in, together
/// with the notification intent of the request that produced it.
struct OfflineBuild {
    convolver: Box<Convolver>,
    user_initiated: bool,
}

struct OfflineSlot {
    offline: Option<OfflineBuild>,
    queued: Option<(String, IrSettings, bool)>,
}

/// State shared with the host worker thread.
pub struct InstanceShared {
    sample_rate: u32,
    chn_cfg: IrChannelConfig,
    rt_policy: SchedPolicy,
    rt_priority: i32,
    block_size: AtomicU32,
    slot: Mutex<OfflineSlot>,
}

impl InstanceShared {
    /// Execute a worker command. Runs on the host worker thread, never on
    /// the audio thread.
    pub fn work(&self, req: WorkRequest) -> WorkOutcome {
        match req {
            WorkRequest::Load {
                path,
                settings,
                user_initiated,
            } => self.load_ir(path, settings, user_initiated),
            WorkRequest::Free => {
                let queued = {
                    let mut slot = self.slot.lock();
                    slot.offline = None;
                    slot.queued.take()
                };
                match queued {
                    Some((path, settings, user_initiated)) => {
                        log::info!("processing queued IR load: {}", path);
                        self.load_ir(path, settings, user_initiated)
                    }
                    None => WorkOutcome::Done,
                }
            }
        }
    }

    fn load_ir(&self, path: String, settings: IrSettings, user_initiated: bool) -> WorkOutcome {
        let mut slot = self.slot.lock();
        if slot.offline.is_some() {
            log::info!("queueing IR load for later: {}", path);
            slot.queued = Some((path, settings, user_initiated));
            return WorkOutcome::Queued;
        }

        log::info!("opening IR: {}", path);
        let built = Convolver::new(
            &path,
            self.sample_rate,
            self.rt_policy,
            self.rt_priority,
            self.chn_cfg,
            settings,
        )
        .and_then(|mut c| {
            c.reconfigure(self.block_size.load(Ordering::Relaxed), true)?;
            Ok(c)
        });

        match built {
            Ok(c) if c.ready() => {
                slot.offline = Some(OfflineBuild {
                    convolver: Box::new(c),
                    user_initiated,
                });
                WorkOutcome::NeedsResponse
            }
            Ok(_) => {
                log::warn!("IR load: engine did not start: {}", path);
                WorkOutcome::Failed
            }
            Err(e) => {
                log::warn!("IR load failed: {}: {}", path, e);
                WorkOutcome::Failed
            }
        }
    }
}

/// A convolver instance as seen by an audio host: realtime `run`, worker
/// commands, state save/restore, latency reporting.
pub struct ConvoInstance {
    shared: Arc<InstanceShared>,
    online: Option<Box<Convolver>>,

    chn_in: u32,
    chn_out: u32,
    buffered: bool,

    db_dry: f32,
    db_wet: f32,
}

impl ConvoInstance {
    pub fn new(
        chn_cfg: IrChannelConfig,
        sample_rate: u32,
        block_size: u32,
        rt_policy: SchedPolicy,
        rt_priority: i32,
    ) -> Self {
        let block_size = if block_size > MAX_BLOCK as u32 {
            log::warn!("block size {} out of range, clamping to {}", block_size, MAX_BLOCK);
            MAX_BLOCK as u32
        } else if block_size < 64 {
            log::info!("block size {} too small, using 64", block_size);
            64
        } else {
            block_size
        };

        Self {
            shared: Arc::new(InstanceShared {
                sample_rate,
                chn_cfg,
                rt_policy,
                rt_priority,
                block_size: AtomicU32::new(block_size),
                slot: Mutex::new(OfflineSlot {
                    offline: None,
                    queued: None,
                }),
            }),
            online: None,
            chn_in: chn_cfg.n_inputs(),
            chn_out: chn_cfg.n_outputs(),
            buffered: true,
            db_dry: -60.0,
            db_wet: 0.0,
        }
    }

    /// Handle for the host worker thread.
    pub fn shared(&self) -> Arc<InstanceShared> {
        self.shared.clone()
    }

    pub fn has_ir(&self) -> bool {
        self.online.is_some()
    }

    pub fn ir_path(&self) -> Option<&str> {
        self.online.as_ref().map(|c| c.path())
    }

    /// Build a user-initiated load command for the worker. The swap that
    /// eventually applies it reports a state change to the host.
    pub fn request_load(&self, path: &str, settings: IrSettings) -> WorkRequest {
        WorkRequest::Load {
            path: path.to_string(),
            settings,
            user_initiated: true,
        }
    }

    /// Select buffered (quantum-aligned, `min_part` extra latency) or
    /// unbuffered (partial-block) processing.
    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    /// Dry/wet mix in dB; the engine smooths towards the new targets.
    pub fn set_mix_db(&mut self, db_dry: f32, db_wet: f32) {
        if self.db_dry == db_dry && self.db_wet == db_wet {
            return;
        }
        self.db_dry = db_dry;
        self.db_wet = db_wet;
        if let Some(online) = &mut self.online {
            online.set_output_gain(db_to_coeff(db_dry), db_to_coeff(db_wet), true);
        }
    }

    /// Nominal block size changed; rebuilds the online engine.
    pub fn set_block_size(&mut self, block_size: u32) {
        self.shared
            .block_size
            .store(block_size.clamp(64, MAX_BLOCK as u32), Ordering::Relaxed);
        self.activate();
    }

    /// (Re)start the online engine, e.g. after the host re-activates.
    pub fn activate(&mut self) {
        let block_size = self.shared.block_size.load(Ordering::Relaxed);
        if let Some(online) = &mut self.online {
            if let Err(e) = online.reconfigure(block_size, true) {
                log::warn!("reconfigure failed: {}", e);
            }
        }
    }

    /// Deliver the worker's response between audio blocks: swap the engine
    /// slots and hand back the `Free` command for the worker. Whether the
    /// swap counts as a state change comes from the request that built the
    /// incoming engine, so queued loads and restores cannot mix up each
    /// other's notifications.
    pub fn work_response(&mut self) -> SwapOutcome {
        let mut slot = self.shared.slot.lock();
        let build = match slot.offline.take() {
            Some(b) => b,
            None => {
                // A failed load may still leave a queued path behind; a
                // Free command drains the queue.
                let follow_up = slot.queued.is_some().then_some(WorkRequest::Free);
                return SwapOutcome {
                    swapped: false,
                    state_changed: false,
                    follow_up,
                };
            }
        };

        let old = std::mem::replace(&mut self.online, Some(build.convolver));
        // park the previous engine for the Free command; its flag is dead
        slot.offline = old.map(|convolver| OfflineBuild {
            convolver,
            user_initiated: false,
        });
        drop(slot);

        if let Some(online) = &mut self.online {
            online.set_output_gain(db_to_coeff(self.db_dry), db_to_coeff(self.db_wet), false);
        }

        SwapOutcome {
            swapped: true,
            state_changed: build.user_initiated,
            follow_up: Some(WorkRequest::Free),
        }
    }

    /// Process one block. Inputs are copied to the outputs and convolved in
    /// place; with no online engine the outputs are zeroed. Returns the
    /// latency to report to the host.
    pub fn run(
        &mut self,
        inputs: &[&[Sample]],
        outputs: &mut [&mut [Sample]],
        n_samples: usize,
    ) -> u32 {
        debug_assert!((MIN_BLOCK..=MAX_BLOCK).contains(&n_samples));
        debug_assert_eq!(inputs.len(), self.chn_in as usize);
        debug_assert_eq!(outputs.len(), self.chn_out as usize);

        let online = match &mut self.online {
            Some(c) => c,
            None => {
                for out in outputs.iter_mut() {
                    out[..n_samples].fill(0.0);
                }
                return 0;
            }
        };
        debug_assert!(online.ready());

        let buffered = self.buffered;
        let latency =
            online.artificial_latency() + if buffered { online.latency() } else { 0 };

        outputs[0][..n_samples].copy_from_slice(&inputs[0][..n_samples]);

        if self.chn_in == 2 {
            if online.sum_inputs() {
                // fake stereo: both engine inputs carry the mono sum
                for (o, i) in outputs[0][..n_samples].iter_mut().zip(&inputs[1][..n_samples]) {
                    *o = 0.5 * (*o + *i);
                }
                let (first, rest) = outputs.split_at_mut(1);
                rest[0][..n_samples].copy_from_slice(&first[0][..n_samples]);
            } else {
                outputs[1][..n_samples].copy_from_slice(&inputs[1][..n_samples]);
            }
            let (first, rest) = outputs.split_at_mut(1);
            if buffered {
                online.run_buffered_stereo(
                    &mut first[0][..n_samples],
                    &mut rest[0][..n_samples],
                    n_samples,
                );
            } else {
                online.run_stereo(
                    &mut first[0][..n_samples],
                    &mut rest[0][..n_samples],
                    n_samples,
                );
            }
        } else if self.chn_out == 2 {
            // mono to stereo: the dry signal on both outputs is the input
            outputs[1][..n_samples].copy_from_slice(&inputs[0][..n_samples]);
            let (first, rest) = outputs.split_at_mut(1);
            if buffered {
                online.run_buffered_stereo(
                    &mut first[0][..n_samples],
                    &mut rest[0][..n_samples],
                    n_samples,
                );
            } else {
                online.run_stereo(
                    &mut first[0][..n_samples],
                    &mut rest[0][..n_samples],
                    n_samples,
                );
            }
        } else if buffered {
            online.run_buffered_mono(&mut outputs[0][..n_samples], n_samples);
        } else {
            online.run_mono(&mut outputs[0][..n_samples], n_samples);
        }

        latency
    }

    /// Current persisted state, if an IR is loaded.
    pub fn save(&self) -> Option<PersistedState> {
        self.online
            .as_ref()
            .map(|c| PersistedState::from_settings(c.path(), c.settings()))
    }

    /// Schedule a state-restore load. The returned command must be run on
    /// the worker thread; the restore does not count as a user change, so
    /// the swap applying it emits no state-changed notification.
    pub fn restore(&self, state: &PersistedState) -> WorkRequest {
        WorkRequest::Load {
            path: state.ir.clone(),
            settings: state.to_settings(),
            user_initiated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ConvoInstance {
        ConvoInstance::new(IrChannelConfig::Mono, 44_100, 64, SchedPolicy::Other, 0)
    }

    #[test]
    fn test_no_ir_outputs_silence_and_zero_latency() {
        let mut inst = instance();
        let input = [0.5f32; 64];
        let mut out = [1.0f32; 64];
        let latency = inst.run(&[&input], &mut [&mut out], 64);
        assert_eq!(latency, 0);
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_load_and_swap() {
        let mut inst = instance();
        let shared = inst.shared();

        let req = inst.request_load("mem:default", IrSettings::default());
        assert_eq!(shared.work(req), WorkOutcome::NeedsResponse);

        let swap = inst.work_response();
        assert!(swap.swapped);
        assert!(swap.state_changed);
        assert!(matches!(swap.follow_up, Some(WorkRequest::Free)));
        assert!(inst.has_ir());
        assert_eq!(inst.ir_path(), Some("mem:default"));

        assert_eq!(shared.work(WorkRequest::Free), WorkOutcome::Done);
    }

    #[test]
    fn test_second_load_queues_until_free() {
        let inst = instance();
        let shared = inst.shared();

        let first = inst.request_load("mem:default", IrSettings::default());
        assert_eq!(shared.work(first), WorkOutcome::NeedsResponse);

        // offline slot is occupied until the response frees it
        let second = inst.request_load("mem:other", IrSettings::default());
        assert_eq!(shared.work(second), WorkOutcome::Queued);

        // Free drops the pending build and starts the queued one
        assert_eq!(shared.work(WorkRequest::Free), WorkOutcome::NeedsResponse);
    }

    #[test]
    fn test_failed_load_leaves_online_untouched() {
        let mut inst = instance();
        let shared = inst.shared();

        let ok = inst.request_load("mem:default", IrSettings::default());
        assert_eq!(shared.work(ok), WorkOutcome::NeedsResponse);
        inst.work_response();
        shared.work(WorkRequest::Free);

        let bad = inst.request_load("/nonexistent/ir.wav", IrSettings::default());
        assert_eq!(shared.work(bad), WorkOutcome::Failed);

        let swap = inst.work_response();
        assert!(!swap.swapped);
        assert_eq!(inst.ir_path(), Some("mem:default"));
    }

    #[test]
    fn test_restore_suppresses_state_changed() {
        let mut inst = instance();
        let shared = inst.shared();

        let state = PersistedState {
            ir: "mem:default".into(),
            ..Default::default()
        };
        let req = inst.restore(&state);
        assert_eq!(shared.work(req), WorkOutcome::NeedsResponse);

        let swap = inst.work_response();
        assert!(swap.swapped);
        assert!(!swap.state_changed);

        // a later user load notifies again
        shared.work(WorkRequest::Free);
        let req = inst.request_load("mem:default", IrSettings::default());
        assert_eq!(shared.work(req), WorkOutcome::NeedsResponse);
        let swap = inst.work_response();
        assert!(swap.state_changed);
    }

    #[test]
    fn test_save_reflects_online_settings() {
        let mut inst = instance();
        let shared = inst.shared();

        assert!(inst.save().is_none());

        let mut settings = IrSettings::default();
        settings.gain = 0.5;
        let req = inst.request_load("mem:default", settings);
        shared.work(req);
        inst.work_response();

        let state = inst.save().unwrap();
        assert_eq!(state.ir, "mem:default");
        assert_eq!(state.gain, 0.5);
    }
}
