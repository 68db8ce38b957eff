//! Persisted state
//!
//! Property-addressed key/value state of one convolver instance. Missing
//! keys fall back to defaults, and serialization is byte-stable: saving,
//! restoring and saving again yields identical bytes.

use serde::{Deserialize, Serialize};

use crate::convolver::IrSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// IR file to load.
    pub ir: String,
    /// Master linear gain.
    pub gain: f32,
    /// Global pre-delay, frames.
    pub predelay: i32,
    /// Frames added to the reported latency.
    pub artificial_latency: i32,
    /// Stereo routing: pre-sum L+R to mono.
    pub sum_inputs: bool,
    /// Per-impulse gain.
    pub channel_gain: [f32; 4],
    /// Per-impulse delay, frames.
    pub channel_predelay: [i32; 4],
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            ir: String::new(),
            gain: 1.0,
            predelay: 0,
            artificial_latency: 0,
            sum_inputs: false,
            channel_gain: [1.0; 4],
            channel_predelay: [0; 4],
        }
    }
}

impl PersistedState {
    pub fn from_settings(ir: &str, s: &IrSettings) -> Self {
        Self {
            ir: ir.to_string(),
            gain: s.gain,
            predelay: s.pre_delay as i32,
            artificial_latency: s.artificial_latency as i32,
            sum_inputs: s.sum_inputs,
            channel_gain: s.channel_gain,
            channel_predelay: [
                s.channel_delay[0] as i32,
                s.channel_delay[1] as i32,
                s.channel_delay[2] as i32,
                s.channel_delay[3] as i32,
            ],
        }
    }

    pub fn to_settings(&self) -> IrSettings {
        IrSettings {
            gain: self.gain,
            pre_delay: self.predelay.max(0) as u32,
            channel_gain: self.channel_gain,
            channel_delay: [
                self.channel_predelay[0].max(0) as u32,
                self.channel_predelay[1].max(0) as u32,
                self.channel_predelay[2].max(0) as u32,
                self.channel_predelay[3].max(0) as u32,
            ],
            sum_inputs: self.sum_inputs,
            artificial_latency: self.artificial_latency.max(0) as u32,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_restore_save_is_byte_identical() {
        let state = PersistedState {
            ir: "/tmp/hall.wav".into(),
            gain: 0.75,
            predelay: 480,
            artificial_latency: 64,
            sum_inputs: true,
            channel_gain: [1.0, 0.0, 0.0, 1.0],
            channel_predelay: [0, 3, 5, 7],
        };
        let bytes = state.to_bytes().unwrap();
        let restored = PersistedState::from_bytes(&bytes).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let state = PersistedState::from_bytes(br#"{"ir":"/tmp/x.wav"}"#).unwrap();
        assert_eq!(state.ir, "/tmp/x.wav");
        assert_eq!(state.gain, 1.0);
        assert_eq!(state.predelay, 0);
        assert!(!state.sum_inputs);
        assert_eq!(state.channel_gain, [1.0; 4]);
        assert_eq!(state.channel_predelay, [0; 4]);
    }

    #[test]
    fn test_settings_roundtrip() {
        let mut s = IrSettings::default();
        s.gain = 0.5;
        s.pre_delay = 100;
        s.channel_gain = [1.0, 0.5, 0.25, 0.0];
        s.channel_delay = [1, 2, 3, 4];
        s.sum_inputs = true;
        s.artificial_latency = 32;

        let state = PersistedState::from_settings("mem:default", &s);
        assert_eq!(state.to_settings(), s);
    }
}
