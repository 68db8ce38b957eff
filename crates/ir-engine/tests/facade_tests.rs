//! Facade integration tests
//!
//! End-to-end runs of the convolver facade against reference convolutions,
//! over WAV fixtures written with hound.

use std::path::{Path, PathBuf};

use ir_dsp::SchedPolicy;
use ir_engine::{ConvoInstance, Convolver, IrChannelConfig, IrSettings};

const RATE: u32 = 44_100;

fn noise(len: usize, seed: u64) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    (0..len)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            (seed, i).hash(&mut hasher);
            (hasher.finish() as f64 / u64::MAX as f64) as f32 - 0.5
        })
        .collect()
}

fn direct_convolve(input: &[f32], ir: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0f64; input.len()];
    for (i, &x) in input.iter().enumerate() {
        let reach = ir.len().min(out.len() - i);
        for (j, &h) in ir[..reach].iter().enumerate() {
            out[i + j] += x as f64 * h as f64;
        }
    }
    out.into_iter().map(|v| v as f32).collect()
}

/// Write a float WAV whose channels are the given tap vectors.
fn write_ir(dir: &Path, name: &str, channels: &[Vec<f32>]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: channels.len() as u16,
        sample_rate: RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for s in ir_core::interleave(channels) {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
    path
}

fn identity_ir(dir: &Path) -> PathBuf {
    let mut taps = vec![0.0f32; 16];
    taps[0] = 1.0;
    write_ir(dir, "identity.wav", &[taps])
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "sample {} differs: {} vs {}", i, x, y);
    }
}

#[test]
fn buffered_identity_is_input_delayed_by_min_part() {
    let dir = tempfile::tempdir().unwrap();
    let path = identity_ir(dir.path());

    let mut c = Convolver::new(
        path.to_str().unwrap(),
        RATE,
        SchedPolicy::Other,
        0,
        IrChannelConfig::Mono,
        IrSettings::default(),
    )
    .unwrap();
    c.reconfigure(64, true).unwrap();
    assert!(c.ready());
    assert_eq!(c.latency(), 64);

    let input = noise(1024, 1);
    let mut stream = input.clone();
    for block in stream.chunks_mut(64) {
        c.run_buffered_mono(block, 64);
    }

    for i in 0..stream.len() {
        let expect = if i < 64 { 0.0 } else { input[i - 64] };
        assert!((stream[i] - expect).abs() < 1e-5, "sample {}", i);
    }
}

#[test]
fn unbuffered_identity_has_zero_latency() {
    let dir = tempfile::tempdir().unwrap();
    let path = identity_ir(dir.path());

    let mut c = Convolver::new(
        path.to_str().unwrap(),
        RATE,
        SchedPolicy::Other,
        0,
        IrChannelConfig::Mono,
        IrSettings::default(),
    )
    .unwrap();
    c.reconfigure(64, true).unwrap();

    let input = noise(960, 2);
    let mut stream = input.clone();
    // 48-sample host blocks exercise the tail-only + head path
    for block in stream.chunks_mut(48) {
        let n = block.len();
        c.run_mono(block, n);
    }
    assert_close(&stream, &input, 1e-5);
}

#[test]
fn buffered_matches_reference_convolution() {
    let dir = tempfile::tempdir().unwrap();
    let taps: Vec<f32> = noise(300, 3).iter().map(|v| v * 0.2).collect();
    let path = write_ir(dir.path(), "rand.wav", &[taps.clone()]);

    let mut c = Convolver::new(
        path.to_str().unwrap(),
        RATE,
        SchedPolicy::Other,
        0,
        IrChannelConfig::Mono,
        IrSettings::default(),
    )
    .unwrap();
    c.reconfigure(64, true).unwrap();

    let input = noise(2048, 4);
    let mut stream = input.clone();
    for block in stream.chunks_mut(64) {
        c.run_buffered_mono(block, 64);
    }

    let reference = direct_convolve(&input, &taps);
    for i in 64..stream.len() {
        assert!(
            (stream[i] - reference[i - 64]).abs() < 2e-3,
            "sample {} differs",
            i
        );
    }
}

#[test]
fn mono_to_stereo_duplicates_response() {
    let dir = tempfile::tempdir().unwrap();
    let taps: Vec<f32> = noise(100, 5).iter().map(|v| v * 0.2).collect();
    let path = write_ir(dir.path(), "m2s.wav", &[taps.clone()]);

    let mut inst = ConvoInstance::new(
        IrChannelConfig::MonoToStereo,
        RATE,
        512,
        SchedPolicy::Other,
        0,
    );
    let shared = inst.shared();
    shared.work(inst.request_load(path.to_str().unwrap(), IrSettings::default()));
    assert!(inst.work_response().swapped);

    let input = noise(2048, 6);
    let mut out_l = vec![0.0f32; 2048];
    let mut out_r = vec![0.0f32; 2048];
    let mut latency = 0;
    for start in (0..2048).step_by(512) {
        let inp = &input[start..start + 512];
        let (l, r) = (
            &mut out_l[start..start + 512],
            &mut out_r[start..start + 512],
        );
        latency = inst.run(&[inp], &mut [l, r], 512);
    }
    assert_eq!(latency, 64);

    assert_eq!(out_l, out_r);
    let reference = direct_convolve(&input, &taps);
    for i in 64..2048 {
        assert!((out_l[i] - reference[i - 64]).abs() < 2e-3, "sample {}", i);
    }
}

#[test]
fn stereo_four_channel_matrix() {
    let dir = tempfile::tempdir().unwrap();
    let h_ll: Vec<f32> = noise(48, 7).iter().map(|v| v * 0.2).collect();
    let h_lr: Vec<f32> = noise(48, 8).iter().map(|v| v * 0.2).collect();
    let h_rl: Vec<f32> = noise(48, 9).iter().map(|v| v * 0.2).collect();
    let h_rr: Vec<f32> = noise(48, 10).iter().map(|v| v * 0.2).collect();
    let path = write_ir(
        dir.path(),
        "matrix.wav",
        &[h_ll.clone(), h_lr.clone(), h_rl.clone(), h_rr.clone()],
    );

    let mut inst = ConvoInstance::new(IrChannelConfig::Stereo, RATE, 64, SchedPolicy::Other, 0);
    let shared = inst.shared();
    shared.work(inst.request_load(path.to_str().unwrap(), IrSettings::default()));
    assert!(inst.work_response().swapped);

    let in_l = noise(1024, 11);
    let in_r = noise(1024, 12);
    let mut out_l = vec![0.0f32; 1024];
    let mut out_r = vec![0.0f32; 1024];
    for start in (0..1024).step_by(64) {
        let (l, r) = (
            &mut out_l[start..start + 64],
            &mut out_r[start..start + 64],
        );
        inst.run(
            &[&in_l[start..start + 64], &in_r[start..start + 64]],
            &mut [l, r],
            64,
        );
    }

    let mut expect_l = direct_convolve(&in_l, &h_ll);
    for (e, v) in expect_l.iter_mut().zip(direct_convolve(&in_r, &h_rl)) {
        *e += v;
    }
    let mut expect_r = direct_convolve(&in_l, &h_lr);
    for (e, v) in expect_r.iter_mut().zip(direct_convolve(&in_r, &h_rr)) {
        *e += v;
    }

    for i in 64..1024 {
        assert!((out_l[i] - expect_l[i - 64]).abs() < 2e-3, "L sample {}", i);
        assert!((out_r[i] - expect_r[i - 64]).abs() < 2e-3, "R sample {}", i);
    }
}

#[test]
fn stereo_three_channel_ir_equals_two_channel_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let h_l: Vec<f32> = noise(64, 13).iter().map(|v| v * 0.2).collect();
    let h_r: Vec<f32> = noise(64, 14).iter().map(|v| v * 0.2).collect();
    let h_x: Vec<f32> = noise(64, 15).iter().map(|v| v * 0.2).collect();

    let path3 = write_ir(
        dir.path(),
        "three.wav",
        &[h_l.clone(), h_r.clone(), h_x],
    );
    let path2 = write_ir(dir.path(), "two.wav", &[h_l, h_r]);

    let run = |path: &Path| {
        let mut inst =
            ConvoInstance::new(IrChannelConfig::Stereo, RATE, 64, SchedPolicy::Other, 0);
        let shared = inst.shared();
        shared.work(inst.request_load(path.to_str().unwrap(), IrSettings::default()));
        assert!(inst.work_response().swapped);

        let in_l = noise(512, 16);
        let in_r = noise(512, 17);
        let mut out_l = vec![0.0f32; 512];
        let mut out_r = vec![0.0f32; 512];
        for start in (0..512).step_by(64) {
            let (l, r) = (
                &mut out_l[start..start + 64],
                &mut out_r[start..start + 64],
            );
            inst.run(
                &[&in_l[start..start + 64], &in_r[start..start + 64]],
                &mut [l, r],
                64,
            );
        }
        (out_l, out_r)
    };

    let (l3, r3) = run(&path3);
    let (l2, r2) = run(&path2);
    assert_close(&l3, &l2, 1e-7);
    assert_close(&r3, &r2, 1e-7);
}

#[test]
fn sum_inputs_collapses_to_mono() {
    let dir = tempfile::tempdir().unwrap();
    let taps: Vec<f32> = noise(32, 18).iter().map(|v| v * 0.2).collect();
    let path = write_ir(dir.path(), "sum.wav", &[taps.clone(), taps]);

    let mut settings = IrSettings::default();
    settings.sum_inputs = true;

    let mut inst = ConvoInstance::new(IrChannelConfig::Stereo, RATE, 64, SchedPolicy::Other, 0);
    let shared = inst.shared();
    shared.work(inst.request_load(path.to_str().unwrap(), settings));
    assert!(inst.work_response().swapped);

    let in_l = noise(512, 19);
    let in_r = noise(512, 20);
    let mut out_l = vec![0.0f32; 512];
    let mut out_r = vec![0.0f32; 512];
    for start in (0..512).step_by(64) {
        let (l, r) = (
            &mut out_l[start..start + 64],
            &mut out_r[start..start + 64],
        );
        inst.run(
            &[&in_l[start..start + 64], &in_r[start..start + 64]],
            &mut [l, r],
            64,
        );
    }
    assert_eq!(out_l, out_r);
}

#[test]
fn channel_gain_scales_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = identity_ir(dir.path());

    let mut settings = IrSettings::default();
    settings.gain = 0.5;
    settings.channel_gain[0] = 0.5;

    let mut c = Convolver::new(
        path.to_str().unwrap(),
        RATE,
        SchedPolicy::Other,
        0,
        IrChannelConfig::Mono,
        settings,
    )
    .unwrap();
    c.reconfigure(64, true).unwrap();

    let input = noise(256, 21);
    let mut stream = input.clone();
    for block in stream.chunks_mut(64) {
        c.run_buffered_mono(block, 64);
    }
    for i in 64..256 {
        assert!((stream[i] - 0.25 * input[i - 64]).abs() < 1e-5);
    }
}

#[test]
fn pre_delay_shifts_response() {
    let dir = tempfile::tempdir().unwrap();
    let path = identity_ir(dir.path());

    let mut settings = IrSettings::default();
    settings.pre_delay = 32;

    let mut c = Convolver::new(
        path.to_str().unwrap(),
        RATE,
        SchedPolicy::Other,
        0,
        IrChannelConfig::Mono,
        settings,
    )
    .unwrap();
    c.reconfigure(64, true).unwrap();

    let input = noise(512, 22);
    let mut stream = input.clone();
    for block in stream.chunks_mut(64) {
        c.run_buffered_mono(block, 64);
    }
    // identity shifted by the pre-delay plus the buffering quantum
    for i in 96..512 {
        assert!((stream[i] - input[i - 96]).abs() < 1e-5, "sample {}", i);
    }
}
