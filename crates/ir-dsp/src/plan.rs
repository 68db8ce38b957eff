//! Partition planner
//!
//! Splits an impulse response into levels of exponentially growing partition
//! size. Small partitions keep the head of the IR at low latency; larger
//! partitions amortize the FFT cost of the tail. The split is driven by a
//! cost model comparing the per-level FFT cost against the complex
//! multiply-accumulate cost of keeping more partitions at the current size.

/// Relative cost of one FFT, per channel.
const FFT_COST: f32 = 5.0;

/// Relative cost of one spectrum multiply-accumulate, per (input, output)
/// pair.
const MAC_COST: f32 = 1.0;

/// Planner inputs. All sizes are in frames; `quantum`, `minpart` and
/// `maxpart` must be powers of two (validated by the engine).
#[derive(Debug, Clone, Copy)]
pub struct PlanParams {
    pub n_inp: u32,
    pub n_out: u32,
    pub max_ir_len: u32,
    pub quantum: u32,
    pub minpart: u32,
    pub maxpart: u32,
    /// Fraction of (input, output) pairs that carry an IR, in (0, 1].
    /// Zero or negative selects the default `1 / min(n_inp, n_out)`.
    pub density: f32,
}

/// One planned convolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    /// Scheduling priority offset, more negative for larger partitions.
    pub prio: i32,
    /// First IR frame covered by this level.
    pub offs: u32,
    /// Number of partitions.
    pub npar: u32,
    /// Partition size in frames.
    pub size: u32,
}

/// A complete partition plan.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub levels: Vec<LevelPlan>,
    /// Largest partition size actually used; can be smaller than the
    /// requested maximum.
    pub maxpart: u32,
}

impl PartitionPlan {
    pub fn compute(p: &PlanParams) -> Self {
        let mut density = p.density;
        if density <= 0.0 {
            density = 1.0 / p.n_inp.min(p.n_out) as f32;
        }
        if density > 1.0 {
            density = 1.0;
        }

        let cfft = FFT_COST * (p.n_inp + p.n_out) as f32;
        let cmac = MAC_COST * (p.n_inp * p.n_out) as f32 * density;

        // Fine doubling when FFTs dominate; otherwise allow quadrupling,
        // with the first stride picked so the size walk can land on maxpart.
        let step = if cfft < 4.0 * cmac { 1u32 } else { 2 };
        let mut s = if step == 2 {
            let r = p.maxpart / p.minpart;
            if r & 0xAAAA != 0 {
                1
            } else {
                2
            }
        } else {
            1
        };
        let mut nmin = if s == 1 { 2 } else { 6 };
        if p.minpart == p.quantum {
            nmin += 1;
        }

        let mut prio = 0i32;
        let mut size = p.quantum;
        while size < p.minpart {
            prio -= 1;
            size <<= 1;
        }

        let mut levels = Vec::new();
        let mut offs = 0u32;
        while offs < p.max_ir_len {
            let mut npar = (p.max_ir_len - offs).div_ceil(size);
            if size < p.maxpart && npar > nmin {
                // Promote the remainder to the next size when that is
                // cheaper than keeping npar partitions at this size.
                let r = 1u32 << s;
                let d = npar - nmin;
                let d = d - d.div_ceil(r);
                if cfft < d as f32 * cmac {
                    npar = nmin;
                }
            }
            levels.push(LevelPlan {
                prio,
                offs,
                npar,
                size,
            });
            offs += size * npar;
            if offs < p.max_ir_len {
                prio -= s as i32;
                size <<= s;
                s = step;
                nmin = if s == 1 { 2 } else { 6 };
            }
        }

        PartitionPlan {
            levels,
            maxpart: size,
        }
    }

    /// Total IR frames covered, `Σ size·npar`.
    pub fn covered(&self) -> u64 {
        self.levels
            .iter()
            .map(|l| l.size as u64 * l.npar as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_ir_len: u32, quantum: u32, minpart: u32, maxpart: u32) -> PlanParams {
        PlanParams {
            n_inp: 1,
            n_out: 1,
            max_ir_len,
            quantum,
            minpart,
            maxpart,
            density: 0.0,
        }
    }

    #[test]
    fn test_plan_covers_ir() {
        for len in [1u32, 63, 64, 65, 4096, 100_000, 1 << 20] {
            let plan = PartitionPlan::compute(&params(len, 64, 64, 8192));
            assert!(
                plan.covered() >= len as u64,
                "len {} covered {}",
                len,
                plan.covered()
            );
        }
    }

    #[test]
    fn test_sizes_non_decreasing_and_bounded() {
        let plan = PartitionPlan::compute(&params(1 << 22, 64, 64, 8192));
        let mut prev = 0;
        for l in &plan.levels {
            assert!(l.size >= prev);
            assert!(l.size <= 8192);
            prev = l.size;
        }
        assert_eq!(plan.maxpart, plan.levels.last().unwrap().size);
    }

    #[test]
    fn test_offsets_are_cumulative() {
        let plan = PartitionPlan::compute(&params(1 << 20, 64, 64, 8192));
        let mut offs = 0;
        for l in &plan.levels {
            assert_eq!(l.offs, offs);
            offs += l.size * l.npar;
        }
    }

    #[test]
    fn test_priority_decreases_with_size() {
        let plan = PartitionPlan::compute(&params(1 << 20, 64, 64, 8192));
        for pair in plan.levels.windows(2) {
            assert!(pair[1].prio <= pair[0].prio);
        }
        assert_eq!(plan.levels[0].prio, 0);
    }

    #[test]
    fn test_min_part_above_quantum_lowers_start_priority() {
        let plan = PartitionPlan::compute(&params(1 << 16, 64, 256, 8192));
        // Two doublings from quantum 64 to minpart 256.
        assert_eq!(plan.levels[0].prio, -2);
        assert_eq!(plan.levels[0].size, 256);
    }

    #[test]
    fn test_single_level_when_min_equals_max() {
        let plan = PartitionPlan::compute(&params(1000, 64, 512, 512));
        assert_eq!(plan.levels.len(), 1);
        assert_eq!(plan.levels[0].size, 512);
        assert_eq!(plan.levels[0].npar, 2);
        assert_eq!(plan.maxpart, 512);
    }

    #[test]
    fn test_effective_maxpart_can_undershoot_request() {
        let plan = PartitionPlan::compute(&params(256, 64, 64, 8192));
        assert!(plan.maxpart < 8192);
    }
}
