//! Cycle-accurate pipeline model
//!
//! The dispatcher consults the model once per retired instruction when
//! cycle-accurate mode is on; otherwise the cycle counter is never touched.
//! The trait is the contract; richer micro-architectural models plug in
//! from outside the core.

use crate::isa::dcode::Dcode;
use crate::isa::OpKind;

pub trait PipelineModel: Send {
    /// Cycles consumed by retiring `dcode`.
    fn retire(&mut self, dcode: &Dcode) -> u64;
}

/// A single-issue scalar pipeline with fixed per-class latencies.
pub struct ScalarPipeline {
    pub memory_latency: u64,
    pub branch_latency: u64,
    pub multiply_latency: u64,
}

impl Default for ScalarPipeline {
    fn default() -> Self {
        ScalarPipeline {
            memory_latency: 2,
            branch_latency: 2,
            multiply_latency: 3,
        }
    }
}

impl PipelineModel for ScalarPipeline {
    fn retire(&mut self, dcode: &Dcode) -> u64 {
        if dcode.is_branch() {
            return self.branch_latency;
        }
        match dcode.kind {
            OpKind::Ld | OpKind::St => self.memory_latency,
            OpKind::Mpy => self.multiply_latency,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::dcode::{predecode, Parcels};
    use crate::options::IsaOptions;

    fn decode(p0: u16, p1: u16) -> Dcode {
        predecode(Parcels { p0, p1, limm: 0 }, 0x100, &IsaOptions::default())
    }

    #[test]
    fn test_per_class_latencies() {
        let mut pipeline = ScalarPipeline::default();
        // nop_s
        assert_eq!(pipeline.retire(&decode(0xf000, 0)), 1);
        // ld r1, [r2, 0]
        assert_eq!(pipeline.retire(&decode((0x0a << 11) | (1 << 5) | 2, 0)), 2);
        // b +2
        assert_eq!(pipeline.retire(&decode(0x0c << 11, 2)), 2);
        // mpy r1, r2, r3
        assert_eq!(
            pipeline.retire(&decode((0x08 << 11) | (1 << 5) | 2, 3 << 10)),
            3
        );
    }
}
