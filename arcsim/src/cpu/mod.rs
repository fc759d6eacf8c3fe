//! The simulated CPU: architectural state, interpreter and dispatch loop.

pub mod exec;
pub mod state;
pub mod step;

pub use state::CpuState;
pub use step::{Processor, RunExit, StepState};

use sim_types::{Counter64, CounterId};

/// The profiling counters the core maintains. Mutated only by the
/// dispatcher and (for cycles) the pipeline model.
#[derive(Default)]
pub struct SimCounters {
    pub native: Counter64,
    pub interp: Counter64,
    pub cycles: Counter64,
}

impl SimCounters {
    pub fn get(&self, id: CounterId) -> u64 {
        match id {
            CounterId::NativeInstructionCount64 => self.native.get(),
            CounterId::InterpretedInstructionCount64 => self.interp.get(),
            CounterId::CycleCount64 => self.cycles.get(),
        }
    }
}
