//! Simulator and ISA option sets
//!
//! Options are explicit values handed to [`crate::engine::Engine`] at
//! construction; there is no global configuration state. The ISA option
//! subset that influences decode or code generation is hashed into an
//! [`OptionFingerprint`] so that translation artifacts produced under one
//! option set are never reused under another.

use sim_types::OptionFingerprint;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Fatal configuration errors, surfaced at engine construction only.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An option value is outside its accepted domain.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The requested guest ISA family is not supported by this build.
    #[error("unsupported ISA family: {0:?}")]
    UnsupportedIsa(IsaFamily),
}

/// Guest ISA families the option layer knows about. Only `A700` is
/// implemented by this simulator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum IsaFamily {
    A600,
    #[default]
    A700,
}

/// Options that change what a given instruction word decodes to.
///
/// Everything in here participates in the option fingerprint; changing any
/// field at runtime forces a full invalidation of decoded and translated
/// state.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct IsaOptions {
    pub family: IsaFamily,
    /// 16-bit compact encodings are legal.
    pub compact_enabled: bool,
    /// The `mpy` instruction is present.
    pub mpy_enabled: bool,
    /// Branches may carry a delay slot.
    pub delay_slots_enabled: bool,
    /// Registered EIA extension sub-opcodes, mapping the extension-space
    /// sub-opcode to an index in the engine's extension registry.
    pub eia_subops: BTreeMap<u8, u16>,
}

impl Default for IsaOptions {
    fn default() -> Self {
        IsaOptions {
            family: IsaFamily::A700,
            compact_enabled: true,
            mpy_enabled: true,
            delay_slots_enabled: true,
            eia_subops: BTreeMap::new(),
        }
    }
}

impl IsaOptions {
    /// Fingerprint of this option set. Equal fingerprints mean decode and
    /// code generation behave identically.
    pub fn fingerprint(&self) -> OptionFingerprint {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        OptionFingerprint::from_raw(hasher.finish())
    }
}

/// Runtime-toggleable simulator options (the sim*On/Off surface).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SimToggle {
    Debug,
    Fast,
    Cosim,
    MemoryModel,
    CycleAccurate,
    Trace,
    Verbose,
    EmulateTraps,
}

/// The full simulator option set.
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Extra consistency checking in the dispatch loop.
    pub debug: bool,
    /// Dynamic binary translation enabled.
    pub fast: bool,
    /// Co-simulation lock-step mode.
    pub cosim: bool,
    /// Memory hierarchy model enabled.
    pub memory_model: bool,
    /// Consult the pipeline model per retired instruction.
    pub cycle_accurate: bool,
    /// Emit a per-instruction trace through `log::trace!`.
    pub trace: bool,
    /// Chattier progress output.
    pub verbose: bool,
    /// Emulate OS traps instead of delivering them to the guest.
    pub emulate_traps: bool,

    /// Number of translation worker threads.
    pub workers: usize,
    /// Block execution count at which a block qualifies for translation.
    pub hot_threshold: u64,
    /// Hot blocks accumulated in one page before a work unit is formed.
    pub page_translate_threshold: u32,
    /// Slots in the decoded-instruction cache; must be a power of two.
    pub dcode_cache_slots: usize,
    /// Capacity of the translation work queue.
    pub queue_capacity: usize,
    /// Live translation modules tolerated before a full flush.
    pub max_live_modules: usize,

    pub isa: IsaOptions,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            debug: false,
            fast: true,
            cosim: false,
            memory_model: false,
            cycle_accurate: false,
            trace: false,
            verbose: false,
            emulate_traps: true,
            workers: 2,
            hot_threshold: 4096,
            page_translate_threshold: 4,
            dcode_cache_slots: 8192,
            queue_capacity: 16,
            max_live_modules: 64,
            isa: IsaOptions::default(),
        }
    }
}

impl SimOptions {
    /// Validates the option set. Fatal errors only; every failure here
    /// aborts engine construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.isa.family != IsaFamily::A700 {
            return Err(ConfigError::UnsupportedIsa(self.isa.family));
        }
        if !self.dcode_cache_slots.is_power_of_two() {
            return Err(ConfigError::InvalidOption(format!(
                "dcode cache slots must be a power of two, got {}",
                self.dcode_cache_slots
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidOption(
                "at least one translation worker is required".into(),
            ));
        }
        if self.hot_threshold == 0 {
            return Err(ConfigError::InvalidOption(
                "hot threshold must be non-zero".into(),
            ));
        }
        if self.page_translate_threshold == 0 {
            return Err(ConfigError::InvalidOption(
                "page translate threshold must be non-zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidOption(
                "translation queue capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Applies one runtime toggle.
    pub fn apply_toggle(&mut self, toggle: SimToggle, on: bool) {
        match toggle {
            SimToggle::Debug => self.debug = on,
            SimToggle::Fast => self.fast = on,
            SimToggle::Cosim => self.cosim = on,
            SimToggle::MemoryModel => self.memory_model = on,
            SimToggle::CycleAccurate => self.cycle_accurate = on,
            SimToggle::Trace => self.trace = on,
            SimToggle::Verbose => self.verbose = on,
            SimToggle::EmulateTraps => self.emulate_traps = on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(SimOptions::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_cache_size() {
        let mut opts = SimOptions::default();
        opts.dcode_cache_slots = 1000;
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_rejects_unsupported_family() {
        let mut opts = SimOptions::default();
        opts.isa.family = IsaFamily::A600;
        assert!(matches!(
            opts.validate(),
            Err(ConfigError::UnsupportedIsa(IsaFamily::A600))
        ));
    }

    #[test]
    fn test_fingerprint_tracks_isa_options() {
        let base = IsaOptions::default();
        let mut changed = base.clone();
        changed.mpy_enabled = false;
        assert_ne!(base.fingerprint(), changed.fingerprint());
        assert_eq!(base.fingerprint(), base.clone().fingerprint());
    }

    #[test]
    fn test_toggle_application() {
        let mut opts = SimOptions::default();
        opts.apply_toggle(SimToggle::Fast, false);
        assert!(!opts.fast);
        opts.apply_toggle(SimToggle::CycleAccurate, true);
        assert!(opts.cycle_accurate);
    }
}
