//! A global store of flags that can impact analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analysis sessions in the same process). Numeric
//! thresholds are per-session instead, see [`Limits`](crate::session::Limits).

use std::sync::Mutex;

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Attempt to recover jump tables behind indirect branches. Without this, every indirect
    /// branch is left unresolved.
    pub enable_jump_table_recovery: bool,
    /// Treat every register input of a function (not just the stack pointer) as the base of a
    /// relative constant during constant propagation.
    pub relative_bases_for_all_register_inputs: bool,
    /// Adjusting a relative constant inside a loop body yields `bottom` and marks the function
    /// stack-unsafe. If disabled, such adjustments are trusted.
    pub degrade_relative_constants_in_loops: bool,
    /// Track stores of constants to stack slots, and fold later loads from those slots.
    pub enable_stack_slot_simulation: bool,
    /// Fold loads from constant addresses inside read-only regions of the image.
    pub fold_loads_from_readonly_image: bool,
    /// Analyse the callees of each function as they are discovered.
    pub follow_calls: bool,
    /// Whether to log the boundaries of each block as it is created (useful when debugging)
    pub debug_print_block_boundaries: bool,
    /// Whether to include dead ops in SSA dumps
    pub debug_print_dead_ops: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enable_jump_table_recovery: true,
            relative_bases_for_all_register_inputs: false,
            degrade_relative_constants_in_loops: true,
            enable_stack_slot_simulation: true,
            fold_loads_from_readonly_image: true,
            follow_calls: true,
            debug_print_block_boundaries: false,
            debug_print_dead_ops: false,
        }
    }
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    fn from_initialized() -> Self {
        let init = INTERNAL_CONFIG_INITIALIZER
            .lock()
            .map(|mut i| i.take().expect("Should be initialized only once"))
            .unwrap_or_default();
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = INTERNAL_CONFIG_INITIALIZER
            .lock()
            .map(|mut i| i.replace(Some(command_line_config.into())))
            .unwrap_or_default();
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static INTERNAL_CONFIG_INITIALIZER: Mutex<Option<Option<AnalysisConfig>>> = Mutex::new(Some(None));

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableJumpTableRecovery,
    EnableRelativeBasesForAllRegisterInputs,
    DisableDegradingRelativeConstantsInLoops,
    DisableStackSlotSimulation,
    DisableFoldingLoadsFromReadonlyImage,
    DisableFollowingCalls,
    DebugPrintBlockBoundaries,
    DebugPrintDeadOps,
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        let mut r = Self::default();
        for c in v {
            use CommandLineAnalysisConfig::*;
            match c {
                DisableJumpTableRecovery => r.enable_jump_table_recovery = false,
                EnableRelativeBasesForAllRegisterInputs => {
                    r.relative_bases_for_all_register_inputs = true
                }
                DisableDegradingRelativeConstantsInLoops => {
                    r.degrade_relative_constants_in_loops = false
                }
                DisableStackSlotSimulation => r.enable_stack_slot_simulation = false,
                DisableFoldingLoadsFromReadonlyImage => r.fold_loads_from_readonly_image = false,
                DisableFollowingCalls => r.follow_calls = false,
                DebugPrintBlockBoundaries => r.debug_print_block_boundaries = true,
                DebugPrintDeadOps => r.debug_print_dead_ops = true,
            }
        }
        r
    }
}
