//! VM tunables, following the fluent builder-with-sane-defaults shape the
//! reference runtime uses for its own execution-limit config (spec §8.3).
//!
//! `VmConfig` is plain data: construct it directly, or chain the `with_*`
//! builders onto [`VmConfig::new`]. `wisp-cli` layers `wisp.toml` overrides
//! on top of the defaults before handing the result to [`crate::Vm`]; the
//! runtime itself never reads a config file.

use crate::gc::DEFAULT_GROWTH_FACTOR;
use crate::vm::{stderr_sink, stdout_sink, OutputSink, FRAMES_MAX, STACK_SLOTS_PER_FRAME};

/// Tunable limits and output sinks for a [`crate::Vm`] (spec §8.3).
pub struct VmConfig {
    /// Maximum call-frame depth (spec §3 "Value stack"). Default 64.
    pub frames_max: usize,
    /// Value-stack slots reserved per frame up front; only sizes the
    /// stack's initial capacity, it does not cap how far the stack can
    /// grow. Default 256.
    pub stack_slots_per_frame: usize,
    /// Run a collection cycle before every allocation (spec §4.5), for
    /// shaking out GC bugs that a lucky allocation pattern would hide.
    pub gc_stress: bool,
    /// Multiplier applied to live bytes after a collection to compute the
    /// next threshold (spec §4.5). Default 2.
    pub heap_growth_factor: usize,
    /// Destination for `print` statements. Defaults to stdout.
    pub output: OutputSink,
    /// Destination for runtime error reports. Defaults to stderr.
    pub error_output: OutputSink,
}

impl std::fmt::Debug for VmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmConfig")
            .field("frames_max", &self.frames_max)
            .field("stack_slots_per_frame", &self.stack_slots_per_frame)
            .field("gc_stress", &self.gc_stress)
            .field("heap_growth_factor", &self.heap_growth_factor)
            .field("output", &"<output sink>")
            .field("error_output", &"<error sink>")
            .finish()
    }
}

impl VmConfig {
    /// Defaults matching the dispatch loop's own compile-time constants:
    /// 64 frames, 256 stack slots per frame, growth factor 2, no GC stress,
    /// stdout/stderr sinks.
    pub fn new() -> Self {
        Self {
            frames_max: FRAMES_MAX,
            stack_slots_per_frame: STACK_SLOTS_PER_FRAME,
            gc_stress: false,
            heap_growth_factor: DEFAULT_GROWTH_FACTOR,
            output: stdout_sink(),
            error_output: stderr_sink(),
        }
    }

    /// A config suited to fuzzing/property tests: small limits so boundary
    /// conditions (stack overflow, recursion depth) are cheap to hit, and
    /// GC stress on so a missed root shows up as a crash instead of luck.
    pub fn sandboxed() -> Self {
        Self {
            frames_max: 8,
            stack_slots_per_frame: 64,
            gc_stress: true,
            heap_growth_factor: DEFAULT_GROWTH_FACTOR,
            output: stdout_sink(),
            error_output: stderr_sink(),
        }
    }

    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max;
        self
    }

    pub fn with_stack_slots_per_frame(mut self, slots: usize) -> Self {
        self.stack_slots_per_frame = slots;
        self
    }

    pub fn with_gc_stress(mut self, stress: bool) -> Self {
        self.gc_stress = stress;
        self
    }

    pub fn with_heap_growth_factor(mut self, factor: usize) -> Self {
        self.heap_growth_factor = factor;
        self
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_error_output(mut self, error_output: OutputSink) -> Self {
        self.error_output = error_output;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Overrides loaded from a `wisp.toml` in the working directory (spec §8.3).
/// Every field is optional so an absent or partial file just falls back to
/// `VmConfig::new()`'s defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct FileConfig {
    pub frames_max: Option<usize>,
    pub stack_slots_per_frame: Option<usize>,
    pub gc_stress: Option<bool>,
    pub heap_growth_factor: Option<usize>,
}

impl FileConfig {
    /// Parse a `wisp.toml` document.
    pub fn parse(toml_source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_source)
    }

    /// Apply these overrides onto a base config, leaving unset fields (and
    /// the output sinks, which a config file cannot express) untouched.
    pub fn apply(&self, mut config: VmConfig) -> VmConfig {
        if let Some(v) = self.frames_max {
            config.frames_max = v;
        }
        if let Some(v) = self.stack_slots_per_frame {
            config.stack_slots_per_frame = v;
        }
        if let Some(v) = self.gc_stress {
            config.gc_stress = v;
        }
        if let Some(v) = self.heap_growth_factor {
            config.heap_growth_factor = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_dispatch_loop_constants() {
        let config = VmConfig::new();
        assert_eq!(config.frames_max, FRAMES_MAX);
        assert_eq!(config.stack_slots_per_frame, STACK_SLOTS_PER_FRAME);
        assert!(!config.gc_stress);
        assert_eq!(config.heap_growth_factor, DEFAULT_GROWTH_FACTOR);
    }

    #[test]
    fn sandboxed_config_is_restrictive() {
        let config = VmConfig::sandboxed();
        assert_eq!(config.frames_max, 8);
        assert!(config.gc_stress);
    }

    #[test]
    fn fluent_builder_overrides_defaults() {
        let config = VmConfig::new().with_frames_max(4).with_gc_stress(true);
        assert_eq!(config.frames_max, 4);
        assert!(config.gc_stress);
    }

    #[test]
    fn file_config_overrides_only_present_fields() {
        let file = FileConfig::parse("frames_max = 16\ngc_stress = true\n").unwrap();
        let config = file.apply(VmConfig::new());
        assert_eq!(config.frames_max, 16);
        assert!(config.gc_stress);
        assert_eq!(config.stack_slots_per_frame, STACK_SLOTS_PER_FRAME);
    }

    #[test]
    fn empty_file_config_changes_nothing() {
        let file = FileConfig::parse("").unwrap();
        let config = file.apply(VmConfig::new());
        assert_eq!(config.frames_max, FRAMES_MAX);
    }
}
