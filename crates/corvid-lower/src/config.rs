//! Lowering configuration (corvid-lower.toml).

use crate::error::LowerResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs of the lowering pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoweringConfig {
    /// Forward the continuation of suspend functions whose suspension points
    /// are all tail calls instead of building a state machine.
    pub tail_call_optimization: bool,

    /// Name of the resume method of continuation classes.
    pub state_machine_method_name: String,

    /// Infix between function name and counter in continuation class names.
    pub coroutine_class_suffix: String,

    /// Check state machine invariants after each build.
    pub verify_state_machines: bool,

    /// Worker threads for multi-module lowering (0 = number of CPUs).
    pub parallel_workers: usize,
}

impl Default for LoweringConfig {
    fn default() -> Self {
        Self {
            tail_call_optimization: true,
            state_machine_method_name: "doResume".to_string(),
            coroutine_class_suffix: "COROUTINE$".to_string(),
            verify_state_machines: true,
            parallel_workers: 0,
        }
    }
}

impl LoweringConfig {
    /// Parse a configuration; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> LowerResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> LowerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Effective number of worker threads.
    pub fn worker_count(&self) -> usize {
        if self.parallel_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.parallel_workers
        }
    }
}
