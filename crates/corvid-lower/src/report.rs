//! Lowering reports.
//!
//! What each module's lowering produced, for logging and JSON dumps.

use serde::Serialize;

/// Shape of one generated state machine.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StateMachineSummary {
    /// Qualified name of the lowered suspend function.
    pub function: String,
    /// Qualified name of the generated continuation class.
    pub continuation_class: String,
    /// Number of normal states; traps are not counted.
    pub state_count: usize,
    /// Successor state ids, indexed by state id.
    pub successors: Vec<Vec<u32>>,
    /// Names of the fields holding promoted locals, in promotion order.
    pub live_local_fields: Vec<String>,
    /// Names of the fields saving the arguments.
    pub argument_fields: Vec<String>,
}

/// A local class or function moved out of a lambda or inline function body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExtractionRecord {
    /// Qualified name of the moved declaration.
    pub declaration: String,
    /// Qualified name of the new parent.
    pub new_parent: String,
    /// Captured values turned into constructor fields or leading parameters.
    pub captured: Vec<String>,
}

/// Everything the lowering of one module produced.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ModuleReport {
    /// Name of the module.
    pub module: String,
    /// Suspend functions lowered to a state machine.
    pub state_machines: Vec<StateMachineSummary>,
    /// Suspend functions lowered by forwarding their continuation.
    pub tail_call_functions: Vec<String>,
    /// Suspend functions without suspension points.
    pub plain_functions: Vec<String>,
    /// Local declarations moved to a new parent.
    pub extracted: Vec<ExtractionRecord>,
}

impl ModuleReport {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            ..Self::default()
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
