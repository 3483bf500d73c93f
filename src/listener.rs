//! Hooks observing calls to individual functions.

use crate::call_context::Context;
use std::sync::Arc;
use wasmcore_environ::FuncType;

/// Static information about a function in a module instance.
#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    pub(crate) module_name: String,
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) debug_name: String,
    pub(crate) export_names: Vec<String>,
    pub(crate) param_names: Option<Vec<String>>,
    pub(crate) func_type: FuncType,
}

impl FunctionDefinition {
    /// Name of the module instance defining this function.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Position in the module's function index space, imports first.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The debug name from the name section, or the empty string.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `module.name`, or `module.$index` for unnamed functions.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn export_names(&self) -> &[String] {
        &self.export_names
    }

    /// Parameter names, present only if every parameter is named.
    pub fn param_names(&self) -> Option<&[String]> {
        self.param_names.as_deref()
    }

    pub fn func_type(&self) -> &FuncType {
        &self.func_type
    }
}

/// Observes calls to one function. Engines invoke the listener around every
/// call of the function it was created for.
pub trait FunctionListener: Send + Sync {
    /// Invoked before the function runs, with its parameters in slot
    /// encoding.
    fn before(&self, ctx: &Context, definition: &FunctionDefinition, params: &[u64]);

    /// Invoked after the function returns or fails.
    fn after(
        &self,
        ctx: &Context,
        definition: &FunctionDefinition,
        error: Option<&anyhow::Error>,
        results: &[u64],
    );
}

/// Consulted once for every function built during instantiation.
pub trait FunctionListenerFactory: Send + Sync {
    /// Returns a listener for the function, or `None` to leave it
    /// unobserved.
    fn new_listener(&self, definition: &FunctionDefinition) -> Option<Arc<dyn FunctionListener>>;
}
