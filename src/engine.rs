//! The seam between instantiation and execution.
//!
//! This crate never executes code itself. An [`Engine`] is shared by a
//! [`Store`](crate::Store) and compiles modules; a [`ModuleEngine`] is created
//! for each instance and calls its functions. An interpreter and a compiler
//! can both sit behind these traits.

use crate::call_context::{CallContext, Context};
use crate::func::FunctionInstance;
use crate::global::GlobalInstance;
use crate::module::Module;
use crate::table::{ElementInstance, TableInitEntry, TableInstance};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// Compiles modules and creates a [`ModuleEngine`] per instance.
pub trait Engine: Send + Sync {
    /// Compiles the module ahead of instantiation.
    ///
    /// Compilation results are keyed by [`Module::id`].
    fn compile_module(&self, module: &Module) -> Result<()>;

    /// Releases the compiled form of `module`. Instances already created from
    /// it keep working.
    fn delete_compiled_module(&self, module: &Module);

    /// The number of modules currently compiled.
    fn compiled_module_count(&self) -> u32;

    /// Prepares execution of one instance of `module`.
    ///
    /// `imported_functions` and `functions` together form the instance's
    /// function index space. The engine writes each of `table_inits` into
    /// `tables` and stops at the first entry that does not fit, reporting it
    /// with [`NewModuleEngineError::deferred`] and an
    /// [`ElementOffsetOutOfBounds`](crate::ElementOffsetOutOfBounds) error.
    fn new_module_engine(
        &self,
        name: &str,
        module: &Module,
        imported_functions: &[Arc<FunctionInstance>],
        functions: &[Arc<FunctionInstance>],
        tables: &[Arc<TableInstance>],
        table_inits: &[TableInitEntry],
    ) -> Result<Box<dyn ModuleEngine>, NewModuleEngineError>;
}

/// Executes the functions of one module instance.
pub trait ModuleEngine: Send + Sync {
    /// The name of the instance, for error messages.
    fn name(&self) -> &str;

    /// Calls `function` with parameters in slot encoding.
    ///
    /// `call_ctx` is the module the call is made on behalf of: its memory is
    /// the one host functions see. Engines return [`Trap`](crate::Trap)s for
    /// runtime faults and the error of
    /// [`CallContext::fail_if_closed`] once the module is closed.
    fn call(
        &self,
        ctx: &Context,
        call_ctx: &CallContext,
        function: &FunctionInstance,
        params: &[u64],
    ) -> Result<Vec<u64>>;

    /// Materializes a passive `funcref` element segment, turning function
    /// indices into engine references.
    fn create_func_element_instance(&self, function_indices: &[Option<u32>]) -> ElementInstance;

    /// Rewrites globals initialized by `ref.func`, each currently holding a
    /// function index, to hold engine references instead.
    fn initialize_funcref_globals(&self, globals: &[Arc<GlobalInstance>]);
}

/// The error half of [`Engine::new_module_engine`].
///
/// A deferred error still carries a usable module engine: instantiation logs
/// the error and goes on.
pub struct NewModuleEngineError {
    pub engine: Option<Box<dyn ModuleEngine>>,
    pub error: anyhow::Error,
}

impl NewModuleEngineError {
    /// An error that does not prevent `engine` from being used.
    pub fn deferred(engine: Box<dyn ModuleEngine>, error: impl Into<anyhow::Error>) -> Self {
        NewModuleEngineError {
            engine: Some(engine),
            error: error.into(),
        }
    }
}

impl From<anyhow::Error> for NewModuleEngineError {
    fn from(error: anyhow::Error) -> Self {
        NewModuleEngineError {
            engine: None,
            error,
        }
    }
}

impl fmt::Debug for NewModuleEngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NewModuleEngineError")
            .field("engine", &self.engine.as_ref().map(|e| e.name()))
            .field("error", &self.error)
            .finish()
    }
}
