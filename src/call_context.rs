use crate::func::Function;
use crate::global::Global;
use crate::instance::{ExportInstance, ModuleInstance};
use crate::memory::MemoryInstance;
use crate::sys::Closer;
use crate::ExternKind;
use anyhow::Result;
use hashbrown::HashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Embedder-supplied values threaded through every call.
///
/// A `Context` is cheap to clone. It carries at most one value per type and is
/// immutable once built; deriving a new context with [`Context::with_value`]
/// leaves the original untouched.
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Returns a context that also carries `value`, replacing any previous
    /// value of the same type.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Context {
        let mut values = HashMap::clone(&self.values);
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Context {
            values: Arc::new(values),
        }
    }

    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.values.len())
            .finish()
    }
}

/// A handle to an instantiated module, used by embedders to reach its exports
/// and passed to host functions as the calling module.
///
/// Clones share the module's closed state: closing through any of them closes
/// the module for all.
#[derive(Clone)]
pub struct CallContext {
    module: Arc<ModuleInstance>,
    memory: Option<Arc<MemoryInstance>>,
}

impl CallContext {
    pub(crate) fn new(module: Arc<ModuleInstance>) -> CallContext {
        let memory = module.memory().cloned();
        CallContext { module, memory }
    }

    /// The name the module was instantiated under.
    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn module(&self) -> &Arc<ModuleInstance> {
        &self.module
    }

    /// The memory calls through this context read and write, if any.
    pub fn memory(&self) -> Option<&Arc<MemoryInstance>> {
        self.memory.as_ref()
    }

    /// Returns a context for the same module that uses `memory` instead of the
    /// module's own.
    pub fn with_memory(&self, memory: Arc<MemoryInstance>) -> CallContext {
        match &self.memory {
            Some(current) if Arc::ptr_eq(current, &memory) => self.clone(),
            _ => CallContext {
                module: self.module.clone(),
                memory: Some(memory),
            },
        }
    }

    /// Looks up an exported function.
    ///
    /// The function always runs with this context, even when the module
    /// re-exports a function it imported.
    pub fn exported_function(&self, name: &str) -> Option<Function> {
        match self.module.get_export(name, ExternKind::Func).ok()? {
            ExportInstance::Function(f) => Some(Function::new(f.clone(), self.clone())),
            _ => None,
        }
    }

    pub fn exported_memory(&self, name: &str) -> Option<Arc<MemoryInstance>> {
        match self.module.get_export(name, ExternKind::Memory).ok()? {
            ExportInstance::Memory(m) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn exported_global(&self, name: &str) -> Option<Global> {
        match self.module.get_export(name, ExternKind::Global).ok()? {
            ExportInstance::Global(g) => Some(Global::new(g.clone())),
            _ => None,
        }
    }

    /// Returns an [`ExitError`](crate::ExitError) carrying the stored exit code
    /// once the module has been closed.
    ///
    /// Engines check this on entry to every call.
    pub fn fail_if_closed(&self) -> Result<()> {
        self.module.fail_if_closed()
    }

    /// Closes the module with exit code zero.
    pub fn close(&self, ctx: &Context) -> Result<()> {
        self.close_with_exit_code(ctx, 0)
    }

    /// Closes the module: records `exit_code`, releases its system context,
    /// removes it from its namespace and closes its code.
    ///
    /// Only the first close has any effect; later ones return `Ok` and leave
    /// the stored exit code unchanged.
    pub fn close_with_exit_code(&self, ctx: &Context, exit_code: u32) -> Result<()> {
        self.module.close_with_exit_code(ctx, exit_code)
    }

    /// Registers a resource closed after the module's system context, such as
    /// an engine's compiled code.
    pub fn set_code_closer(&self, closer: impl Closer + 'static) {
        self.module.set_code_closer(Box::new(closer));
    }
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Module[{}]", self.name())
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("name", &self.name())
            .field("memory", &self.memory.is_some())
            .finish()
    }
}
