use crate::call_context::{CallContext, Context};
use crate::engine::ModuleEngine;
use crate::func::{FunctionInstance, FunctionTypeId};
use crate::global::GlobalInstance;
use crate::memory::{DataInstance, MemoryInstance};
use crate::namespace::Namespace;
use crate::sync::lock;
use crate::sys::{Closer, SysContext};
use crate::table::{ElementInstance, TableInstance};
use crate::trap::ExitError;
use crate::ExternKind;
use anyhow::{Result, anyhow};
use hashbrown::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use thiserror::Error;
use wasmcore_environ::FuncType;

/// An error resolving a module's imports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("module[{0}] not instantiated")]
    ModuleNotInstantiated(String),
    #[error("{name:?} is not exported in module {module:?}")]
    ExportNotFound { module: String, name: String },
    #[error("export {name:?} in module {module:?} is a {actual}, not a {expected}")]
    ExportKindMismatch {
        module: String,
        name: String,
        expected: ExternKind,
        actual: ExternKind,
    },
    #[error("import[{index}] {kind}[{module}.{name}]: {reason}")]
    Import {
        index: usize,
        kind: ExternKind,
        module: String,
        name: String,
        reason: String,
    },
}

/// An error raised while instantiating a module, after its imports resolved.
#[derive(Error, Debug)]
pub enum InstantiationError {
    #[error("module[{0}] has already been instantiated")]
    NameTaken(String),
    #[error("data[{0}] out of bounds memory access")]
    DataOutOfBounds(usize),
    #[error("element[{0}] out of bounds table access")]
    ElementOutOfBounds(usize),
    #[error("too many function types in a store")]
    TooManyTypes,
    #[error("compilation failed: {0}")]
    Compilation(#[source] anyhow::Error),
    #[error("start {func} failed: {source}")]
    Start {
        func: String,
        #[source]
        source: anyhow::Error,
    },
}

/// An item exported by a module instance.
#[derive(Debug, Clone)]
pub enum ExportInstance {
    Function(Arc<FunctionInstance>),
    Global(Arc<GlobalInstance>),
    Memory(Arc<MemoryInstance>),
    Table(Arc<TableInstance>),
}

impl ExportInstance {
    pub fn kind(&self) -> ExternKind {
        match self {
            ExportInstance::Function(_) => ExternKind::Func,
            ExportInstance::Global(_) => ExternKind::Global,
            ExportInstance::Memory(_) => ExternKind::Memory,
            ExportInstance::Table(_) => ExternKind::Table,
        }
    }
}

/// The linked objects of an instantiated module.
///
/// Index spaces follow the module's: imported functions and globals come
/// before the module's own. Imported objects are shared with the instance
/// that defines them, and an instance keeps every instance it imports from
/// alive.
pub struct ModuleInstance {
    pub(crate) name: String,
    pub(crate) imported_modules: Vec<Arc<ModuleInstance>>,
    pub(crate) functions: Vec<Arc<FunctionInstance>>,
    pub(crate) globals: Vec<Arc<GlobalInstance>>,
    pub(crate) memory: Option<Arc<MemoryInstance>>,
    pub(crate) tables: Vec<Arc<TableInstance>>,
    pub(crate) types: Vec<FuncType>,
    pub(crate) type_ids: Vec<FunctionTypeId>,
    pub(crate) data_instances: Vec<Arc<DataInstance>>,
    pub(crate) element_instances: OnceLock<Vec<Arc<ElementInstance>>>,
    pub(crate) exports: HashMap<String, ExportInstance>,
    pub(crate) engine: OnceLock<Box<dyn ModuleEngine>>,
    pub(crate) namespace: Weak<Namespace>,
    pub(crate) sys: Option<Arc<SysContext>>,
    /// Zero while open. Once closed, bit 0 is set and the upper 32 bits hold
    /// the exit code.
    pub(crate) closed: AtomicU64,
    pub(crate) code_closer: Mutex<Option<Box<dyn Closer>>>,
}

impl ModuleInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functions(&self) -> &[Arc<FunctionInstance>] {
        &self.functions
    }

    pub fn function(&self, index: u32) -> Option<&Arc<FunctionInstance>> {
        self.functions.get(index as usize)
    }

    pub fn globals(&self) -> &[Arc<GlobalInstance>] {
        &self.globals
    }

    pub fn memory(&self) -> Option<&Arc<MemoryInstance>> {
        self.memory.as_ref()
    }

    pub fn tables(&self) -> &[Arc<TableInstance>] {
        &self.tables
    }

    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    /// Store-wide identifiers of the module's types, by type index.
    pub fn type_ids(&self) -> &[FunctionTypeId] {
        &self.type_ids
    }

    /// One per data segment. Active segments, and passive ones after
    /// `data.drop`, are empty.
    pub fn data_instances(&self) -> &[Arc<DataInstance>] {
        &self.data_instances
    }

    /// One per element segment. Only passive segments carry references.
    pub fn element_instances(&self) -> &[Arc<ElementInstance>] {
        self.element_instances.get().map_or(&[], Vec::as_slice)
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, &ExportInstance)> {
        self.exports.iter().map(|(name, export)| (name.as_str(), export))
    }

    /// Looks up an export by name, failing if it is missing or of another
    /// kind.
    pub fn get_export(&self, name: &str, kind: ExternKind) -> Result<&ExportInstance, LinkError> {
        let export = self
            .exports
            .get(name)
            .ok_or_else(|| LinkError::ExportNotFound {
                module: self.name.clone(),
                name: name.to_string(),
            })?;
        if export.kind() != kind {
            return Err(LinkError::ExportKindMismatch {
                module: self.name.clone(),
                name: name.to_string(),
                expected: kind,
                actual: export.kind(),
            });
        }
        Ok(export)
    }

    /// The engine executing this module's functions.
    pub fn engine(&self) -> Result<&dyn ModuleEngine> {
        self.engine
            .get()
            .map(|engine| &**engine)
            .ok_or_else(|| anyhow!("module[{}] has no engine", self.name))
    }

    /// A call context bound to this module and its own memory.
    pub fn call_context(self: &Arc<Self>) -> CallContext {
        CallContext::new(self.clone())
    }

    pub fn system_context(&self) -> Option<&Arc<SysContext>> {
        self.sys.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) != 0
    }

    pub(crate) fn fail_if_closed(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            0 => Ok(()),
            closed => Err(ExitError {
                module_name: self.name.clone(),
                exit_code: (closed >> 32) as u32,
            }
            .into()),
        }
    }

    pub(crate) fn set_code_closer(&self, closer: Box<dyn Closer>) {
        *lock(&self.code_closer) = Some(closer);
    }

    pub(crate) fn close_with_exit_code(&self, ctx: &Context, exit_code: u32) -> Result<()> {
        let closed = 1 | (u64::from(exit_code) << 32);
        if self
            .closed
            .compare_exchange(0, closed, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        log::debug!("closing module[{}] with exit code {exit_code}", self.name);

        let mut result = match &self.sys {
            Some(sys) => sys.close(ctx),
            None => Ok(()),
        };
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.delete_module(&self.name);
        }
        let closer = lock(&self.code_closer).take();
        if let Some(closer) = closer {
            let closed = closer.close(ctx);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field(
                "imported_modules",
                &self.imported_modules.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .field("functions", &self.functions.len())
            .field("globals", &self.globals.len())
            .field("memory", &self.memory.is_some())
            .field("tables", &self.tables.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
