use crate::call_context::{CallContext, Context};
use crate::instance::ModuleInstance;
use crate::listener::{FunctionDefinition, FunctionListener};
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use wasmcore_environ::{FeatureError, Features, FuncType, ValType};

macro_rules! for_each_function_signature {
    ($mac:ident) => {
        $mac!(0);
        $mac!(1 A1);
        $mac!(2 A1 A2);
        $mac!(3 A1 A2 A3);
        $mac!(4 A1 A2 A3 A4);
        $mac!(5 A1 A2 A3 A4 A5);
        $mac!(6 A1 A2 A3 A4 A5 A6);
        $mac!(7 A1 A2 A3 A4 A5 A6 A7);
        $mac!(8 A1 A2 A3 A4 A5 A6 A7 A8);
    };
}

mod typed;
pub use typed::*;

/// Errors in the declaration of a host function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("multiple result types invalid as {0}")]
    MultiValue(FeatureError),
    #[error("param[{index}] is unsupported: {ty}")]
    UnsupportedParam { index: usize, ty: ValType },
    #[error("result[{index}] is unsupported: {ty}")]
    UnsupportedResult { index: usize, ty: ValType },
    #[error("argument count mismatch: expected {expected}, but was {actual}")]
    ArgumentCount { expected: usize, actual: usize },
}

/// A store-wide identifier of a function type, assigned when a module using
/// the type is instantiated.
///
/// Two functions have equal signatures exactly when their type ids are equal,
/// which is what `call_indirect` checks at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionTypeId(pub(crate) u32);

impl FunctionTypeId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Which leading context arguments a host function takes before its Wasm
/// parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    NoContext,
    /// The embedder's [`Context`].
    Context,
    /// The calling module's [`CallContext`].
    Module,
    /// Both a [`Context`] and a [`CallContext`], in that order.
    ContextModule,
}

impl HostKind {
    /// The number of leading context arguments.
    pub fn context_params(self) -> usize {
        match self {
            HostKind::NoContext => 0,
            HostKind::Context | HostKind::Module => 1,
            HostKind::ContextModule => 2,
        }
    }
}

/// The uniform calling convention every host function is adapted to:
/// parameters and results as flat 64-bit slots.
pub type HostCallable = dyn Fn(&Context, &CallContext, &[u64]) -> Result<Vec<u64>> + Send + Sync;

/// A native function callable from WebAssembly.
#[derive(Clone)]
pub struct HostFunc {
    ty: FuncType,
    kind: HostKind,
    callable: Arc<HostCallable>,
}

fn host_supported(ty: ValType) -> bool {
    matches!(
        ty,
        ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64 | ValType::ExternRef
    )
}

impl HostFunc {
    /// Declares a host function with an explicit signature.
    ///
    /// `callable` receives both contexts regardless of `kind`, which only
    /// records what the native function asked for.
    pub fn new(
        ty: FuncType,
        kind: HostKind,
        callable: impl Fn(&Context, &CallContext, &[u64]) -> Result<Vec<u64>> + Send + Sync + 'static,
    ) -> Result<HostFunc, ConfigError> {
        let offset = kind.context_params();
        if let Some((index, &param)) = ty
            .params()
            .iter()
            .enumerate()
            .find(|(_, t)| !host_supported(**t))
        {
            return Err(ConfigError::UnsupportedParam {
                index: index + offset,
                ty: param,
            });
        }
        if let Some((index, &result)) = ty
            .results()
            .iter()
            .enumerate()
            .find(|(_, t)| !host_supported(**t))
        {
            return Err(ConfigError::UnsupportedResult { index, ty: result });
        }
        Ok(HostFunc {
            ty,
            kind,
            callable: Arc::new(callable),
        })
    }

    /// Adapts a native closure, deriving the signature from its argument and
    /// return types.
    pub fn wrap<Params, Results>(func: impl IntoHostFunc<Params, Results>) -> HostFunc {
        func.into_host_func()
    }

    pub(crate) fn from_typed(
        kind: HostKind,
        params: &[ValType],
        results: Vec<ValType>,
        callable: impl Fn(&Context, &CallContext, &[u64]) -> Result<Vec<u64>> + Send + Sync + 'static,
    ) -> HostFunc {
        HostFunc {
            ty: FuncType::new(params.iter().copied(), results),
            kind,
            callable: Arc::new(callable),
        }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    /// Checks the signature against the enabled features.
    pub fn check_features(&self, features: Features) -> Result<(), ConfigError> {
        if self.ty.results().len() > 1 {
            features
                .require(Features::MULTI_VALUE)
                .map_err(ConfigError::MultiValue)?;
        }
        Ok(())
    }

    /// Calls the function on behalf of `module`, the caller's context.
    pub fn call(&self, ctx: &Context, module: &CallContext, params: &[u64]) -> Result<Vec<u64>> {
        if params.len() != self.ty.params().len() {
            return Err(ConfigError::ArgumentCount {
                expected: self.ty.params().len(),
                actual: params.len(),
            }
            .into());
        }
        (self.callable)(ctx, module, params)
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("ty", &self.ty)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The code behind a function instance.
#[derive(Debug, Clone)]
pub enum FunctionKind {
    /// A function defined in WebAssembly.
    Wasm {
        /// Declared locals, not including parameters.
        locals: Vec<ValType>,
        /// Instruction bytes, ending with `end`.
        body: Vec<u8>,
    },
    Host(HostFunc),
}

/// A function bound to the module instance that defines it.
///
/// Function instances are shared by every module importing them. The
/// back-pointer to the defining instance is weak; importers keep the defining
/// instance alive through their own module handles.
pub struct FunctionInstance {
    kind: FunctionKind,
    definition: FunctionDefinition,
    type_id: FunctionTypeId,
    module: Weak<ModuleInstance>,
    listener: Option<Arc<dyn FunctionListener>>,
}

impl FunctionInstance {
    pub(crate) fn new(
        kind: FunctionKind,
        definition: FunctionDefinition,
        type_id: FunctionTypeId,
        module: Weak<ModuleInstance>,
        listener: Option<Arc<dyn FunctionListener>>,
    ) -> FunctionInstance {
        FunctionInstance {
            kind,
            definition,
            type_id,
            module,
            listener,
        }
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn ty(&self) -> &FuncType {
        &self.definition.func_type
    }

    pub fn type_id(&self) -> FunctionTypeId {
        self.type_id
    }

    /// Position in the defining module's function index space.
    pub fn index(&self) -> u32 {
        self.definition.index
    }

    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    pub fn listener(&self) -> Option<&Arc<dyn FunctionListener>> {
        self.listener.as_ref()
    }

    /// The module instance defining this function.
    pub fn module(&self) -> Result<Arc<ModuleInstance>> {
        self.module.upgrade().ok_or_else(|| {
            anyhow!(
                "module[{}] defining {} has been dropped",
                self.definition.module_name,
                self.definition.debug_name
            )
        })
    }
}

impl fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FunctionInstance")
            .field("name", &self.definition.debug_name)
            .field("ty", self.ty())
            .field("type_id", &self.type_id)
            .finish()
    }
}

/// An exported function, bound to the call context it runs with.
///
/// A function re-exported from an imported module still runs in its
/// defining module's engine, but with the importing module's context.
#[derive(Clone, Debug)]
pub struct Function {
    instance: Arc<FunctionInstance>,
    call_ctx: CallContext,
}

impl Function {
    pub(crate) fn new(instance: Arc<FunctionInstance>, call_ctx: CallContext) -> Function {
        Function { instance, call_ctx }
    }

    pub fn ty(&self) -> &FuncType {
        self.instance.ty()
    }

    pub fn param_types(&self) -> &[ValType] {
        self.ty().params()
    }

    pub fn result_types(&self) -> &[ValType] {
        self.ty().results()
    }

    pub fn definition(&self) -> &FunctionDefinition {
        self.instance.definition()
    }

    pub fn instance(&self) -> &Arc<FunctionInstance> {
        &self.instance
    }

    /// Calls the function with parameters in slot encoding, returning its
    /// results in the same encoding.
    pub fn call(&self, ctx: &Context, params: &[u64]) -> Result<Vec<u64>> {
        let module = self.instance.module()?;
        module
            .engine()?
            .call(ctx, &self.call_ctx, &self.instance, params)
    }
}
