use crate::call_context::{CallContext, Context};
use crate::config::Config;
use crate::func::{ConfigError, HostFunc, HostKind, IntoHostFunc};
use crate::global::Val;
use anyhow::{Result, bail};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use wasmcore_environ::{
    self as environ, Export, ExternKind, FuncType, GlobalType, MemoryType, Mutability, NameSection,
};

/// A validated module, ready to be instantiated any number of times.
///
/// Cloning a `Module` is cheap: clones share the same image.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    env: environ::Module,
    host_functions: Vec<HostFunc>,
}

impl Module {
    /// Validates a decoded module against `config` and assigns its id.
    pub fn new(config: &Config, mut env: environ::Module) -> Result<Module> {
        env.validate(config.features, config.max_stack_values)?;
        env.assign_id();
        Ok(Module {
            inner: Arc::new(ModuleInner {
                env,
                host_functions: Vec::new(),
            }),
        })
    }

    /// The module image.
    pub fn env(&self) -> &environ::Module {
        &self.inner.env
    }

    /// Native implementations of the module's functions, in the order of its
    /// function section. Empty unless built with a [`HostModuleBuilder`].
    pub fn host_functions(&self) -> &[HostFunc] {
        &self.inner.host_functions
    }

    pub fn is_host(&self) -> bool {
        !self.inner.host_functions.is_empty()
    }

    /// The content hash engines key compiled code by.
    pub fn id(&self) -> &[u8; 32] {
        &self.inner.env.id
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Module")
            .field("functions", &self.inner.env.functions.len())
            .field("imports", &self.inner.env.imports.len())
            .field("exports", &self.inner.env.exports.len())
            .field("host", &self.is_host())
            .finish()
    }
}

struct HostFuncDecl {
    func: HostFunc,
    param_names: Option<Vec<String>>,
}

/// Builds a module whose functions are implemented natively.
///
/// Functions, the memory and globals are exported under the names given here,
/// in the order they are added.
///
/// ```ignore
/// let mut builder = HostModuleBuilder::new("env");
/// builder
///     .func("add", |a: i32, b: i32| a + b)
///     .memory("memory", 1, Some(2));
/// let module = builder.build(&Config::new())?;
/// ```
pub struct HostModuleBuilder {
    name: String,
    funcs: IndexMap<String, HostFuncDecl>,
    memory: Option<(String, MemoryType)>,
    globals: IndexMap<String, Val>,
}

impl fmt::Debug for HostModuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostModuleBuilder")
            .field("name", &self.name)
            .field("funcs", &self.funcs.keys().collect::<Vec<_>>())
            .field("memory", &self.memory)
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HostModuleBuilder {
    pub fn new(name: impl Into<String>) -> HostModuleBuilder {
        HostModuleBuilder {
            name: name.into(),
            funcs: IndexMap::new(),
            memory: None,
            globals: IndexMap::new(),
        }
    }

    /// Exports a native closure, deriving its signature from the closure's
    /// types. A leading `&Context`, `&CallContext`, or both, are passed through
    /// rather than exposed to WebAssembly.
    pub fn func<Params, Results>(
        &mut self,
        name: impl Into<String>,
        func: impl IntoHostFunc<Params, Results>,
    ) -> &mut Self {
        self.insert_func(name.into(), HostFunc::wrap(func));
        self
    }

    /// Exports a function with an explicitly declared signature.
    pub fn func_new(
        &mut self,
        name: impl Into<String>,
        ty: FuncType,
        kind: HostKind,
        func: impl Fn(&Context, &CallContext, &[u64]) -> Result<Vec<u64>> + Send + Sync + 'static,
    ) -> Result<&mut Self, ConfigError> {
        let func = HostFunc::new(ty, kind, func)?;
        self.insert_func(name.into(), func);
        Ok(self)
    }

    fn insert_func(&mut self, name: String, func: HostFunc) {
        self.funcs.insert(
            name,
            HostFuncDecl {
                func,
                param_names: None,
            },
        );
    }

    /// Names the parameters of a previously added function, for listeners.
    pub fn param_names(&mut self, func: &str, names: &[&str]) -> Result<&mut Self> {
        let Some(decl) = self.funcs.get_mut(func) else {
            bail!("{func:?} is not a function of host module {:?}", self.name);
        };
        let expected = decl.func.ty().params().len();
        if names.len() != expected {
            return Err(ConfigError::ArgumentCount {
                expected,
                actual: names.len(),
            }
            .into());
        }
        decl.param_names = Some(names.iter().map(|n| n.to_string()).collect());
        Ok(self)
    }

    /// Exports a memory of `min` pages, growable to `max`.
    pub fn memory(&mut self, name: impl Into<String>, min: u32, max: Option<u32>) -> &mut Self {
        self.memory = Some((name.into(), MemoryType::new(min, max)));
        self
    }

    /// Exports an immutable global.
    pub fn global(&mut self, name: impl Into<String>, val: Val) -> &mut Self {
        self.globals.insert(name.into(), val);
        self
    }

    /// Checks every export against `config` and produces the module.
    pub fn build(&self, config: &Config) -> Result<Module> {
        let mut env = environ::Module::default();
        let mut names = NameSection {
            module_name: Some(self.name.clone()),
            ..NameSection::default()
        };
        let mut host_functions = Vec::with_capacity(self.funcs.len());

        for (index, (name, decl)) in self.funcs.iter().enumerate() {
            decl.func.check_features(config.features)?;
            let ty = decl.func.ty();
            let type_index = match env.types.iter().position(|t| t == ty) {
                Some(i) => i,
                None => {
                    env.types.push(ty.clone());
                    env.types.len() - 1
                }
            };
            env.functions.push(type_index as u32);
            env.exports.push(Export {
                name: name.clone(),
                kind: ExternKind::Func,
                index: index as u32,
            });
            names.function_names.insert(index as u32, name.clone());
            if let Some(params) = &decl.param_names {
                names.local_names.insert(
                    index as u32,
                    params
                        .iter()
                        .enumerate()
                        .map(|(i, n)| (i as u32, n.clone()))
                        .collect(),
                );
            }
            host_functions.push(decl.func.clone());
        }

        if let Some((name, ty)) = &self.memory {
            env.memory = Some(*ty);
            env.exports.push(Export {
                name: name.clone(),
                kind: ExternKind::Memory,
                index: 0,
            });
        }

        for (index, (name, val)) in self.globals.iter().enumerate() {
            env.globals.push(environ::Global {
                ty: GlobalType::new(val.ty(), Mutability::Const),
                init: val.to_const_expr(),
            });
            env.exports.push(Export {
                name: name.clone(),
                kind: ExternKind::Global,
                index: index as u32,
            });
        }

        env.names = Some(names);
        env.validate_host(config.features)?;
        env.assign_id();
        log::debug!(
            "built host module[{}] with {} functions",
            self.name,
            host_functions.len()
        );
        Ok(Module {
            inner: Arc::new(ModuleInner {
                env,
                host_functions,
            }),
        })
    }
}
