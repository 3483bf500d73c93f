use crate::call_context::{CallContext, Context};
use crate::config::Config;
use crate::engine::{Engine, NewModuleEngineError};
use crate::func::{FunctionInstance, FunctionKind, FunctionTypeId};
use crate::global::{GlobalInstance, eval_const_expr};
use crate::instance::{ExportInstance, InstantiationError, LinkError, ModuleInstance};
use crate::listener::{FunctionDefinition, FunctionListenerFactory};
use crate::memory::{DataInstance, MemoryInstance};
use crate::module::Module;
use crate::namespace::Namespace;
use crate::sync::RwLock;
use crate::sys::SysContext;
use crate::table::{ElementInstance, NULL_EXTERNREF, TableInitEntry, TableInstance};
use crate::trap::ElementOffsetOutOfBounds;
use anyhow::Result;
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use wasmcore_environ::{
    ConstExpr, DataMode, ElementMode, ExternKind, Features, FuncType, ImportDesc, RefType,
};

/// Owns the namespaces modules are instantiated into, the function type ids
/// shared by all of them, and the engine.
pub struct Store {
    features: Features,
    max_function_types: u32,
    engine: Arc<dyn Engine>,
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    namespaces: Vec<Arc<Namespace>>,
    type_ids: HashMap<FuncType, FunctionTypeId>,
}

/// Objects an instance imports, in index-space order.
#[derive(Default)]
struct Imports {
    functions: Vec<Arc<FunctionInstance>>,
    globals: Vec<Arc<GlobalInstance>>,
    tables: Vec<Arc<TableInstance>>,
    memory: Option<Arc<MemoryInstance>>,
}

impl Store {
    /// Creates a store with one namespace, available from
    /// [`Store::default_namespace`].
    pub fn new(config: &Config, engine: Arc<dyn Engine>) -> Store {
        Store {
            features: config.features,
            max_function_types: config.max_function_types,
            engine,
            inner: RwLock::new(StoreInner {
                namespaces: vec![Arc::new(Namespace::new())],
                type_ids: HashMap::new(),
            }),
        }
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The namespace created with the store.
    ///
    /// Once the store has been closed this is a fresh, empty namespace.
    pub fn default_namespace(&self) -> Arc<Namespace> {
        let mut inner = self.inner.write();
        if inner.namespaces.is_empty() {
            inner.namespaces.push(Arc::new(Namespace::new()));
        }
        inner.namespaces[0].clone()
    }

    /// Creates an empty namespace, closed along with the store.
    pub fn new_namespace(&self) -> Arc<Namespace> {
        let ns = Arc::new(Namespace::new());
        self.inner.write().namespaces.push(ns.clone());
        ns
    }

    /// Returns the id of each type, assigning ids to types not seen before.
    pub fn function_type_ids(
        &self,
        types: &[FuncType],
    ) -> Result<Vec<FunctionTypeId>, InstantiationError> {
        let mut inner = self.inner.write();
        let mut ids = Vec::with_capacity(types.len());
        for ty in types {
            if let Some(&id) = inner.type_ids.get(ty) {
                ids.push(id);
                continue;
            }
            let next = inner.type_ids.len() as u32;
            if next >= self.max_function_types {
                return Err(InstantiationError::TooManyTypes);
            }
            let id = FunctionTypeId(next);
            log::trace!("assigned {id:?} to {ty}");
            inner.type_ids.insert(ty.clone(), id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Instantiates `module` as `name` in `ns`, resolving its imports against
    /// the modules already published there.
    ///
    /// On success the instance is published under `name` and its call context
    /// returned. On failure nothing is published and `name` is free again,
    /// though memories and tables shared with other instances may already
    /// have been written.
    pub fn instantiate(
        &self,
        ctx: &Context,
        ns: &Arc<Namespace>,
        module: &Module,
        name: &str,
        sys: Option<Arc<SysContext>>,
        listener_factory: Option<&dyn FunctionListenerFactory>,
    ) -> Result<CallContext> {
        let env = module.env();
        let imported_names: HashSet<&str> = env.imports.iter().map(|i| i.module.as_str()).collect();
        let imported_modules = ns.require_modules(&imported_names)?;
        ns.require_module_name(name)?;

        log::debug!("instantiating module[{name}]");
        let instantiation = Instantiation {
            store: self,
            ctx,
            ns,
            module,
            name,
            sys,
            listener_factory,
        };
        match instantiation.run(&imported_modules) {
            Ok(call_ctx) => {
                ns.add_module(call_ctx.module().clone());
                log::debug!("instantiated module[{name}]");
                Ok(call_ctx)
            }
            Err(e) => {
                ns.delete_module(name);
                log::debug!("failed to instantiate module[{name}]: {e}");
                Err(e)
            }
        }
    }

    /// Closes every namespace in reverse creation order. The first error is
    /// returned, but all namespaces are closed.
    pub fn close_with_exit_code(&self, ctx: &Context, exit_code: u32) -> Result<()> {
        let namespaces = {
            let mut inner = self.inner.write();
            inner.type_ids.clear();
            std::mem::take(&mut inner.namespaces)
        };
        log::debug!("closing store with exit code {exit_code}");
        let mut result = Ok(());
        for ns in namespaces.iter().rev() {
            let closed = ns.close_with_exit_code(ctx, exit_code);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

struct Instantiation<'a> {
    store: &'a Store,
    ctx: &'a Context,
    ns: &'a Arc<Namespace>,
    module: &'a Module,
    name: &'a str,
    sys: Option<Arc<SysContext>>,
    listener_factory: Option<&'a dyn FunctionListenerFactory>,
}

impl Instantiation<'_> {
    fn run(self, modules: &HashMap<String, Arc<ModuleInstance>>) -> Result<CallContext> {
        let env = self.module.env();
        let features = self.store.features;
        let reference_types = features.contains(Features::REFERENCE_TYPES);

        let type_ids = self.store.function_type_ids(&env.types)?;
        let imports = self.resolve_imports(modules)?;

        // Tables, with the active element segments to write into them.
        let mut tables = imports.tables.clone();
        tables.extend(env.tables.iter().map(|&ty| Arc::new(TableInstance::new(ty))));
        let mut table_inits = Vec::new();
        for (segment_index, segment) in env.elements.iter().enumerate() {
            let ElementMode::Active {
                table_index,
                offset,
            } = &segment.mode
            else {
                continue;
            };
            let offset = eval_const_expr(offset, &imports.globals).0 as u32;
            if !reference_types {
                let fits = tables.get(*table_index as usize).is_some_and(|table| {
                    u64::from(offset) + segment.init.len() as u64 <= u64::from(table.size())
                });
                if !fits {
                    return Err(InstantiationError::ElementOutOfBounds(segment_index).into());
                }
            }
            table_inits.push(TableInitEntry {
                segment_index,
                table_index: *table_index,
                offset,
                function_indices: segment.init.clone(),
            });
        }

        let globals: Vec<Arc<GlobalInstance>> = env
            .globals
            .iter()
            .map(|g| Arc::new(GlobalInstance::from_const_expr(g.ty, &g.init, &imports.globals)))
            .collect();
        let funcref_globals: Vec<Arc<GlobalInstance>> = env
            .globals
            .iter()
            .zip(&globals)
            .filter(|(g, _)| matches!(g.init, ConstExpr::RefFunc(_)))
            .map(|(_, instance)| instance.clone())
            .collect();

        let memory = match (&imports.memory, env.memory) {
            (Some(imported), _) => Some(imported.clone()),
            (None, Some(ty)) => Some(Arc::new(MemoryInstance::new(ty))),
            (None, None) => None,
        };

        let data_instances = env
            .data
            .iter()
            .map(|d| match d.mode {
                DataMode::Passive => Arc::new(DataInstance::new(d.init.clone())),
                DataMode::Active { .. } => Arc::new(DataInstance::new(Vec::new())),
            })
            .collect();

        let num_imported = imports.functions.len();
        let instance = Arc::new_cyclic(|weak: &Weak<ModuleInstance>| {
            let mut functions = imports.functions.clone();
            functions.extend(self.build_functions(weak, &type_ids));
            let mut all_globals = imports.globals.clone();
            all_globals.extend(globals);
            let exports = build_exports(env, &functions, &all_globals, &tables, memory.as_ref());
            ModuleInstance {
                name: self.name.to_string(),
                imported_modules: modules.values().cloned().collect(),
                functions,
                globals: all_globals,
                memory,
                tables,
                types: env.types.clone(),
                type_ids,
                data_instances,
                element_instances: OnceLock::new(),
                exports,
                engine: OnceLock::new(),
                namespace: Arc::downgrade(self.ns),
                sys: self.sys.clone(),
                closed: Default::default(),
                code_closer: Mutex::new(None),
            }
        });

        // Before reference types, a segment that does not fit fails
        // instantiation without touching memory.
        if !reference_types {
            self.check_data(&instance)?;
        }

        self.store
            .engine
            .compile_module(self.module)
            .map_err(InstantiationError::Compilation)?;
        let module_engine = match self.store.engine.new_module_engine(
            self.name,
            self.module,
            &instance.functions[..num_imported],
            &instance.functions[num_imported..],
            &instance.tables,
            &table_inits,
        ) {
            Ok(engine) => engine,
            Err(NewModuleEngineError {
                engine: Some(engine),
                error,
            }) if error.downcast_ref::<ElementOffsetOutOfBounds>().is_some() => {
                log::warn!("module[{}]: {error}", self.name);
                engine
            }
            Err(NewModuleEngineError { error, .. }) => {
                return Err(InstantiationError::Compilation(error).into());
            }
        };

        let elements = env
            .elements
            .iter()
            .map(|segment| {
                Arc::new(match (&segment.mode, segment.ty) {
                    (ElementMode::Passive, RefType::FuncRef) => {
                        module_engine.create_func_element_instance(&segment.init)
                    }
                    (ElementMode::Passive, RefType::ExternRef) => ElementInstance::new(
                        RefType::ExternRef,
                        vec![NULL_EXTERNREF; segment.init.len()],
                    ),
                    _ => ElementInstance::empty(segment.ty),
                })
            })
            .collect();
        let _ = instance.element_instances.set(elements);
        module_engine.initialize_funcref_globals(&funcref_globals);
        let _ = instance.engine.set(module_engine);

        self.apply_data(&instance)?;

        let call_ctx = instance.call_context();
        if let Some(start) = env.start {
            let start_fn = instance
                .function(start)
                .ok_or_else(|| InstantiationError::Start {
                    func: env.func_desc(start),
                    source: anyhow::anyhow!("function index out of range"),
                })?;
            let result = start_fn
                .module()
                .and_then(|m| m.engine()?.call(self.ctx, &call_ctx, start_fn, &[]));
            if let Err(source) = result {
                return Err(InstantiationError::Start {
                    func: env.func_desc(start),
                    source,
                }
                .into());
            }
        }
        Ok(call_ctx)
    }

    fn resolve_imports(&self, modules: &HashMap<String, Arc<ModuleInstance>>) -> Result<Imports, LinkError> {
        let env = self.module.env();
        let mut imports = Imports::default();
        for (index, import) in env.imports.iter().enumerate() {
            let kind = import.desc.kind();
            let fail = |reason: String| LinkError::Import {
                index,
                kind,
                module: import.module.clone(),
                name: import.name.clone(),
                reason,
            };
            let instance = modules
                .get(&import.module)
                .ok_or_else(|| LinkError::ModuleNotInstantiated(import.module.clone()))?;
            let export = instance
                .get_export(&import.name, kind)
                .map_err(|e| fail(e.to_string()))?;

            match (&import.desc, export) {
                (ImportDesc::Func(type_index), ExportInstance::Function(f)) => {
                    let expected = env
                        .types
                        .get(*type_index as usize)
                        .ok_or_else(|| fail("function type out of range".to_string()))?;
                    let actual = f.ty();
                    if !expected.equals_signature(actual.params(), actual.results()) {
                        return Err(fail(format!("signature mismatch: {expected} != {actual}")));
                    }
                    imports.functions.push(f.clone());
                }
                (ImportDesc::Table(expected), ExportInstance::Table(table)) => {
                    if expected.element != table.element_type() {
                        return Err(fail(format!(
                            "table type mismatch: {} != {}",
                            expected.element,
                            table.element_type()
                        )));
                    }
                    let size = table.size();
                    if expected.min > size {
                        return Err(fail(format!(
                            "minimum size mismatch: {} > {size}",
                            expected.min
                        )));
                    }
                    if let Some(expected_max) = expected.max {
                        match table.max() {
                            None => {
                                return Err(fail(format!(
                                    "maximum size mismatch: {expected_max}, but actual has no max"
                                )));
                            }
                            Some(max) if expected_max < max => {
                                return Err(fail(format!(
                                    "maximum size mismatch: {expected_max} < {max}"
                                )));
                            }
                            Some(_) => {}
                        }
                    }
                    imports.tables.push(table.clone());
                }
                (ImportDesc::Memory(expected), ExportInstance::Memory(memory)) => {
                    let pages = memory.size();
                    if expected.min > pages {
                        return Err(fail(format!(
                            "minimum size mismatch: {} > {pages}",
                            expected.min
                        )));
                    }
                    let expected_max = expected.maximum_pages();
                    if expected_max < memory.max() {
                        return Err(fail(format!(
                            "maximum size mismatch: {expected_max} < {}",
                            memory.max()
                        )));
                    }
                    imports.memory = Some(memory.clone());
                }
                (ImportDesc::Global(expected), ExportInstance::Global(global)) => {
                    let actual = global.ty();
                    if expected.mutability != actual.mutability {
                        return Err(fail(format!(
                            "mutability mismatch: {:?} != {:?}",
                            expected.mutability, actual.mutability
                        )));
                    }
                    if expected.content != actual.content {
                        return Err(fail(format!(
                            "value type mismatch: {} != {}",
                            expected.content, actual.content
                        )));
                    }
                    imports.globals.push(global.clone());
                }
                _ => unreachable!("get_export checked the export kind"),
            }
        }
        Ok(imports)
    }

    fn build_functions(
        &self,
        module: &Weak<ModuleInstance>,
        type_ids: &[FunctionTypeId],
    ) -> Vec<Arc<FunctionInstance>> {
        let env = self.module.env();
        let names = env.names.as_ref();
        let first = env.num_imported_functions();
        let host_functions = self.module.host_functions();

        env.functions
            .iter()
            .enumerate()
            .map(|(i, &type_index)| {
                let index = first + i as u32;
                let func_type = env.types[type_index as usize].clone();
                let func_name = names
                    .and_then(|n| n.func_name(index))
                    .unwrap_or_default()
                    .to_string();
                let debug_name = if func_name.is_empty() {
                    format!("{}.${index}", self.name)
                } else {
                    format!("{}.{func_name}", self.name)
                };
                let definition = FunctionDefinition {
                    module_name: self.name.to_string(),
                    index,
                    name: func_name,
                    debug_name,
                    export_names: env
                        .exports
                        .iter()
                        .filter(|e| e.kind == ExternKind::Func && e.index == index)
                        .map(|e| e.name.clone())
                        .collect(),
                    param_names: names
                        .and_then(|n| n.param_names(index, func_type.params().len())),
                    func_type,
                };
                let kind = match host_functions.get(i) {
                    Some(host) => FunctionKind::Host(host.clone()),
                    None => {
                        let code = &env.code[i];
                        FunctionKind::Wasm {
                            locals: code.locals.clone(),
                            body: code.body.clone(),
                        }
                    }
                };
                let listener = self
                    .listener_factory
                    .and_then(|factory| factory.new_listener(&definition));
                Arc::new(FunctionInstance::new(
                    kind,
                    definition,
                    type_ids[type_index as usize],
                    module.clone(),
                    listener,
                ))
            })
            .collect()
    }

    fn active_data(&self, instance: &ModuleInstance) -> impl Iterator<Item = (usize, u32, &[u8])> {
        let globals = instance.globals();
        self.module
            .env()
            .data
            .iter()
            .enumerate()
            .filter_map(move |(i, d)| match &d.mode {
                DataMode::Active { offset, .. } => {
                    Some((i, eval_const_expr(offset, globals).0 as u32, d.init.as_slice()))
                }
                DataMode::Passive => None,
            })
    }

    fn check_data(&self, instance: &ModuleInstance) -> Result<(), InstantiationError> {
        let len = instance.memory().map_or(0, |m| m.byte_len());
        for (i, offset, bytes) in self.active_data(instance) {
            if u64::from(offset) + bytes.len() as u64 > len {
                return Err(InstantiationError::DataOutOfBounds(i));
            }
        }
        Ok(())
    }

    /// Copies active data segments into memory, stopping at the first one out
    /// of bounds. Segments before it stay written.
    fn apply_data(&self, instance: &ModuleInstance) -> Result<(), InstantiationError> {
        for (i, offset, bytes) in self.active_data(instance) {
            let written = instance.memory().is_some_and(|m| m.write(offset, bytes));
            if !written {
                return Err(InstantiationError::DataOutOfBounds(i));
            }
        }
        Ok(())
    }
}

fn build_exports(
    env: &wasmcore_environ::Module,
    functions: &[Arc<FunctionInstance>],
    globals: &[Arc<GlobalInstance>],
    tables: &[Arc<TableInstance>],
    memory: Option<&Arc<MemoryInstance>>,
) -> HashMap<String, ExportInstance> {
    env.exports
        .iter()
        .filter_map(|export| {
            let index = export.index as usize;
            let instance = match export.kind {
                ExternKind::Func => ExportInstance::Function(functions.get(index)?.clone()),
                ExternKind::Global => ExportInstance::Global(globals.get(index)?.clone()),
                ExternKind::Table => ExportInstance::Table(tables.get(index)?.clone()),
                ExternKind::Memory => ExportInstance::Memory(memory?.clone()),
            };
            Some((export.name.clone(), instance))
        })
        .collect()
}
