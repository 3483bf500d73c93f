//! The decoded, uninstantiated module image.

use crate::validate::{FuncValidator, ModuleContext, ValidationError};
use crate::{
    ConstExpr, ExternKind, Features, FuncType, GlobalType, MemoryType, RefType, TableType,
    ValType, WASM32_MAX_PAGES,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// An error found while validating a module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("invalid {section} section: {message}")]
    Section {
        section: &'static str,
        message: String,
    },
    #[error(transparent)]
    Function(#[from] ValidationError),
}

fn section_error(section: &'static str, message: impl Into<String>) -> ModuleError {
    ModuleError::Section {
        section,
        message: message.into(),
    }
}

/// What an import brings into the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportDesc {
    /// A function with the given type index.
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl ImportDesc {
    pub fn kind(&self) -> ExternKind {
        match self {
            ImportDesc::Func(_) => ExternKind::Func,
            ImportDesc::Table(_) => ExternKind::Table,
            ImportDesc::Memory(_) => ExternKind::Memory,
            ImportDesc::Global(_) => ExternKind::Global,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// A global defined by the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementMode {
    /// Copied into a table at instantiation.
    Active { table_index: u32, offset: ConstExpr },
    /// Kept around for `table.init`.
    Passive,
    /// Only forward-declares functions for `ref.func`.
    Declarative,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementSegment {
    pub ty: RefType,
    pub mode: ElementMode,
    /// Function indices, with `None` for a null reference.
    pub init: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataMode {
    Active { memory_index: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSegment {
    pub mode: DataMode,
    pub init: Vec<u8>,
}

/// The locals and instructions of a function defined in the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionBody {
    /// Types of the declared locals, not including parameters.
    pub locals: Vec<ValType>,
    /// Instruction bytes, ending with `end`.
    pub body: Vec<u8>,
}

/// Debug names carried by the custom `name` section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NameSection {
    pub module_name: Option<String>,
    pub function_names: BTreeMap<u32, String>,
    /// Local names per function index. Parameters come first.
    pub local_names: BTreeMap<u32, BTreeMap<u32, String>>,
}

impl NameSection {
    pub fn func_name(&self, index: u32) -> Option<&str> {
        self.function_names.get(&index).map(String::as_str)
    }

    /// Returns the names of the first `count` locals of a function, but only
    /// if every one of them is named.
    pub fn param_names(&self, index: u32, count: usize) -> Option<Vec<String>> {
        if count == 0 {
            return None;
        }
        let locals = self.local_names.get(&index)?;
        (0..count as u32)
            .map(|i| locals.get(&i).cloned())
            .collect()
    }
}

/// A decoded module: immutable once built and validated.
///
/// Index spaces place imported items before the ones the module defines.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index of each function defined by the module.
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memory: Option<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub code: Vec<FunctionBody>,
    pub data_count: Option<u32>,
    pub names: Option<NameSection>,
    /// Content hash assigned by [`Module::assign_id`].
    pub id: [u8; 32],
}

impl Module {
    pub fn imported_functions(&self) -> impl Iterator<Item = u32> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Func(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn imported_globals(&self) -> impl Iterator<Item = GlobalType> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Global(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn imported_tables(&self) -> impl Iterator<Item = TableType> + '_ {
        self.imports.iter().filter_map(|i| match i.desc {
            ImportDesc::Table(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn imported_memory(&self) -> Option<MemoryType> {
        self.imports.iter().find_map(|i| match i.desc {
            ImportDesc::Memory(ty) => Some(ty),
            _ => None,
        })
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.imported_functions().count() as u32
    }

    pub fn num_imported_globals(&self) -> u32 {
        self.imported_globals().count() as u32
    }

    /// Size of the function index space.
    pub fn num_functions(&self) -> u32 {
        self.num_imported_functions() + self.functions.len() as u32
    }

    /// Type index of every function in the function index space.
    pub fn function_type_indices(&self) -> Vec<u32> {
        self.imported_functions()
            .chain(self.functions.iter().copied())
            .collect()
    }

    /// The type of the function at `index` in the function index space.
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let imported = self.num_imported_functions();
        let ty = if index < imported {
            self.imported_functions().nth(index as usize)?
        } else {
            *self.functions.get((index - imported) as usize)?
        };
        self.types.get(ty as usize)
    }

    pub fn global_types(&self) -> Vec<GlobalType> {
        self.imported_globals()
            .chain(self.globals.iter().map(|g| g.ty))
            .collect()
    }

    pub fn table_types(&self) -> Vec<TableType> {
        self.imported_tables()
            .chain(self.tables.iter().copied())
            .collect()
    }

    /// The memory visible to the module, whether imported or defined.
    pub fn memory_type(&self) -> Option<MemoryType> {
        self.imported_memory().or(self.memory)
    }

    /// Describes the function at `index` for error messages, preferring its
    /// debug name.
    pub fn func_desc(&self, index: u32) -> String {
        match self.names.as_ref().and_then(|n| n.func_name(index)) {
            Some(name) => format!("${name}"),
            None => format!("function[{index}]"),
        }
    }

    /// Computes the content hash engines use to key compiled code.
    pub fn assign_id(&mut self) {
        let mut hasher = Sha256::new();
        let sections = format!(
            "{:?}{:?}{:?}{:?}{:?}{:?}{:?}{:?}{:?}{:?}{:?}{:?}",
            self.types,
            self.imports,
            self.functions,
            self.tables,
            self.memory,
            self.globals,
            self.exports,
            self.start,
            self.elements,
            self.data,
            self.code,
            self.data_count,
        );
        hasher.update(sections.as_bytes());
        self.id = hasher.finalize().into();
    }

    /// Functions that `ref.func` may name: those in element segments, exports
    /// and global initializers.
    pub fn declared_functions(&self) -> HashSet<u32> {
        let mut set = HashSet::new();
        for segment in &self.elements {
            set.extend(segment.init.iter().flatten().copied());
        }
        for export in &self.exports {
            if export.kind == ExternKind::Func {
                set.insert(export.index);
            }
        }
        for global in &self.globals {
            if let ConstExpr::RefFunc(index) = global.init {
                set.insert(index);
            }
        }
        set
    }

    /// Validates the module's sections and every function body.
    pub fn validate(&self, features: Features, max_stack_values: u32) -> Result<(), ModuleError> {
        self.validate_types(features)?;
        self.validate_imports(features)?;
        self.validate_functions()?;
        self.validate_memory()?;
        self.validate_tables(features)?;
        self.validate_globals(features)?;
        self.validate_exports(features)?;
        self.validate_start()?;
        self.validate_elements(features)?;
        self.validate_data(features)?;
        self.validate_code(features, max_stack_values)?;
        log::debug!(
            "validated module with {} functions and {} imports",
            self.functions.len(),
            self.imports.len()
        );
        Ok(())
    }

    /// Validates a module whose functions are provided by the host and so
    /// have no code section.
    pub fn validate_host(&self, features: Features) -> Result<(), ModuleError> {
        self.validate_types(features)?;
        self.validate_memory()?;
        self.validate_globals(features)?;
        self.validate_exports(features)
    }

    fn validate_types(&self, features: Features) -> Result<(), ModuleError> {
        for (i, ty) in self.types.iter().enumerate() {
            if ty.results().len() > 1 {
                if let Err(e) = features.require(Features::MULTI_VALUE) {
                    return Err(section_error(
                        "type",
                        format!("type[{i}]: multiple result types invalid as {e}"),
                    ));
                }
            }
            for &vt in ty.params().iter().chain(ty.results()) {
                require_value_type(features, vt)
                    .map_err(|e| section_error("type", format!("type[{i}]: {e}")))?;
            }
        }
        Ok(())
    }

    fn validate_imports(&self, features: Features) -> Result<(), ModuleError> {
        for (i, import) in self.imports.iter().enumerate() {
            match &import.desc {
                ImportDesc::Func(ty) => {
                    if *ty as usize >= self.types.len() {
                        return Err(section_error(
                            "import",
                            format!("import[{i}] invalid as type index out of range: {ty}"),
                        ));
                    }
                }
                ImportDesc::Global(ty) => {
                    if ty.is_mutable() {
                        if let Err(e) = features.require(Features::MUTABLE_GLOBAL) {
                            return Err(section_error(
                                "import",
                                format!("import[{i}] global[{}.{}]: {e}", import.module, import.name),
                            ));
                        }
                    }
                }
                ImportDesc::Table(_) | ImportDesc::Memory(_) => {}
            }
        }
        Ok(())
    }

    fn validate_functions(&self) -> Result<(), ModuleError> {
        if self.functions.len() != self.code.len() {
            return Err(section_error(
                "code",
                format!(
                    "code count ({}) != function count ({})",
                    self.code.len(),
                    self.functions.len()
                ),
            ));
        }
        for (i, &ty) in self.functions.iter().enumerate() {
            if ty as usize >= self.types.len() {
                return Err(section_error(
                    "function",
                    format!("function[{i}] has invalid type index {ty}"),
                ));
            }
        }
        Ok(())
    }

    fn validate_memory(&self) -> Result<(), ModuleError> {
        if self.imported_memory().is_some() && self.memory.is_some() {
            return Err(section_error("memory", "at most one memory allowed in module"));
        }
        let Some(memory) = self.memory_type() else {
            return Ok(());
        };
        if memory.min > WASM32_MAX_PAGES {
            return Err(section_error(
                "memory",
                format!(
                    "min {} pages over limit of {WASM32_MAX_PAGES} pages",
                    memory.min
                ),
            ));
        }
        if let Some(max) = memory.max {
            if max > WASM32_MAX_PAGES {
                return Err(section_error(
                    "memory",
                    format!("max {max} pages over limit of {WASM32_MAX_PAGES} pages"),
                ));
            }
            if memory.min > max {
                return Err(section_error(
                    "memory",
                    format!("min {} pages > max {max} pages", memory.min),
                ));
            }
        }
        Ok(())
    }

    fn validate_tables(&self, features: Features) -> Result<(), ModuleError> {
        let tables = self.table_types();
        if tables.len() > 1 {
            if let Err(e) = features.require(Features::REFERENCE_TYPES) {
                return Err(section_error("table", format!("multiple tables invalid as {e}")));
            }
        }
        for (i, table) in tables.iter().enumerate() {
            if table.element == RefType::ExternRef {
                if let Err(e) = features.require(Features::REFERENCE_TYPES) {
                    return Err(section_error("table", format!("table[{i}]: {e}")));
                }
            }
            if let Some(max) = table.max {
                if table.min > max {
                    return Err(section_error(
                        "table",
                        format!("table[{i}] min {} > max {max}", table.min),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_globals(&self, features: Features) -> Result<(), ModuleError> {
        let imported: Vec<GlobalType> = self.imported_globals().collect();
        let num_functions = self.num_functions();
        for (i, global) in self.globals.iter().enumerate() {
            require_value_type(features, global.ty.content)
                .map_err(|e| section_error("global", format!("global[{i}]: {e}")))?;
            global
                .init
                .validate(global.ty.content, features, &imported, num_functions)
                .map_err(|e| section_error("global", format!("global[{i}]: {e}")))?;
        }
        Ok(())
    }

    fn validate_exports(&self, features: Features) -> Result<(), ModuleError> {
        let mut names = HashSet::new();
        let globals = self.global_types();
        for export in &self.exports {
            if !names.insert(export.name.as_str()) {
                return Err(section_error(
                    "export",
                    format!("export[{}] duplicates name", export.name),
                ));
            }
            let count = match export.kind {
                ExternKind::Func => self.num_functions() as usize,
                ExternKind::Table => self.table_types().len(),
                ExternKind::Memory => usize::from(self.memory_type().is_some()),
                ExternKind::Global => globals.len(),
            };
            if export.index as usize >= count {
                return Err(section_error(
                    "export",
                    format!(
                        "unknown {} for export[{}]: index {}",
                        export.kind, export.name, export.index
                    ),
                ));
            }
            if export.kind == ExternKind::Global && globals[export.index as usize].is_mutable() {
                if let Err(e) = features.require(Features::MUTABLE_GLOBAL) {
                    return Err(section_error(
                        "export",
                        format!("export[{}] global: {e}", export.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_start(&self) -> Result<(), ModuleError> {
        let Some(index) = self.start else {
            return Ok(());
        };
        match self.func_type(index) {
            None => Err(section_error(
                "start",
                format!("invalid start function: func[{index}] has an invalid type"),
            )),
            Some(ty) if !ty.params().is_empty() || !ty.results().is_empty() => Err(section_error(
                "start",
                format!("invalid start function: func[{index}] has an invalid type: {ty}"),
            )),
            Some(_) => Ok(()),
        }
    }

    fn validate_elements(&self, features: Features) -> Result<(), ModuleError> {
        let tables = self.table_types();
        let imported: Vec<GlobalType> = self.imported_globals().collect();
        let num_functions = self.num_functions();
        for (i, segment) in self.elements.iter().enumerate() {
            if segment.ty == RefType::ExternRef {
                if let Err(e) = features.require(Features::REFERENCE_TYPES) {
                    return Err(section_error("element", format!("element[{i}]: {e}")));
                }
            }
            match &segment.mode {
                ElementMode::Active {
                    table_index,
                    offset,
                } => {
                    let Some(table) = tables.get(*table_index as usize) else {
                        return Err(section_error(
                            "element",
                            format!("element[{i}] table index out of range: {table_index}"),
                        ));
                    };
                    if table.element != segment.ty {
                        return Err(section_error(
                            "element",
                            format!(
                                "element[{i}] type mismatch: table has {} but segment has {}",
                                table.element, segment.ty
                            ),
                        ));
                    }
                    offset
                        .validate(ValType::I32, features, &imported, num_functions)
                        .map_err(|e| section_error("element", format!("element[{i}]: {e}")))?;
                }
                ElementMode::Passive => {
                    if let Err(e) = features.require(Features::BULK_MEMORY_OPERATIONS) {
                        return Err(section_error("element", format!("element[{i}]: {e}")));
                    }
                }
                ElementMode::Declarative => {
                    if let Err(e) = features.require(Features::REFERENCE_TYPES) {
                        return Err(section_error("element", format!("element[{i}]: {e}")));
                    }
                }
            }
            if let Some(index) = segment.init.iter().flatten().find(|&&f| f >= num_functions) {
                return Err(section_error(
                    "element",
                    format!("element[{i}] function index out of range: {index}"),
                ));
            }
        }
        Ok(())
    }

    fn validate_data(&self, features: Features) -> Result<(), ModuleError> {
        if let Some(count) = self.data_count {
            if count as usize != self.data.len() {
                return Err(section_error(
                    "data",
                    format!(
                        "data count section ({count}) doesn't match the length of data section ({})",
                        self.data.len()
                    ),
                ));
            }
        }
        let imported: Vec<GlobalType> = self.imported_globals().collect();
        let num_functions = self.num_functions();
        for (i, segment) in self.data.iter().enumerate() {
            match &segment.mode {
                DataMode::Active {
                    memory_index,
                    offset,
                } => {
                    if self.memory_type().is_none() || *memory_index != 0 {
                        return Err(section_error(
                            "data",
                            format!("data[{i}] unknown memory {memory_index}"),
                        ));
                    }
                    offset
                        .validate(ValType::I32, features, &imported, num_functions)
                        .map_err(|e| section_error("data", format!("data[{i}]: {e}")))?;
                }
                DataMode::Passive => {
                    if let Err(e) = features.require(Features::BULK_MEMORY_OPERATIONS) {
                        return Err(section_error("data", format!("data[{i}]: {e}")));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_code(&self, features: Features, max_stack_values: u32) -> Result<(), ModuleError> {
        let functions = self.function_type_indices();
        let globals = self.global_types();
        let tables = self.table_types();
        let elements: Vec<RefType> = self.elements.iter().map(|e| e.ty).collect();
        let declared_functions = self.declared_functions();
        let context = ModuleContext {
            types: &self.types,
            functions: &functions,
            globals: &globals,
            memory: self.memory_type(),
            tables: &tables,
            elements: &elements,
            data_count: self.data_count,
            declared_functions: &declared_functions,
        };
        let imported = self.num_imported_functions();
        for (i, (&ty, code)) in self.functions.iter().zip(&self.code).enumerate() {
            let ty = &self.types[ty as usize];
            FuncValidator::new(
                &context,
                features,
                max_stack_values,
                imported + i as u32,
                ty,
                &code.locals,
                &code.body,
            )
            .validate()?;
        }
        Ok(())
    }
}

fn require_value_type(features: Features, ty: ValType) -> Result<(), crate::FeatureError> {
    match ty {
        ValType::V128 => features.require(Features::SIMD),
        ValType::FuncRef | ValType::ExternRef => features.require(Features::REFERENCE_TYPES),
        _ => Ok(()),
    }
}
