//! A small reference interpreter behind the engine traits, and helpers to
//! assemble modules by hand.

mod interp;

pub use interp::{Interpreter, MAX_CALL_DEPTH};

use anyhow::Result;
use std::sync::Arc;
use wasmcore::environ::{self, Export, FunctionBody};
use wasmcore::*;

/// A store over a fresh interpreter.
pub fn store(config: &Config) -> (Store, Arc<Interpreter>) {
    let _ = env_logger::try_init();
    let engine = Arc::new(Interpreter::default());
    (Store::new(config, engine.clone()), engine)
}

/// Validates `env` and instantiates it as `name` in the store's default
/// namespace.
pub fn instantiate(
    store: &Store,
    config: &Config,
    env: environ::Module,
    name: &str,
) -> Result<CallContext> {
    let module = Module::new(config, env)?;
    store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &module,
        name,
        None,
        None,
    )
}

pub fn code(locals: &[ValType], body: &[u8]) -> FunctionBody {
    FunctionBody {
        locals: locals.to_vec(),
        body: body.to_vec(),
    }
}

pub fn export(name: &str, kind: ExternKind, index: u32) -> Export {
    Export {
        name: name.to_string(),
        kind,
        index,
    }
}

/// A module exporting one function `f` of type `ty` with the given body.
pub fn single_function(ty: FuncType, body: &[u8]) -> environ::Module {
    environ::Module {
        types: vec![ty],
        functions: vec![0],
        code: vec![code(&[], body)],
        exports: vec![export("f", ExternKind::Func, 0)],
        ..environ::Module::default()
    }
}

/// Calls the export `name` with the given slots.
pub fn call(module: &CallContext, name: &str, params: &[u64]) -> Result<Vec<u64>> {
    let f = module
        .exported_function(name)
        .ok_or_else(|| anyhow::anyhow!("{name:?} is not exported"))?;
    f.call(&Context::default(), params)
}
