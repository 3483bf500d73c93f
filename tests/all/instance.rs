use crate::support::*;
use anyhow::Result;
use wasmcore::environ::{self, ConstExpr, opcode};
use wasmcore::*;

pub fn add_module() -> environ::Module {
    single_function(
        FuncType::new([ValType::I32, ValType::I32], [ValType::I32]),
        &[
            opcode::LOCAL_GET,
            0,
            opcode::LOCAL_GET,
            1,
            opcode::I32_ADD,
            opcode::END,
        ],
    )
}

#[test]
fn add() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let module = instantiate(&store, &config, add_module(), "math")?;
    assert_eq!(call(&module, "f", &[2, 3])?, [5]);
    assert_eq!(call(&module, "f", &[u64::from(u32::MAX), 2])?, [1]);

    let f = module.exported_function("f").unwrap();
    assert_eq!(f.param_types(), [ValType::I32, ValType::I32]);
    assert_eq!(f.result_types(), [ValType::I32]);
    assert_eq!(f.definition().debug_name(), "math.$0");
    Ok(())
}

#[test]
fn duplicate_name() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    instantiate(&store, &config, add_module(), "math")?;
    let err = instantiate(&store, &config, add_module(), "math").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InstantiationError>(),
        Some(InstantiationError::NameTaken(name)) if name == "math"
    ));
    assert_eq!(err.to_string(), "module[math] has already been instantiated");
    assert_eq!(store.default_namespace().module_names(), ["math"]);

    // Names only need to be unique within a namespace.
    let other = store.new_namespace();
    let module = Module::new(&config, add_module())?;
    store.instantiate(&Context::default(), &other, &module, "math", None, None)?;
    assert_eq!(other.module_names(), ["math"]);
    Ok(())
}

#[test]
fn start_runs_before_publishing() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let env = environ::Module {
        types: vec![FuncType::default()],
        functions: vec![0],
        globals: vec![environ::Global {
            ty: GlobalType::new(ValType::I32, Mutability::Var),
            init: ConstExpr::I32(0),
        }],
        code: vec![code(
            &[],
            &[opcode::I32_CONST, 42, opcode::GLOBAL_SET, 0, opcode::END],
        )],
        exports: vec![export("g", ExternKind::Global, 0)],
        start: Some(0),
        ..environ::Module::default()
    };
    let module = instantiate(&store, &config, env, "init")?;
    let g = module.exported_global("g").unwrap();
    assert_eq!(g.get(), 42);
    assert_eq!(g.val(), Some(Val::I32(42)));
    Ok(())
}

#[test]
fn start_trap_releases_name() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let mut env = environ::Module {
        types: vec![FuncType::default()],
        functions: vec![0],
        code: vec![code(&[], &[opcode::UNREACHABLE, opcode::END])],
        start: Some(0),
        ..environ::Module::default()
    };
    let err = instantiate(&store, &config, env.clone(), "boom").unwrap_err();
    assert_eq!(err.to_string(), "start function[0] failed: unreachable");
    assert!(
        err.chain()
            .any(|e| e.downcast_ref::<Trap>() == Some(&Trap::Unreachable))
    );

    let ns = store.default_namespace();
    assert!(ns.module("boom").is_none());
    assert!(ns.module_names().is_empty());

    env.start = None;
    instantiate(&store, &config, env, "boom")?;
    assert!(ns.module("boom").is_some());
    Ok(())
}

#[test]
fn modules_share_function_type_ids() -> Result<()> {
    let config = Config::new();
    let (store, engine) = store(&config);
    let a = instantiate(&store, &config, add_module(), "a")?;
    let b = instantiate(&store, &config, add_module(), "b")?;
    assert_eq!(a.module().type_ids(), b.module().type_ids());

    // Identical images compile once.
    assert_eq!(engine.compiled_module_count(), 1);
    Ok(())
}
