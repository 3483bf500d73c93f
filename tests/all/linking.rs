use crate::support::*;
use anyhow::Result;
use wasmcore::environ::{self, Import, ImportDesc, opcode};
use wasmcore::*;

fn identity() -> environ::Module {
    single_function(
        FuncType::new([ValType::I32], [ValType::I32]),
        &[opcode::LOCAL_GET, 0, opcode::END],
    )
}

fn import(module: &str, name: &str, desc: ImportDesc) -> Import {
    Import {
        module: module.to_string(),
        name: name.to_string(),
        desc,
    }
}

#[test]
fn import_signature_mismatch() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    instantiate(&store, &config, identity(), "a")?;

    let b = environ::Module {
        types: vec![FuncType::new([ValType::I64], [ValType::I32])],
        imports: vec![import("a", "f", ImportDesc::Func(0))],
        ..environ::Module::default()
    };
    let err = instantiate(&store, &config, b, "b").unwrap_err();
    assert_eq!(
        err.downcast_ref::<LinkError>(),
        Some(&LinkError::Import {
            index: 0,
            kind: ExternKind::Func,
            module: "a".to_string(),
            name: "f".to_string(),
            reason: "signature mismatch: (i64) -> (i32) != (i32) -> (i32)".to_string(),
        })
    );
    assert_eq!(
        err.to_string(),
        "import[0] func[a.f]: signature mismatch: (i64) -> (i32) != (i32) -> (i32)"
    );
    assert!(store.default_namespace().module("b").is_none());
    Ok(())
}

#[test]
fn unresolved_imports() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let importer = |module: &str, name: &str, desc: ImportDesc| environ::Module {
        types: vec![FuncType::new([ValType::I32], [ValType::I32])],
        imports: vec![import(module, name, desc)],
        ..environ::Module::default()
    };

    let err = instantiate(&store, &config, importer("a", "f", ImportDesc::Func(0)), "b")
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<LinkError>(),
        Some(&LinkError::ModuleNotInstantiated("a".to_string()))
    );

    instantiate(&store, &config, identity(), "a")?;
    let err = instantiate(&store, &config, importer("a", "g", ImportDesc::Func(0)), "b")
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "import[0] func[a.g]: \"g\" is not exported in module \"a\""
    );

    let memory = ImportDesc::Memory(MemoryType::new(1, None));
    let err = instantiate(&store, &config, importer("a", "f", memory), "b").unwrap_err();
    assert_eq!(
        err.to_string(),
        "import[0] memory[a.f]: export \"f\" in module \"a\" is a func, not a memory"
    );
    Ok(())
}

#[test]
fn calls_across_modules() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    instantiate(&store, &config, identity(), "a")?;

    // (func $g (param i32) (result i32) local.get 0 call $a.f i32.const 1 i32.add)
    let b = environ::Module {
        types: vec![FuncType::new([ValType::I32], [ValType::I32])],
        imports: vec![import("a", "f", ImportDesc::Func(0))],
        functions: vec![0],
        code: vec![code(
            &[],
            &[
                opcode::LOCAL_GET,
                0,
                opcode::CALL,
                0,
                opcode::I32_CONST,
                1,
                opcode::I32_ADD,
                opcode::END,
            ],
        )],
        exports: vec![
            export("g", ExternKind::Func, 1),
            export("f", ExternKind::Func, 0),
        ],
        ..environ::Module::default()
    };
    let b = instantiate(&store, &config, b, "b")?;
    assert_eq!(call(&b, "g", &[41])?, [42]);

    // A re-exported import runs with the importing module's context.
    let f = b.exported_function("f").unwrap();
    assert_eq!(f.definition().module_name(), "a");
    assert_eq!(f.call(&Context::default(), &[7])?, [7]);

    let ns = store.default_namespace();
    assert_eq!(ns.module_names(), ["a", "b"]);
    Ok(())
}

#[test]
fn importer_outlives_closed_exporter() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    drop(instantiate(&store, &config, identity(), "a")?);

    // (func $g (param i32) (result i32) local.get 0 call $a.f)
    let b = environ::Module {
        types: vec![FuncType::new([ValType::I32], [ValType::I32])],
        imports: vec![import("a", "f", ImportDesc::Func(0))],
        functions: vec![0],
        code: vec![code(&[], &[opcode::LOCAL_GET, 0, opcode::CALL, 0, opcode::END])],
        exports: vec![export("g", ExternKind::Func, 1)],
        ..environ::Module::default()
    };
    let b = instantiate(&store, &config, b, "b")?;

    let ns = store.default_namespace();
    let a = ns.module("a").unwrap();
    let weak_a = std::sync::Arc::downgrade(a.module());
    a.close(&Context::default())?;
    drop(a);
    assert!(ns.module("a").is_none());
    assert_eq!(ns.module_names(), ["b"]);

    // `b` still holds `a`, so its imported function keeps working.
    assert!(weak_a.upgrade().is_some_and(|a| a.is_closed()));
    assert_eq!(call(&b, "g", &[7])?, [7]);

    b.close(&Context::default())?;
    drop(b);
    assert!(weak_a.upgrade().is_none());
    Ok(())
}

#[test]
fn imported_globals_and_memories() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);

    let mut builder = HostModuleBuilder::new("env");
    builder
        .memory("memory", 1, Some(4))
        .global("base", Val::I32(16));
    let env = builder.build(&config)?;
    store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &env,
        "env",
        None,
        None,
    )?;

    let user = environ::Module {
        imports: vec![
            import("env", "memory", ImportDesc::Memory(MemoryType::new(1, Some(4)))),
            import(
                "env",
                "base",
                ImportDesc::Global(GlobalType::new(ValType::I32, Mutability::Const)),
            ),
        ],
        data: vec![environ::DataSegment {
            mode: environ::DataMode::Active {
                memory_index: 0,
                offset: environ::ConstExpr::GlobalGet(0),
            },
            init: b"hi".to_vec(),
        }],
        ..environ::Module::default()
    };
    let user = instantiate(&store, &config, user, "user")?;
    let memory = user.memory().unwrap();
    assert_eq!(memory.read(16, 2).as_deref(), Some(&b"hi"[..]));

    // An import may not promise a tighter maximum than the export has.
    let strict = environ::Module {
        imports: vec![import(
            "env",
            "memory",
            ImportDesc::Memory(MemoryType::new(1, Some(2))),
        )],
        ..environ::Module::default()
    };
    let err = instantiate(&store, &config, strict, "strict").unwrap_err();
    assert_eq!(
        err.to_string(),
        "import[0] memory[env.memory]: maximum size mismatch: 2 < 4"
    );

    let mutable = environ::Module {
        imports: vec![import(
            "env",
            "base",
            ImportDesc::Global(GlobalType::new(ValType::I32, Mutability::Var)),
        )],
        ..environ::Module::default()
    };
    let err = instantiate(&store, &config, mutable, "mutable").unwrap_err();
    assert_eq!(
        err.to_string(),
        "import[0] global[env.base]: mutability mismatch: Var != Const"
    );
    Ok(())
}
