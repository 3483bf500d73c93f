use crate::support::*;
use anyhow::Result;
use wasmcore::environ::{self, opcode};
use wasmcore::*;

/// Exports `grow`, `size`, `load8` and `store8` over a memory of `min..=max`
/// pages.
fn memory_module(min: u32, max: Option<u32>) -> environ::Module {
    let i32_i32 = FuncType::new([ValType::I32], [ValType::I32]);
    let store_ty = FuncType::new([ValType::I32, ValType::I32], []);
    let size_ty = FuncType::new([], [ValType::I32]);
    environ::Module {
        types: vec![i32_i32, store_ty, size_ty],
        functions: vec![0, 2, 0, 1],
        memory: Some(MemoryType::new(min, max)),
        code: vec![
            code(&[], &[opcode::LOCAL_GET, 0, opcode::MEMORY_GROW, 0, opcode::END]),
            code(&[], &[opcode::MEMORY_SIZE, 0, opcode::END]),
            code(
                &[],
                &[opcode::LOCAL_GET, 0, opcode::I32_LOAD8_U, 0, 0, opcode::END],
            ),
            code(
                &[],
                &[
                    opcode::LOCAL_GET,
                    0,
                    opcode::LOCAL_GET,
                    1,
                    opcode::I32_STORE8,
                    0,
                    0,
                    opcode::END,
                ],
            ),
        ],
        exports: vec![
            export("grow", ExternKind::Func, 0),
            export("size", ExternKind::Func, 1),
            export("load8", ExternKind::Func, 2),
            export("store8", ExternKind::Func, 3),
            export("memory", ExternKind::Memory, 0),
        ],
        ..environ::Module::default()
    }
}

#[test]
fn grow_keeps_contents() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let module = instantiate(&store, &config, memory_module(1, Some(2)), "mem")?;

    call(&module, "store8", &[65535, 0x42])?;
    assert_eq!(call(&module, "grow", &[1])?, [1]);
    assert_eq!(call(&module, "grow", &[1])?, [u64::from(u32::MAX)]);
    assert_eq!(call(&module, "size", &[])?, [2]);
    assert_eq!(call(&module, "load8", &[65535])?, [0x42]);
    assert_eq!(call(&module, "load8", &[131071])?, [0]);

    let err = call(&module, "load8", &[131072]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::MemoryOutOfBounds));

    // The embedder sees the same memory.
    let memory = module.exported_memory("memory").unwrap();
    assert_eq!(memory.size(), 2);
    assert_eq!(memory.byte_len(), 2 * u64::from(WASM_PAGE_SIZE));
    assert!(memory.write_u32_le(131068, 0xdead_beef));
    assert_eq!(call(&module, "load8", &[131071])?, [0xde]);
    Ok(())
}

#[test]
fn grow_by_zero_reports_size() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let module = instantiate(&store, &config, memory_module(0, None), "mem")?;
    assert_eq!(call(&module, "grow", &[0])?, [0]);
    assert_eq!(call(&module, "grow", &[3])?, [0]);
    assert_eq!(call(&module, "grow", &[0])?, [3]);
    let err = call(&module, "store8", &[u64::from(3 * WASM_PAGE_SIZE), 1]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::MemoryOutOfBounds));
    Ok(())
}

#[test]
fn host_sees_caller_memory() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);

    let mut builder = HostModuleBuilder::new("env");
    builder.func("peek", |caller: &CallContext, addr: u32| -> Result<u32> {
        let memory = caller
            .memory()
            .ok_or_else(|| anyhow::anyhow!("{caller} has no memory"))?;
        match memory.read_byte(addr) {
            Some(b) => Ok(u32::from(b)),
            None => Err(Trap::MemoryOutOfBounds.into()),
        }
    });
    let host = builder.build(&config)?;
    store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &host,
        "env",
        None,
        None,
    )?;

    let mut env = memory_module(1, Some(1));
    env.imports.push(environ::Import {
        module: "env".to_string(),
        name: "peek".to_string(),
        desc: environ::ImportDesc::Func(0),
    });
    // Function indices shift by one for the import; re-export it as well.
    for e in env.exports.iter_mut().filter(|e| e.kind == ExternKind::Func) {
        e.index += 1;
    }
    env.exports.push(export("peek", ExternKind::Func, 0));
    let module = instantiate(&store, &config, env, "user")?;

    call(&module, "store8", &[100, 7])?;
    assert_eq!(call(&module, "peek", &[100])?, [7]);
    let err = call(&module, "peek", &[65536]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::MemoryOutOfBounds));
    Ok(())
}
