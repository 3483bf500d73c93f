use crate::support::*;
use anyhow::Result;
use wasmcore::environ::{self, opcode};
use wasmcore::*;

#[test]
fn unreachable() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let env = single_function(FuncType::default(), &[opcode::UNREACHABLE, opcode::END]);
    let module = instantiate(&store, &config, env, "m")?;
    let err = call(&module, "f", &[]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::Unreachable));

    // A trap leaves the module usable.
    assert!(call(&module, "f", &[]).is_err());
    assert!(!module.module().is_closed());
    Ok(())
}

#[test]
fn infinite_recursion_overflows() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let env = single_function(FuncType::default(), &[opcode::CALL, 0, opcode::END]);
    let module = instantiate(&store, &config, env, "m")?;
    let err = call(&module, "f", &[]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::StackOverflow));
    Ok(())
}

#[test]
fn bounded_recursion_completes() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    // (func $sum (param i32) (result i32)
    //   local.get 0 i32.eqz
    //   if (result i32) i32.const 0
    //   else local.get 0 local.get 0 i32.const 1 i32.sub call $sum i32.add end)
    let body = [
        opcode::LOCAL_GET,
        0,
        opcode::I32_EQZ,
        opcode::IF,
        0x7f,
        opcode::I32_CONST,
        0,
        opcode::ELSE,
        opcode::LOCAL_GET,
        0,
        opcode::LOCAL_GET,
        0,
        opcode::I32_CONST,
        1,
        opcode::I32_SUB,
        opcode::CALL,
        0,
        opcode::I32_ADD,
        opcode::END,
        opcode::END,
    ];
    let env = single_function(FuncType::new([ValType::I32], [ValType::I32]), &body);
    let module = instantiate(&store, &config, env, "m")?;
    assert_eq!(call(&module, "f", &[10])?, [55]);

    let depth = (MAX_CALL_DEPTH + 10) as u64;
    let err = call(&module, "f", &[depth]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::StackOverflow));
    Ok(())
}

#[test]
fn compilation_failure_is_reported() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    // f32.const 1.0 drop
    let env = single_function(
        FuncType::default(),
        &[opcode::F32_CONST, 0, 0, 0x80, 0x3f, opcode::DROP, opcode::END],
    );
    let err = instantiate(&store, &config, env, "m").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InstantiationError>(),
        Some(InstantiationError::Compilation(_))
    ));
    assert_eq!(
        err.to_string(),
        "compilation failed: unsupported instruction f32.const"
    );
    assert!(store.default_namespace().module("m").is_none());
    Ok(())
}

#[test]
fn loops_and_locals() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    // (func (param $n i32) (result i32) (local $acc i32)
    //   block loop
    //     local.get $n i32.eqz br_if 1
    //     local.get $acc local.get $n i32.add local.set $acc
    //     local.get $n i32.const 1 i32.sub local.set $n
    //     br 0
    //   end end
    //   local.get $acc)
    let body = [
        opcode::BLOCK,
        0x40,
        opcode::LOOP,
        0x40,
        opcode::LOCAL_GET,
        0,
        opcode::I32_EQZ,
        opcode::BR_IF,
        1,
        opcode::LOCAL_GET,
        1,
        opcode::LOCAL_GET,
        0,
        opcode::I32_ADD,
        opcode::LOCAL_SET,
        1,
        opcode::LOCAL_GET,
        0,
        opcode::I32_CONST,
        1,
        opcode::I32_SUB,
        opcode::LOCAL_SET,
        0,
        opcode::BR,
        0,
        opcode::END,
        opcode::END,
        opcode::LOCAL_GET,
        1,
        opcode::END,
    ];
    let env = environ::Module {
        code: vec![code(&[ValType::I32], &body)],
        ..single_function(FuncType::new([ValType::I32], [ValType::I32]), &[])
    };
    let module = instantiate(&store, &config, env, "m")?;
    assert_eq!(call(&module, "f", &[100])?, [5050]);
    assert_eq!(call(&module, "f", &[0])?, [0]);
    Ok(())
}
