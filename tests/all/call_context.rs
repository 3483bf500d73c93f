use crate::instance::add_module;
use crate::support::*;
use anyhow::{Result, bail};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use wasmcore::*;

#[test]
fn close_is_idempotent() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let module = instantiate(&store, &config, add_module(), "math")?;
    let f = module.exported_function("f").unwrap();
    let ctx = Context::default();

    module.close_with_exit_code(&ctx, 2)?;
    assert!(module.module().is_closed());
    module.close_with_exit_code(&ctx, 3)?;
    module.close(&ctx)?;

    let err = f.call(&ctx, &[1, 2]).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ExitError>(),
        Some(&ExitError {
            module_name: "math".to_string(),
            exit_code: 2,
        })
    );
    assert_eq!(err.to_string(), "module \"math\" closed with exit_code(2)");

    // Closing removes the module from its namespace, freeing the name.
    let ns = store.default_namespace();
    assert!(ns.module("math").is_none());
    instantiate(&store, &config, add_module(), "math")?;
    Ok(())
}

#[test]
fn close_releases_resources_in_order() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let order = Arc::new(AtomicU32::new(0));

    let sys_order = order.clone();
    let sys = SysContext::new()
        .with_args(["prog", "-v"])
        .with_env("HOME", "/")
        .with_files(move |_: &Context| -> Result<()> {
            assert_eq!(sys_order.fetch_add(1, Ordering::SeqCst), 0);
            bail!("files already closed")
        });
    let module = Module::new(&config, add_module())?;
    let module = store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &module,
        "math",
        Some(Arc::new(sys)),
        None,
    )?;
    let sys = module.module().system_context().unwrap();
    assert_eq!(sys.args(), ["prog", "-v"]);
    assert_eq!(sys.environ(), [("HOME".to_string(), "/".to_string())]);

    let code_order = order.clone();
    module.set_code_closer(move |_: &Context| -> Result<()> {
        assert_eq!(code_order.fetch_add(1, Ordering::SeqCst), 1);
        Ok(())
    });

    // Every resource is closed, and the first failure is reported.
    let err = module.close(&Context::default()).unwrap_err();
    assert_eq!(err.to_string(), "files already closed");
    assert_eq!(order.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn store_close_reaches_every_namespace() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let default = instantiate(&store, &config, add_module(), "a")?;
    let other = store.new_namespace();
    let module = Module::new(&config, add_module())?;
    let isolated = store.instantiate(&Context::default(), &other, &module, "a", None, None)?;

    store.close_with_exit_code(&Context::default(), 7)?;
    for module in [&default, &isolated] {
        let err = call(module, "f", &[1, 2]).unwrap_err();
        assert_eq!(err.downcast_ref::<ExitError>().unwrap().exit_code, 7);
    }
    assert!(other.module_names().is_empty());

    // The store hands out a fresh default namespace afterwards.
    let ns = store.default_namespace();
    assert!(ns.module_names().is_empty());
    instantiate(&store, &config, add_module(), "a")?;
    Ok(())
}

#[test]
fn namespace_lookup() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    instantiate(&store, &config, add_module(), "math")?;

    let ns = store.default_namespace();
    let math = ns.module("math").unwrap();
    assert_eq!(math.name(), "math");
    assert_eq!(math.to_string(), "Module[math]");
    assert!(math.memory().is_none());
    assert!(math.exported_memory("memory").is_none());
    assert!(math.exported_function("missing").is_none());
    assert_eq!(call(&math, "f", &[20, 22])?, [42]);
    Ok(())
}

#[test]
fn context_reaches_host_functions() -> Result<()> {
    #[derive(Debug, PartialEq)]
    struct RequestId(u32);

    let config = Config::new();
    let (store, _) = store(&config);
    let mut builder = HostModuleBuilder::new("env");
    builder.func("request_id", |ctx: &Context| {
        ctx.value::<RequestId>().map_or(0, |id| id.0)
    });
    let host = builder.build(&config)?;
    let env = store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &host,
        "env",
        None,
        None,
    )?;

    let f = env.exported_function("request_id").unwrap();
    assert_eq!(f.call(&Context::default(), &[])?, [0]);
    let ctx = Context::new().with_value(RequestId(9));
    assert_eq!(ctx.value::<RequestId>(), Some(&RequestId(9)));
    assert_eq!(f.call(&ctx, &[])?, [9]);
    Ok(())
}
