use crate::support::*;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use wasmcore::environ::{self, Import, ImportDesc, opcode};
use wasmcore::*;

/// Records every call as a line of text.
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
}

impl FunctionListener for Recorder {
    fn before(&self, _ctx: &Context, definition: &FunctionDefinition, params: &[u64]) {
        let names = definition.param_names().map(|n| n.join(",")).unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .push(format!("--> {}({names}) {params:?}", definition.debug_name()));
    }

    fn after(
        &self,
        _ctx: &Context,
        definition: &FunctionDefinition,
        error: Option<&anyhow::Error>,
        results: &[u64],
    ) {
        let outcome = match error {
            Some(e) => format!("error: {e}"),
            None => format!("{results:?}"),
        };
        self.log
            .lock()
            .unwrap()
            .push(format!("<-- {} {outcome}", definition.debug_name()));
    }
}

/// Hands the same recorder to every function except those named `quiet`.
struct Factory(Arc<Recorder>);

impl FunctionListenerFactory for Factory {
    fn new_listener(&self, definition: &FunctionDefinition) -> Option<Arc<dyn FunctionListener>> {
        if definition.name() == "quiet" {
            return None;
        }
        Some(self.0.clone())
    }
}

#[test]
fn listeners_wrap_calls() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let recorder = Arc::new(Recorder::default());
    let factory = Factory(recorder.clone());
    let ns = store.default_namespace();

    let mut builder = HostModuleBuilder::new("env");
    builder
        .func("double", |x: i32| x.wrapping_mul(2))
        .func("quiet", || {});
    builder.param_names("double", &["x"])?;
    let host = builder.build(&config)?;
    store.instantiate(&Context::default(), &ns, &host, "env", None, Some(&factory))?;

    // (func (param i32) (result i32) call $quiet local.get 0 call $double)
    let user = environ::Module {
        types: vec![
            FuncType::new([ValType::I32], [ValType::I32]),
            FuncType::default(),
        ],
        imports: vec![
            Import {
                module: "env".to_string(),
                name: "double".to_string(),
                desc: ImportDesc::Func(0),
            },
            Import {
                module: "env".to_string(),
                name: "quiet".to_string(),
                desc: ImportDesc::Func(1),
            },
        ],
        functions: vec![0],
        code: vec![code(
            &[],
            &[
                opcode::CALL,
                1,
                opcode::LOCAL_GET,
                0,
                opcode::CALL,
                0,
                opcode::END,
            ],
        )],
        exports: vec![export("run", ExternKind::Func, 2)],
        ..environ::Module::default()
    };
    let user = Module::new(&config, user)?;
    let user = store.instantiate(&Context::default(), &ns, &user, "user", None, Some(&factory))?;

    assert_eq!(call(&user, "run", &[21])?, [42]);
    assert_eq!(
        *recorder.log.lock().unwrap(),
        [
            "--> user.$2() [21]",
            "--> env.double(x) [21]",
            "<-- env.double [42]",
            "<-- user.$2 [42]",
        ]
    );
    Ok(())
}

#[test]
fn listeners_see_errors() -> Result<()> {
    let config = Config::new();
    let (store, _) = store(&config);
    let recorder = Arc::new(Recorder::default());
    let env = single_function(FuncType::default(), &[opcode::UNREACHABLE, opcode::END]);
    let module = Module::new(&config, env)?;
    let module = store.instantiate(
        &Context::default(),
        &store.default_namespace(),
        &module,
        "trap",
        None,
        Some(&Factory(recorder.clone())),
    )?;

    assert!(call(&module, "f", &[]).is_err());
    assert_eq!(
        *recorder.log.lock().unwrap(),
        ["--> trap.$0() []", "<-- trap.$0 error: unreachable"]
    );
    Ok(())
}
