use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasmcore::environ::{Features, decode_block_type, leb128, opcode};
use wasmcore::*;

/// Nesting depth at which calls within one module trap with
/// [`Trap::StackOverflow`].
pub const MAX_CALL_DEPTH: usize = 200;

/// An engine interpreting a subset of the MVP instruction set straight from
/// function bodies.
///
/// `funcref` values are indices into a registry shared by every instance
/// created from the engine.
#[derive(Default)]
pub struct Interpreter {
    compiled: Mutex<HashMap<[u8; 32], Arc<CompiledModule>>>,
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    functions: Mutex<Vec<Arc<FunctionInstance>>>,
}

impl Registry {
    fn register(&self, f: &Arc<FunctionInstance>) -> Reference {
        let mut functions = self.functions.lock().unwrap();
        functions.push(f.clone());
        (functions.len() - 1) as Reference
    }

    fn get(&self, reference: Reference) -> Option<Arc<FunctionInstance>> {
        let functions = self.functions.lock().unwrap();
        functions.get(usize::try_from(reference).ok()?).cloned()
    }
}

struct CompiledModule {
    num_imported_functions: u32,
    bodies: Vec<ControlMap>,
}

#[derive(Clone, Copy)]
struct Block {
    else_pc: Option<usize>,
    end_pc: usize,
}

/// Where each structured instruction of a body ends.
#[derive(Default)]
struct ControlMap {
    /// Keyed by the position of `block`, `loop` or `if`.
    blocks: HashMap<usize, Block>,
    /// Position of the `end` closing each `else`.
    elses: HashMap<usize, usize>,
}

fn decode_u32(body: &[u8], pc: usize) -> Result<(u32, usize)> {
    Ok(leb128::decode_u32(&body[pc..])?)
}

fn scan(types: &[FuncType], body: &[u8]) -> Result<ControlMap> {
    let mut map = ControlMap::default();
    let mut open: Vec<(usize, Option<usize>)> = Vec::new();
    let mut pc = 0;
    while pc < body.len() {
        let start = pc;
        let op = body[pc];
        pc += 1;
        match op {
            opcode::BLOCK | opcode::LOOP | opcode::IF => {
                let (_, n) = decode_block_type(types, &body[pc..], Features::all())?;
                pc += n;
                open.push((start, None));
            }
            opcode::ELSE => {
                if let Some(last) = open.last_mut() {
                    last.1 = Some(start);
                }
            }
            opcode::END => {
                if let Some((block, else_pc)) = open.pop() {
                    map.blocks.insert(
                        block,
                        Block {
                            else_pc,
                            end_pc: start,
                        },
                    );
                    if let Some(else_pc) = else_pc {
                        map.elses.insert(else_pc, start);
                    }
                }
            }
            opcode::BR
            | opcode::BR_IF
            | opcode::CALL
            | opcode::LOCAL_GET
            | opcode::LOCAL_SET
            | opcode::LOCAL_TEE
            | opcode::GLOBAL_GET
            | opcode::GLOBAL_SET => pc += decode_u32(body, pc)?.1,
            opcode::BR_TABLE => {
                let (count, n) = decode_u32(body, pc)?;
                pc += n;
                for _ in 0..=count {
                    pc += decode_u32(body, pc)?.1;
                }
            }
            opcode::CALL_INDIRECT
            | opcode::I32_LOAD
            | opcode::I32_LOAD8_U
            | opcode::I32_STORE
            | opcode::I32_STORE8 => {
                pc += decode_u32(body, pc)?.1;
                pc += decode_u32(body, pc)?.1;
            }
            opcode::MEMORY_SIZE | opcode::MEMORY_GROW => pc += 1,
            opcode::I32_CONST => pc += leb128::decode_i32(&body[pc..])?.1,
            opcode::I64_CONST => pc += leb128::decode_i64(&body[pc..])?.1,
            opcode::UNREACHABLE
            | opcode::NOP
            | opcode::RETURN
            | opcode::DROP
            | opcode::SELECT
            | opcode::I32_EQZ
            | opcode::I32_EQ
            | opcode::I32_NE
            | opcode::I32_LT_S
            | opcode::I32_ADD
            | opcode::I32_SUB
            | opcode::I32_MUL
            | opcode::I64_ADD => {}
            other => bail!("unsupported instruction {}", opcode::instruction_name(other)),
        }
    }
    Ok(map)
}

impl Engine for Interpreter {
    fn compile_module(&self, module: &Module) -> Result<()> {
        let mut compiled = self.compiled.lock().unwrap();
        if compiled.contains_key(module.id()) {
            return Ok(());
        }
        let env = module.env();
        let bodies = if module.is_host() {
            Vec::new()
        } else {
            env.code
                .iter()
                .map(|code| scan(&env.types, &code.body))
                .collect::<Result<_>>()?
        };
        compiled.insert(
            *module.id(),
            Arc::new(CompiledModule {
                num_imported_functions: env.num_imported_functions(),
                bodies,
            }),
        );
        Ok(())
    }

    fn delete_compiled_module(&self, module: &Module) {
        self.compiled.lock().unwrap().remove(module.id());
    }

    fn compiled_module_count(&self) -> u32 {
        self.compiled.lock().unwrap().len() as u32
    }

    fn new_module_engine(
        &self,
        name: &str,
        module: &Module,
        imported_functions: &[Arc<FunctionInstance>],
        functions: &[Arc<FunctionInstance>],
        tables: &[Arc<TableInstance>],
        table_inits: &[TableInitEntry],
    ) -> Result<Box<dyn ModuleEngine>, NewModuleEngineError> {
        self.compile_module(module)?;
        let compiled = self
            .compiled
            .lock()
            .unwrap()
            .get(module.id())
            .cloned()
            .ok_or_else(|| anyhow!("module[{name}] was not compiled"))?;
        let refs = imported_functions
            .iter()
            .chain(functions)
            .map(|f| self.registry.register(f))
            .collect();
        let engine = Box::new(InterpModuleEngine {
            name: name.to_string(),
            compiled,
            registry: self.registry.clone(),
            refs,
        });
        for init in table_inits {
            let values: Vec<Reference> = init
                .function_indices
                .iter()
                .map(|&index| engine.reference(index))
                .collect();
            let written = tables
                .get(init.table_index as usize)
                .is_some_and(|table| table.initialize(init.offset, &values));
            if !written {
                let error = ElementOffsetOutOfBounds {
                    segment: init.segment_index,
                };
                return Err(NewModuleEngineError::deferred(engine, error));
            }
        }
        Ok(engine)
    }
}

struct InterpModuleEngine {
    name: String,
    compiled: Arc<CompiledModule>,
    registry: Arc<Registry>,
    /// Registry reference of each function in the module's index space.
    refs: Vec<Reference>,
}

#[derive(Clone, Copy)]
struct Label {
    height: usize,
    arity: usize,
    /// Where execution continues after a branch to this label.
    cont: usize,
}

impl InterpModuleEngine {
    fn reference(&self, index: Option<u32>) -> Reference {
        index
            .and_then(|i| self.refs.get(i as usize).copied())
            .unwrap_or(NULL_FUNCREF)
    }

    fn invoke(
        &self,
        ctx: &Context,
        call_ctx: &CallContext,
        f: &FunctionInstance,
        params: &[u64],
        depth: usize,
    ) -> Result<Vec<u64>> {
        if depth > MAX_CALL_DEPTH {
            return Err(Trap::StackOverflow.into());
        }
        if let Some(listener) = f.listener() {
            listener.before(ctx, f.definition(), params);
        }
        let result = match f.kind() {
            FunctionKind::Host(host) => host.call(ctx, call_ctx, params),
            FunctionKind::Wasm { locals, body } => self.execute(ctx, f, locals, body, params, depth),
        };
        if let Some(listener) = f.listener() {
            match &result {
                Ok(results) => listener.after(ctx, f.definition(), None, results),
                Err(e) => listener.after(ctx, f.definition(), Some(e), &[]),
            }
        }
        result
    }

    /// Calls `callee` from code of `instance`.
    fn call_function(
        &self,
        ctx: &Context,
        instance: &Arc<ModuleInstance>,
        callee: &FunctionInstance,
        args: &[u64],
        depth: usize,
    ) -> Result<Vec<u64>> {
        let caller_ctx = instance.call_context();
        match callee.kind() {
            FunctionKind::Host(_) => self.invoke(ctx, &caller_ctx, callee, args, depth),
            FunctionKind::Wasm { .. } => {
                let defining = callee.module()?;
                if Arc::ptr_eq(&defining, instance) {
                    self.invoke(ctx, &caller_ctx, callee, args, depth)
                } else {
                    defining.engine()?.call(ctx, &caller_ctx, callee, args)
                }
            }
        }
    }

    fn execute(
        &self,
        ctx: &Context,
        f: &FunctionInstance,
        local_types: &[ValType],
        body: &[u8],
        params: &[u64],
        depth: usize,
    ) -> Result<Vec<u64>> {
        let instance = f.module()?;
        let defined = (f.index() - self.compiled.num_imported_functions) as usize;
        let map = self
            .compiled
            .bodies
            .get(defined)
            .ok_or_else(|| anyhow!("{} was not compiled", f.definition().debug_name()))?;
        let types = instance.types();
        let result_count = f.ty().results().len();

        let mut locals = params.to_vec();
        locals.extend(local_types.iter().map(|&ty| match ty {
            ValType::FuncRef => NULL_FUNCREF,
            _ => 0,
        }));
        let mut stack: Vec<u64> = Vec::new();
        let mut labels = vec![Label {
            height: 0,
            arity: result_count,
            cont: body.len(),
        }];

        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| anyhow!("operand stack underflow"))?
            };
        }
        macro_rules! imm_u32 {
            ($pc:ident) => {{
                let (v, n) = decode_u32(body, $pc)?;
                $pc += n;
                v
            }};
        }

        let mut pc = 0;
        while let Some(&op) = body.get(pc) {
            let start = pc;
            pc += 1;
            match op {
                opcode::UNREACHABLE => return Err(Trap::Unreachable.into()),
                opcode::NOP => {}
                opcode::BLOCK | opcode::LOOP | opcode::IF => {
                    let (ty, n) = decode_block_type(types, &body[pc..], Features::all())?;
                    pc += n;
                    let block = map.blocks[&start];
                    if op == opcode::IF && pop!() as u32 == 0 {
                        match block.else_pc {
                            Some(else_pc) => pc = else_pc + 1,
                            None => {
                                pc = block.end_pc + 1;
                                continue;
                            }
                        }
                    }
                    let (arity, cont) = if op == opcode::LOOP {
                        (ty.params().len(), start)
                    } else {
                        (ty.results().len(), block.end_pc + 1)
                    };
                    labels.push(Label {
                        height: stack.len() - ty.params().len(),
                        arity,
                        cont,
                    });
                }
                opcode::ELSE => pc = map.elses[&start],
                opcode::END => {
                    labels.pop();
                }
                opcode::BR | opcode::BR_IF | opcode::BR_TABLE => {
                    let relative = match op {
                        // `pc` is replaced by the branch target below.
                        opcode::BR => decode_u32(body, pc)?.0,
                        opcode::BR_IF => {
                            let relative = imm_u32!(pc);
                            if pop!() as u32 == 0 {
                                continue;
                            }
                            relative
                        }
                        _ => {
                            let count = imm_u32!(pc);
                            let mut targets = Vec::with_capacity(count as usize + 1);
                            for _ in 0..=count {
                                targets.push(imm_u32!(pc));
                            }
                            let index = (pop!() as u32 as usize).min(count as usize);
                            targets[index]
                        }
                    };
                    let target = labels.len() - 1 - relative as usize;
                    let label = labels[target];
                    let values = stack.split_off(stack.len() - label.arity);
                    stack.truncate(label.height);
                    stack.extend(values);
                    labels.truncate(target);
                    pc = label.cont;
                }
                opcode::RETURN => break,
                opcode::CALL | opcode::CALL_INDIRECT => {
                    let callee = if op == opcode::CALL {
                        let index = imm_u32!(pc);
                        instance
                            .function(index)
                            .cloned()
                            .ok_or_else(|| anyhow!("unknown function {index}"))?
                    } else {
                        let type_index = imm_u32!(pc);
                        let table_index = imm_u32!(pc);
                        let element = pop!() as u32;
                        let reference = instance
                            .tables()
                            .get(table_index as usize)
                            .and_then(|table| table.get(element))
                            .filter(|&r| r != NULL_FUNCREF)
                            .ok_or(Trap::TableOutOfBounds)?;
                        let callee = self
                            .registry
                            .get(reference)
                            .ok_or(Trap::TableOutOfBounds)?;
                        if Some(&callee.type_id()) != instance.type_ids().get(type_index as usize) {
                            return Err(Trap::IndirectCallTypeMismatch.into());
                        }
                        callee
                    };
                    let args = stack.split_off(stack.len() - callee.ty().params().len());
                    let results = self.call_function(ctx, &instance, &callee, &args, depth + 1)?;
                    stack.extend(results);
                }
                opcode::DROP => {
                    pop!();
                }
                opcode::SELECT => {
                    let c = pop!();
                    let b = pop!();
                    let a = pop!();
                    stack.push(if c as u32 != 0 { a } else { b });
                }
                opcode::LOCAL_GET => {
                    let index = imm_u32!(pc) as usize;
                    stack.push(locals[index]);
                }
                opcode::LOCAL_SET => {
                    let index = imm_u32!(pc) as usize;
                    locals[index] = pop!();
                }
                opcode::LOCAL_TEE => {
                    let index = imm_u32!(pc) as usize;
                    locals[index] = *stack.last().ok_or_else(|| anyhow!("empty stack"))?;
                }
                opcode::GLOBAL_GET => {
                    let index = imm_u32!(pc) as usize;
                    stack.push(instance.globals()[index].get());
                }
                opcode::GLOBAL_SET => {
                    let index = imm_u32!(pc) as usize;
                    instance.globals()[index].set(pop!());
                }
                opcode::I32_LOAD | opcode::I32_LOAD8_U | opcode::I32_STORE | opcode::I32_STORE8 => {
                    let _align = imm_u32!(pc);
                    let offset = imm_u32!(pc);
                    let value = if op == opcode::I32_STORE || op == opcode::I32_STORE8 {
                        Some(pop!() as u32)
                    } else {
                        None
                    };
                    let address = u64::from(pop!() as u32) + u64::from(offset);
                    let address = u32::try_from(address).map_err(|_| Trap::MemoryOutOfBounds)?;
                    let memory = instance.memory().ok_or(Trap::MemoryOutOfBounds)?;
                    match (op, value) {
                        (opcode::I32_LOAD, _) => {
                            let v = memory.read_u32_le(address).ok_or(Trap::MemoryOutOfBounds)?;
                            stack.push(u64::from(v));
                        }
                        (opcode::I32_LOAD8_U, _) => {
                            let v = memory.read_byte(address).ok_or(Trap::MemoryOutOfBounds)?;
                            stack.push(u64::from(v));
                        }
                        (opcode::I32_STORE, Some(v)) => {
                            if !memory.write_u32_le(address, v) {
                                return Err(Trap::MemoryOutOfBounds.into());
                            }
                        }
                        (_, Some(v)) => {
                            if !memory.write_byte(address, v as u8) {
                                return Err(Trap::MemoryOutOfBounds.into());
                            }
                        }
                        _ => unreachable!(),
                    }
                }
                opcode::MEMORY_SIZE | opcode::MEMORY_GROW => {
                    pc += 1;
                    let memory = instance
                        .memory()
                        .ok_or_else(|| anyhow!("module has no memory"))?;
                    if op == opcode::MEMORY_SIZE {
                        stack.push(u64::from(memory.size()));
                    } else {
                        let delta = pop!() as u32;
                        stack.push(u64::from(memory.grow(delta).unwrap_or(u32::MAX)));
                    }
                }
                opcode::I32_CONST => {
                    let (v, n) = leb128::decode_i32(&body[pc..])?;
                    pc += n;
                    stack.push(u64::from(v as u32));
                }
                opcode::I64_CONST => {
                    let (v, n) = leb128::decode_i64(&body[pc..])?;
                    pc += n;
                    stack.push(v as u64);
                }
                opcode::I32_EQZ => {
                    let a = pop!() as u32;
                    stack.push(u64::from(a == 0));
                }
                opcode::I64_ADD => {
                    let b = pop!();
                    let a = pop!();
                    stack.push(a.wrapping_add(b));
                }
                opcode::I32_EQ
                | opcode::I32_NE
                | opcode::I32_LT_S
                | opcode::I32_ADD
                | opcode::I32_SUB
                | opcode::I32_MUL => {
                    let b = pop!() as u32;
                    let a = pop!() as u32;
                    let v = match op {
                        opcode::I32_EQ => u32::from(a == b),
                        opcode::I32_NE => u32::from(a != b),
                        opcode::I32_LT_S => u32::from((a as i32) < (b as i32)),
                        opcode::I32_ADD => a.wrapping_add(b),
                        opcode::I32_SUB => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    stack.push(u64::from(v));
                }
                other => bail!("unsupported instruction {}", opcode::instruction_name(other)),
            }
        }
        Ok(stack.split_off(stack.len() - result_count))
    }
}

impl ModuleEngine for InterpModuleEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        ctx: &Context,
        call_ctx: &CallContext,
        function: &FunctionInstance,
        params: &[u64],
    ) -> Result<Vec<u64>> {
        call_ctx.fail_if_closed()?;
        self.invoke(ctx, call_ctx, function, params, 0)
    }

    fn create_func_element_instance(&self, function_indices: &[Option<u32>]) -> ElementInstance {
        ElementInstance::new(
            RefType::FuncRef,
            function_indices.iter().map(|&i| self.reference(i)).collect(),
        )
    }

    fn initialize_funcref_globals(&self, globals: &[Arc<GlobalInstance>]) {
        for global in globals {
            global.set(self.reference(u32::try_from(global.get()).ok()));
        }
    }
}
