//! Validation of function bodies.
//!
//! A [`FuncValidator`] walks the instruction stream of one function a byte at
//! a time, tracking the types on the operand stack and the nesting of
//! structured control frames. It decodes immediates itself, so only the
//! function bodies of a module ever need to be read at the instruction level.

mod stack;

use self::stack::{Operand, OperandStack, type_count_error};
use crate::leb128::{self, DecodeError};
use crate::opcode::{self, misc, vec};
use crate::{FeatureError, Features, FuncType, GlobalType, MemoryType, RefType, TableType, ValType};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// An error found while validating a function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Index of the function in the module's function index space.
    pub func_index: u32,
    /// Byte offset within the body of the offending instruction.
    pub offset: usize,
    /// Text-format name of the offending instruction, if the error is tied to
    /// one.
    pub instruction: Option<&'static str>,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction {
            Some(instr) => write!(
                f,
                "invalid function[{}] at offset {:#x} ({instr}): {}",
                self.func_index, self.offset, self.message
            ),
            None => write!(f, "invalid function[{}]: {}", self.func_index, self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockTypeError {
    #[error("decode int33: {0}")]
    Decode(#[from] DecodeError),
    #[error("block with function type return invalid as {0}")]
    MultiValue(FeatureError),
    #[error("type index out of range: {0}")]
    TypeIndexOutOfRange(i64),
}

/// Decodes a block type, returning it along with the number of bytes read.
///
/// Negative values are shorthands for blocks without parameters and with at
/// most one result. Non-negative values index `types` and need the
/// multi-value proposal.
pub fn decode_block_type(
    types: &[FuncType],
    bytes: &[u8],
    features: Features,
) -> Result<(FuncType, usize), BlockTypeError> {
    let (raw, read) = leb128::decode_i33_as_i64(bytes)?;
    let single = |ty: ValType| FuncType::new([], [ty]);
    let ty = match raw {
        -64 => FuncType::default(),
        -1 => single(ValType::I32),
        -2 => single(ValType::I64),
        -3 => single(ValType::F32),
        -4 => single(ValType::F64),
        -5 => single(ValType::V128),
        -16 => single(ValType::FuncRef),
        -17 => single(ValType::ExternRef),
        _ => {
            features
                .require(Features::MULTI_VALUE)
                .map_err(BlockTypeError::MultiValue)?;
            usize::try_from(raw)
                .ok()
                .and_then(|index| types.get(index))
                .ok_or(BlockTypeError::TypeIndexOutOfRange(raw))?
                .clone()
        }
    };
    Ok((ty, read))
}

/// The parts of a module a function body can refer to, with imported items
/// first in each index space.
pub struct ModuleContext<'a> {
    pub types: &'a [FuncType],
    /// Type index of every function.
    pub functions: &'a [u32],
    pub globals: &'a [GlobalType],
    pub memory: Option<MemoryType>,
    pub tables: &'a [TableType],
    /// Reference type of every element segment.
    pub elements: &'a [RefType],
    pub data_count: Option<u32>,
    /// Functions that `ref.func` may refer to.
    pub declared_functions: &'a HashSet<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
}

impl FrameKind {
    fn name(self) -> &'static str {
        match self {
            FrameKind::Function => "",
            FrameKind::Block => "block",
            FrameKind::Loop => "loop",
            FrameKind::If => "if",
        }
    }
}

struct ControlFrame {
    kind: FrameKind,
    ty: FuncType,
    has_else: bool,
}

impl ControlFrame {
    /// Types a branch to this frame must carry.
    fn label_types(&self) -> &[ValType] {
        match self.kind {
            FrameKind::Loop => self.ty.params(),
            _ => self.ty.results(),
        }
    }
}

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(format!($($arg)*))
    };
}

/// Validates the body of a single function.
pub struct FuncValidator<'a> {
    module: &'a ModuleContext<'a>,
    features: Features,
    max_stack_values: usize,
    func_index: u32,
    ty: &'a FuncType,
    locals: Vec<ValType>,
    body: &'a [u8],
    pos: usize,
    operands: OperandStack,
    frames: Vec<ControlFrame>,
}

impl<'a> FuncValidator<'a> {
    pub fn new(
        module: &'a ModuleContext<'a>,
        features: Features,
        max_stack_values: u32,
        func_index: u32,
        ty: &'a FuncType,
        locals: &[ValType],
        body: &'a [u8],
    ) -> FuncValidator<'a> {
        let mut all_locals = ty.params().to_vec();
        all_locals.extend_from_slice(locals);
        FuncValidator {
            module,
            features,
            max_stack_values: max_stack_values as usize,
            func_index,
            ty,
            locals: all_locals,
            body,
            pos: 0,
            operands: OperandStack::default(),
            frames: vec![ControlFrame {
                kind: FrameKind::Function,
                ty: ty.clone(),
                has_else: false,
            }],
        }
    }

    fn error(&self, offset: usize, instruction: Option<&'static str>, message: String) -> ValidationError {
        ValidationError {
            func_index: self.func_index,
            offset,
            instruction,
            message,
        }
    }

    pub fn validate(mut self) -> Result<(), ValidationError> {
        log::trace!(
            "validating function[{}] with {} body bytes",
            self.func_index,
            self.body.len()
        );
        for &ty in &self.locals[self.ty.params().len()..] {
            if let Err(e) = self.require_value_type(ty) {
                return Err(self.error(0, None, format!("invalid local of type {ty}: {e}")));
            }
        }

        while self.pos < self.body.len() {
            let start = self.pos;
            if self.frames.is_empty() {
                return Err(self.error(
                    start,
                    None,
                    "instructions found after the end of the function".to_string(),
                ));
            }
            if let Err(message) = self.step() {
                let instruction = self.describe(start);
                return Err(self.error(start, Some(instruction), message));
            }
        }

        if !self.frames.is_empty() {
            return Err(self.error(self.body.len(), None, "ill-nested block exists".to_string()));
        }
        if self.operands.max_height() > self.max_stack_values {
            return Err(self.error(
                self.body.len(),
                None,
                format!(
                    "function may have {} stack values, which exceeds limit {}",
                    self.operands.max_height(),
                    self.max_stack_values
                ),
            ));
        }
        Ok(())
    }

    fn describe(&self, offset: usize) -> &'static str {
        let op = self.body[offset];
        let sub = || leb128::decode_u32(&self.body[offset + 1..]).map(|(v, _)| v);
        match op {
            opcode::MISC_PREFIX => sub().map_or("misc_prefix", opcode::misc_instruction_name),
            opcode::VEC_PREFIX => sub().map_or("vec_prefix", opcode::vector_instruction_name),
            _ => opcode::instruction_name(op),
        }
    }

    fn require_value_type(&self, ty: ValType) -> Result<(), FeatureError> {
        match ty {
            ValType::V128 => self.features.require(Features::SIMD),
            ValType::FuncRef | ValType::ExternRef => self.features.require(Features::REFERENCE_TYPES),
            _ => Ok(()),
        }
    }

    fn read_u8(&mut self) -> Result<u8, String> {
        let byte = *self
            .body
            .get(self.pos)
            .ok_or_else(|| DecodeError::UnexpectedEof.to_string())?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_leb<T>(
        &mut self,
        decode: fn(&[u8]) -> Result<(T, usize), DecodeError>,
    ) -> Result<T, String> {
        let (value, read) =
            decode(&self.body[self.pos..]).map_err(|e| format!("read immediate: {e}"))?;
        self.pos += read;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        self.read_leb(leb128::decode_u32)
    }

    fn skip(&mut self, n: usize) -> Result<&'a [u8], String> {
        let body = self.body;
        let bytes = body
            .get(self.pos..self.pos + n)
            .ok_or_else(|| DecodeError::UnexpectedEof.to_string())?;
        self.pos += n;
        Ok(bytes)
    }

    fn read_memarg(&mut self) -> Result<u32, String> {
        let align = self
            .read_u32()
            .map_err(|e| format!("read memory align: {e}"))?;
        self.read_u32()
            .map_err(|e| format!("read memory offset: {e}"))?;
        Ok(align)
    }

    fn read_reserved_byte(&mut self, name: &str) -> Result<(), String> {
        if self.read_u8()? != 0 {
            invalid!("{name} reserved byte must be zero encoded with 1 byte");
        }
        Ok(())
    }

    fn pop(&mut self, ty: ValType, name: &str) -> Result<(), String> {
        self.operands
            .pop_expect(ty)
            .map_err(|e| format!("cannot pop the operand for {name}: {e}"))
    }

    fn pop_n(&mut self, types: &[ValType], name: &str) -> Result<(), String> {
        for &ty in types.iter().rev() {
            self.pop(ty, name)?;
        }
        Ok(())
    }

    fn require_memory(&self, name: &str) -> Result<(), String> {
        if self.module.memory.is_none() {
            invalid!("memory must exist for {name}");
        }
        Ok(())
    }

    fn table(&self, index: u32) -> Result<TableType, String> {
        match self.module.tables.get(index as usize) {
            Some(table) => Ok(*table),
            None => invalid!("table of index {index} not found"),
        }
    }

    fn frame_at_depth(&self, depth: u32) -> Result<&ControlFrame, String> {
        let len = self.frames.len();
        match len.checked_sub(depth as usize + 1) {
            Some(i) => Ok(&self.frames[i]),
            None => invalid!(
                "invalid label index {depth} with {len} for the current label stack length"
            ),
        }
    }

    fn step(&mut self) -> Result<(), String> {
        let module = self.module;
        let op = self.read_u8()?;
        let name = opcode::instruction_name(op);
        match op {
            opcode::I32_LOAD..=opcode::I64_STORE32 => {
                if module.memory.is_none() {
                    invalid!("unknown memory access");
                }
                let align = self.read_memarg()?;
                let (width, ty, store) = scalar_memory_access(op);
                check_alignment(align, width)?;
                if store {
                    self.pop(ty, name)?;
                    self.pop(ValType::I32, name)?;
                } else {
                    self.pop(ValType::I32, name)?;
                    self.operands.push(ty);
                }
            }
            opcode::MEMORY_SIZE | opcode::MEMORY_GROW => {
                if module.memory.is_none() {
                    invalid!("unknown memory access");
                }
                let (reserved, read) = leb128::decode_u32(&self.body[self.pos..])
                    .map_err(|e| format!("read immediate: {e}"))?;
                if reserved != 0 || read != 1 {
                    invalid!("memory instruction reserved bytes not zero with 1 byte");
                }
                self.pos += read;
                if op == opcode::MEMORY_GROW {
                    self.pop(ValType::I32, name)?;
                }
                self.operands.push(ValType::I32);
            }
            opcode::I32_CONST => {
                self.read_leb(leb128::decode_i32)
                    .map_err(|e| format!("read i32 immediate: {e}"))?;
                self.operands.push(ValType::I32);
            }
            opcode::I64_CONST => {
                self.read_leb(leb128::decode_i64)
                    .map_err(|e| format!("read i64 immediate: {e}"))?;
                self.operands.push(ValType::I64);
            }
            opcode::F32_CONST => {
                self.skip(4)?;
                self.operands.push(ValType::F32);
            }
            opcode::F64_CONST => {
                self.skip(8)?;
                self.operands.push(ValType::F64);
            }
            opcode::LOCAL_GET | opcode::LOCAL_SET | opcode::LOCAL_TEE => {
                let index = self.read_u32()?;
                let Some(&ty) = self.locals.get(index as usize) else {
                    invalid!(
                        "invalid local index for {name} {index} >= {}(=len(locals)+len(parameters))",
                        self.locals.len()
                    );
                };
                match op {
                    opcode::LOCAL_GET => self.operands.push(ty),
                    opcode::LOCAL_SET => self.pop(ty, name)?,
                    _ => {
                        self.pop(ty, name)?;
                        self.operands.push(ty);
                    }
                }
            }
            opcode::GLOBAL_GET => {
                let index = self.read_u32()?;
                let Some(global) = module.globals.get(index as usize) else {
                    invalid!("invalid index for {name}");
                };
                self.operands.push(global.content);
            }
            opcode::GLOBAL_SET => {
                let index = self.read_u32()?;
                let Some(global) = module.globals.get(index as usize).copied() else {
                    invalid!("invalid global index");
                };
                if !global.is_mutable() {
                    invalid!("{name} when not mutable");
                }
                self.pop(global.content, name)?;
            }
            opcode::BR => {
                let depth = self.read_u32()?;
                let frame = self.frame_at_depth(depth)?;
                let want = frame.label_types().to_vec();
                self.operands.require(false, name, &want, false)?;
                self.operands.unreachable();
            }
            opcode::BR_IF => {
                let depth = self.read_u32()?;
                let want = self.frame_at_depth(depth)?.label_types().to_vec();
                self.operands
                    .pop_expect(ValType::I32)
                    .map_err(|_| format!("cannot pop the required operand for {name}"))?;
                self.operands.require(false, name, &want, false)?;
                self.operands.push_all(&want);
            }
            opcode::BR_TABLE => self.br_table()?,
            opcode::RETURN => {
                let ty = self.ty;
                self.operands.require(false, "", ty.results(), false)?;
                self.operands.unreachable();
            }
            opcode::CALL => {
                let index = self.read_u32()?;
                let ty = self
                    .module
                    .functions
                    .get(index as usize)
                    .and_then(|&t| module.types.get(t as usize));
                let Some(ty) = ty else {
                    invalid!("invalid function index");
                };
                for &param in ty.params().iter().rev() {
                    self.operands
                        .pop_expect(param)
                        .map_err(|e| format!("type mismatch on {name} operation param type: {e}"))?;
                }
                self.operands.push_all(ty.results());
            }
            opcode::CALL_INDIRECT => {
                let type_index = self.read_u32()?;
                let Some(ty) = module.types.get(type_index as usize) else {
                    invalid!("invalid type index at {name}: {type_index}");
                };
                let table_index = self
                    .read_u32()
                    .map_err(|e| format!("read table index: {e}"))?;
                if table_index != 0 {
                    if let Err(e) = self.features.require(Features::REFERENCE_TYPES) {
                        invalid!("table index must be zero but was {table_index}: {e}");
                    }
                }
                let Some(table) = module.tables.get(table_index as usize) else {
                    invalid!("unknown table index: {table_index}");
                };
                if table.element != RefType::FuncRef {
                    invalid!(
                        "table is not funcref type but was {} for {name}",
                        table.element
                    );
                }
                self.operands
                    .pop_expect(ValType::I32)
                    .map_err(|_| format!("cannot pop the offset in table for {name}"))?;
                for &param in ty.params().iter().rev() {
                    self.operands
                        .pop_expect(param)
                        .map_err(|_| format!("type mismatch on {name} operation input type"))?;
                }
                self.operands.push_all(ty.results());
            }
            opcode::I32_EQZ..=opcode::I64_EXTEND32_S => {
                if op >= opcode::I32_EXTEND8_S {
                    if let Err(e) = self.features.require(Features::SIGN_EXTENSION_OPS) {
                        invalid!("{name} invalid as {e}");
                    }
                }
                let (operand, count, result) = numeric_signature(op);
                for _ in 0..count {
                    self.pop(operand, name)?;
                }
                self.operands.push(result);
            }
            opcode::REF_NULL | opcode::REF_IS_NULL | opcode::REF_FUNC => {
                if let Err(e) = self.features.require(Features::REFERENCE_TYPES) {
                    invalid!("{name} is invalid as {e}");
                }
                match op {
                    opcode::REF_NULL => {
                        let ty = match self.read_u8()? {
                            0x70 => ValType::FuncRef,
                            0x6f => ValType::ExternRef,
                            other => invalid!("unknown type for ref.null: {other:#x}"),
                        };
                        self.operands.push(ty);
                    }
                    opcode::REF_IS_NULL => {
                        let operand = self
                            .operands
                            .pop()
                            .map_err(|e| format!("cannot pop the operand for ref.is_null: {e}"))?;
                        if let Operand::Known(ty) = operand {
                            if !ty.is_ref() {
                                invalid!("type mismatch: expected reference type but was {ty}");
                            }
                        }
                        self.operands.push(ValType::I32);
                    }
                    _ => {
                        let index = self
                            .read_u32()
                            .map_err(|e| format!("failed to read function index for ref.func: {e}"))?;
                        if !module.declared_functions.contains(&index) {
                            invalid!("undeclared function index {index} for ref.func");
                        }
                        self.operands.push(ValType::FuncRef);
                    }
                }
            }
            opcode::TABLE_GET | opcode::TABLE_SET => {
                if let Err(e) = self.features.require(Features::REFERENCE_TYPES) {
                    invalid!("{name} is invalid as {e}");
                }
                let index = self.read_u32()?;
                let element = ValType::from(self.table(index)?.element);
                if op == opcode::TABLE_GET {
                    self.pop(ValType::I32, name)?;
                    self.operands.push(element);
                } else {
                    self.pop(element, name)?;
                    self.pop(ValType::I32, name)?;
                }
            }
            opcode::MISC_PREFIX => self.misc()?,
            opcode::VEC_PREFIX => self.vector()?,
            opcode::BLOCK | opcode::LOOP | opcode::IF => {
                let (ty, read) =
                    decode_block_type(module.types, &self.body[self.pos..], self.features)
                        .map_err(|e| format!("read block: {e}"))?;
                self.pos += read;
                let kind = match op {
                    opcode::BLOCK => FrameKind::Block,
                    opcode::LOOP => FrameKind::Loop,
                    _ => FrameKind::If,
                };
                if kind == FrameKind::If {
                    self.operands
                        .pop_expect(ValType::I32)
                        .map_err(|e| format!("cannot pop the operand for 'if': {e}"))?;
                }
                self.operands.require(true, name, ty.params(), false)?;
                self.operands.push_all(ty.params());
                self.operands.push_limit(ty.params().len());
                self.frames.push(ControlFrame {
                    kind,
                    ty,
                    has_else: false,
                });
            }
            opcode::ELSE => {
                let Some(frame) = self.frames.last_mut() else {
                    invalid!("else must follow an if");
                };
                if frame.kind != FrameKind::If || frame.has_else {
                    invalid!("else must follow an if");
                }
                frame.has_else = true;
                let frame = &self.frames[self.frames.len() - 1];
                self.operands
                    .require(false, opcode::instruction_name(opcode::IF), frame.ty.results(), true)?;
                self.operands.reset_at_limit();
                self.operands.push_all(frame.ty.params());
            }
            opcode::END => {
                let Some(frame) = self.frames.pop() else {
                    invalid!("ill-nested block exists");
                };
                let missing_else = frame.kind == FrameKind::If && !frame.has_else;
                if missing_else && frame.ty.params() != frame.ty.results() {
                    let have: Vec<Operand> = frame.ty.params().iter().map(|&t| t.into()).collect();
                    return Err(type_count_error(false, "else", &have, frame.ty.results()));
                }
                let context = if frame.kind == FrameKind::If && frame.has_else {
                    "else"
                } else {
                    frame.kind.name()
                };
                self.operands
                    .require(false, context, frame.ty.results(), true)?;
                self.operands.reset_at_limit();
                self.operands.push_all(frame.ty.results());
                if frame.kind != FrameKind::Function {
                    self.operands.pop_limit();
                }
            }
            opcode::DROP => {
                self.operands
                    .pop()
                    .map_err(|e| format!("invalid drop: {e}"))?;
            }
            opcode::SELECT | opcode::TYPED_SELECT => self.select(op)?,
            opcode::UNREACHABLE => self.operands.unreachable(),
            opcode::NOP => {}
            _ => invalid!("invalid instruction {op:#x}"),
        }
        Ok(())
    }

    fn br_table(&mut self) -> Result<(), String> {
        let name = opcode::instruction_name(opcode::BR_TABLE);
        let count = self.read_u32()?;
        let mut targets = Vec::new();
        for _ in 0..count {
            targets.push(self.read_u32()?);
        }
        let default = self.read_u32()?;
        let want: Vec<ValType> = self.frame_at_depth(default)?.label_types().to_vec();
        self.operands
            .pop_expect(ValType::I32)
            .map_err(|_| format!("cannot pop the required operand for {name}"))?;

        // With reference types, values popped from unreachable code relax the
        // check against the other labels.
        let expected: Vec<Operand> = if self.features.get(Features::REFERENCE_TYPES) {
            let mut expected: Vec<Operand> = want.iter().map(|&t| t.into()).collect();
            for i in (0..want.len()).rev() {
                let actual = self.operands.pop()?;
                match actual {
                    Operand::Unknown => expected[i] = Operand::Unknown,
                    Operand::Known(ty) if ty != want[i] => invalid!(
                        "cannot use {ty} in {name} block as param[{i}] type {}",
                        want[i]
                    ),
                    Operand::Known(_) => {}
                }
            }
            expected
        } else {
            self.operands.require(false, name, &want, false)?;
            want.iter().map(|&t| t.into()).collect()
        };

        for target in targets {
            let label = self.frame_at_depth(target)?.label_types();
            if label.len() != expected.len() {
                invalid!(
                    "inconsistent block type length for {name} at {target}; {:?} (ln={default}) != {:?} (l={target})",
                    want,
                    label
                );
            }
            for (exp, &ty) in expected.iter().zip(label) {
                if *exp != Operand::Unknown && *exp != Operand::Known(ty) {
                    invalid!("inconsistent block type for {name} at {target}");
                }
            }
        }
        self.operands.unreachable();
        Ok(())
    }

    fn select(&mut self, op: u8) -> Result<(), String> {
        let name = opcode::instruction_name(op);
        let typed = if op == opcode::TYPED_SELECT {
            let count = self.read_u32()?;
            if count != 1 {
                invalid!("too many type immediates for {name}");
            }
            let byte = self.read_u8()?;
            let Some(ty) = ValType::from_byte(byte) else {
                invalid!("invalid type {byte:#x} for {name}");
            };
            if let Err(e) = self.require_value_type(ty) {
                invalid!("{name} is invalid as {e}");
            }
            Some(ty)
        } else {
            None
        };

        self.operands
            .pop_expect(ValType::I32)
            .map_err(|e| format!("type mismatch on 3rd select operand: {e}"))?;
        let v1 = self
            .operands
            .pop()
            .map_err(|e| format!("invalid select: {e}"))?;
        let v2 = self
            .operands
            .pop()
            .map_err(|e| format!("invalid select: {e}"))?;

        match typed {
            Some(ty) => {
                for v in [v1, v2] {
                    if !v.matches(ty.into()) {
                        invalid!("type mismatch: expected {ty}, but was {v}");
                    }
                }
                self.operands.push(ty);
            }
            None => {
                if v1.is_ref() || v2.is_ref() {
                    invalid!("reference types cannot be used for non typed select instruction");
                }
                if !v1.matches(v2) {
                    invalid!("type mismatch on 1st and 2nd select operands");
                }
                self.operands
                    .push(if v1 == Operand::Unknown { v2 } else { v1 });
            }
        }
        Ok(())
    }

    fn check_data_index(&mut self, name: &str) -> Result<(), String> {
        let Some(count) = self.module.data_count else {
            invalid!("{name} requires data count section");
        };
        let index = self
            .read_u32()
            .map_err(|e| format!("failed to read data segment index for {name}: {e}"))?;
        if index >= count {
            invalid!("index {index} out of range of data section(len={count})");
        }
        Ok(())
    }

    fn check_element_index(&mut self, name: &str) -> Result<RefType, String> {
        let index = self
            .read_u32()
            .map_err(|e| format!("failed to read element segment index for {name}: {e}"))?;
        match self.module.elements.get(index as usize) {
            Some(ty) => Ok(*ty),
            None => invalid!(
                "index {index} out of range of element section(len={})",
                self.module.elements.len()
            ),
        }
    }

    fn read_table_index(&mut self, name: &str, role: &str) -> Result<TableType, String> {
        let index = self
            .read_u32()
            .map_err(|e| format!("failed to read {role} table index for {name}: {e}"))?;
        if index != 0 {
            if let Err(e) = self.features.require(Features::REFERENCE_TYPES) {
                invalid!("{role} table index must be zero for {name} as {e}");
            }
        }
        self.table(index)
    }

    fn misc(&mut self) -> Result<(), String> {
        let sub = self.read_u32()?;
        let name = opcode::misc_instruction_name(sub);
        let gate = match sub {
            misc::I32_TRUNC_SAT_F32_S..=misc::I64_TRUNC_SAT_F64_U => Features::NONTRAPPING_FLOAT_TO_INT,
            misc::MEMORY_INIT..=misc::TABLE_COPY => Features::BULK_MEMORY_OPERATIONS,
            misc::TABLE_GROW..=misc::TABLE_FILL => Features::REFERENCE_TYPES,
            _ => invalid!("invalid misc instruction {sub:#x}"),
        };
        if let Err(e) = self.features.require(gate) {
            invalid!("{name} invalid as {e}");
        }

        use ValType::*;
        match sub {
            misc::I32_TRUNC_SAT_F32_S | misc::I32_TRUNC_SAT_F32_U => {
                self.pop(F32, name)?;
                self.operands.push(I32);
            }
            misc::I32_TRUNC_SAT_F64_S | misc::I32_TRUNC_SAT_F64_U => {
                self.pop(F64, name)?;
                self.operands.push(I32);
            }
            misc::I64_TRUNC_SAT_F32_S | misc::I64_TRUNC_SAT_F32_U => {
                self.pop(F32, name)?;
                self.operands.push(I64);
            }
            misc::I64_TRUNC_SAT_F64_S | misc::I64_TRUNC_SAT_F64_U => {
                self.pop(F64, name)?;
                self.operands.push(I64);
            }
            misc::MEMORY_INIT => {
                self.check_data_index(name)?;
                self.require_memory(name)?;
                self.read_reserved_byte(name)?;
                self.pop_n(&[I32, I32, I32], name)?;
            }
            misc::DATA_DROP => self.check_data_index(name)?,
            misc::MEMORY_COPY => {
                self.require_memory(name)?;
                self.read_reserved_byte(name)?;
                self.read_reserved_byte(name)?;
                self.pop_n(&[I32, I32, I32], name)?;
            }
            misc::MEMORY_FILL => {
                self.require_memory(name)?;
                self.read_reserved_byte(name)?;
                self.pop_n(&[I32, I32, I32], name)?;
            }
            misc::TABLE_INIT => {
                let element = self.check_element_index(name)?;
                let table = self.read_table_index(name, "source")?;
                if table.element != element {
                    invalid!(
                        "type mismatch for {name}: element type {element} does not match table type {}",
                        table.element
                    );
                }
                self.pop_n(&[I32, I32, I32], name)?;
            }
            misc::ELEM_DROP => {
                self.check_element_index(name)?;
            }
            misc::TABLE_COPY => {
                let dst = self.read_table_index(name, "destination")?;
                let src = self.read_table_index(name, "source")?;
                if dst.element != src.element {
                    invalid!(
                        "table type mismatch for {name}: {} (src) != {} (dst)",
                        src.element,
                        dst.element
                    );
                }
                self.pop_n(&[I32, I32, I32], name)?;
            }
            _ => {
                let index = self
                    .read_u32()
                    .map_err(|e| format!("failed to read table index for {name}: {e}"))?;
                let element = ValType::from(self.table(index)?.element);
                match sub {
                    misc::TABLE_GROW => {
                        self.pop_n(&[element, I32], name)?;
                        self.operands.push(I32);
                    }
                    misc::TABLE_SIZE => self.operands.push(I32),
                    _ => self.pop_n(&[I32, element, I32], name)?,
                }
            }
        }
        Ok(())
    }

    fn vector(&mut self) -> Result<(), String> {
        let sub = self.read_u32()?;
        let name = opcode::vector_instruction_name(sub);
        if let Err(e) = self.features.require(Features::SIMD) {
            invalid!("{name} invalid as {e}");
        }
        let Some(shape) = vector_shape(sub) else {
            invalid!("invalid vector instruction {sub:#x}");
        };

        use ValType::*;
        match shape {
            VecShape::Const => {
                self.skip(16)
                    .map_err(|_| format!("cannot read constant vector value for {name}"))?;
                self.operands.push(V128);
            }
            VecShape::Load(width) => {
                self.require_memory(name)?;
                let align = self.read_memarg()?;
                check_alignment(align, width)?;
                self.pop(I32, name)?;
                self.operands.push(V128);
            }
            VecShape::Store => {
                self.require_memory(name)?;
                let align = self.read_memarg()?;
                check_alignment(align, 16)?;
                self.pop_n(&[I32, V128], name)?;
            }
            VecShape::LoadLane { width, lanes } | VecShape::StoreLane { width, lanes } => {
                self.require_memory(name)?;
                let align = self.read_memarg()?;
                check_alignment(align, width)?;
                self.read_lane(name, lanes)?;
                self.pop_n(&[I32, V128], name)?;
                if matches!(shape, VecShape::LoadLane { .. }) {
                    self.operands.push(V128);
                }
            }
            VecShape::ExtractLane { lanes, result } => {
                self.read_lane(name, lanes)?;
                self.pop(V128, name)?;
                self.operands.push(result);
            }
            VecShape::ReplaceLane { lanes, operand } => {
                self.read_lane(name, lanes)?;
                self.pop_n(&[V128, operand], name)?;
                self.operands.push(V128);
            }
            VecShape::Shuffle => {
                let lanes = self
                    .skip(16)
                    .map_err(|_| format!("16 lane indexes for {name} not found"))?;
                if let Some((i, l)) = lanes.iter().enumerate().find(|(_, l)| **l >= 32) {
                    invalid!("invalid lane index[{i}] {l} >= 32 for {name}");
                }
                self.pop_n(&[V128, V128], name)?;
                self.operands.push(V128);
            }
            VecShape::Splat(ty) => {
                self.pop(ty, name)?;
                self.operands.push(V128);
            }
            VecShape::Test => {
                self.pop(V128, name)?;
                self.operands.push(I32);
            }
            VecShape::Unary => {
                self.pop(V128, name)?;
                self.operands.push(V128);
            }
            VecShape::Binary => {
                self.pop_n(&[V128, V128], name)?;
                self.operands.push(V128);
            }
            VecShape::Ternary => {
                self.pop_n(&[V128, V128, V128], name)?;
                self.operands.push(V128);
            }
            VecShape::Shift => {
                self.pop_n(&[V128, I32], name)?;
                self.operands.push(V128);
            }
        }
        Ok(())
    }

    fn read_lane(&mut self, name: &str, lanes: u8) -> Result<(), String> {
        let lane = self
            .read_u8()
            .map_err(|_| format!("lane for {name} not found"))?;
        if lane >= lanes {
            invalid!("invalid lane index {lane} >= {lanes} for {name}");
        }
        Ok(())
    }
}

fn check_alignment(align: u32, width: u32) -> Result<(), String> {
    if align >= 32 || 1u32 << align > width {
        invalid!("invalid memory alignment");
    }
    Ok(())
}

/// Natural width in bytes, operand type, and whether the instruction stores,
/// for the scalar loads and stores.
fn scalar_memory_access(op: u8) -> (u32, ValType, bool) {
    use ValType::*;
    match op {
        opcode::I32_LOAD => (4, I32, false),
        opcode::I64_LOAD => (8, I64, false),
        opcode::F32_LOAD => (4, F32, false),
        opcode::F64_LOAD => (8, F64, false),
        opcode::I32_LOAD8_S | opcode::I32_LOAD8_U => (1, I32, false),
        opcode::I32_LOAD16_S | opcode::I32_LOAD16_U => (2, I32, false),
        opcode::I64_LOAD8_S | opcode::I64_LOAD8_U => (1, I64, false),
        opcode::I64_LOAD16_S | opcode::I64_LOAD16_U => (2, I64, false),
        opcode::I64_LOAD32_S | opcode::I64_LOAD32_U => (4, I64, false),
        opcode::I32_STORE => (4, I32, true),
        opcode::I64_STORE => (8, I64, true),
        opcode::F32_STORE => (4, F32, true),
        opcode::F64_STORE => (8, F64, true),
        opcode::I32_STORE8 => (1, I32, true),
        opcode::I32_STORE16 => (2, I32, true),
        opcode::I64_STORE8 => (1, I64, true),
        opcode::I64_STORE16 => (2, I64, true),
        _ => (4, I64, true),
    }
}

/// Operand type, operand count, and result type of the numeric instructions
/// `0x45..=0xc4`.
fn numeric_signature(op: u8) -> (ValType, usize, ValType) {
    use ValType::*;
    match op {
        0x45 => (I32, 1, I32),
        0x46..=0x4f => (I32, 2, I32),
        0x50 => (I64, 1, I32),
        0x51..=0x5a => (I64, 2, I32),
        0x5b..=0x60 => (F32, 2, I32),
        0x61..=0x66 => (F64, 2, I32),
        0x67..=0x69 => (I32, 1, I32),
        0x6a..=0x78 => (I32, 2, I32),
        0x79..=0x7b => (I64, 1, I64),
        0x7c..=0x8a => (I64, 2, I64),
        0x8b..=0x91 => (F32, 1, F32),
        0x92..=0x98 => (F32, 2, F32),
        0x99..=0x9f => (F64, 1, F64),
        0xa0..=0xa6 => (F64, 2, F64),
        0xa7 => (I64, 1, I32),
        0xa8 | 0xa9 => (F32, 1, I32),
        0xaa | 0xab => (F64, 1, I32),
        0xac | 0xad => (I32, 1, I64),
        0xae | 0xaf => (F32, 1, I64),
        0xb0 | 0xb1 => (F64, 1, I64),
        0xb2 | 0xb3 => (I32, 1, F32),
        0xb4 | 0xb5 => (I64, 1, F32),
        0xb6 => (F64, 1, F32),
        0xb7 | 0xb8 => (I32, 1, F64),
        0xb9 | 0xba => (I64, 1, F64),
        0xbb => (F32, 1, F64),
        0xbc => (F32, 1, I32),
        0xbd => (F64, 1, I64),
        0xbe => (I32, 1, F32),
        0xbf => (I64, 1, F64),
        0xc0 | 0xc1 => (I32, 1, I32),
        _ => (I64, 1, I64),
    }
}

#[derive(Debug, Clone, Copy)]
enum VecShape {
    Const,
    Load(u32),
    Store,
    LoadLane { width: u32, lanes: u8 },
    StoreLane { width: u32, lanes: u8 },
    ExtractLane { lanes: u8, result: ValType },
    ReplaceLane { lanes: u8, operand: ValType },
    Shuffle,
    Splat(ValType),
    /// `v128 -> i32`
    Test,
    Unary,
    Binary,
    Ternary,
    /// `v128, i32 -> v128`
    Shift,
}

fn vector_shape(op: u32) -> Option<VecShape> {
    use ValType::*;
    use VecShape::*;
    let extract = |lanes, result| ExtractLane { lanes, result };
    let replace = |lanes, operand| ReplaceLane { lanes, operand };
    Some(match op {
        vec::V128_LOAD => Load(16),
        vec::V128_LOAD8X8_S..=vec::V128_LOAD32X2_U => Load(8),
        vec::V128_LOAD8_SPLAT => Load(1),
        vec::V128_LOAD16_SPLAT => Load(2),
        vec::V128_LOAD32_SPLAT | vec::V128_LOAD32_ZERO => Load(4),
        vec::V128_LOAD64_SPLAT | vec::V128_LOAD64_ZERO => Load(8),
        vec::V128_STORE => Store,
        vec::V128_CONST => Const,
        vec::I8X16_SHUFFLE => Shuffle,
        vec::I8X16_SWIZZLE => Binary,
        vec::I8X16_SPLAT..=0x11 => Splat(I32),
        0x12 => Splat(I64),
        0x13 => Splat(F32),
        vec::F64X2_SPLAT => Splat(F64),
        vec::I8X16_EXTRACT_LANE_S | 0x16 => extract(16, I32),
        0x17 => replace(16, I32),
        0x18 | 0x19 => extract(8, I32),
        0x1a => replace(8, I32),
        0x1b => extract(4, I32),
        0x1c => replace(4, I32),
        0x1d => extract(2, I64),
        0x1e => replace(2, I64),
        0x1f => extract(4, F32),
        0x20 => replace(4, F32),
        0x21 => extract(2, F64),
        vec::F64X2_REPLACE_LANE => replace(2, F64),
        0x23..=0x4c => Binary,
        0x4d => Unary,
        0x4e..=0x51 => Binary,
        0x52 => Ternary,
        0x53 => Test,
        vec::V128_LOAD8_LANE..=vec::V128_LOAD64_LANE => {
            let width = 1 << (op - vec::V128_LOAD8_LANE);
            LoadLane {
                width,
                lanes: (16 / width) as u8,
            }
        }
        vec::V128_STORE8_LANE..=vec::V128_STORE64_LANE => {
            let width = 1 << (op - vec::V128_STORE8_LANE);
            StoreLane {
                width,
                lanes: (16 / width) as u8,
            }
        }
        0x5e..=0x62 => Unary,
        0x63 | 0x64 => Test,
        0x65 | 0x66 => Binary,
        0x67..=0x6a => Unary,
        0x6b..=0x6d => Shift,
        0x6e..=0x73 => Binary,
        0x74 | 0x75 => Unary,
        0x76..=0x79 => Binary,
        0x7a => Unary,
        0x7b => Binary,
        0x7c..=0x81 => Unary,
        0x82 => Binary,
        0x83 | 0x84 => Test,
        0x85 | 0x86 => Binary,
        0x87..=0x8a => Unary,
        0x8b..=0x8d => Shift,
        0x8e..=0x93 => Binary,
        0x94 => Unary,
        0x95..=0x99 | 0x9b..=0x9f => Binary,
        0xa0 | 0xa1 => Unary,
        0xa3 | 0xa4 => Test,
        0xa7..=0xaa => Unary,
        0xab..=0xad => Shift,
        0xae | 0xb1 | 0xb5..=0xba | 0xbc..=0xbf => Binary,
        0xc0 | 0xc1 => Unary,
        0xc3 | 0xc4 => Test,
        0xc7..=0xca => Unary,
        0xcb..=0xcd => Shift,
        0xce | 0xd1 | 0xd5..=0xdf => Binary,
        0xe0 | 0xe1 | 0xe3 => Unary,
        0xe4..=0xeb => Binary,
        0xec | 0xed | 0xef => Unary,
        0xf0..=0xf7 => Binary,
        0xf8..=0xff => Unary,
        _ => return None,
    })
}
