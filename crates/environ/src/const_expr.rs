//! Constant expressions used by global initializers and segment offsets.

use crate::leb128::{self, DecodeError};
use crate::opcode;
use crate::{FeatureError, Features, GlobalType, RefType, ValType};
use thiserror::Error;

/// A constant expression: a single value-producing instruction followed by
/// `end`.
///
/// Floats are kept as their IEEE-754 bit patterns so that NaN payloads
/// survive unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    V128(u128),
    RefNull(RefType),
    RefFunc(u32),
    GlobalGet(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstExprError {
    #[error("invalid opcode for const expression: {0:#x}")]
    InvalidOpcode(u8),
    #[error("constant expression has not been terminated")]
    Unterminated,
    #[error("global index out of range: {0} (only imported globals may be read)")]
    UnknownGlobal(u32),
    #[error("function index out of range: {0}")]
    UnknownFunction(u32),
    #[error("type mismatch: expected {expected}, but was {actual}")]
    TypeMismatch { expected: ValType, actual: ValType },
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ConstExpr {
    /// Decodes a constant expression from its binary encoding, including the
    /// trailing `end`.
    pub fn decode(bytes: &[u8]) -> Result<ConstExpr, ConstExprError> {
        let (&op, rest) = bytes.split_first().ok_or(DecodeError::UnexpectedEof)?;
        let (expr, read) = match op {
            opcode::I32_CONST => {
                let (v, n) = leb128::decode_i32(rest)?;
                (ConstExpr::I32(v), n)
            }
            opcode::I64_CONST => {
                let (v, n) = leb128::decode_i64(rest)?;
                (ConstExpr::I64(v), n)
            }
            opcode::F32_CONST => {
                (ConstExpr::F32(leb128::decode_f32_bits(rest)?), 4)
            }
            opcode::F64_CONST => {
                (ConstExpr::F64(leb128::decode_f64_bits(rest)?), 8)
            }
            opcode::VEC_PREFIX => {
                let (sub, n) = leb128::decode_u32(rest)?;
                if sub != opcode::vec::V128_CONST {
                    return Err(ConstExprError::InvalidOpcode(op));
                }
                (ConstExpr::V128(leb128::decode_v128(&rest[n..])?), n + 16)
            }
            opcode::REF_NULL => match rest.first() {
                Some(0x70) => (ConstExpr::RefNull(RefType::FuncRef), 1),
                Some(0x6f) => (ConstExpr::RefNull(RefType::ExternRef), 1),
                Some(&other) => return Err(ConstExprError::InvalidOpcode(other)),
                None => return Err(DecodeError::UnexpectedEof.into()),
            },
            opcode::REF_FUNC => {
                let (v, n) = leb128::decode_u32(rest)?;
                (ConstExpr::RefFunc(v), n)
            }
            opcode::GLOBAL_GET => {
                let (v, n) = leb128::decode_u32(rest)?;
                (ConstExpr::GlobalGet(v), n)
            }
            other => return Err(ConstExprError::InvalidOpcode(other)),
        };
        match rest.get(read) {
            Some(&opcode::END) => Ok(expr),
            _ => Err(ConstExprError::Unterminated),
        }
    }

    /// Type-checks this expression.
    ///
    /// `imported_globals` are the types of the module's imported globals, the
    /// only globals a constant expression may read. `num_functions` is the
    /// size of the function index space.
    pub fn result_type(
        &self,
        features: Features,
        imported_globals: &[GlobalType],
        num_functions: u32,
    ) -> Result<ValType, ConstExprError> {
        Ok(match *self {
            ConstExpr::I32(_) => ValType::I32,
            ConstExpr::I64(_) => ValType::I64,
            ConstExpr::F32(_) => ValType::F32,
            ConstExpr::F64(_) => ValType::F64,
            ConstExpr::V128(_) => {
                features.require(Features::SIMD)?;
                ValType::V128
            }
            ConstExpr::RefNull(ty) => {
                features.require(Features::REFERENCE_TYPES)?;
                ty.into()
            }
            ConstExpr::RefFunc(index) => {
                features.require(Features::REFERENCE_TYPES)?;
                if index >= num_functions {
                    return Err(ConstExprError::UnknownFunction(index));
                }
                ValType::FuncRef
            }
            ConstExpr::GlobalGet(index) => {
                imported_globals
                    .get(index as usize)
                    .ok_or(ConstExprError::UnknownGlobal(index))?
                    .content
            }
        })
    }

    /// Type-checks this expression against an expected type.
    pub fn validate(
        &self,
        expected: ValType,
        features: Features,
        imported_globals: &[GlobalType],
        num_functions: u32,
    ) -> Result<(), ConstExprError> {
        let actual = self.result_type(features, imported_globals, num_functions)?;
        if actual != expected {
            return Err(ConstExprError::TypeMismatch { expected, actual });
        }
        Ok(())
    }
}
