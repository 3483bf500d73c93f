use crate::table::{NULL_EXTERNREF, NULL_FUNCREF};
use anyhow::{Result, bail};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use wasmcore_environ::{ConstExpr, GlobalType, RefType, ValType};

/// A global's storage: the value type, its mutability, and 128 bits of
/// value.
///
/// The high cell only carries data for `v128`. Every other type lives in the
/// low cell in its flat 64-bit slot encoding.
pub struct GlobalInstance {
    ty: GlobalType,
    val: AtomicU64,
    val_hi: AtomicU64,
}

impl GlobalInstance {
    pub fn new(ty: GlobalType, val: u64, val_hi: u64) -> GlobalInstance {
        GlobalInstance {
            ty,
            val: AtomicU64::new(val),
            val_hi: AtomicU64::new(val_hi),
        }
    }

    /// Creates a global initialized by a constant expression.
    ///
    /// `global.get` may only read `imported_globals`. A `ref.func` initializer
    /// stores the function index until an engine rewrites it with
    /// [`ModuleEngine::initialize_funcref_globals`](crate::ModuleEngine::initialize_funcref_globals).
    pub fn from_const_expr(
        ty: GlobalType,
        init: &ConstExpr,
        imported_globals: &[Arc<GlobalInstance>],
    ) -> GlobalInstance {
        let (val, val_hi) = eval_const_expr(init, imported_globals);
        GlobalInstance::new(ty, val, val_hi)
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    /// The low 64 bits of the value.
    pub fn get(&self) -> u64 {
        self.val.load(Ordering::Acquire)
    }

    pub fn get_v128(&self) -> u128 {
        u128::from(self.val_hi.load(Ordering::Acquire)) << 64 | u128::from(self.get())
    }

    /// Stores a value without checking mutability, as engines do for
    /// `global.set` on validated code.
    pub fn set(&self, val: u64) {
        self.val.store(val, Ordering::Release);
    }

    pub fn set_v128(&self, val: u128) {
        self.val.store(val as u64, Ordering::Release);
        self.val_hi.store((val >> 64) as u64, Ordering::Release);
    }
}

impl fmt::Debug for GlobalInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GlobalInstance")
            .field("ty", &self.ty)
            .field("val", &self.get())
            .finish()
    }
}

/// Evaluates a constant expression to its `(low, high)` slot pair.
///
/// Expressions are type-checked by module validation, so a `global.get` of
/// an index outside `imported_globals` cannot happen and yields zero.
pub fn eval_const_expr(expr: &ConstExpr, imported_globals: &[Arc<GlobalInstance>]) -> (u64, u64) {
    match *expr {
        ConstExpr::I32(v) => (u64::from(v as u32), 0),
        ConstExpr::I64(v) => (v as u64, 0),
        ConstExpr::F32(bits) => (u64::from(bits), 0),
        ConstExpr::F64(bits) => (bits, 0),
        ConstExpr::V128(v) => (v as u64, (v >> 64) as u64),
        ConstExpr::RefNull(RefType::FuncRef) => (NULL_FUNCREF, 0),
        ConstExpr::RefNull(RefType::ExternRef) => (NULL_EXTERNREF, 0),
        ConstExpr::RefFunc(index) => (u64::from(index), 0),
        ConstExpr::GlobalGet(index) => match imported_globals.get(index as usize) {
            Some(g) => {
                let v = g.get_v128();
                (v as u64, (v >> 64) as u64)
            }
            None => (0, 0),
        },
    }
}

/// A global value in its native representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
        }
    }

    pub(crate) fn to_const_expr(self) -> ConstExpr {
        match self {
            Val::I32(v) => ConstExpr::I32(v),
            Val::I64(v) => ConstExpr::I64(v),
            Val::F32(v) => ConstExpr::F32(v.to_bits()),
            Val::F64(v) => ConstExpr::F64(v.to_bits()),
            Val::V128(v) => ConstExpr::V128(v),
        }
    }
}

/// An exported global, as seen by the embedder.
#[derive(Debug, Clone)]
pub struct Global {
    instance: Arc<GlobalInstance>,
}

impl Global {
    pub(crate) fn new(instance: Arc<GlobalInstance>) -> Global {
        Global { instance }
    }

    pub fn ty(&self) -> GlobalType {
        self.instance.ty()
    }

    /// The value in its flat 64-bit slot encoding.
    pub fn get(&self) -> u64 {
        self.instance.get()
    }

    /// Reads the value as its native type. References are returned as `None`.
    pub fn val(&self) -> Option<Val> {
        let raw = self.instance.get();
        Some(match self.ty().content {
            ValType::I32 => Val::I32(raw as u32 as i32),
            ValType::I64 => Val::I64(raw as i64),
            ValType::F32 => Val::F32(f32::from_bits(raw as u32)),
            ValType::F64 => Val::F64(f64::from_bits(raw)),
            ValType::V128 => Val::V128(self.instance.get_v128()),
            ValType::FuncRef | ValType::ExternRef => return None,
        })
    }

    /// Stores a value in its flat 64-bit slot encoding.
    pub fn set(&self, val: u64) -> Result<()> {
        if !self.ty().is_mutable() {
            bail!("immutable global cannot be set");
        }
        self.instance.set(val);
        Ok(())
    }

    pub fn instance(&self) -> &Arc<GlobalInstance> {
        &self.instance
    }
}
