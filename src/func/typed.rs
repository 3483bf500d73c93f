use super::{HostFunc, HostKind};
use crate::call_context::{CallContext, Context};
use anyhow::Result;
use wasmcore_environ::ValType;

/// A native type that can be passed to or returned from a host function.
///
/// Each value travels as one 64-bit slot: integers zero-extended from their
/// unsigned form, floats as their IEEE-754 bit pattern, and `usize` as an
/// opaque `externref` handle.
///
/// This trait should not be implemented by external users, it's only intended
/// as an implementation detail of this crate.
pub trait HostTy: Send + Sized + 'static {
    #[doc(hidden)]
    fn valtype() -> ValType;
    #[doc(hidden)]
    fn from_slot(slot: u64) -> Self;
    #[doc(hidden)]
    fn into_slot(self) -> u64;
}

impl HostTy for i32 {
    fn valtype() -> ValType {
        ValType::I32
    }
    fn from_slot(slot: u64) -> i32 {
        slot as u32 as i32
    }
    fn into_slot(self) -> u64 {
        u64::from(self as u32)
    }
}

impl HostTy for u32 {
    fn valtype() -> ValType {
        ValType::I32
    }
    fn from_slot(slot: u64) -> u32 {
        slot as u32
    }
    fn into_slot(self) -> u64 {
        u64::from(self)
    }
}

impl HostTy for i64 {
    fn valtype() -> ValType {
        ValType::I64
    }
    fn from_slot(slot: u64) -> i64 {
        slot as i64
    }
    fn into_slot(self) -> u64 {
        self as u64
    }
}

impl HostTy for u64 {
    fn valtype() -> ValType {
        ValType::I64
    }
    fn from_slot(slot: u64) -> u64 {
        slot
    }
    fn into_slot(self) -> u64 {
        self
    }
}

impl HostTy for f32 {
    fn valtype() -> ValType {
        ValType::F32
    }
    fn from_slot(slot: u64) -> f32 {
        f32::from_bits(slot as u32)
    }
    fn into_slot(self) -> u64 {
        u64::from(self.to_bits())
    }
}

impl HostTy for f64 {
    fn valtype() -> ValType {
        ValType::F64
    }
    fn from_slot(slot: u64) -> f64 {
        f64::from_bits(slot)
    }
    fn into_slot(self) -> u64 {
        self.to_bits()
    }
}

impl HostTy for usize {
    fn valtype() -> ValType {
        ValType::ExternRef
    }
    fn from_slot(slot: u64) -> usize {
        slot as usize
    }
    fn into_slot(self) -> u64 {
        self as u64
    }
}

/// The return type of a host function: nothing, a single [`HostTy`], a
/// tuple of them, or any of those wrapped in `anyhow::Result` to trap.
///
/// This trait should not be implemented by external users, it's only intended
/// as an implementation detail of this crate.
pub trait HostResults: 'static {
    #[doc(hidden)]
    fn valtypes() -> Vec<ValType>;
    #[doc(hidden)]
    fn into_slots(self) -> Result<Vec<u64>>;
}

impl HostResults for () {
    fn valtypes() -> Vec<ValType> {
        Vec::new()
    }
    fn into_slots(self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }
}

impl<T: HostTy> HostResults for T {
    fn valtypes() -> Vec<ValType> {
        vec![T::valtype()]
    }
    fn into_slots(self) -> Result<Vec<u64>> {
        Ok(vec![self.into_slot()])
    }
}

impl<T: HostResults> HostResults for Result<T> {
    fn valtypes() -> Vec<ValType> {
        T::valtypes()
    }
    fn into_slots(self) -> Result<Vec<u64>> {
        self?.into_slots()
    }
}

macro_rules! impl_host_results {
    ($n:tt $($t:ident)*) => {
        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<$($t: HostTy,)*> HostResults for ($($t,)*) {
            fn valtypes() -> Vec<ValType> {
                vec![$($t::valtype(),)*]
            }
            fn into_slots(self) -> Result<Vec<u64>> {
                let ($($t,)*) = self;
                Ok(vec![$($t.into_slot(),)*])
            }
        }
    };
}

impl_host_results!(2 A1 A2);
impl_host_results!(3 A1 A2 A3);
impl_host_results!(4 A1 A2 A3 A4);

/// Internal trait implemented for all closures that can be adapted into a
/// [`HostFunc`].
///
/// The closure may take a leading `&Context`, a leading `&CallContext`, or
/// both in that order, followed by up to eight [`HostTy`] parameters.
///
/// This trait should not be implemented by external users, it's only intended
/// as an implementation detail of this crate.
pub trait IntoHostFunc<Params, Results>: Send + Sync + 'static {
    #[doc(hidden)]
    fn into_host_func(self) -> HostFunc;
}

macro_rules! impl_into_host_func {
    ($num:tt $($args:ident)*) => {
        // Implement for functions without leading context parameters,
        // delegating to the implementation below which takes both.
        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<F, $($args,)* R> IntoHostFunc<($($args,)*), R> for F
        where
            F: Fn($($args),*) -> R + Send + Sync + 'static,
            $($args: HostTy,)*
            R: HostResults,
        {
            fn into_host_func(self) -> HostFunc {
                let f = move |_: &Context, _: &CallContext, $($args: $args),*| {
                    self($($args),*)
                };
                adapt::<_, ($($args,)*), R>(HostKind::NoContext, f)
            }
        }

        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<F, $($args,)* R> IntoHostFunc<(Context, $($args,)*), R> for F
        where
            F: Fn(&Context, $($args),*) -> R + Send + Sync + 'static,
            $($args: HostTy,)*
            R: HostResults,
        {
            fn into_host_func(self) -> HostFunc {
                let f = move |ctx: &Context, _: &CallContext, $($args: $args),*| {
                    self(ctx, $($args),*)
                };
                adapt::<_, ($($args,)*), R>(HostKind::Context, f)
            }
        }

        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<F, $($args,)* R> IntoHostFunc<(CallContext, $($args,)*), R> for F
        where
            F: Fn(&CallContext, $($args),*) -> R + Send + Sync + 'static,
            $($args: HostTy,)*
            R: HostResults,
        {
            fn into_host_func(self) -> HostFunc {
                let f = move |_: &Context, module: &CallContext, $($args: $args),*| {
                    self(module, $($args),*)
                };
                adapt::<_, ($($args,)*), R>(HostKind::Module, f)
            }
        }

        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<F, $($args,)* R> IntoHostFunc<(Context, CallContext, $($args,)*), R> for F
        where
            F: Fn(&Context, &CallContext, $($args),*) -> R + Send + Sync + 'static,
            $($args: HostTy,)*
            R: HostResults,
        {
            fn into_host_func(self) -> HostFunc {
                adapt::<_, ($($args,)*), R>(HostKind::ContextModule, self)
            }
        }
    };
}

/// Turns a closure taking both contexts and typed parameters into a
/// [`HostFunc`] over flat slots.
trait Adapt<Params, Results>: Send + Sync + 'static {
    fn valtypes() -> Vec<ValType>;
    fn call_slots(&self, ctx: &Context, module: &CallContext, params: &[u64]) -> Result<Vec<u64>>;
}

fn adapt<F, P, R>(kind: HostKind, f: F) -> HostFunc
where
    F: Adapt<P, R>,
    R: HostResults,
{
    HostFunc::from_typed(
        kind,
        &F::valtypes(),
        R::valtypes(),
        move |ctx: &Context, module: &CallContext, params: &[u64]| f.call_slots(ctx, module, params),
    )
}

macro_rules! impl_adapt {
    ($num:tt $($args:ident)*) => {
        #[allow(non_snake_case, reason = "macro-generated code")]
        impl<F, $($args,)* R> Adapt<($($args,)*), R> for F
        where
            F: Fn(&Context, &CallContext, $($args),*) -> R + Send + Sync + 'static,
            $($args: HostTy,)*
            R: HostResults,
        {
            fn valtypes() -> Vec<ValType> {
                vec![$($args::valtype(),)*]
            }

            fn call_slots(
                &self,
                ctx: &Context,
                module: &CallContext,
                params: &[u64],
            ) -> Result<Vec<u64>> {
                #[allow(unused_mut, unused_variables, reason = "macro-generated code")]
                let mut slots = params.iter().copied();
                $(let $args = $args::from_slot(slots.next().unwrap_or_default());)*
                self(ctx, module, $($args),*).into_slots()
            }
        }
    };
}

for_each_function_signature!(impl_adapt);
for_each_function_signature!(impl_into_host_func);
