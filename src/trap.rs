use thiserror::Error;

/// A runtime trap raised while executing WebAssembly.
///
/// Engines return these through `anyhow::Error`, so embedders recover the
/// kind with `error.downcast_ref::<Trap>()`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trap {
    #[error("unreachable")]
    Unreachable,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("invalid table access")]
    TableOutOfBounds,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    BadConversionToInteger,
    #[error("stack overflow")]
    StackOverflow,
}

/// Returned by calls into a module that has been closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("module {module_name:?} closed with exit_code({exit_code})")]
pub struct ExitError {
    pub module_name: String,
    pub exit_code: u32,
}

/// An active element segment did not fit its table.
///
/// When reference types are enabled this is not an instantiation failure: an
/// engine reports it from [`Engine::new_module_engine`](crate::Engine::new_module_engine)
/// alongside a usable module engine, and the segments before the offending
/// one stay written.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("element offset out of bounds: element[{segment}]")]
pub struct ElementOffsetOutOfBounds {
    pub segment: usize,
}
