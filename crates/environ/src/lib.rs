//! Static side of the wasmcore runtime: the value and type model, the set of
//! enabled proposals, the decoded module image, and validation of function
//! bodies.
//!
//! Nothing in this crate depends on how code is executed. The `wasmcore`
//! crate builds instances out of a validated [`Module`] and hands function
//! bodies to a pluggable engine.

mod const_expr;
mod features;
pub mod leb128;
mod module;
pub mod opcode;
mod types;
mod validate;

pub use crate::const_expr::*;
pub use crate::features::*;
pub use crate::module::*;
pub use crate::types::*;
pub use crate::validate::*;

/// The maximum number of values a function body may keep on its operand
/// stack, and the maximum number of distinct function types in a store.
pub const MAXIMUM_VALUES: u32 = 1 << 27;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
