//! The runtime half of wasmcore: turning a validated [`Module`] into linked
//! module instances.
//!
//! A [`Store`] owns one or more [`Namespace`]s, each of which is a registry of
//! instantiated modules keyed by name. Instantiation resolves imports against
//! the namespace, builds the instance's tables, globals and memory, hands
//! function bodies to a pluggable [`Engine`], applies data segments and runs
//! the start function. The result is a [`CallContext`], the handle embedders
//! and host functions use to reach a module's exports.
//!
//! Execution itself is not part of this crate: an [`Engine`] compiles modules
//! and a [`ModuleEngine`] calls functions of one instance. Values cross that
//! boundary as flat 64-bit slots (see [`HostTy`]).

mod call_context;
mod config;
mod engine;
mod func;
mod global;
mod instance;
mod listener;
mod memory;
mod module;
mod namespace;
mod store;
mod sync;
mod sys;
mod table;
mod trap;

pub use crate::call_context::*;
pub use crate::config::*;
pub use crate::engine::*;
pub use crate::func::*;
pub use crate::global::*;
pub use crate::instance::*;
pub use crate::listener::*;
pub use crate::memory::*;
pub use crate::module::*;
pub use crate::namespace::*;
pub use crate::store::*;
pub use crate::sys::*;
pub use crate::table::*;
pub use crate::trap::*;

pub use wasmcore_environ as environ;
pub use wasmcore_environ::{
    ExternKind, FeatureError, Features, FuncType, GlobalType, MemoryType, Mutability, RefType,
    TableType, ValType, WASM_PAGE_SIZE, WASM32_MAX_PAGES, bytes_to_pages, pages_to_bytes,
};
