mod call_context;
mod instance;
mod linking;
mod listener;
mod memory;
mod support;
mod traps;
