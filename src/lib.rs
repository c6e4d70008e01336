//! Gas-metered interpreter core.
//!
//! Provides the execution engine, allocator, collectors and root tracker of a
//! Go-like virtual machine.

pub mod utils;
pub mod virtual_machine;
