//! Gas-metered tree-walking interpreter for a Go-like language.
//!
//! Programs arrive as syntax trees whose names were already resolved to
//! `(depth, index)` paths into lexical blocks. The [`machine::Machine`] walks
//! them on explicit stacks, one opcode per step, so every step can be charged
//! and execution can stop at any point without leaving the host in a bad
//! state.
//!
//! # Resource accounting
//!
//! - **CPU**: every opcode has a fixed cost, counted against an optional
//!   cycle limit and consumed from the gas meter
//! - **Memory**: every value is charged through the [`alloc::Allocator`]
//!   when built; crossing the ceiling triggers a [`gc`] pass that recounts
//!   reachable memory, and a second crossing without relief is fatal
//! - **Collection**: values visited by a pass are paid for as gas
//! - **Escapes**: heap items whose address was taken are tracked by the
//!   [`heap`] root tracker and released when their last pointer goes away
//!
//! # Modules
//!
//! - [`alloc`]: Byte accounting, cost table and charged constructors
//! - [`errors`]: Fatal execution errors
//! - [`gas`]: Gas meters and per-category profiles
//! - [`gc`]: Deep collector recounting reachable memory
//! - [`heap`]: Root tracker for heap-escaped locals
//! - [`isa`]: Opcode table and CPU costs
//! - [`machine`]: The interpreter, its frames and builtins
//! - [`nodes`]: Pre-resolved syntax trees
//! - [`pool`]: Reuse of drained machines
//! - [`profile`]: Allocation observers
//! - [`store`]: Loading persisted blocks
//! - [`types`]: Static types
//! - [`values`]: Runtime values, blocks and packages

pub mod alloc;
pub mod errors;
pub mod gas;
pub mod gc;
pub mod heap;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod machine;
pub mod nodes;
pub mod pool;
pub mod profile;
pub mod store;
pub mod types;
pub mod values;
