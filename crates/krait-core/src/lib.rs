//! krait translation core
//!
//! The frontend-to-backend pipeline of a user-space dynamic binary
//! translator running x86-64 guests on aarch64 hosts:
//! - **frontend**: decoded guest instructions → SSA IR (`OpDispatchBuilder`)
//! - **ir**: the arena-backed SSA container and its views
//! - **cache**: the two-level guest-rip → host-code lookup cache
//! - **mem**: guest mapping mutations → cache invalidation
//! - **signal**: signal-masked critical sections
//! - **telemetry** / **perfmap**: counters and profiler symbol export
//!
//! The instruction decoder, the aarch64 emitter, and the syscall table
//! are external collaborators; this crate defines the records they
//! exchange and everything in between.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod frontend;
pub mod ir;
pub mod telemetry;

#[cfg(unix)]
pub mod cache;
#[cfg(unix)]
pub mod mem;
#[cfg(unix)]
pub mod perfmap;
#[cfg(unix)]
pub mod signal;

pub use config::TranslatorConfig;
pub use frontend::operands::{DecodedOp, Operand, X86Op};
pub use frontend::OpDispatchBuilder;
pub use ir::{IrListCopy, IrListView, NodeId};

#[cfg(unix)]
pub use cache::{CacheError, LookupCache};
