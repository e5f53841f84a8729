//! SSA intermediate representation for translated guest code
//!
//! One translation unit is a pair of dense arenas: an ordered node list
//! (the SSA values, intrusively linked in emission order) and an op arena
//! (the payloads the nodes point at). Nodes resolve their payload through
//! an index, so rewriting that index reaches every use of the value.

pub mod arena;
pub mod node;
pub mod ops;
pub mod view;

pub use arena::Arena;
pub use node::{NodeId, OrderedNode};
pub use ops::{BreakReason, CondCode, Op, OpId, OpKind, MAX_ARGS};
pub use view::{IrListCopy, IrListView};
