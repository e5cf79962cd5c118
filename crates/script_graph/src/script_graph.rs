//! Script Graph - Editable node graphs for scripted functions
//!
//! A [`GraphFunction`] holds the nodes, pins and links of one scripted function.
//! Statements are chained through flow pins; expressions feed data pins and are
//! evaluated lazily. Ids are stable across edits: deleting a node tombstones its
//! slot instead of compacting the arrays, so saved graphs reload unchanged.
//!
//! [`collect_errors`] checks a function against the current type registry before
//! it is compiled or run.

mod error;
mod function;
mod ids;
mod node;
mod pin;
mod script;
mod validate;

pub use error::*;
pub use function::*;
pub use ids::*;
pub use node::*;
pub use pin::*;
pub use script::*;
pub use validate::*;
