//! Script Runtime - Compiles and interprets visual scripts
//!
//! [`ScriptCompiler`] turns [`Script`](script_graph::Script)s into types in a
//! [`TypeRegistry`](script_registry::TypeRegistry): fields become a computed
//! layout, functions become descriptors whose thunks run the graph on an
//! [`Interpreter`]. Callers see scripted functions exactly like native ones.
//!
//! Each call gets a frame on the interpreter's bump-allocated stack. Pure nodes
//! are evaluated on demand and cached until the next statement runs.

mod compiled;
mod compiler;
mod config;
mod diagnostics;
mod frame;
mod interpreter;
mod scripted;
mod stack;

pub use compiled::{CompileContext, CompiledFunction};
pub use compiler::*;
pub use config::{ConfigError, RuntimeConfig};
pub use diagnostics::{CollectingSink, ErrorSink, TracingSink, fatal};
pub use interpreter::Interpreter;
pub use stack::{InterpreterStack, StackMark};
