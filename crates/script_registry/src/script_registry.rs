//! Script Registry - Dynamic type information for the visual scripting system
//!
//! This crate gives the engine runtime reflection over types it has no
//! compile-time knowledge of. A [`TypeDescriptor`] describes layout, fields and
//! callable operations of a type; a [`DynamicValue`] carries a type-erased value
//! together with how it is held (by value, by reference, by pointer).
//!
//! Native Rust types describe themselves through the [`Reflect`] trait (usually
//! via `#[derive(Reflect)]`), scripted types are assembled at compile time by the
//! script runtime. Both end up in the same [`TypeRegistry`].

// Lets the derive macro's `::script_registry::` paths resolve inside this crate.
extern crate self as script_registry;

mod descriptor;
mod form;
mod function;
mod native;
mod primitives;
mod registry;
mod type_id;
mod value;

pub use descriptor::*;
pub use form::*;
pub use function::*;
pub use native::*;
pub use primitives::register_builtin_types;
pub use registry::*;
pub use type_id::*;
pub use value::*;

pub use script_macros::Reflect;
