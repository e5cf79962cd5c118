//! Native type reflection
//!
//! Rust types opt into the registry by implementing [`Reflect`], usually via
//! `#[derive(Reflect)]`. The typed [`NativeTypeBuilder`] turns Rust trait
//! implementations into registry operations: `Default` becomes the default and
//! move constructors, `Clone` the copy constructor and assignment, and so on.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{
    FieldDescriptor, FunctionDescriptor, JsonCodec, OperatorKind, TypeBuilder, TypeDescriptor, TypeId, TypeTraits,
    ValueForm, arg, arg_mut, native_destructor, write_return,
};

/// A Rust type that can describe itself to the registry.
pub trait Reflect: Sized + 'static {
    /// Fully-qualified name; its hash is the type's [`TypeId`].
    const TYPE_NAME: &'static str;

    /// Add operations, fields and flags to the description.
    fn describe(builder: NativeTypeBuilder<Self>) -> NativeTypeBuilder<Self> {
        builder
    }
}

pub fn type_id_of<T: Reflect>() -> TypeId {
    TypeId::of_name(T::TYPE_NAME)
}

/// Describe a native type without registering it.
pub fn describe_native<T: Reflect>() -> TypeDescriptor {
    T::describe(NativeTypeBuilder::new()).build()
}

/// Typed builder for a native type's [`TypeDescriptor`].
pub struct NativeTypeBuilder<T> {
    inner: TypeBuilder,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Reflect> Default for NativeTypeBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reflect> NativeTypeBuilder<T> {
    pub fn new() -> Self {
        let inner = TypeBuilder::new(T::TYPE_NAME, Layout::new::<T>()).destructor(native_destructor::<T>());
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    fn map(mut self, f: impl FnOnce(TypeBuilder) -> TypeBuilder) -> Self {
        self.inner = f(self.inner);
        self
    }

    /// Default constructor, plus move construction and assignment through `mem::take`.
    pub fn with_default(self) -> Self
    where
        T: Default,
    {
        let default = FunctionDescriptor::operator(OperatorKind::Constructor)
            .returns_of::<T>(ValueForm::Value)
            .build(|_, ret| write_return(ret, T::default()));
        let move_construct = FunctionDescriptor::operator(OperatorKind::Constructor)
            .param_of::<T>("other", ValueForm::RValue)
            .returns_of::<T>(ValueForm::Value)
            .build(|args, ret| {
                let value = mem::take(arg_mut::<T>(args, 0)?);
                write_return(ret, value)
            });
        let move_assign = FunctionDescriptor::operator(OperatorKind::Assign)
            .param_of::<T>("self", ValueForm::Ref)
            .param_of::<T>("other", ValueForm::RValue)
            .pure(false)
            .build(|args, _| {
                let value = mem::take(arg_mut::<T>(args, 1)?);
                *arg_mut::<T>(args, 0)? = value;
                Ok(None)
            });
        self.map(|b| {
            b.traits(
                TypeTraits::DEFAULT_CONSTRUCTIBLE
                    .union(TypeTraits::MOVE_CONSTRUCTIBLE)
                    .union(TypeTraits::MOVE_ASSIGNABLE),
            )
            .function(default)
            .function(move_construct)
            .function(move_assign)
        })
    }

    /// Copy constructor and copy assignment through `Clone`.
    pub fn with_clone(self) -> Self
    where
        T: Clone,
    {
        let copy_construct = FunctionDescriptor::operator(OperatorKind::Constructor)
            .param_of::<T>("other", ValueForm::ConstRef)
            .returns_of::<T>(ValueForm::Value)
            .build(|args, ret| {
                let value = arg::<T>(args, 0)?.clone();
                write_return(ret, value)
            });
        let copy_assign = FunctionDescriptor::operator(OperatorKind::Assign)
            .param_of::<T>("self", ValueForm::Ref)
            .param_of::<T>("other", ValueForm::ConstRef)
            .pure(false)
            .build(|args, _| {
                let value = arg::<T>(args, 1)?.clone();
                *arg_mut::<T>(args, 0)? = value;
                Ok(None)
            });
        self.map(|b| {
            b.traits(TypeTraits::COPY_CONSTRUCTIBLE.union(TypeTraits::COPY_ASSIGNABLE))
                .function(copy_construct)
                .function(copy_assign)
        })
    }

    /// `==` and `!=` through `PartialEq`.
    pub fn with_eq(self) -> Self
    where
        T: PartialEq,
    {
        self.binary(OperatorKind::Equal, |a: &T, b: &T| a == b)
            .binary(OperatorKind::NotEqual, |a: &T, b: &T| a != b)
    }

    /// Comparison operators through `PartialOrd`.
    pub fn with_ord(self) -> Self
    where
        T: PartialOrd,
    {
        self.binary(OperatorKind::Less, |a: &T, b: &T| a < b)
            .binary(OperatorKind::LessEqual, |a: &T, b: &T| a <= b)
            .binary(OperatorKind::Greater, |a: &T, b: &T| a > b)
            .binary(OperatorKind::GreaterEqual, |a: &T, b: &T| a >= b)
    }

    /// JSON encode/decode through serde.
    pub fn with_serde(self) -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        let codec = JsonCodec {
            encode: Arc::new(|ptr| {
                // SAFETY: codec contract, ptr holds a live T.
                let value = unsafe { ptr.cast::<T>().as_ref() };
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
            }),
            decode: Arc::new(|json, ptr| {
                let value = T::deserialize(json).map_err(|e| e.to_string())?;
                // SAFETY: codec contract, ptr is uninitialised storage for T.
                unsafe { ptr.cast::<T>().as_ptr().write(value) };
                Ok(())
            }),
        };
        self.map(|b| b.codec(codec))
    }

    /// A binary operator on two const references.
    pub fn binary<R, F>(self, op: OperatorKind, f: F) -> Self
    where
        R: Reflect,
        F: Fn(&T, &T) -> R + Send + Sync + 'static,
    {
        let function = FunctionDescriptor::operator(op)
            .param_of::<T>("a", ValueForm::ConstRef)
            .param_of::<T>("b", ValueForm::ConstRef)
            .returns_of::<R>(ValueForm::Value)
            .build(move |args, ret| {
                let value = f(arg::<T>(args, 0)?, arg::<T>(args, 1)?);
                write_return(ret, value)
            });
        self.function(function)
    }

    /// A field at `offset`, usually from `std::mem::offset_of!`.
    pub fn field<F: Reflect>(self, name: &str, offset: usize) -> Self {
        debug_assert!(offset + mem::size_of::<F>() <= mem::size_of::<T>());
        self.map(|b| b.field(FieldDescriptor::new(name, TypeId::of_name(F::TYPE_NAME), offset)))
    }

    pub fn base<B: Reflect>(self) -> Self {
        self.map(|b| b.base(TypeId::of_name(B::TYPE_NAME)))
    }

    pub fn function(self, function: FunctionDescriptor) -> Self {
        self.map(|b| b.function(function))
    }

    /// Keep the type out of script palettes and signatures.
    pub fn hidden_from_scripts(self) -> Self {
        self.map(|b| b.script_visible(false))
    }

    pub fn build(self) -> TypeDescriptor {
        self.inner.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DynamicValue, TypeRegistry};
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize, crate::Reflect)]
    #[reflect(name = "test::Health", default, clone, eq, ord, serde)]
    struct Health {
        current: f32,
        max: f32,
    }

    #[derive(crate::Reflect)]
    #[reflect(name = "test::Opaque")]
    struct Opaque {
        #[allow(dead_code)]
        handle: u64,
    }

    #[test]
    fn test_derive_describes_fields() {
        let health = describe_native::<Health>();
        assert_eq!(health.name(), "test::Health");
        assert_eq!(health.fields().len(), 2);
        assert_eq!(health.fields()[1].name, "max");
        assert_eq!(health.fields()[1].offset, mem::offset_of!(Health, max));
        assert!(health.is_copy_constructible());
        assert!(health.is_trivially_destructible());
    }

    #[test]
    fn test_derive_without_capabilities() {
        let opaque = describe_native::<Opaque>();
        assert!(!opaque.is_default_constructible());
        assert!(!opaque.is_copy_constructible());
        assert!(!opaque.is_ownable_by_scripts());
        assert!(opaque.construct(&mut []).is_err());
    }

    #[test]
    fn test_ordering_operators() {
        let registry = TypeRegistry::with_builtins();
        let health = registry.register_native::<Health>();
        let mut args = [
            DynamicValue::new(Health { current: 1.0, max: 2.0 }),
            DynamicValue::new(Health { current: 2.0, max: 2.0 }),
        ];
        let less = health.call("operator<", &mut args).unwrap().unwrap();
        assert_eq!(less.get::<bool>(), Some(&true));
    }

    #[test]
    fn test_serde_codec_round_trip() {
        let health = describe_native::<Health>();
        let value = Health { current: 5.0, max: 10.0 };
        let json = unsafe { health.to_json(std::ptr::NonNull::from(&value).cast()) }.unwrap();
        assert_eq!(json, serde_json::json!({ "current": 5.0, "max": 10.0 }));

        let buffer = health.allocate();
        unsafe { health.from_json_at(&json, buffer) }.unwrap();
        let decoded = unsafe { health.adopt(buffer) };
        assert_eq!(decoded.get::<Health>(), Some(&value));
    }
}
