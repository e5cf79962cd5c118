//! Built-in primitive types

use crate::{
    CallError, FunctionDescriptor, NativeTypeBuilder, OperatorKind, Reflect, TypeRegistry, ValueForm, arg,
    write_return,
};

macro_rules! reflect_value_type {
    ($ty:ty, $name:literal) => {
        impl Reflect for $ty {
            const TYPE_NAME: &'static str = $name;

            fn describe(builder: NativeTypeBuilder<Self>) -> NativeTypeBuilder<Self> {
                builder.with_default().with_clone().with_eq().with_ord().with_serde()
            }
        }
    };
    ($ty:ty, $name:literal, arithmetic) => {
        impl Reflect for $ty {
            const TYPE_NAME: &'static str = $name;

            fn describe(builder: NativeTypeBuilder<Self>) -> NativeTypeBuilder<Self> {
                with_arithmetic(builder.with_default().with_clone().with_eq().with_ord().with_serde())
            }
        }
    };
}

/// Arithmetic operators, where the type has them.
trait Arithmetic: Sized {
    fn add(a: &Self, b: &Self) -> Option<Self>;
    fn sub(a: &Self, b: &Self) -> Option<Self>;
    fn mul(a: &Self, b: &Self) -> Option<Self>;
    fn div(a: &Self, b: &Self) -> Option<Self>;
    fn rem(a: &Self, b: &Self) -> Option<Self>;
}

macro_rules! checked_arithmetic {
    ($($ty:ty),*) => {$(
        impl Arithmetic for $ty {
            fn add(a: &Self, b: &Self) -> Option<Self> { a.checked_add(*b) }
            fn sub(a: &Self, b: &Self) -> Option<Self> { a.checked_sub(*b) }
            fn mul(a: &Self, b: &Self) -> Option<Self> { a.checked_mul(*b) }
            fn div(a: &Self, b: &Self) -> Option<Self> { a.checked_div(*b) }
            fn rem(a: &Self, b: &Self) -> Option<Self> { a.checked_rem(*b) }
        }
    )*};
}

macro_rules! float_arithmetic {
    ($($ty:ty),*) => {$(
        impl Arithmetic for $ty {
            fn add(a: &Self, b: &Self) -> Option<Self> { Some(a + b) }
            fn sub(a: &Self, b: &Self) -> Option<Self> { Some(a - b) }
            fn mul(a: &Self, b: &Self) -> Option<Self> { Some(a * b) }
            fn div(a: &Self, b: &Self) -> Option<Self> { Some(a / b) }
            fn rem(a: &Self, b: &Self) -> Option<Self> { Some(a % b) }
        }
    )*};
}

checked_arithmetic!(i32, i64, u32, u64);
float_arithmetic!(f32, f64);

fn with_arithmetic<T: Reflect + Arithmetic>(builder: NativeTypeBuilder<T>) -> NativeTypeBuilder<T> {
    let ops: [(OperatorKind, fn(&T, &T) -> Option<T>); 5] = [
        (OperatorKind::Add, T::add),
        (OperatorKind::Subtract, T::sub),
        (OperatorKind::Multiply, T::mul),
        (OperatorKind::Divide, T::div),
        (OperatorKind::Remainder, T::rem),
    ];
    ops.into_iter().fold(builder, |builder, (op, f)| {
        builder.function(
            FunctionDescriptor::operator(op)
                .param_of::<T>("a", ValueForm::ConstRef)
                .param_of::<T>("b", ValueForm::ConstRef)
                .returns_of::<T>(ValueForm::Value)
                .build(move |args, ret| {
                    let value = f(arg::<T>(args, 0)?, arg::<T>(args, 1)?).ok_or_else(|| {
                        CallError::new(format!(
                            "`{}` {} overflowed or divided by zero",
                            T::TYPE_NAME,
                            op.function_name()
                        ))
                    })?;
                    write_return(ret, value)
                }),
        )
    })
}

reflect_value_type!(bool, "bool");
reflect_value_type!(i32, "i32", arithmetic);
reflect_value_type!(i64, "i64", arithmetic);
reflect_value_type!(u32, "u32", arithmetic);
reflect_value_type!(u64, "u64", arithmetic);
reflect_value_type!(f32, "f32", arithmetic);
reflect_value_type!(f64, "f64", arithmetic);
reflect_value_type!(String, "String");

/// Register every built-in primitive type.
pub fn register_builtin_types(registry: &TypeRegistry) {
    registry.register_native::<bool>();
    registry.register_native::<i32>();
    registry.register_native::<i64>();
    registry.register_native::<u32>();
    registry.register_native::<u64>();
    registry.register_native::<f32>();
    registry.register_native::<f64>();
    registry.register_native::<String>();

    if let Some(string) = registry.lookup_native::<String>() {
        string.add_function(std::sync::Arc::new(
            FunctionDescriptor::operator(OperatorKind::Add)
                .param_of::<String>("a", ValueForm::ConstRef)
                .param_of::<String>("b", ValueForm::ConstRef)
                .returns_of::<String>(ValueForm::Value)
                .build(|args, ret| {
                    let joined = format!("{}{}", arg::<String>(args, 0)?, arg::<String>(args, 1)?);
                    write_return(ret, joined)
                }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynamicValue;

    #[test]
    fn test_integer_addition() {
        let registry = TypeRegistry::with_builtins();
        let i32_type = registry.lookup_native::<i32>().unwrap();
        let mut args = [DynamicValue::new(40i32), DynamicValue::new(2i32)];
        let sum = i32_type.call("operator+", &mut args).unwrap().unwrap();
        assert_eq!(sum.get::<i32>(), Some(&42));
    }

    #[test]
    fn test_integer_division_by_zero_fails() {
        let registry = TypeRegistry::with_builtins();
        let i32_type = registry.lookup_native::<i32>().unwrap();
        let mut args = [DynamicValue::new(1i32), DynamicValue::new(0i32)];
        let err = i32_type.call("operator/", &mut args).unwrap_err();
        assert!(err.message().contains("divided by zero"));
    }

    #[test]
    fn test_string_concatenation() {
        let registry = TypeRegistry::with_builtins();
        let string = registry.lookup_native::<String>().unwrap();
        let mut args = [DynamicValue::new(String::from("ab")), DynamicValue::new(String::from("cd"))];
        let joined = string.call("operator+", &mut args).unwrap().unwrap();
        assert_eq!(joined.get::<String>().map(String::as_str), Some("abcd"));
    }

    #[test]
    fn test_bool_has_no_arithmetic() {
        let registry = TypeRegistry::with_builtins();
        let bool_type = registry.lookup_native::<bool>().unwrap();
        let mut args = [DynamicValue::new(true), DynamicValue::new(true)];
        assert!(bool_type.call("operator+", &mut args).is_err());
    }
}
