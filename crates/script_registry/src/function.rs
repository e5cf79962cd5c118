//! Callable operations attached to types
//!
//! Every operation a type exposes, including its constructors and operators, is
//! a [`FunctionDescriptor`] with a uniform thunk signature. Native functions and
//! interpreter-backed script functions are indistinguishable to callers.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DynamicValue, Reflect, TypeId, ValueForm, hash_bytes, name_hash, type_id_of};

// ─────────────────────────────────────────────────────────────────────────────
// Call Results
// ─────────────────────────────────────────────────────────────────────────────

/// A failed call, carrying a diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CallError {
    message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Success with an optional produced value, or failure with a message.
///
/// When the caller supplies a return buffer the callee constructs the result in
/// place and returns `Ok(None)`.
pub type CallResult = Result<Option<DynamicValue>, CallError>;

/// Uniform invocation thunk: arguments plus an optional uninitialised return buffer.
pub type Thunk = Arc<dyn Fn(&mut [DynamicValue], Option<NonNull<u8>>) -> CallResult + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Function Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Operators a type can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    Constructor,
    Assign,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Negate,
    Not,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 15] = [
        OperatorKind::Constructor,
        OperatorKind::Assign,
        OperatorKind::Equal,
        OperatorKind::NotEqual,
        OperatorKind::Less,
        OperatorKind::LessEqual,
        OperatorKind::Greater,
        OperatorKind::GreaterEqual,
        OperatorKind::Add,
        OperatorKind::Subtract,
        OperatorKind::Multiply,
        OperatorKind::Divide,
        OperatorKind::Remainder,
        OperatorKind::Negate,
        OperatorKind::Not,
    ];

    /// The name graphs use to refer to this operator.
    pub fn function_name(self) -> &'static str {
        match self {
            OperatorKind::Constructor => "operator new",
            OperatorKind::Assign => "operator=",
            OperatorKind::Equal => "operator==",
            OperatorKind::NotEqual => "operator!=",
            OperatorKind::Less => "operator<",
            OperatorKind::LessEqual => "operator<=",
            OperatorKind::Greater => "operator>",
            OperatorKind::GreaterEqual => "operator>=",
            OperatorKind::Add => "operator+",
            OperatorKind::Subtract => "operator-",
            OperatorKind::Multiply => "operator*",
            OperatorKind::Divide => "operator/",
            OperatorKind::Remainder => "operator%",
            OperatorKind::Negate => "operator neg",
            OperatorKind::Not => "operator!",
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.function_name() == name)
    }
}

/// Key of the per-type function multimap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKey {
    Operator(OperatorKind),
    Named(u32),
}

impl FunctionKey {
    /// Key for a function name; operator names map to their operator.
    pub fn from_name(name: &str) -> Self {
        match OperatorKind::from_function_name(name) {
            Some(op) => FunctionKey::Operator(op),
            None => FunctionKey::Named(name_hash(name)),
        }
    }
}

impl From<OperatorKind> for FunctionKey {
    fn from(op: OperatorKind) -> Self {
        FunctionKey::Operator(op)
    }
}

/// Structural signature hash: parameter and return types and forms, not names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuncId(u32);

impl FuncId {
    pub fn of_signature(params: &[ParamDesc], ret: Option<&ParamDesc>) -> Self {
        let mut hash = name_hash("fn");
        for param in params {
            hash = hash_bytes(hash, &param.type_id.as_u32().to_le_bytes());
            hash = hash_bytes(hash, &[param.form as u8]);
        }
        hash = hash_bytes(hash, b"->");
        if let Some(ret) = ret {
            hash = hash_bytes(hash, &ret.type_id.as_u32().to_le_bytes());
            hash = hash_bytes(hash, &[ret.form as u8]);
        }
        Self(hash)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// One parameter (or the return slot) of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDesc {
    pub name: String,
    pub type_id: TypeId,
    pub form: ValueForm,
}

impl ParamDesc {
    pub fn new(name: impl Into<String>, type_id: TypeId, form: ValueForm) -> Self {
        Self {
            name: name.into(),
            type_id,
            form,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// A callable operation of a type.
pub struct FunctionDescriptor {
    name: String,
    key: FunctionKey,
    params: Vec<ParamDesc>,
    ret: Option<ParamDesc>,
    pure: bool,
    signature: FuncId,
    thunk: Thunk,
}

impl FunctionDescriptor {
    /// Start building a named function.
    pub fn builder(name: impl Into<String>) -> FunctionBuilder {
        let name = name.into();
        let key = FunctionKey::from_name(&name);
        FunctionBuilder {
            name,
            key,
            params: Vec::new(),
            ret: None,
            pure: false,
        }
    }

    /// Start building an operator.
    pub fn operator(op: OperatorKind) -> FunctionBuilder {
        FunctionBuilder {
            name: op.function_name().to_string(),
            key: FunctionKey::Operator(op),
            params: Vec::new(),
            ret: None,
            pure: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> FunctionKey {
        self.key
    }

    pub fn params(&self) -> &[ParamDesc] {
        &self.params
    }

    pub fn return_param(&self) -> Option<&ParamDesc> {
        self.ret.as_ref()
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn signature(&self) -> FuncId {
        self.signature
    }

    /// Check an argument list of (type, form, is-null) triples against the parameters.
    pub fn check_arguments(
        &self,
        args: impl ExactSizeIterator<Item = (TypeId, ValueForm, bool)>,
    ) -> Result<(), CallError> {
        if args.len() != self.params.len() {
            return Err(CallError::new(format!(
                "`{}` expects {} argument(s), got {}",
                self.name,
                self.params.len(),
                args.len()
            )));
        }
        for (index, ((type_id, form, is_null), param)) in args.zip(&self.params).enumerate() {
            if type_id != param.type_id {
                return Err(CallError::new(format!(
                    "argument {} (`{}`) of `{}` expects type {}, got {}",
                    index, param.name, self.name, param.type_id, type_id
                )));
            }
            if !param.form.accepts(form) {
                return Err(CallError::new(format!(
                    "argument {} (`{}`) of `{}` expects a {} argument, got {}",
                    index, param.name, self.name, param.form, form
                )));
            }
            if is_null && !param.form.is_nullable() {
                return Err(CallError::new(format!(
                    "argument {} (`{}`) of `{}` must not be null",
                    index, param.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Validate the arguments, then run the thunk.
    pub fn invoke(&self, args: &mut [DynamicValue], ret: Option<NonNull<u8>>) -> CallResult {
        self.check_arguments(args.iter().map(|a| (a.type_id(), a.form(), a.is_null())))?;
        (self.thunk)(args, ret)
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret", &self.ret)
            .field("pure", &self.pure)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Builder for [`FunctionDescriptor`].
pub struct FunctionBuilder {
    name: String,
    key: FunctionKey,
    params: Vec<ParamDesc>,
    ret: Option<ParamDesc>,
    pure: bool,
}

impl FunctionBuilder {
    pub fn param(mut self, name: impl Into<String>, type_id: TypeId, form: ValueForm) -> Self {
        self.params.push(ParamDesc::new(name, type_id, form));
        self
    }

    pub fn param_of<T: Reflect>(self, name: impl Into<String>, form: ValueForm) -> Self {
        self.param(name, type_id_of::<T>(), form)
    }

    pub fn returns(mut self, type_id: TypeId, form: ValueForm) -> Self {
        self.ret = Some(ParamDesc::new("Return Value", type_id, form));
        self
    }

    pub fn returns_of<T: Reflect>(self, form: ValueForm) -> Self {
        self.returns(type_id_of::<T>(), form)
    }

    pub fn pure(mut self, pure: bool) -> Self {
        self.pure = pure;
        self
    }

    pub fn build<F>(self, thunk: F) -> FunctionDescriptor
    where
        F: Fn(&mut [DynamicValue], Option<NonNull<u8>>) -> CallResult + Send + Sync + 'static,
    {
        self.build_with(Arc::new(thunk))
    }

    pub fn build_with(self, thunk: Thunk) -> FunctionDescriptor {
        let signature = FuncId::of_signature(&self.params, self.ret.as_ref());
        FunctionDescriptor {
            name: self.name,
            key: self.key,
            params: self.params,
            ret: self.ret,
            pure: self.pure,
            signature,
            thunk,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thunk helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Typed access to argument `index`.
pub fn arg<T: Reflect>(args: &[DynamicValue], index: usize) -> Result<&T, CallError> {
    args.get(index)
        .and_then(|a| a.get::<T>())
        .ok_or_else(|| CallError::new(format!("argument {} is not a readable `{}`", index, T::TYPE_NAME)))
}

/// Typed mutable access to argument `index`.
pub fn arg_mut<T: Reflect>(args: &mut [DynamicValue], index: usize) -> Result<&mut T, CallError> {
    args.get_mut(index)
        .and_then(|a| a.get_mut::<T>())
        .ok_or_else(|| CallError::new(format!("argument {} is not a writable `{}`", index, T::TYPE_NAME)))
}

/// Construct a result in the caller's buffer, or hand it back as an owned value.
pub fn write_return<T: Reflect>(ret: Option<NonNull<u8>>, value: T) -> CallResult {
    match ret {
        Some(buffer) => {
            // SAFETY: thunk contract, the buffer is uninitialised storage for T.
            unsafe { buffer.cast::<T>().as_ptr().write(value) };
            Ok(None)
        }
        None => Ok(Some(DynamicValue::new(value))),
    }
}

/// A pure native function of one argument taken by const reference.
pub fn native_fn1<A, R, F>(name: &str, a: &str, f: F) -> FunctionDescriptor
where
    A: Reflect,
    R: Reflect,
    F: Fn(&A) -> R + Send + Sync + 'static,
{
    FunctionDescriptor::builder(name)
        .param_of::<A>(a, ValueForm::ConstRef)
        .returns_of::<R>(ValueForm::Value)
        .pure(true)
        .build(move |args, ret| {
            let value = f(arg::<A>(args, 0)?);
            write_return(ret, value)
        })
}

/// A pure native function of two arguments taken by const reference.
pub fn native_fn2<A, B, R, F>(name: &str, a: &str, b: &str, f: F) -> FunctionDescriptor
where
    A: Reflect,
    B: Reflect,
    R: Reflect,
    F: Fn(&A, &B) -> R + Send + Sync + 'static,
{
    FunctionDescriptor::builder(name)
        .param_of::<A>(a, ValueForm::ConstRef)
        .param_of::<B>(b, ValueForm::ConstRef)
        .returns_of::<R>(ValueForm::Value)
        .pure(true)
        .build(move |args, ret| {
            let value = f(arg::<A>(args, 0)?, arg::<B>(args, 1)?);
            write_return(ret, value)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> FunctionDescriptor {
        native_fn2::<i32, i32, i32, _>("Add", "a", "b", |a, b| a + b)
    }

    #[test]
    fn test_invoke_returns_owned_value() {
        let f = add();
        let mut args = [DynamicValue::new(2i32), DynamicValue::new(3i32)];
        let result = f.invoke(&mut args, None).unwrap().unwrap();
        assert_eq!(result.get::<i32>(), Some(&5));
    }

    #[test]
    fn test_invoke_writes_into_return_buffer() {
        let f = add();
        let mut args = [DynamicValue::new(2i32), DynamicValue::new(3i32)];
        let mut out = 0i32;
        let result = f.invoke(&mut args, Some(NonNull::from(&mut out).cast())).unwrap();
        assert!(result.is_none());
        assert_eq!(out, 5);
    }

    #[test]
    fn test_invoke_rejects_wrong_arity() {
        let f = add();
        let mut args = [DynamicValue::new(2i32)];
        let err = f.invoke(&mut args, None).unwrap_err();
        assert!(err.message().contains("expects 2 argument(s), got 1"));
    }

    #[test]
    fn test_invoke_rejects_wrong_type() {
        let f = add();
        let mut args = [DynamicValue::new(2i32), DynamicValue::new(3.0f32)];
        let err = f.invoke(&mut args, None).unwrap_err();
        assert!(err.message().contains("argument 1 (`b`)"));
    }

    #[test]
    fn test_ref_parameter_rejects_const_argument() {
        let f = FunctionDescriptor::builder("Increment")
            .param_of::<i32>("value", ValueForm::Ref)
            .build(|args, _| {
                *arg_mut::<i32>(args, 0)? += 1;
                Ok(None)
            });
        let number = 1i32;
        let mut args =
            [unsafe { DynamicValue::borrowed(type_id_of::<i32>(), ValueForm::ConstRef, NonNull::from(&number).cast()) }];
        let err = f.invoke(&mut args, None).unwrap_err();
        assert!(err.message().contains("expects a ref argument, got const ref"));
        assert_eq!(number, 1);
    }

    #[test]
    fn test_signature_ignores_names() {
        let a = native_fn2::<i32, i32, i32, _>("Add", "a", "b", |a, b| a + b);
        let b = native_fn2::<i32, i32, i32, _>("Sub", "x", "y", |a, b| a - b);
        let c = native_fn2::<i32, f32, i32, _>("Mix", "a", "b", |a, _| *a);
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_operator_names_round_trip() {
        for op in OperatorKind::ALL {
            assert_eq!(OperatorKind::from_function_name(op.function_name()), Some(op));
        }
        assert_eq!(FunctionKey::from_name("operator+"), FunctionKey::Operator(OperatorKind::Add));
        assert_eq!(FunctionKey::from_name("Jump"), FunctionKey::Named(name_hash("Jump")));
    }
}
