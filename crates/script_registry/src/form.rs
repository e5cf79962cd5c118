//! How a value is held when it crosses a function boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of ways a [`DynamicValue`](crate::DynamicValue) can refer to its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueForm {
    /// An owned value
    Value,
    /// A mutable reference, never null
    Ref,
    /// An immutable reference, never null
    ConstRef,
    /// A mutable pointer, may be null
    Ptr,
    /// An immutable pointer, may be null
    ConstPtr,
    /// A value the receiver may move out of
    RValue,
}

impl ValueForm {
    pub fn is_reference(self) -> bool {
        matches!(self, ValueForm::Ref | ValueForm::ConstRef)
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, ValueForm::Ptr | ValueForm::ConstPtr)
    }

    /// Value and RValue forms are owned by exactly one holder.
    pub fn is_owning(self) -> bool {
        matches!(self, ValueForm::Value | ValueForm::RValue)
    }

    pub fn is_mutable(self) -> bool {
        !matches!(self, ValueForm::ConstRef | ValueForm::ConstPtr)
    }

    pub fn is_nullable(self) -> bool {
        self.is_pointer()
    }

    /// Whether a parameter of this form accepts an argument of form `arg`.
    ///
    /// Copies are allowed into `Value`, any non-null form binds to `ConstRef`,
    /// and mutable parameters reject const arguments.
    pub fn accepts(self, arg: ValueForm) -> bool {
        use ValueForm::*;
        match self {
            Value => matches!(arg, Value | Ref | ConstRef | RValue),
            RValue => matches!(arg, Value | RValue),
            ConstRef => matches!(arg, Value | Ref | ConstRef | RValue),
            Ref => matches!(arg, Value | Ref),
            Ptr => matches!(arg, Value | Ref | Ptr),
            ConstPtr => matches!(arg, Value | Ref | ConstRef | Ptr | ConstPtr),
        }
    }
}

impl fmt::Display for ValueForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueForm::Value => "value",
            ValueForm::Ref => "ref",
            ValueForm::ConstRef => "const ref",
            ValueForm::Ptr => "ptr",
            ValueForm::ConstPtr => "const ptr",
            ValueForm::RValue => "rvalue",
        };
        f.write_str(s)
    }
}
