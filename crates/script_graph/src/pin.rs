//! Pins and links

use std::fmt;

use serde::{Deserialize, Serialize};

use script_registry::{Reflect, TypeId, ValueForm};

use crate::{LinkId, NodeId, PinId};

// ─────────────────────────────────────────────────────────────────────────────
// Type references
// ─────────────────────────────────────────────────────────────────────────────

/// A type referred to by name. Serialized as the bare name; the id is the
/// name's hash, so references re-resolve by name on load.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TypeRef {
    name: String,
    id: TypeId,
}

impl TypeRef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: TypeId::of_name(&name),
            name,
        }
    }

    pub fn of<T: Reflect>() -> Self {
        Self::new(T::TYPE_NAME)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TypeId {
        self.id
    }
}

impl From<String> for TypeRef {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<TypeRef> for String {
    fn from(ty: TypeRef) -> Self {
        ty.name
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({})", self.name)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pins
// ─────────────────────────────────────────────────────────────────────────────

/// Direction of a pin (input or output)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinDirection {
    Input,
    Output,
}

/// What travels through a pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PinType {
    /// Execution order between statements
    Flow,
    /// A value of a registered type
    Data {
        #[serde(rename = "type")]
        ty: TypeRef,
        form: ValueForm,
    },
}

impl PinType {
    pub fn data(ty: TypeRef, form: ValueForm) -> Self {
        PinType::Data { ty, form }
    }

    pub fn is_flow(&self) -> bool {
        matches!(self, PinType::Flow)
    }

    pub fn type_ref(&self) -> Option<&TypeRef> {
        match self {
            PinType::Flow => None,
            PinType::Data { ty, .. } => Some(ty),
        }
    }

    pub fn form(&self) -> Option<ValueForm> {
        match self {
            PinType::Flow => None,
            PinType::Data { form, .. } => Some(*form),
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinType::Flow => f.write_str("flow"),
            PinType::Data { ty, form } => write!(f, "{} ({})", ty, form),
        }
    }
}

/// A pin on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub node: NodeId,
    pub direction: PinDirection,
    pub name: String,
    #[serde(rename = "type")]
    pub pin_type: PinType,
    /// Fallback for an unlinked data input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Pin {
    pub fn is_input(&self) -> bool {
        self.direction == PinDirection::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == PinDirection::Output
    }

    pub fn is_flow(&self) -> bool {
        self.pin_type.is_flow()
    }
}

/// Shape of a pin before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinSpec {
    pub direction: PinDirection,
    pub name: String,
    pub pin_type: PinType,
}

impl PinSpec {
    pub fn flow_in(name: &str) -> Self {
        Self {
            direction: PinDirection::Input,
            name: name.to_string(),
            pin_type: PinType::Flow,
        }
    }

    pub fn flow_out(name: &str) -> Self {
        Self {
            direction: PinDirection::Output,
            name: name.to_string(),
            pin_type: PinType::Flow,
        }
    }

    pub fn data_in(name: &str, ty: TypeRef, form: ValueForm) -> Self {
        Self {
            direction: PinDirection::Input,
            name: name.to_string(),
            pin_type: PinType::data(ty, form),
        }
    }

    pub fn data_out(name: &str, ty: TypeRef, form: ValueForm) -> Self {
        Self {
            direction: PinDirection::Output,
            name: name.to_string(),
            pin_type: PinType::data(ty, form),
        }
    }

    /// Whether an existing pin has this shape.
    pub fn matches(&self, pin: &Pin) -> bool {
        pin.direction == self.direction && pin.name == self.name && pin.pin_type == self.pin_type
    }
}

/// A connection from an output pin to an input pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub input: PinId,
    pub output: PinId,
}
