//! Graph nodes
//!
//! Each [`NodeKind`] stores only what it needs to re-resolve its descriptor by
//! name. Its pins are derived from that descriptor, see [`NodeKind::expected_pins`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use script_registry::{FuncId, FunctionDescriptor, TypeRegistry, ValueForm};

use crate::{FunctionSignature, NodeId, PinId, PinSpec, PinType, TypeRef};

/// Standard pin names
pub mod pin_names {
    pub const EXEC: &str = "Exec";
    pub const THEN: &str = "Then";
    pub const RETURN_VALUE: &str = "Return Value";
    pub const TARGET: &str = "Target";
    pub const CONDITION: &str = "Condition";
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const BREAK: &str = "Break";
    pub const START: &str = "Start";
    pub const END: &str = "End";
    pub const LOOP_BODY: &str = "Loop Body";
    pub const COMPLETED: &str = "Completed";
    pub const INDEX: &str = "Index";
    pub const IN: &str = "In";
    pub const OUT: &str = "Out";
}

use pin_names::*;

/// Type names of the loop and branch pins
pub const BOOL_TYPE: &str = "bool";
pub const INDEX_TYPE: &str = "i32";

/// Position of a node in the editor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Failure to resolve a node against the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("type `{0}` is not registered")]
    UnknownType(String),

    #[error("`{type_name}` has no function `{function}`")]
    UnknownFunction { type_name: String, function: String },

    #[error("`{type_name}::{function}` no longer has signature {signature}")]
    SignatureChanged {
        type_name: String,
        function: String,
        signature: FuncId,
    },

    #[error("`{type_name}` has no field `{field}`")]
    UnknownField { type_name: String, field: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Node Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// What a node does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeKind {
    /// Where execution starts; outputs the function's parameters
    Entry,
    /// Ends execution, producing the return value
    Return,
    /// Calls a function of a registered type
    Call {
        #[serde(rename = "type")]
        type_name: String,
        function: String,
        signature: FuncId,
    },
    /// Reads a field
    FieldGet {
        #[serde(rename = "type")]
        type_name: String,
        field: String,
    },
    /// Writes a field
    FieldSet {
        #[serde(rename = "type")]
        type_name: String,
        field: String,
    },
    Branch,
    ForLoop,
    WhileLoop,
    /// Editor annotation, never executed
    Comment { text: String },
    /// Visual passthrough for a flow or data wire
    Reroute { pin_type: PinType },
}

impl NodeKind {
    /// A call node for a function of `type_name`.
    pub fn call(type_name: &str, function: &FunctionDescriptor) -> Self {
        NodeKind::Call {
            type_name: type_name.to_string(),
            function: function.name().to_string(),
            signature: function.signature(),
        }
    }

    pub fn field_get(type_name: &str, field: &str) -> Self {
        NodeKind::FieldGet {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    pub fn field_set(type_name: &str, field: &str) -> Self {
        NodeKind::FieldSet {
            type_name: type_name.to_string(),
            field: field.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Entry => "Entry",
            NodeKind::Return => "Return",
            NodeKind::Call { .. } => "Call",
            NodeKind::FieldGet { .. } => "FieldGet",
            NodeKind::FieldSet { .. } => "FieldSet",
            NodeKind::Branch => "Branch",
            NodeKind::ForLoop => "ForLoop",
            NodeKind::WhileLoop => "WhileLoop",
            NodeKind::Comment { .. } => "Comment",
            NodeKind::Reroute { .. } => "Reroute",
        }
    }

    /// Resolve the function a call node refers to.
    pub fn resolve_call(
        type_name: &str,
        function: &str,
        signature: FuncId,
        registry: &TypeRegistry,
    ) -> Result<std::sync::Arc<FunctionDescriptor>, ResolveError> {
        let owner = registry
            .lookup_name(type_name)
            .ok_or_else(|| ResolveError::UnknownType(type_name.to_string()))?;
        let overloads = owner.functions_named(function);
        if overloads.is_empty() {
            return Err(ResolveError::UnknownFunction {
                type_name: type_name.to_string(),
                function: function.to_string(),
            });
        }
        overloads
            .into_iter()
            .find(|f| f.signature() == signature)
            .ok_or_else(|| ResolveError::SignatureChanged {
                type_name: type_name.to_string(),
                function: function.to_string(),
                signature,
            })
    }

    /// The pins this node should have, in order.
    pub fn expected_pins(
        &self,
        signature: &FunctionSignature,
        registry: &TypeRegistry,
    ) -> Result<Vec<PinSpec>, ResolveError> {
        let bool_ty = TypeRef::new(BOOL_TYPE);
        let index_ty = TypeRef::new(INDEX_TYPE);

        let pins = match self {
            NodeKind::Entry => {
                let mut pins = Vec::new();
                if !signature.pure {
                    pins.push(PinSpec::flow_out(THEN));
                }
                for param in &signature.params {
                    pins.push(PinSpec::data_out(&param.name, param.ty.clone(), param.form));
                }
                pins
            }
            NodeKind::Return => {
                let mut pins = Vec::new();
                if !signature.pure {
                    pins.push(PinSpec::flow_in(EXEC));
                }
                if let Some(ret) = &signature.ret {
                    pins.push(PinSpec::data_in(RETURN_VALUE, ret.ty.clone(), ret.form));
                }
                pins
            }
            NodeKind::Call {
                type_name,
                function,
                signature: func_id,
            } => {
                let function = Self::resolve_call(type_name, function, *func_id, registry)?;
                let type_ref = |id| {
                    registry
                        .lookup(id)
                        .map(|d| TypeRef::new(d.name()))
                        .ok_or_else(|| ResolveError::UnknownType(id.to_string()))
                };
                let mut pins = Vec::new();
                if !function.is_pure() {
                    pins.push(PinSpec::flow_in(EXEC));
                }
                for param in function.params() {
                    pins.push(PinSpec::data_in(&param.name, type_ref(param.type_id)?, param.form));
                }
                if !function.is_pure() {
                    pins.push(PinSpec::flow_out(THEN));
                }
                if let Some(ret) = function.return_param() {
                    pins.push(PinSpec::data_out(RETURN_VALUE, type_ref(ret.type_id)?, ret.form));
                }
                pins
            }
            NodeKind::FieldGet { type_name, field } | NodeKind::FieldSet { type_name, field } => {
                let owner = registry
                    .lookup_name(type_name)
                    .ok_or_else(|| ResolveError::UnknownType(type_name.clone()))?;
                let descriptor = owner.field(field).ok_or_else(|| ResolveError::UnknownField {
                    type_name: type_name.clone(),
                    field: field.clone(),
                })?;
                let field_ty = registry
                    .lookup(descriptor.type_id)
                    .map(|d| TypeRef::new(d.name()))
                    .ok_or_else(|| ResolveError::UnknownType(descriptor.type_id.to_string()))?;
                let owner_ty = TypeRef::new(type_name.clone());
                if matches!(self, NodeKind::FieldGet { .. }) {
                    vec![
                        PinSpec::data_in(TARGET, owner_ty, ValueForm::ConstRef),
                        PinSpec::data_out(field, field_ty, ValueForm::Value),
                    ]
                } else {
                    vec![
                        PinSpec::flow_in(EXEC),
                        PinSpec::data_in(TARGET, owner_ty, ValueForm::Ref),
                        PinSpec::data_in(field, field_ty, ValueForm::ConstRef),
                        PinSpec::flow_out(THEN),
                    ]
                }
            }
            NodeKind::Branch => vec![
                PinSpec::flow_in(EXEC),
                PinSpec::data_in(CONDITION, bool_ty, ValueForm::Value),
                PinSpec::flow_out(TRUE),
                PinSpec::flow_out(FALSE),
            ],
            NodeKind::ForLoop => vec![
                PinSpec::flow_in(EXEC),
                PinSpec::flow_in(BREAK),
                PinSpec::data_in(START, index_ty.clone(), ValueForm::Value),
                PinSpec::data_in(END, index_ty.clone(), ValueForm::Value),
                PinSpec::flow_out(LOOP_BODY),
                PinSpec::flow_out(COMPLETED),
                PinSpec::data_out(INDEX, index_ty, ValueForm::Value),
            ],
            NodeKind::WhileLoop => vec![
                PinSpec::flow_in(EXEC),
                PinSpec::flow_in(BREAK),
                PinSpec::data_in(CONDITION, bool_ty, ValueForm::Value),
                PinSpec::flow_out(LOOP_BODY),
                PinSpec::flow_out(COMPLETED),
            ],
            NodeKind::Comment { .. } => Vec::new(),
            NodeKind::Reroute { pin_type } => vec![
                PinSpec {
                    direction: crate::PinDirection::Input,
                    name: IN.to_string(),
                    pin_type: pin_type.clone(),
                },
                PinSpec {
                    direction: crate::PinDirection::Output,
                    name: OUT.to_string(),
                    pin_type: pin_type.clone(),
                },
            ],
        };
        Ok(pins)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph Node
// ─────────────────────────────────────────────────────────────────────────────

/// A node and its contiguous pin range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    #[serde(flatten)]
    pub kind: NodeKind,
    pub first_pin: PinId,
    pub pin_count: u32,
    #[serde(default)]
    pub position: Position,
}

impl GraphNode {
    /// Ids of this node's pins, tombstoned ones included.
    pub fn pin_ids(&self) -> impl Iterator<Item = PinId> + use<> {
        let first = self.first_pin.get();
        (first..first + self.pin_count).map(PinId::new)
    }

    pub fn owns_pin(&self, pin: PinId) -> bool {
        pin.get() >= self.first_pin.get() && pin.get() < self.first_pin.get() + self.pin_count
    }

    /// Entry, Return, Branch and loops are statements whatever their pins look like.
    pub fn is_always_impure(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Entry | NodeKind::Return | NodeKind::Branch | NodeKind::ForLoop | NodeKind::WhileLoop
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_registry::{TypeRegistry, native_fn2};

    #[test]
    fn test_node_kind_json_is_tagged() {
        let kind = NodeKind::field_get("Player", "health");
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "FieldGet", "type": "Player", "field": "health" })
        );
    }

    #[test]
    fn test_for_loop_pins() {
        let registry = TypeRegistry::with_builtins();
        let pins = NodeKind::ForLoop
            .expected_pins(&FunctionSignature::default(), &registry)
            .unwrap();
        let names: Vec<_> = pins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["Exec", "Break", "Start", "End", "Loop Body", "Completed", "Index"]);
    }

    #[test]
    fn test_pure_call_has_no_flow_pins() {
        let registry = TypeRegistry::with_builtins();
        let i32_type = registry.lookup_name("i32").unwrap();
        let max = native_fn2::<i32, i32, i32, _>("Max", "a", "b", |a, b| *a.max(b));
        let kind = NodeKind::call("i32", &max);
        i32_type.add_function(std::sync::Arc::new(max));

        let pins = kind.expected_pins(&FunctionSignature::default(), &registry).unwrap();
        assert_eq!(pins.len(), 3);
        assert!(pins.iter().all(|p| !p.pin_type.is_flow()));
    }

    #[test]
    fn test_unknown_function_is_reported() {
        let registry = TypeRegistry::with_builtins();
        let kind = NodeKind::Call {
            type_name: "i32".into(),
            function: "Teleport".into(),
            signature: FuncId::from_raw(1),
        };
        let err = kind.expected_pins(&FunctionSignature::default(), &registry).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownFunction { .. }));
    }
}
