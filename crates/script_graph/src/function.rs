//! Graph functions
//!
//! A [`GraphFunction`] owns every node, pin and link of one scripted function in
//! index-addressed arrays. Removal leaves a `None` tombstone, so ids handed out
//! earlier stay valid and are never reused.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use script_registry::{TypeRegistry, ValueForm};

use crate::{
    GraphNode, Link, LinkId, NodeId, NodeKind, Pin, PinDirection, PinId, PinSpec, Position, ResolveError, TypeRef,
};

// ─────────────────────────────────────────────────────────────────────────────
// Signature
// ─────────────────────────────────────────────────────────────────────────────

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    pub form: ValueForm,
}

impl FunctionParam {
    pub fn new(name: &str, ty: TypeRef, form: ValueForm) -> Self {
        Self {
            name: name.to_string(),
            ty,
            form,
        }
    }
}

/// The declared return value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnSlot {
    #[serde(rename = "type")]
    pub ty: TypeRef,
    pub form: ValueForm,
}

/// Everything about a function except its body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    #[serde(default)]
    pub params: Vec<FunctionParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<ReturnSlot>,
    #[serde(default)]
    pub pure: bool,
    #[serde(default)]
    pub is_static: bool,
    /// Name of the engine event this function implements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl FunctionSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, name: &str, ty: TypeRef, form: ValueForm) -> Self {
        self.params.push(FunctionParam::new(name, ty, form));
        self
    }

    pub fn with_return(mut self, ty: TypeRef, form: ValueForm) -> Self {
        self.ret = Some(ReturnSlot { ty, form });
        self
    }

    pub fn pure(mut self, pure: bool) -> Self {
        self.pure = pure;
        self
    }

    pub fn static_fn(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn event(mut self, event: &str) -> Self {
        self.event = Some(event.to_string());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from editing a graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Pin not found: {0}")]
    PinNotFound(PinId),

    #[error("Link not allowed: {0}")]
    LinkNotAllowed(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Graph Function
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted function: its signature and its node graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphFunction {
    pub name: String,
    #[serde(flatten)]
    pub signature: FunctionSignature,
    #[serde(default)]
    nodes: Vec<Option<GraphNode>>,
    #[serde(default)]
    pins: Vec<Option<Pin>>,
    #[serde(default)]
    links: Vec<Option<Link>>,
}

impl GraphFunction {
    /// An empty function
    pub fn new(name: &str, signature: FunctionSignature) -> Self {
        Self {
            name: name.to_string(),
            signature,
            nodes: Vec::new(),
            pins: Vec::new(),
            links: Vec::new(),
        }
    }

    /// A function with its Entry node and, if it returns a value or is pure, a Return node.
    pub fn with_entry(name: &str, signature: FunctionSignature, registry: &TypeRegistry) -> Result<Self, GraphError> {
        let mut function = Self::new(name, signature);
        function.add_node(NodeKind::Entry, registry)?;
        if function.signature.ret.is_some() || function.signature.pure {
            function.add_node(NodeKind::Return, registry)?;
        }
        Ok(function)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn pin(&self, id: PinId) -> Option<&Pin> {
        self.pins.get(id.index()).and_then(Option::as_ref)
    }

    pub fn pin_mut(&mut self, id: PinId) -> Option<&mut Pin> {
        self.pins.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.index()).and_then(Option::as_ref)
    }

    /// Live nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().flatten()
    }

    /// Live pins in id order
    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.pins.iter().flatten()
    }

    /// Live links in id order
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().flatten()
    }

    /// Number of pin ids ever allocated, tombstones included
    pub fn pin_capacity(&self) -> usize {
        self.pins.len()
    }

    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_capacity(&self) -> usize {
        self.links.len()
    }

    /// Live pins of a node, in order
    pub fn node_pins(&self, node: NodeId) -> impl Iterator<Item = &Pin> {
        self.node(node)
            .into_iter()
            .flat_map(|n| n.pin_ids())
            .filter_map(|id| self.pin(id))
    }

    /// A node's pin by direction and name
    pub fn find_pin(&self, node: NodeId, direction: PinDirection, name: &str) -> Option<PinId> {
        self.node_pins(node)
            .find(|p| p.direction == direction && p.name == name)
            .map(|p| p.id)
    }

    /// Links attached to a pin
    pub fn links_of(&self, pin: PinId) -> impl Iterator<Item = &Link> {
        self.links().filter(move |l| l.input == pin || l.output == pin)
    }

    pub fn entry_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes().filter(|n| matches!(n.kind, NodeKind::Entry))
    }

    pub fn return_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes().filter(|n| matches!(n.kind, NodeKind::Return))
    }

    /// A node is pure if it has no flow pins or its leading output is not flow.
    pub fn is_pure(&self, node: NodeId) -> bool {
        let Some(graph_node) = self.node(node) else {
            return false;
        };
        if graph_node.is_always_impure() {
            return false;
        }
        let has_flow = self.node_pins(node).any(Pin::is_flow);
        let leading_output = self.node_pins(node).find(|p| p.is_output());
        !has_flow || !leading_output.is_some_and(Pin::is_flow)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a node, generating its pins from the registry.
    pub fn add_node(&mut self, kind: NodeKind, registry: &TypeRegistry) -> Result<NodeId, GraphError> {
        let specs = kind.expected_pins(&self.signature, registry)?;
        Ok(self.add_node_with_pins(kind, specs))
    }

    /// Add a node with explicit pins.
    pub fn add_node_with_pins(&mut self, kind: NodeKind, specs: Vec<PinSpec>) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        let pin_count = specs.len() as u32;
        let first_pin = self.push_pins(id, specs);
        debug!(function = %self.name, node = %id, kind = kind.label(), "Added node");
        self.nodes.push(Some(GraphNode {
            id,
            kind,
            first_pin,
            pin_count,
            position: Position::default(),
        }));
        id
    }

    fn push_pins(&mut self, node: NodeId, specs: Vec<PinSpec>) -> PinId {
        let first_pin = PinId::from_index(self.pins.len());
        for spec in specs {
            let id = PinId::from_index(self.pins.len());
            self.pins.push(Some(Pin {
                id,
                node,
                direction: spec.direction,
                name: spec.name,
                pin_type: spec.pin_type,
                default: None,
            }));
        }
        first_pin
    }

    /// Remove a node, its pins and every link touching them.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node(id).cloned().ok_or(GraphError::NodeNotFound(id))?;
        for pin in node.pin_ids() {
            self.unlink_pin(pin);
            if let Some(slot) = self.pins.get_mut(pin.index()) {
                *slot = None;
            }
        }
        self.nodes[id.index()] = None;
        debug!(function = %self.name, node = %id, "Removed node");
        Ok(())
    }

    /// Remove a single pin and its links. The node keeps its pin range.
    pub fn remove_pin(&mut self, id: PinId) -> Result<(), GraphError> {
        if self.pin(id).is_none() {
            return Err(GraphError::PinNotFound(id));
        }
        self.unlink_pin(id);
        self.pins[id.index()] = None;
        Ok(())
    }

    fn unlink_pin(&mut self, pin: PinId) {
        for slot in &mut self.links {
            if slot.as_ref().is_some_and(|l| l.input == pin || l.output == pin) {
                *slot = None;
            }
        }
    }

    /// Set a pin's fallback value.
    pub fn set_pin_default(&mut self, pin: PinId, value: Option<serde_json::Value>) -> Result<(), GraphError> {
        let pin = self.pin_mut(pin).ok_or(GraphError::PinNotFound(pin))?;
        pin.default = value;
        Ok(())
    }

    pub fn set_position(&mut self, node: NodeId, position: Position) -> Result<(), GraphError> {
        let node = self.node_mut(node).ok_or(GraphError::NodeNotFound(node))?;
        node.position = position;
        Ok(())
    }

    /// Link an output pin to an input pin.
    ///
    /// Enforces direction, flow/data agreement and fan-in/out limits: a flow
    /// output and a data input each take at most one link. Type and form
    /// compatibility are reported by [`collect_errors`](crate::collect_errors).
    pub fn add_link(&mut self, output: PinId, input: PinId) -> Result<LinkId, GraphError> {
        let out_pin = self.pin(output).ok_or(GraphError::PinNotFound(output))?;
        let in_pin = self.pin(input).ok_or(GraphError::PinNotFound(input))?;

        if out_pin.direction != PinDirection::Output || in_pin.direction != PinDirection::Input {
            return Err(GraphError::LinkNotAllowed(format!(
                "{} must be an output and {} an input",
                output, input
            )));
        }
        if out_pin.node == in_pin.node {
            return Err(GraphError::LinkNotAllowed(format!("{} cannot link to itself", out_pin.node)));
        }
        if out_pin.is_flow() != in_pin.is_flow() {
            return Err(GraphError::LinkNotAllowed(format!(
                "cannot connect {} to {}",
                out_pin.pin_type, in_pin.pin_type
            )));
        }
        if out_pin.is_flow() && self.links().any(|l| l.output == output) {
            return Err(GraphError::LinkNotAllowed(format!("flow output {} is already linked", output)));
        }
        if !in_pin.is_flow() && self.links().any(|l| l.input == input) {
            return Err(GraphError::LinkNotAllowed(format!("data input {} is already linked", input)));
        }

        let id = LinkId::from_index(self.links.len());
        self.links.push(Some(Link { id, input, output }));
        Ok(id)
    }

    pub fn remove_link(&mut self, id: LinkId) -> Option<Link> {
        self.links.get_mut(id.index()).and_then(Option::take)
    }

    /// Regenerate a node's pins from the registry after its descriptor changed.
    ///
    /// The new pins get a fresh contiguous id range; links on pins whose
    /// direction, name and flow/data kind survive are carried over.
    pub fn refresh_node(&mut self, id: NodeId, registry: &TypeRegistry) -> Result<(), GraphError> {
        let node = self.node(id).cloned().ok_or(GraphError::NodeNotFound(id))?;
        let specs = node.kind.expected_pins(&self.signature, registry)?;

        let old_pins: Vec<Pin> = node.pin_ids().filter_map(|p| self.pin(p).cloned()).collect();
        if old_pins.len() == specs.len() && specs.iter().zip(&old_pins).all(|(s, p)| s.matches(p)) {
            return Ok(());
        }

        let first_pin = self.push_pins(id, specs.clone());
        let mut remap = Vec::new();
        for old in &old_pins {
            let new = (0..specs.len() as u32).map(|i| PinId::new(first_pin.get() + i)).find(|p| {
                self.pin(*p).is_some_and(|new| {
                    new.direction == old.direction && new.name == old.name && new.is_flow() == old.is_flow()
                })
            });
            if let Some(new) = new {
                let default = old.default.clone();
                if let Some(pin) = self.pin_mut(new) {
                    pin.default = default;
                }
                remap.push((old.id, new));
            }
        }
        for link in self.links.iter_mut().flatten() {
            for (old, new) in &remap {
                if link.input == *old {
                    link.input = *new;
                }
                if link.output == *old {
                    link.output = *new;
                }
            }
        }
        for old in &old_pins {
            if !remap.iter().any(|(o, _)| *o == old.id) {
                self.unlink_pin(old.id);
            }
            self.pins[old.id.index()] = None;
        }
        if let Some(node) = self.node_mut(id) {
            node.first_pin = first_pin;
            node.pin_count = specs.len() as u32;
        }
        debug!(function = %self.name, node = %id, "Refreshed node pins");
        Ok(())
    }

    /// Replace the signature and refresh Entry and Return nodes to match.
    pub fn set_signature(&mut self, signature: FunctionSignature, registry: &TypeRegistry) -> Result<(), GraphError> {
        self.signature = signature;
        let ids: Vec<NodeId> = self
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::Entry | NodeKind::Return))
            .map(|n| n.id)
            .collect();
        for id in ids {
            self.refresh_node(id, registry)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────────

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_registry::{FunctionDescriptor, Reflect, TypeRegistry, native_fn2};
    use std::sync::Arc;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::with_builtins();
        let i32_type = registry.lookup_native::<i32>().unwrap();
        i32_type.add_function(Arc::new(native_fn2::<i32, i32, i32, _>("Max", "a", "b", |a, b| *a.max(b))));
        i32_type.add_function(Arc::new(
            FunctionDescriptor::builder("Print")
                .param_of::<i32>("value", ValueForm::ConstRef)
                .build(|_, _| Ok(None)),
        ));
        registry
    }

    fn max_kind(registry: &TypeRegistry) -> NodeKind {
        let i32_type = registry.lookup_name(i32::TYPE_NAME).unwrap();
        NodeKind::call("i32", &i32_type.functions_named("Max")[0])
    }

    fn print_kind(registry: &TypeRegistry) -> NodeKind {
        let i32_type = registry.lookup_name(i32::TYPE_NAME).unwrap();
        NodeKind::call("i32", &i32_type.functions_named("Print")[0])
    }

    fn sample(registry: &TypeRegistry) -> GraphFunction {
        let signature = FunctionSignature::new().with_param("x", TypeRef::new("i32"), ValueForm::Value);
        let mut f = GraphFunction::with_entry("Sample", signature, registry).unwrap();
        let entry = f.entry_nodes().next().unwrap().id;
        let max = f.add_node(max_kind(registry), registry).unwrap();
        let print = f.add_node(print_kind(registry), registry).unwrap();

        let x = f.find_pin(entry, PinDirection::Output, "x").unwrap();
        let then = f.find_pin(entry, PinDirection::Output, "Then").unwrap();
        f.add_link(x, f.find_pin(max, PinDirection::Input, "a").unwrap()).unwrap();
        f.add_link(x, f.find_pin(max, PinDirection::Input, "b").unwrap()).unwrap();
        f.add_link(
            f.find_pin(max, PinDirection::Output, "Return Value").unwrap(),
            f.find_pin(print, PinDirection::Input, "value").unwrap(),
        )
        .unwrap();
        f.add_link(then, f.find_pin(print, PinDirection::Input, "Exec").unwrap()).unwrap();
        f
    }

    #[test]
    fn test_pins_are_contiguous_per_node() {
        let registry = registry();
        let f = sample(&registry);
        for node in f.nodes() {
            for pin in node.pin_ids() {
                assert_eq!(f.pin(pin).unwrap().node, node.id);
            }
        }
        assert_eq!(f.pin_capacity(), f.pins().count());
    }

    #[test]
    fn test_purity_from_pins() {
        let registry = registry();
        let f = sample(&registry);
        let ids: Vec<_> = f.nodes().map(|n| (n.id, n.kind.label())).collect();
        for (id, label) in ids {
            match label {
                "Call" => {
                    let pure = f.node_pins(id).all(|p| !p.is_flow());
                    assert_eq!(f.is_pure(id), pure);
                }
                _ => assert!(!f.is_pure(id)),
            }
        }
    }

    #[test]
    fn test_fan_in_and_fan_out_limits() {
        let registry = registry();
        let mut f = sample(&registry);
        let entry = f.entry_nodes().next().unwrap().id;
        let then = f.find_pin(entry, PinDirection::Output, "Then").unwrap();
        let second = f.add_node(print_kind(&registry), &registry).unwrap();
        let second_exec = f.find_pin(second, PinDirection::Input, "Exec").unwrap();

        // One flow output drives a single statement.
        assert!(matches!(f.add_link(then, second_exec), Err(GraphError::LinkNotAllowed(_))));

        // A data input takes one link; a data output feeds many.
        let x = f.find_pin(entry, PinDirection::Output, "x").unwrap();
        let value = f.find_pin(second, PinDirection::Input, "value").unwrap();
        f.add_link(x, value).unwrap();
        assert!(matches!(f.add_link(x, value), Err(GraphError::LinkNotAllowed(_))));

        // Many flow links may arrive at one input.
        let print_node = f
            .nodes()
            .find(|n| matches!(&n.kind, NodeKind::Call { function, .. } if function == "Print") && n.id != second)
            .unwrap()
            .id;
        let print_then = f.find_pin(print_node, PinDirection::Output, "Then").unwrap();
        let ret_exec = {
            let ret = f.add_node(NodeKind::Return, &registry).unwrap();
            f.find_pin(ret, PinDirection::Input, "Exec").unwrap()
        };
        let second_then = f.find_pin(second, PinDirection::Output, "Then").unwrap();
        f.add_link(print_then, ret_exec).unwrap();
        f.add_link(second_then, ret_exec).unwrap();
    }

    #[test]
    fn test_flow_and_data_do_not_mix() {
        let registry = registry();
        let mut f = sample(&registry);
        let entry = f.entry_nodes().next().unwrap().id;
        let then = f.find_pin(entry, PinDirection::Output, "Then").unwrap();
        let max = f.add_node(max_kind(&registry), &registry).unwrap();
        let a = f.find_pin(max, PinDirection::Input, "a").unwrap();
        assert!(f.add_link(then, a).is_err());
        assert!(f.add_link(a, then).is_err());
    }

    #[test]
    fn test_remove_node_tombstones_and_unlinks() {
        let registry = registry();
        let mut f = sample(&registry);
        let links_before = f.links().count();
        let max = f
            .nodes()
            .find(|n| matches!(&n.kind, NodeKind::Call { function, .. } if function == "Max"))
            .unwrap()
            .id;
        let pin_ids: Vec<_> = f.node(max).unwrap().pin_ids().collect();
        let capacity = f.pin_capacity();

        f.remove_node(max).unwrap();
        assert!(f.node(max).is_none());
        assert!(pin_ids.iter().all(|p| f.pin(*p).is_none()));
        assert_eq!(f.links().count(), links_before - 3);
        assert_eq!(f.pin_capacity(), capacity);

        // Fresh ids continue after the tombstones.
        let again = f.add_node(max_kind(&registry), &registry).unwrap();
        assert_eq!(again.get(), f.node_capacity() as u32);
        assert!(again > max);
    }

    #[test]
    fn test_serialize_round_trip_is_byte_identical() {
        let registry = registry();
        let mut f = sample(&registry);
        let max = f
            .nodes()
            .find(|n| matches!(&n.kind, NodeKind::Call { function, .. } if function == "Max"))
            .unwrap()
            .id;
        f.set_position(max, Position::new(120.5, -40.0)).unwrap();
        let extra = f.add_node(NodeKind::Comment { text: "note".into() }, &registry).unwrap();
        f.remove_node(extra).unwrap();

        let first = f.to_json().unwrap();
        let loaded = GraphFunction::from_json(&first).unwrap();
        let second = loaded.to_json().unwrap();
        assert_eq!(first, second);
        assert_eq!(loaded, f);
        assert!(first.contains("null"));
    }

    #[test]
    fn test_set_signature_refreshes_entry() {
        let registry = registry();
        let mut f = sample(&registry);
        let entry = f.entry_nodes().next().unwrap().id;
        let old_x = f.find_pin(entry, PinDirection::Output, "x").unwrap();

        let signature = FunctionSignature::new()
            .with_param("x", TypeRef::new("i32"), ValueForm::Value)
            .with_param("y", TypeRef::new("f32"), ValueForm::Value);
        f.set_signature(signature, &registry).unwrap();

        let new_x = f.find_pin(entry, PinDirection::Output, "x").unwrap();
        assert_ne!(old_x, new_x);
        assert!(f.pin(old_x).is_none());
        assert!(f.find_pin(entry, PinDirection::Output, "y").is_some());
        // Both links from x followed it to the new pin.
        assert_eq!(f.links().filter(|l| l.output == new_x).count(), 2);
    }
}
