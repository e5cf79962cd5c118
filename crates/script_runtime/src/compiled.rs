//! Compiled functions
//!
//! Compilation validates a [`GraphFunction`] and resolves everything the
//! interpreter needs by name up front: function descriptors, field offsets, pin
//! types, link endpoints and the layout of a frame's value storage.

use std::alloc::Layout;
use std::sync::Arc;

use script_graph::{
    ErrorKind, GraphFunction, NodeId, NodeKind, PinDirection, PinId, ScriptError, collect_errors,
    resolve_error_kind,
};
use script_registry::{FunctionDescriptor, TypeDescriptor, TypeId, TypeRegistry, ValueForm};

/// What a function is compiled for
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    /// Enclosing script, for error locations
    pub script: Option<String>,
    /// Type of the implicit `this` argument of an instance method
    pub this_type: Option<TypeId>,
    /// Type of the implicit world argument of an event function
    pub world_type: Option<TypeId>,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_script(mut self, script: &str) -> Self {
        self.script = Some(script.to_string());
        self
    }

    pub fn with_this(mut self, this_type: TypeId) -> Self {
        self.this_type = Some(this_type);
        self
    }

    pub fn with_world(mut self, world_type: TypeId) -> Self {
        self.world_type = Some(world_type);
        self
    }
}

/// A resolved field
pub(crate) struct FieldAccess {
    pub offset: usize,
    pub ty: Arc<TypeDescriptor>,
}

pub(crate) enum Op {
    Entry,
    Return,
    Call(Arc<FunctionDescriptor>),
    FieldGet(FieldAccess),
    FieldSet(FieldAccess),
    Branch,
    ForLoop,
    WhileLoop,
    Reroute,
    Comment,
}

pub(crate) struct CompiledNode {
    pub id: NodeId,
    pub label: &'static str,
    pub op: Op,
    pub pure: bool,
    pub flow_in: Vec<PinId>,
    pub flow_out: Vec<PinId>,
    pub data_in: Vec<PinId>,
    pub data_out: Vec<PinId>,
}

pub(crate) struct CompiledPin {
    pub node: NodeId,
    /// Data pins only
    pub ty: Option<Arc<TypeDescriptor>>,
    pub form: ValueForm,
    pub default: Option<serde_json::Value>,
    /// Output feeding this data input
    pub source: Option<PinId>,
    /// Input this flow output leads to
    pub target: Option<PinId>,
    /// Offset of this pin's value storage in the frame
    pub storage: usize,
}

/// A validated function, ready to execute
pub struct CompiledFunction {
    name: String,
    script: Option<String>,
    nodes: Vec<Option<CompiledNode>>,
    pins: Vec<Option<CompiledPin>>,
    entry: NodeId,
    return_node: Option<NodeId>,
    ret: Option<(Arc<TypeDescriptor>, ValueForm)>,
    pure: bool,
    params: usize,
    world_index: Option<usize>,
    this_index: Option<usize>,
    this_type: Option<TypeId>,
    storage: Layout,
}

impl CompiledFunction {
    /// Validate and resolve `function`. Every static error is returned.
    pub fn compile(
        function: &GraphFunction,
        registry: &TypeRegistry,
        context: &CompileContext,
    ) -> Result<Self, Vec<ScriptError>> {
        let script = context.script.as_deref();
        let errors = collect_errors(function, registry, script);
        if !errors.is_empty() {
            return Err(errors);
        }
        let located = |e: ScriptError| vec![e.within(script, &function.name)];
        let bug = |message: String| located(ScriptError::new(ErrorKind::CompilerBug, message));

        // Pins and frame storage
        let mut storage = Layout::new::<()>();
        let mut pins: Vec<Option<CompiledPin>> = (0..function.pin_capacity()).map(|_| None).collect();
        for pin in function.pins() {
            let (ty, form) = match pin.pin_type.type_ref() {
                Some(type_ref) => {
                    let ty = registry
                        .lookup_name(type_ref.name())
                        .ok_or_else(|| bug(format!("type `{}` vanished during compilation", type_ref)))?;
                    (Some(ty), pin.pin_type.form().unwrap_or(ValueForm::Value))
                }
                None => (None, ValueForm::Value),
            };
            let offset = match &ty {
                Some(ty) => {
                    let (extended, offset) = storage
                        .extend(ty.layout())
                        .map_err(|e| bug(format!("frame layout overflow: {}", e)))?;
                    storage = extended;
                    offset
                }
                None => 0,
            };
            pins[pin.id.index()] = Some(CompiledPin {
                node: pin.node,
                ty,
                form,
                default: pin.default.clone(),
                source: None,
                target: None,
                storage: offset,
            });
        }

        for link in function.links() {
            let is_flow = function.pin(link.output).is_some_and(|p| p.is_flow());
            if is_flow {
                if let Some(Some(pin)) = pins.get_mut(link.output.index()) {
                    pin.target = Some(link.input);
                }
            } else if let Some(Some(pin)) = pins.get_mut(link.input.index()) {
                pin.source = Some(link.output);
            }
        }

        // Nodes
        let mut nodes: Vec<Option<CompiledNode>> = (0..function.node_capacity()).map(|_| None).collect();
        for node in function.nodes() {
            let op = match &node.kind {
                NodeKind::Entry => Op::Entry,
                NodeKind::Return => Op::Return,
                NodeKind::Call {
                    type_name,
                    function: name,
                    signature,
                } => Op::Call(
                    NodeKind::resolve_call(type_name, name, *signature, registry)
                        .map_err(|e| located(ScriptError::new(resolve_error_kind(&e), e.to_string()).at_node(node.id)))?,
                ),
                NodeKind::FieldGet { type_name, field } => Op::FieldGet(resolve_field(registry, type_name, field).map_err(&bug)?),
                NodeKind::FieldSet { type_name, field } => Op::FieldSet(resolve_field(registry, type_name, field).map_err(&bug)?),
                NodeKind::Branch => Op::Branch,
                NodeKind::ForLoop => Op::ForLoop,
                NodeKind::WhileLoop => Op::WhileLoop,
                NodeKind::Reroute { .. } => Op::Reroute,
                NodeKind::Comment { .. } => Op::Comment,
            };
            let mut compiled = CompiledNode {
                id: node.id,
                label: node.kind.label(),
                op,
                pure: function.is_pure(node.id),
                flow_in: Vec::new(),
                flow_out: Vec::new(),
                data_in: Vec::new(),
                data_out: Vec::new(),
            };
            for pin in function.node_pins(node.id) {
                let list = match (pin.direction, pin.is_flow()) {
                    (PinDirection::Input, true) => &mut compiled.flow_in,
                    (PinDirection::Output, true) => &mut compiled.flow_out,
                    (PinDirection::Input, false) => &mut compiled.data_in,
                    (PinDirection::Output, false) => &mut compiled.data_out,
                };
                list.push(pin.id);
            }
            nodes[node.id.index()] = Some(compiled);
        }

        let entry = function
            .entry_nodes()
            .next()
            .map(|n| n.id)
            .ok_or_else(|| bug("no Entry node".to_string()))?;
        let return_node = function.return_nodes().next().map(|n| n.id);
        let ret = match &function.signature.ret {
            Some(ret) => {
                let ty = registry
                    .lookup_name(ret.ty.name())
                    .ok_or_else(|| bug(format!("return type `{}` vanished during compilation", ret.ty)))?;
                Some((ty, ret.form))
            }
            None => None,
        };

        let world_index = context.world_type.map(|_| 0);
        let this_index = context.this_type.map(|_| usize::from(world_index.is_some()));

        Ok(Self {
            name: function.name.clone(),
            script: context.script.clone(),
            nodes,
            pins,
            entry,
            return_node,
            ret,
            pure: function.signature.pure,
            params: function.signature.params.len(),
            world_index,
            this_index,
            this_type: context.this_type,
            storage: storage.pad_to_align(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    /// Arguments expected by [`Interpreter::execute`](crate::Interpreter::execute),
    /// implicit world and `this` included
    pub fn arity(&self) -> usize {
        self.implicit_args() + self.params
    }

    pub fn implicit_args(&self) -> usize {
        usize::from(self.world_index.is_some()) + usize::from(self.this_index.is_some())
    }

    pub fn pin_capacity(&self) -> usize {
        self.pins.len()
    }

    /// Layout of the per-call value storage
    pub fn storage_layout(&self) -> Layout {
        self.storage
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&CompiledNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn pin(&self, id: PinId) -> Option<&CompiledPin> {
        self.pins.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn entry(&self) -> NodeId {
        self.entry
    }

    pub(crate) fn return_node(&self) -> Option<NodeId> {
        self.return_node
    }

    pub(crate) fn ret(&self) -> Option<&(Arc<TypeDescriptor>, ValueForm)> {
        self.ret.as_ref()
    }

    pub(crate) fn world_index(&self) -> Option<usize> {
        self.world_index
    }

    pub(crate) fn this_index(&self) -> Option<usize> {
        self.this_index
    }

    pub(crate) fn this_type(&self) -> Option<TypeId> {
        self.this_type
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .field("script", &self.script)
            .field("nodes", &self.nodes.iter().flatten().count())
            .field("pins", &self.pins.len())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

fn resolve_field(registry: &TypeRegistry, type_name: &str, field: &str) -> Result<FieldAccess, String> {
    let owner = registry
        .lookup_name(type_name)
        .ok_or_else(|| format!("type `{}` vanished during compilation", type_name))?;
    let descriptor = owner
        .field(field)
        .ok_or_else(|| format!("field `{}::{}` vanished during compilation", type_name, field))?;
    let ty = registry
        .lookup(descriptor.type_id)
        .ok_or_else(|| format!("type of field `{}::{}` is not registered", type_name, field))?;
    Ok(FieldAccess {
        offset: descriptor.offset,
        ty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_graph::{FunctionSignature, TypeRef};

    #[test]
    fn test_storage_covers_every_data_pin() {
        let registry = TypeRegistry::with_builtins();
        let signature = FunctionSignature::new()
            .with_param("a", TypeRef::new("i64"), ValueForm::Value)
            .with_param("b", TypeRef::new("bool"), ValueForm::Value);
        let mut function = GraphFunction::with_entry("Layout", signature, &registry).unwrap();
        function.add_node(NodeKind::ForLoop, &registry).unwrap();

        let compiled = CompiledFunction::compile(&function, &registry, &CompileContext::new()).unwrap();
        // i64 + bool from Entry, then three i32 pins on the loop.
        assert!(compiled.storage_layout().size() >= 8 + 1 + 3 * 4);
        assert_eq!(compiled.storage_layout().align(), 8);
        assert_eq!(compiled.arity(), 2);
    }

    #[test]
    fn test_invalid_function_reports_errors() {
        let registry = TypeRegistry::with_builtins();
        let function = GraphFunction::new("Nothing", FunctionSignature::new());
        let errors = CompiledFunction::compile(&function, &registry, &CompileContext::new().in_script("S")).unwrap_err();
        assert_eq!(errors[0].kind, ErrorKind::NotPossibleToEnterFunction);
        assert_eq!(errors[0].location.script.as_deref(), Some("S"));
    }

    #[test]
    fn test_implicit_arguments() {
        let registry = TypeRegistry::with_builtins();
        let function = GraphFunction::with_entry("Method", FunctionSignature::new(), &registry).unwrap();
        let context = CompileContext::new()
            .with_world(TypeId::of_name("World"))
            .with_this(TypeId::of_name("Door"));
        let compiled = CompiledFunction::compile(&function, &registry, &context).unwrap();
        assert_eq!(compiled.arity(), 2);
        assert_eq!(compiled.world_index(), Some(0));
        assert_eq!(compiled.this_index(), Some(1));
    }
}
