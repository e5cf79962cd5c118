//! Static checks over a graph function
//!
//! [`collect_errors`] reports every problem it finds rather than stopping at
//! the first, ordered by phase: signature, nodes, links, then whole-function
//! structure.

use std::collections::{HashMap, HashSet, VecDeque};

use script_registry::{TypeRegistry, ValueForm};

use crate::{
    ErrorKind, GraphFunction, GraphNode, NodeId, NodeKind, Pin, PinDirection, PinType, ResolveError, ScriptError,
    TypeRef,
};

/// Collect every static error in `function`.
///
/// `script` names the enclosing script for error locations.
pub fn collect_errors(function: &GraphFunction, registry: &TypeRegistry, script: Option<&str>) -> Vec<ScriptError> {
    let mut errors = Vec::new();
    check_signature(function, registry, &mut errors);
    for node in function.nodes() {
        check_node(function, node, registry, &mut errors);
    }
    check_links(function, registry, &mut errors);
    check_structure(function, &mut errors);
    errors.into_iter().map(|e| e.within(script, &function.name)).collect()
}

/// The error kind a failed node resolution is reported as.
pub fn resolve_error_kind(error: &ResolveError) -> ErrorKind {
    match error {
        ResolveError::UnknownType(_) => ErrorKind::UnreflectedType,
        ResolveError::UnknownFunction { .. } | ResolveError::UnknownField { .. } => {
            ErrorKind::UnderlyingFunctionNoLongerExists
        }
        ResolveError::SignatureChanged { .. } => ErrorKind::NodeOutOfDate,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signature
// ─────────────────────────────────────────────────────────────────────────────

fn check_signature(function: &GraphFunction, registry: &TypeRegistry, errors: &mut Vec<ScriptError>) {
    let signature = &function.signature;

    let mut seen = HashSet::new();
    for param in &signature.params {
        if !seen.insert(param.name.as_str()) {
            errors.push(ScriptError::new(
                ErrorKind::NameNotUnique,
                format!("parameter `{}` is declared more than once", param.name),
            ));
        }
        check_script_type(&param.ty, param.form, registry, errors);
    }
    if let Some(ret) = &signature.ret {
        check_script_type(&ret.ty, ret.form, registry, errors);
    }

    let Some(event_name) = &signature.event else {
        return;
    };
    let Some(event) = registry.event(event_name) else {
        errors.push(ScriptError::new(
            ErrorKind::UnderlyingFunctionNoLongerExists,
            format!("event `{}` is not registered", event_name),
        ));
        return;
    };
    let params_match = event.params.len() == signature.params.len()
        && event
            .params
            .iter()
            .zip(&signature.params)
            .all(|(e, p)| e.type_id == p.ty.id() && e.form == p.form);
    let ret_match = match (&event.ret, &signature.ret) {
        (None, None) => true,
        (Some(e), Some(r)) => e.type_id == r.ty.id() && e.form == r.form,
        _ => false,
    };
    if !params_match || !ret_match {
        errors.push(ScriptError::new(
            ErrorKind::NodeOutOfDate,
            format!("signature no longer matches event `{}`", event_name),
        ));
    }
}

/// A type named by a script signature must exist, be visible and, when held by
/// value, be ownable.
fn check_script_type(ty: &TypeRef, form: ValueForm, registry: &TypeRegistry, errors: &mut Vec<ScriptError>) {
    let Some(descriptor) = registry.lookup_name(ty.name()) else {
        errors.push(ScriptError::new(
            ErrorKind::UnreflectedType,
            format!("type `{}` is not registered", ty),
        ));
        return;
    };
    if !descriptor.is_script_visible() {
        errors.push(ScriptError::new(
            ErrorKind::TypeCannotBeReferencedFromScripts,
            format!("type `{}` is hidden from scripts", ty),
        ));
    } else if form.is_owning() && !descriptor.is_ownable_by_scripts() {
        errors.push(ScriptError::new(
            ErrorKind::TypeCannotBeOwnedByScripts,
            format!("type `{}` can be neither copied nor moved, so scripts cannot hold it by value", ty),
        ));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

fn check_node(function: &GraphFunction, node: &GraphNode, registry: &TypeRegistry, errors: &mut Vec<ScriptError>) {
    let end = node.first_pin.index().saturating_add(node.pin_count as usize);
    if node.first_pin.get() == 0 && node.pin_count > 0 || end > function.pin_capacity() {
        errors.push(
            ScriptError::new(ErrorKind::CompilerBug, format!("pin range of {} is out of bounds", node.id))
                .at_node(node.id),
        );
        return;
    }
    let live: Vec<&Pin> = function.node_pins(node.id).collect();
    if let Some(stray) = live.iter().find(|p| p.node != node.id) {
        errors.push(
            ScriptError::new(
                ErrorKind::CompilerBug,
                format!("{} lies in the range of {} but belongs to {}", stray.id, node.id, stray.node),
            )
            .at_node(node.id)
            .at_pin(stray.id),
        );
        return;
    }

    let expected = match node.kind.expected_pins(&function.signature, registry) {
        Ok(expected) => expected,
        Err(e) => {
            errors.push(ScriptError::new(resolve_error_kind(&e), e.to_string()).at_node(node.id));
            return;
        }
    };
    let up_to_date = live.len() == node.pin_count as usize
        && expected.len() == live.len()
        && expected.iter().zip(&live).all(|(spec, pin)| spec.matches(pin));
    if !up_to_date {
        errors.push(
            ScriptError::new(
                ErrorKind::NodeOutOfDate,
                format!("pins of {} node no longer match what it refers to", node.kind.label()),
            )
            .at_node(node.id),
        );
    }

    // Entry and Return pins come from the signature, which is checked already.
    if matches!(node.kind, NodeKind::Entry | NodeKind::Return) {
        return;
    }
    for pin in live {
        let Some(ty) = pin.pin_type.type_ref() else {
            continue;
        };
        if registry.lookup_name(ty.name()).is_none() {
            errors.push(
                ScriptError::new(ErrorKind::UnreflectedType, format!("type `{}` is not registered", ty))
                    .at_node(node.id)
                    .at_pin(pin.id),
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Links
// ─────────────────────────────────────────────────────────────────────────────

fn check_links(function: &GraphFunction, registry: &TypeRegistry, errors: &mut Vec<ScriptError>) {
    for link in function.links() {
        let (Some(output), Some(input)) = (function.pin(link.output), function.pin(link.input)) else {
            errors.push(
                ScriptError::new(ErrorKind::CompilerBug, format!("{} has a dangling endpoint", link.id)).at_link(link.id),
            );
            continue;
        };
        if output.direction != PinDirection::Output || input.direction != PinDirection::Input {
            errors.push(
                ScriptError::new(
                    ErrorKind::CompilerBug,
                    format!("{} must run from an output to an input", link.id),
                )
                .at_link(link.id),
            );
            continue;
        }

        let error = match (&output.pin_type, &input.pin_type) {
            (PinType::Flow, PinType::Flow) => None,
            (PinType::Data { ty: out_ty, form: out_form }, PinType::Data { ty: in_ty, form: in_form }) => {
                let upcast = (in_form.is_reference() || in_form.is_pointer())
                    && registry.is_derived_from(out_ty.id(), in_ty.id());
                if out_ty.id() != in_ty.id() && !upcast {
                    Some(format!("cannot pass `{}` to a `{}` input", out_ty, in_ty))
                } else if !in_form.accepts(*out_form) {
                    Some(format!("a {} input cannot take a {} value", in_form, out_form))
                } else {
                    None
                }
            }
            _ => Some(format!("cannot connect {} to {}", output.pin_type, input.pin_type)),
        };
        if let Some(message) = error {
            errors.push(
                ScriptError::new(ErrorKind::LinkNotAllowed, message)
                    .at_link(link.id)
                    .at_pin(input.id),
            );
        }
    }

    let mut flow_out = HashMap::new();
    let mut data_in = HashMap::new();
    for link in function.links() {
        let Some(output) = function.pin(link.output) else {
            continue;
        };
        let fan = if output.is_flow() {
            flow_out.entry(link.output).or_insert(0usize)
        } else {
            data_in.entry(link.input).or_insert(0usize)
        };
        *fan += 1;
        if *fan == 2 {
            let pin = if output.is_flow() { link.output } else { link.input };
            errors.push(
                ScriptError::new(ErrorKind::LinkNotAllowed, format!("{} has more than one link", pin))
                    .at_link(link.id)
                    .at_pin(pin),
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Structure
// ─────────────────────────────────────────────────────────────────────────────

fn check_structure(function: &GraphFunction, errors: &mut Vec<ScriptError>) {
    let entries: Vec<NodeId> = function.entry_nodes().map(|n| n.id).collect();
    if entries.len() != 1 {
        errors.push(ScriptError::new(
            ErrorKind::NotPossibleToEnterFunction,
            format!("expected one Entry node, found {}", entries.len()),
        ));
    }

    if function.signature.pure {
        let returns = function.return_nodes().count();
        if returns != 1 {
            errors.push(ScriptError::new(
                ErrorKind::NotPossibleToEnterFunction,
                format!("a pure function needs exactly one Return node, found {}", returns),
            ));
        }
        for node in function.nodes() {
            if !matches!(node.kind, NodeKind::Entry | NodeKind::Return | NodeKind::Comment { .. })
                && !function.is_pure(node.id)
            {
                errors.push(
                    ScriptError::new(
                        ErrorKind::LinkNotAllowed,
                        format!("{} node cannot run in a pure function", node.kind.label()),
                    )
                    .at_node(node.id),
                );
            }
        }
    }

    for node in data_cycles(function) {
        errors.push(
            ScriptError::new(ErrorKind::LinkNotAllowed, format!("{} depends on its own output", node)).at_node(node),
        );
    }

    let reachable = reachable_statements(function, &entries);
    for link in function.links() {
        let Some(output) = function.pin(link.output) else {
            continue;
        };
        if output.is_flow() || function.is_pure(output.node) || reachable.contains(&output.node) {
            continue;
        }
        errors.push(
            ScriptError::new(
                ErrorKind::LinkNotAllowed,
                format!("{} reads {} whose node never runs", link.input, link.output),
            )
            .at_link(link.id)
            .at_node(output.node),
        );
    }
}

/// Nodes reachable from the entries by following flow links.
fn reachable_statements(function: &GraphFunction, entries: &[NodeId]) -> HashSet<NodeId> {
    let mut reachable: HashSet<NodeId> = entries.iter().copied().collect();
    let mut pending: VecDeque<NodeId> = entries.iter().copied().collect();
    while let Some(node) = pending.pop_front() {
        for pin in function.node_pins(node).filter(|p| p.is_flow() && p.is_output()) {
            for link in function.links().filter(|l| l.output == pin.id) {
                let Some(target) = function.pin(link.input) else {
                    continue;
                };
                if reachable.insert(target.node) {
                    pending.push_back(target.node);
                }
            }
        }
    }
    reachable
}

/// Pure nodes that feed their own inputs, once per cycle.
fn data_cycles(function: &GraphFunction) -> Vec<NodeId> {
    let mut producers: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for link in function.links() {
        let (Some(output), Some(input)) = (function.pin(link.output), function.pin(link.input)) else {
            continue;
        };
        if output.is_flow() || !function.is_pure(output.node) || !function.is_pure(input.node) {
            continue;
        }
        producers.entry(input.node).or_default().push(output.node);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<NodeId, Mark> = HashMap::new();
    let mut cycles = Vec::new();
    for start in function.nodes().map(|n| n.id) {
        if marks.contains_key(&start) {
            continue;
        }
        // Iterative DFS: (node, next producer to visit)
        let mut stack = vec![(start, 0usize)];
        marks.insert(start, Mark::Visiting);
        while let Some(&(node, next)) = stack.last() {
            let upstream = producers.get(&node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&producer) = upstream.get(next) {
                let top = stack.len() - 1;
                stack[top].1 += 1;
                match marks.get(&producer) {
                    None => {
                        marks.insert(producer, Mark::Visiting);
                        stack.push((producer, 0));
                    }
                    Some(Mark::Visiting) => {
                        if !cycles.contains(&producer) {
                            cycles.push(producer);
                        }
                    }
                    Some(Mark::Done) => {}
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    cycles
}
