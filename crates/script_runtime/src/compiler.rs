//! Script Compiler
//!
//! Registers scripts as types in two phases. Every script type is declared
//! first, so that fields and signatures may name each other in any order; then
//! every function is declared on its type, and only after that are bodies
//! compiled, so calls between scripts resolve regardless of order.
//!
//! A function whose body fails to compile stays declared. Calling it fails.

use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use script_graph::{ErrorKind, GraphFunction, Script, ScriptError};
use script_registry::{
    CallError, CallResult, DynamicValue, FunctionDescriptor, Thunk, TypeDescriptor, TypeId, TypeRegistry, ValueForm,
};

use crate::compiled::{CompileContext, CompiledFunction};
use crate::config::RuntimeConfig;
use crate::diagnostics::{ErrorSink, TracingSink};
use crate::interpreter::Interpreter;
use crate::scripted::{build_scripted_type, layout_members};

/// Outcome of compiling a set of scripts
#[derive(Debug, Default)]
pub struct CompileReport {
    /// Every error, in the order found
    pub errors: Vec<ScriptError>,
    /// Types declared by the scripts
    pub types: Vec<TypeId>,
}

impl CompileReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Function bodies
// ─────────────────────────────────────────────────────────────────────────────

enum BodyState {
    Pending,
    Ready(Arc<CompiledFunction>),
    Failed(String),
    Unloaded,
}

/// The body behind an interpreter-backed function descriptor
struct ScriptBody {
    name: String,
    state: RwLock<BodyState>,
}

impl ScriptBody {
    fn new(script: &str, function: &str) -> Self {
        Self {
            name: format!("{}::{}", script, function),
            state: RwLock::new(BodyState::Pending),
        }
    }

    fn set(&self, state: BodyState) {
        *self.state.write() = state;
    }

    fn compiled(&self) -> Result<Arc<CompiledFunction>, CallError> {
        match &*self.state.read() {
            BodyState::Ready(compiled) => Ok(Arc::clone(compiled)),
            BodyState::Pending => Err(CallError::new(format!("`{}` is not compiled yet", self.name))),
            BodyState::Failed(reason) => Err(CallError::new(format!("`{}` failed to compile: {}", self.name, reason))),
            BodyState::Unloaded => Err(CallError::new(format!("`{}` was unloaded", self.name))),
        }
    }

    fn thunk(self: &Arc<Self>) -> Thunk {
        let body = Arc::clone(self);
        Arc::new(
            move |args: &mut [DynamicValue], ret: Option<NonNull<u8>>| -> CallResult {
                let compiled = body.compiled()?;
                Interpreter::with_current(|interpreter| interpreter.execute(&compiled, args, ret))
                    .map_err(|e| CallError::new(e.to_string()))
            },
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler
// ─────────────────────────────────────────────────────────────────────────────

/// Compiles scripts into a registry and owns what it registered.
///
/// Recompiling replaces everything the previous compilation declared. Dropping
/// the compiler unloads its types.
pub struct ScriptCompiler {
    registry: Arc<TypeRegistry>,
    world_type: String,
    sink: Arc<dyn ErrorSink>,
    bodies: Vec<Arc<ScriptBody>>,
    types: Vec<TypeId>,
}

impl ScriptCompiler {
    pub fn new(registry: Arc<TypeRegistry>, config: &RuntimeConfig) -> Self {
        Self {
            registry,
            world_type: config.world_type.clone(),
            sink: Arc::new(TracingSink),
            bodies: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Send compile errors to `sink` instead of the log.
    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Types declared by the last compilation
    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    /// Replace the registered scripts with `scripts`.
    pub fn compile(&mut self, scripts: &[Script]) -> CompileReport {
        self.unload();
        let mut report = CompileReport::default();

        let declared = self.declare_types(scripts, &mut report);
        let pending = self.declare_functions(scripts, &declared, &mut report);
        let functions = pending.len();
        for (body, function, context) in pending {
            match CompiledFunction::compile(function, &self.registry, &context) {
                Ok(compiled) => body.set(BodyState::Ready(Arc::new(compiled))),
                Err(errors) => {
                    let reason = match errors.as_slice() {
                        [only] => only.to_string(),
                        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
                        [] => "unknown error".to_string(),
                    };
                    body.set(BodyState::Failed(reason));
                    report.errors.extend(errors);
                }
            }
        }

        for error in &report.errors {
            self.sink.report(error);
        }
        self.types = report.types.clone();
        info!(
            scripts = scripts.len(),
            types = report.types.len(),
            functions,
            errors = report.errors.len(),
            "Compiled scripts"
        );
        report
    }

    /// Remove every type and function of the last compilation.
    pub fn unload(&mut self) {
        for body in self.bodies.drain(..) {
            body.set(BodyState::Unloaded);
        }
        let removed = self
            .types
            .drain(..)
            .filter(|id| self.registry.remove(*id).is_some())
            .count();
        if removed > 0 {
            debug!(removed, "Unloaded script types");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phase 1: types
    // ─────────────────────────────────────────────────────────────────────────

    /// Declare one type per script; `None` where the name was unusable.
    fn declare_types(&self, scripts: &[Script], report: &mut CompileReport) -> Vec<Option<Arc<TypeDescriptor>>> {
        let mut declared: Vec<Option<Arc<TypeDescriptor>>> = vec![None; scripts.len()];
        let mut names = HashSet::new();
        let mut pending = Vec::new();
        for (index, script) in scripts.iter().enumerate() {
            let taken = !names.insert(script.name.as_str()) || self.registry.contains(TypeId::of_name(&script.name));
            if taken {
                report.errors.push(
                    ScriptError::new(
                        ErrorKind::NameNotUnique,
                        format!("type name `{}` is already in use", script.name),
                    )
                    .in_script(&script.name),
                );
            } else {
                pending.push(index);
            }
        }

        // Declare scripts once the script types their fields name exist. A
        // round without progress means a cycle, broken at one of its scripts.
        while !pending.is_empty() {
            let waiting: HashSet<&str> = pending.iter().map(|i| scripts[*i].name.as_str()).collect();
            let ready = pending.iter().position(|i| {
                let script = &scripts[*i];
                script
                    .fields
                    .iter()
                    .all(|f| f.ty.name() == script.name || !waiting.contains(f.ty.name()))
            });
            let (index, blocked) = match ready {
                Some(position) => (pending[position], HashSet::new()),
                None => break_cycle(scripts, &pending),
            };
            pending.retain(|i| *i != index);
            declared[index] = Some(self.declare_type(&scripts[index], &blocked, report));
        }
        declared
    }

    fn declare_type(
        &self,
        script: &Script,
        blocked: &HashSet<&str>,
        report: &mut CompileReport,
    ) -> Arc<TypeDescriptor> {
        let mut fields = Vec::new();
        let mut names = HashSet::new();
        for field in &script.fields {
            let type_name = field.ty.name();
            let rejection = if !names.insert(field.name.as_str()) {
                Some((ErrorKind::NameNotUnique, format!("field `{}` is declared more than once", field.name)))
            } else if type_name == script.name {
                Some((ErrorKind::TypeCannotBeMember, format!("`{}` cannot contain itself", script.name)))
            } else if blocked.contains(type_name) {
                Some((
                    ErrorKind::TypeCannotBeMember,
                    format!("`{}` and `{}` contain each other", script.name, type_name),
                ))
            } else {
                match self.registry.lookup_name(type_name) {
                    None => Some((ErrorKind::UnreflectedType, format!("type `{}` is not registered", type_name))),
                    Some(ty) if !ty.is_script_visible() => Some((
                        ErrorKind::TypeCannotBeReferencedFromScripts,
                        format!("type `{}` is hidden from scripts", type_name),
                    )),
                    Some(ty) if !ty.is_ownable_by_scripts() => Some((
                        ErrorKind::TypeCannotBeOwnedByScripts,
                        format!("type `{}` cannot be held by value", type_name),
                    )),
                    Some(ty) => match field.default.as_ref().map(|json| check_default(&ty, json)) {
                        Some(Err(e)) => Some((
                            ErrorKind::TypeCannotBeMember,
                            format!("default of field `{}` is not a valid `{}`: {}", field.name, type_name, e),
                        )),
                        _ => {
                            fields.push((field.name.clone(), ty, field.default.clone()));
                            None
                        }
                    },
                }
            };
            if let Some((kind, message)) = rejection {
                report.errors.push(ScriptError::new(kind, message).in_script(&script.name));
            }
        }

        let (layout, members) = match layout_members(fields) {
            Ok(laid_out) => laid_out,
            Err(e) => {
                report.errors.push(
                    ScriptError::new(ErrorKind::CompilerBug, format!("layout of `{}` overflowed: {}", script.name, e))
                        .in_script(&script.name),
                );
                (Layout::new::<()>(), Vec::new())
            }
        };
        let descriptor = self.registry.register(build_scripted_type(&script.name, layout, members));
        report.types.push(descriptor.id());
        debug!(
            script = %script.name,
            size = descriptor.size(),
            fields = descriptor.fields().len(),
            "Declared script type"
        );
        descriptor
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Phase 2: functions
    // ─────────────────────────────────────────────────────────────────────────

    fn declare_functions<'s>(
        &mut self,
        scripts: &'s [Script],
        declared: &[Option<Arc<TypeDescriptor>>],
        report: &mut CompileReport,
    ) -> Vec<(Arc<ScriptBody>, &'s GraphFunction, CompileContext)> {
        let world_type = TypeId::of_name(&self.world_type);
        let mut pending = Vec::new();
        for (script, ty) in scripts.iter().zip(declared) {
            let Some(ty) = ty else {
                continue;
            };
            let mut names = HashSet::new();
            for function in &script.functions {
                if !names.insert(function.name.as_str()) {
                    report.errors.push(
                        ScriptError::new(
                            ErrorKind::NameNotUnique,
                            format!("function `{}` is declared more than once", function.name),
                        )
                        .in_script(&script.name)
                        .in_function(&function.name),
                    );
                    continue;
                }

                let signature = &function.signature;
                let mut context = CompileContext::new().in_script(&script.name);
                let mut builder = FunctionDescriptor::builder(function.name.clone());
                if signature.event.is_some() {
                    builder = builder.param("world", world_type, ValueForm::Ref);
                    context = context.with_world(world_type);
                }
                if !signature.is_static {
                    builder = builder.param("this", ty.id(), ValueForm::Ref);
                    context = context.with_this(ty.id());
                }
                for param in &signature.params {
                    builder = builder.param(param.name.clone(), param.ty.id(), param.form);
                }
                if let Some(ret) = &signature.ret {
                    builder = builder.returns(ret.ty.id(), ret.form);
                }

                let body = Arc::new(ScriptBody::new(&script.name, &function.name));
                ty.add_function(Arc::new(builder.pure(signature.pure).build_with(body.thunk())));
                self.bodies.push(Arc::clone(&body));
                pending.push((body, function, context));
            }
        }
        pending
    }
}

impl Drop for ScriptCompiler {
    fn drop(&mut self) {
        self.unload();
    }
}

impl std::fmt::Debug for ScriptCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCompiler")
            .field("world_type", &self.world_type)
            .field("functions", &self.bodies.len())
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

/// A pending script on a field cycle, with the pending types that lead back to it.
fn break_cycle<'s>(scripts: &'s [Script], pending: &[usize]) -> (usize, HashSet<&'s str>) {
    let by_name: HashMap<&str, usize> = pending.iter().map(|i| (scripts[*i].name.as_str(), *i)).collect();
    let waits_on = |index: usize| -> Vec<usize> {
        scripts[index]
            .fields
            .iter()
            .filter_map(|f| by_name.get(f.ty.name()).copied())
            .filter(|dependency| *dependency != index)
            .collect()
    };

    // Every pending script waits on another, so the walk revisits one.
    let mut seen = HashSet::new();
    let mut current = pending[0];
    while seen.insert(current) {
        match waits_on(current).first() {
            Some(next) => current = *next,
            None => break,
        }
    }

    let reaches = |from: usize| {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(index) = stack.pop() {
            if index == current {
                return true;
            }
            if visited.insert(index) {
                stack.extend(waits_on(index));
            }
        }
        false
    };
    let blocked = waits_on(current)
        .into_iter()
        .filter(|dependency| reaches(*dependency))
        .map(|dependency| scripts[dependency].name.as_str())
        .collect();
    (current, blocked)
}

/// Whether `json` decodes as a `ty`.
fn check_default(ty: &TypeDescriptor, json: &serde_json::Value) -> Result<(), String> {
    let ptr = ty.allocate();
    // SAFETY: fresh allocation for the type; destroyed or freed below.
    unsafe {
        let result = ty.from_json_at(json, ptr);
        if result.is_ok() {
            ty.destruct(ptr, true);
        } else {
            ty.deallocate(ptr);
        }
        result
    }
}
