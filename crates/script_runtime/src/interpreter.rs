//! Graph Interpreter
//!
//! Walks a compiled function statement by statement. Statement nodes run in
//! flow order; pure nodes are evaluated lazily when a statement pulls one of
//! their outputs, and their results are reused until the next statement runs.

use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};

use tracing::{debug, error};

use script_graph::{ErrorKind, NodeId, PinId, ScriptError};
use script_registry::{CallError, CallResult, DynamicValue, FunctionDescriptor, TypeDescriptor, TypeId, ValueForm};

use crate::compiled::{CompiledFunction, CompiledNode, CompiledPin, FieldAccess, Op};
use crate::config::RuntimeConfig;
use crate::frame::{ExecutionFrame, LoopMarker};
use crate::stack::{InterpreterStack, StackMark};

thread_local! {
    static CURRENT: Cell<Option<NonNull<Interpreter>>> = const { Cell::new(None) };
    static FALLBACK: Interpreter = Interpreter::new(RuntimeConfig::default());
}

/// Executes compiled functions on its own stack.
///
/// Nested calls made while a function runs, including calls through native
/// functions back into scripts, share the same interpreter and stack.
pub struct Interpreter {
    config: RuntimeConfig,
    stack: InterpreterStack,
    steps: Cell<u32>,
    depth: Cell<u32>,
    world: Cell<Option<(TypeId, NonNull<u8>)>>,
    /// Error of the last failed nested call, before it was flattened into a `CallError`
    nested_failure: RefCell<Option<ScriptError>>,
}

// SAFETY: the raw world pointer is only dereferenced during an execution on the
// owning thread; `Cell` keeps the interpreter `!Sync`.
unsafe impl Send for Interpreter {}

impl Interpreter {
    pub fn new(config: RuntimeConfig) -> Self {
        let stack = InterpreterStack::new(config.stack_size);
        Self {
            config,
            stack,
            steps: Cell::new(0),
            depth: Cell::new(0),
            world: Cell::new(None),
            nested_failure: RefCell::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn stack(&self) -> &InterpreterStack {
        &self.stack
    }

    /// The world of the innermost running event function
    pub fn active_world(&self) -> Option<(TypeId, NonNull<u8>)> {
        self.world.get()
    }

    /// Run `f` on the interpreter executing on this thread, or on a per-thread
    /// default interpreter when nothing is running.
    pub fn with_current<R>(f: impl FnOnce(&Interpreter) -> R) -> R {
        match CURRENT.with(Cell::get) {
            // SAFETY: CURRENT is only set while that interpreter is borrowed on this thread.
            Some(current) => f(unsafe { current.as_ref() }),
            None => FALLBACK.with(|fallback| f(fallback)),
        }
    }

    /// Make this the current interpreter while `f` runs.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _current = CurrentGuard::enter(self);
        f()
    }

    /// Call a function of `descriptor` with this interpreter running any script code.
    pub fn call(&self, descriptor: &TypeDescriptor, name: &str, args: &mut [DynamicValue]) -> CallResult {
        self.scope(|| descriptor.call(name, args))
    }

    /// Execute `function`.
    ///
    /// `args` holds the implicit world and `this` arguments first, then the
    /// declared parameters. An owned return value is constructed into `ret`
    /// when given, otherwise returned.
    pub fn execute(
        &self,
        function: &CompiledFunction,
        args: &mut [DynamicValue],
        ret: Option<NonNull<u8>>,
    ) -> Result<Option<DynamicValue>, ScriptError> {
        let nested = self.depth.get() > 0;
        if !nested {
            self.steps.set(0);
        }
        let _current = CurrentGuard::enter(self);
        let _depth = DepthGuard::enter(&self.depth);
        let _world = function
            .world_index()
            .and_then(|index| args.get(index))
            .map(|world| WorldGuard::enter(&self.world, world));

        let result = self
            .run(function, args, ret)
            .map_err(|e| e.within(function.script(), function.name()));
        if let Err(e) = &result {
            if nested {
                debug!(function = %function.name(), kind = %e.kind, "Nested call failed");
                *self.nested_failure.borrow_mut() = Some(e.clone());
            } else {
                error!(
                    function = %function.name(),
                    kind = %e.kind,
                    location = %e.location,
                    "Script execution failed: {}",
                    e.message
                );
            }
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Statements
    // ─────────────────────────────────────────────────────────────────────────

    fn run(
        &self,
        function: &CompiledFunction,
        args: &mut [DynamicValue],
        ret: Option<NonNull<u8>>,
    ) -> Result<Option<DynamicValue>, ScriptError> {
        if args.len() != function.arity() {
            return Err(ScriptError::new(
                ErrorKind::FunctionCallFailed,
                format!("expects {} argument(s), got {}", function.arity(), args.len()),
            ));
        }
        let mut frame = ExecutionFrame::new(function, &self.stack).ok_or_else(|| {
            ScriptError::new(
                ErrorKind::StackOverflow,
                format!(
                    "interpreter stack exhausted ({} of {} bytes in use)",
                    self.stack.used(),
                    self.stack.capacity()
                ),
            )
        })?;
        let this = function
            .this_index()
            .and_then(|index| args.get(index))
            .and_then(DynamicValue::data_ptr);
        let ctx = Context { function, this };

        let entry = ctx.node(function.entry())?;
        bind_arguments(&ctx, &mut frame, entry, &args[function.implicit_args()..])?;

        if function.is_pure() {
            self.tick()?;
            let node = function
                .return_node()
                .ok_or_else(|| compiler_bug("pure function without a Return node"))?;
            return self.finish(&ctx, &mut frame, ctx.node(node)?, ret);
        }

        let mut next = match entry.flow_out.first() {
            Some(then) => ctx.follow(*then)?,
            None => None,
        };
        loop {
            let arrival = match next {
                Some(arrival) => arrival,
                None => match frame.loops.last() {
                    Some(marker) => Arrival::ReEntry(*marker),
                    None => return self.implicit_return(&ctx, ret),
                },
            };
            self.tick()?;
            let (node_id, via) = match arrival {
                Arrival::Pin(pin) => (ctx.pin_info(pin)?.node, Some(pin)),
                Arrival::ReEntry(marker) => (marker.node(), None),
            };
            let node = ctx.node(node_id)?;
            debug!(function = %function.name(), node = %node.id, kind = node.label, "Executing node");

            next = match (&node.op, arrival) {
                (_, Arrival::ReEntry(LoopMarker::For(_))) => self.for_loop(&ctx, &mut frame, node, None)?,
                (_, Arrival::ReEntry(LoopMarker::While(_))) => self.while_loop(&ctx, &mut frame, node, None)?,
                (Op::Return, _) => return self.finish(&ctx, &mut frame, node, ret),
                (Op::Call(callee), _) => {
                    self.call_node(&ctx, &mut frame, node, callee)?;
                    ctx.follow(nth(&node.flow_out, 0)?)?
                }
                (Op::FieldSet(access), _) => {
                    self.field_set(&ctx, &mut frame, node, access)?;
                    ctx.follow(nth(&node.flow_out, 0)?)?
                }
                (Op::Branch, _) => {
                    let condition = self.pull_bool(&ctx, &mut frame, nth(&node.data_in, 0)?)?;
                    ctx.follow(nth(&node.flow_out, if condition { 0 } else { 1 })?)?
                }
                (Op::ForLoop, _) => self.for_loop(&ctx, &mut frame, node, via)?,
                (Op::WhileLoop, _) => self.while_loop(&ctx, &mut frame, node, via)?,
                (Op::Reroute, _) => ctx.follow(nth(&node.flow_out, 0)?)?,
                (Op::Entry | Op::FieldGet(_) | Op::Comment, _) => {
                    return Err(compiler_bug(format!("{} is not a statement", node.label)).at_node(node.id));
                }
            };
            frame.impure_steps = frame.impure_steps.wrapping_add(1);
        }
    }

    fn tick(&self) -> Result<(), ScriptError> {
        let steps = self.steps.get().saturating_add(1);
        self.steps.set(steps);
        if steps > self.config.max_steps {
            return Err(ScriptError::new(
                ErrorKind::ExecutionTimeOut,
                format!("exceeded {} execution steps", self.config.max_steps),
            ));
        }
        Ok(())
    }

    /// `Index` is seeded with `Start` on the entry edge, not 0, and grows by one
    /// on each re-entry. `End` is read on every visit.
    fn for_loop(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        via: Option<PinId>,
    ) -> Result<Option<Arrival>, ScriptError> {
        let break_pin = nth(&node.flow_in, 1)?;
        let index = nth(&node.data_out, 0)?;
        let (body, completed) = (nth(&node.flow_out, 0)?, nth(&node.flow_out, 1)?);

        match via {
            Some(pin) if pin == break_pin => {
                exit_loop(frame, node.id);
                return ctx.follow(completed);
            }
            Some(_) => {
                let start = self.pull_i32(ctx, frame, nth(&node.data_in, 0)?)?;
                frame.write(index, start);
                if frame.innermost_loop() != Some(node.id) {
                    frame.loops.push(LoopMarker::For(node.id));
                }
            }
            None => {
                let current = frame.read::<i32>(index).unwrap_or_default();
                frame.write(index, current.saturating_add(1));
            }
        }

        let end = self.pull_i32(ctx, frame, nth(&node.data_in, 1)?)?;
        let current = frame.read::<i32>(index).unwrap_or_default();
        if current >= end {
            exit_loop(frame, node.id);
            ctx.follow(completed)
        } else {
            ctx.follow(body)
        }
    }

    fn while_loop(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        via: Option<PinId>,
    ) -> Result<Option<Arrival>, ScriptError> {
        let break_pin = nth(&node.flow_in, 1)?;
        let (body, completed) = (nth(&node.flow_out, 0)?, nth(&node.flow_out, 1)?);

        match via {
            Some(pin) if pin == break_pin => {
                exit_loop(frame, node.id);
                return ctx.follow(completed);
            }
            Some(_) if frame.innermost_loop() != Some(node.id) => frame.loops.push(LoopMarker::While(node.id)),
            _ => {}
        }

        if self.pull_bool(ctx, frame, nth(&node.data_in, 0)?)? {
            ctx.follow(body)
        } else {
            exit_loop(frame, node.id);
            ctx.follow(completed)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Node execution
    // ─────────────────────────────────────────────────────────────────────────

    fn call_node(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        callee: &FunctionDescriptor,
    ) -> Result<(), ScriptError> {
        let mut temps = TempScope::new(&self.stack);
        let mut args = Vec::with_capacity(node.data_in.len());
        for (param, pin) in callee.params().iter().zip(&node.data_in) {
            let ptr = self.pull(ctx, frame, *pin)?;
            let ty = ctx.pin_type(*pin)?;
            let value = match ptr {
                None if param.form.is_pointer() => DynamicValue::null(param.type_id, param.form),
                None => {
                    return Err(ScriptError::new(
                        ErrorKind::ValueWasNull,
                        format!("`{}` of `{}` was null", param.name, callee.name()),
                    )
                    .at_node(node.id)
                    .at_pin(*pin));
                }
                Some(src) if param.form.is_owning() => {
                    let temp = temps.copy_of(ty, src).map_err(|e| e.at_node(node.id).at_pin(*pin))?;
                    // SAFETY: the temporary outlives the call.
                    unsafe { DynamicValue::borrowed(param.type_id, param.form, temp) }
                }
                // SAFETY: pulled values live at least until the frame ends.
                Some(src) => unsafe { DynamicValue::borrowed(param.type_id, param.form, src) },
            };
            args.push(value);
        }

        let ret_pin = node.data_out.first().copied();
        let ret_form = callee.return_param().map(|r| r.form);
        let buffer = match (ret_pin, ret_form) {
            (Some(pin), Some(form)) if form.is_owning() => {
                frame.clear(pin);
                frame.storage(pin)
            }
            _ => None,
        };

        self.nested_failure.borrow_mut().take();
        let result = callee.invoke(&mut args, buffer);
        drop(args);
        drop(temps);

        let value = result.map_err(|e| self.call_failure(callee, e).at_node(node.id))?;
        match (ret_pin, ret_form) {
            (Some(pin), Some(form)) => store_result(frame, pin, form, value).map_err(|e| e.at_node(node.id)),
            _ => Ok(()),
        }
    }

    /// Turn a failed call into a script error. Budget failures of nested script
    /// calls keep their kind.
    fn call_failure(&self, callee: &FunctionDescriptor, error: CallError) -> ScriptError {
        if let Some(nested) = self.nested_failure.borrow_mut().take() {
            if matches!(nested.kind, ErrorKind::StackOverflow | ErrorKind::ExecutionTimeOut) {
                return nested;
            }
        }
        ScriptError::new(
            ErrorKind::FunctionCallFailed,
            format!("`{}` failed: {}", callee.name(), error.message()),
        )
    }

    fn field_get(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        access: &FieldAccess,
    ) -> Result<(), ScriptError> {
        let target = self.pull_target(ctx, frame, node)?;
        let out = nth(&node.data_out, 0)?;
        frame.clear(out);
        let dst = frame.storage(out).ok_or_else(|| compiler_bug("field output has no storage"))?;
        // SAFETY: the target is a live value whose layout places the field at this offset.
        unsafe { access.ty.copy_construct_at(dst, target.add(access.offset)) }
            .map_err(|e| call_failed(format!("reading field failed: {}", e.message())).at_node(node.id))?;
        frame.set_owned(out);
        Ok(())
    }

    fn field_set(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        access: &FieldAccess,
    ) -> Result<(), ScriptError> {
        let target = self.pull_target(ctx, frame, node)?;
        let value_pin = nth(&node.data_in, 1)?;
        let value = self
            .pull(ctx, frame, value_pin)?
            .ok_or_else(|| ScriptError::new(ErrorKind::ValueWasNull, "no value to store").at_pin(value_pin))?;

        let mut temps = TempScope::new(&self.stack);
        let temp = temps.copy_of(&access.ty, value).map_err(|e| e.at_node(node.id))?;
        // SAFETY: the field is live; the temporary is bit-moved into it and released untouched.
        unsafe {
            let field = target.add(access.offset);
            access.ty.destruct(field, false);
            ptr::copy_nonoverlapping(temp.as_ptr(), field.as_ptr(), access.ty.size());
        }
        temps.release_last();
        Ok(())
    }

    fn pull_target(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
    ) -> Result<NonNull<u8>, ScriptError> {
        let pin = nth(&node.data_in, 0)?;
        self.pull(ctx, frame, pin)?
            .ok_or_else(|| ScriptError::new(ErrorKind::ValueWasNull, "target was null").at_node(node.id).at_pin(pin))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Data pulls
    // ─────────────────────────────────────────────────────────────────────────

    /// Produce the value of a data input. `None` is a null pointer.
    fn pull(&self, ctx: &Context<'_>, frame: &mut ExecutionFrame<'_>, pin: PinId) -> Result<Option<NonNull<u8>>, ScriptError> {
        match ctx.pin_info(pin)?.source {
            Some(output) => self.pull_output(ctx, frame, output),
            None => self.fallback(ctx, frame, pin),
        }
    }

    fn pull_output(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        output: PinId,
    ) -> Result<Option<NonNull<u8>>, ScriptError> {
        let node = ctx.node(ctx.pin_info(output)?.node)?;
        if matches!(node.op, Op::Reroute) {
            return self.pull(ctx, frame, nth(&node.data_in, 0)?);
        }

        if node.pure {
            let fresh = frame.is_filled(output) && frame.stamp(output) == Some(frame.impure_steps);
            if !fresh {
                self.tick()?;
                debug!(function = %ctx.function.name(), node = %node.id, kind = node.label, "Evaluating pure node");
                match &node.op {
                    Op::Call(callee) => self.call_node(ctx, frame, node, callee)?,
                    Op::FieldGet(access) => self.field_get(ctx, frame, node, access)?,
                    _ => return Err(compiler_bug(format!("{} has no pure outputs", node.label)).at_node(node.id)),
                }
            }
        } else if !frame.is_filled(output) {
            return Err(ScriptError::new(
                ErrorKind::LinkNotAllowed,
                format!("output of {} was read before the node ran", node.label),
            )
            .at_node(node.id)
            .at_pin(output));
        }
        Ok(frame.value(output))
    }

    /// Value of an unlinked input: its default, `this`, the active world, then a
    /// default-constructed value. Pointer inputs fall back to null last.
    fn fallback(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        pin: PinId,
    ) -> Result<Option<NonNull<u8>>, ScriptError> {
        let info = ctx.pin_info(pin)?;
        let ty = ctx.pin_type(pin)?;

        if let Some(default) = &info.default {
            frame.clear(pin);
            let dst = frame.storage(pin).ok_or_else(|| compiler_bug("data pin has no storage"))?;
            // SAFETY: the slot is empty and its storage laid out for the pin's type.
            unsafe { ty.from_json_at(default, dst) }.map_err(|e| {
                call_failed(format!("default value of `{}` could not be read: {}", ty.name(), e)).at_pin(pin)
            })?;
            frame.set_owned(pin);
            return Ok(Some(dst));
        }
        if ctx.function.this_type() == Some(ty.id()) {
            if let Some(this) = ctx.this {
                return Ok(Some(this));
            }
        }
        if let Some((world_type, world)) = self.world.get() {
            if world_type == ty.id() {
                return Ok(Some(world));
            }
        }
        if ty.is_default_constructible() {
            frame.clear(pin);
            let dst = frame.storage(pin).ok_or_else(|| compiler_bug("data pin has no storage"))?;
            // SAFETY: as above.
            unsafe { ty.construct_default_at(dst) }.map_err(|e| {
                call_failed(format!("constructing `{}` failed: {}", ty.name(), e.message())).at_pin(pin)
            })?;
            frame.set_owned(pin);
            return Ok(Some(dst));
        }
        if info.form.is_pointer() {
            frame.set_null(pin);
            return Ok(None);
        }
        Err(ScriptError::new(
            ErrorKind::ValueWasNull,
            format!("unlinked `{}` input has no default and cannot be constructed", ty.name()),
        )
        .at_node(info.node)
        .at_pin(pin))
    }

    fn pull_bool(&self, ctx: &Context<'_>, frame: &mut ExecutionFrame<'_>, pin: PinId) -> Result<bool, ScriptError> {
        let ptr = self.pull(ctx, frame, pin)?.ok_or_else(|| null_input(pin))?;
        expect_type(ctx, pin, "bool")?;
        // SAFETY: the pin is declared bool.
        Ok(unsafe { ptr.cast::<bool>().read() })
    }

    fn pull_i32(&self, ctx: &Context<'_>, frame: &mut ExecutionFrame<'_>, pin: PinId) -> Result<i32, ScriptError> {
        let ptr = self.pull(ctx, frame, pin)?.ok_or_else(|| null_input(pin))?;
        expect_type(ctx, pin, "i32")?;
        // SAFETY: the pin is declared i32.
        Ok(unsafe { ptr.cast::<i32>().read() })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Returns
    // ─────────────────────────────────────────────────────────────────────────

    fn finish(
        &self,
        ctx: &Context<'_>,
        frame: &mut ExecutionFrame<'_>,
        node: &CompiledNode,
        ret: Option<NonNull<u8>>,
    ) -> Result<Option<DynamicValue>, ScriptError> {
        let Some((ty, form)) = ctx.function.ret() else {
            return Ok(None);
        };
        let pin = nth(&node.data_in, 0)?;
        let value = self.pull(ctx, frame, pin)?;

        if !form.is_owning() {
            return match value {
                None if form.is_pointer() => Ok(Some(DynamicValue::null(ty.id(), *form))),
                None => Err(null_input(pin)),
                Some(ptr) if self.stack.contains_since(frame.mark(), ptr) => Err(ScriptError::new(
                    ErrorKind::LinkNotAllowed,
                    "returns a reference to a value that ends with the call",
                )
                .at_node(node.id)
                .at_pin(pin)),
                // SAFETY: the data outlives this call.
                Some(ptr) => Ok(Some(unsafe { DynamicValue::borrowed(ty.id(), *form, ptr) })),
            };
        }

        let src = value.ok_or_else(|| null_input(pin))?;
        emit(ty, ret, |dst| match frame.owner_of(src) {
            Some(owner) => {
                // SAFETY: the frame owns the value; forgetting the slot completes the move.
                unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), ty.size()) };
                frame.forget(owner);
                Ok(())
            }
            // SAFETY: dst is uninitialised storage for the return type.
            None => unsafe { ty.copy_construct_at(dst, src) },
        })
        .map_err(|e| call_failed(format!("returning `{}` failed: {}", ty.name(), e.message())).at_node(node.id))
    }

    /// A flow chain ended outside any loop.
    fn implicit_return(&self, ctx: &Context<'_>, ret: Option<NonNull<u8>>) -> Result<Option<DynamicValue>, ScriptError> {
        let Some((ty, form)) = ctx.function.ret() else {
            return Ok(None);
        };
        if form.is_pointer() {
            return Ok(Some(DynamicValue::null(ty.id(), *form)));
        }
        if !form.is_owning() || !ty.is_default_constructible() {
            return Err(ScriptError::new(
                ErrorKind::ValueWasNull,
                format!("execution ended without returning a `{}`", ty.name()),
            ));
        }
        // SAFETY: dst is uninitialised storage for the return type.
        emit(ty, ret, |dst| unsafe { ty.construct_default_at(dst) })
            .map_err(|e| call_failed(format!("constructing `{}` failed: {}", ty.name(), e.message())))
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("config", &self.config)
            .field("stack_used", &self.stack.used())
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Arrival {
    /// Through a flow input
    Pin(PinId),
    /// Back to a loop whose body finished
    ReEntry(LoopMarker),
}

struct Context<'a> {
    function: &'a CompiledFunction,
    this: Option<NonNull<u8>>,
}

impl Context<'_> {
    fn node(&self, id: NodeId) -> Result<&CompiledNode, ScriptError> {
        self.function
            .node(id)
            .ok_or_else(|| compiler_bug(format!("{} is missing", id)))
    }

    fn pin_info(&self, id: PinId) -> Result<&CompiledPin, ScriptError> {
        self.function
            .pin(id)
            .ok_or_else(|| compiler_bug(format!("{} is missing", id)))
    }

    fn pin_type(&self, id: PinId) -> Result<&TypeDescriptor, ScriptError> {
        self.pin_info(id)?
            .ty
            .as_deref()
            .ok_or_else(|| compiler_bug(format!("{} is not a data pin", id)).at_pin(id))
    }

    fn follow(&self, output: PinId) -> Result<Option<Arrival>, ScriptError> {
        Ok(self.pin_info(output)?.target.map(Arrival::Pin))
    }
}

fn bind_arguments(
    ctx: &Context<'_>,
    frame: &mut ExecutionFrame<'_>,
    entry: &CompiledNode,
    args: &[DynamicValue],
) -> Result<(), ScriptError> {
    for (index, (pin, arg)) in entry.data_out.iter().zip(args).enumerate() {
        let ty = ctx.pin_type(*pin)?;
        if arg.type_id() != ty.id() {
            return Err(call_failed(format!("argument {} must be a `{}`", index, ty.name())).at_pin(*pin));
        }
        match arg.data_ptr() {
            Some(ptr) => frame.set_borrowed(*pin, ptr),
            None if arg.form().is_pointer() => frame.set_null(*pin),
            None => return Err(null_input(*pin)),
        }
    }
    Ok(())
}

fn store_result(
    frame: &mut ExecutionFrame<'_>,
    pin: PinId,
    form: ValueForm,
    value: Option<DynamicValue>,
) -> Result<(), ScriptError> {
    let dst = frame.storage(pin).ok_or_else(|| compiler_bug("return pin has no storage"))?;
    let Some(value) = value else {
        if form.is_owning() {
            // Constructed in place.
            frame.set_owned(pin);
            return Ok(());
        }
        return Err(call_failed("function returned no value").at_pin(pin));
    };
    if value.is_owning() {
        frame.clear(pin);
        // SAFETY: the slot is empty and laid out for the return type.
        return match unsafe { value.relocate_into(dst) } {
            Ok(()) => {
                frame.set_owned(pin);
                Ok(())
            }
            Err(_) => Err(compiler_bug("owned return value could not be moved").at_pin(pin)),
        };
    }
    match value.data_ptr() {
        Some(ptr) => frame.set_borrowed(pin, ptr),
        None => frame.set_null(pin),
    }
    Ok(())
}

/// Construct a value into `ret`, or into a fresh allocation that is returned.
fn emit(
    ty: &TypeDescriptor,
    ret: Option<NonNull<u8>>,
    init: impl FnOnce(NonNull<u8>) -> Result<(), CallError>,
) -> Result<Option<DynamicValue>, CallError> {
    match ret {
        Some(buffer) => init(buffer).map(|()| None),
        None => {
            let ptr = ty.allocate();
            match init(ptr) {
                // SAFETY: allocated by the descriptor and now initialised.
                Ok(()) => Ok(Some(unsafe { ty.adopt(ptr) })),
                Err(e) => {
                    // SAFETY: allocated above and holds no value.
                    unsafe { ty.deallocate(ptr) };
                    Err(e)
                }
            }
        }
    }
}

fn exit_loop(frame: &mut ExecutionFrame<'_>, node: NodeId) {
    if let Some(position) = frame.loops.iter().rposition(|marker| marker.node() == node) {
        frame.loops.truncate(position);
    }
}

fn nth(pins: &[PinId], index: usize) -> Result<PinId, ScriptError> {
    pins.get(index)
        .copied()
        .ok_or_else(|| compiler_bug(format!("node is missing pin {}", index)))
}

fn expect_type(ctx: &Context<'_>, pin: PinId, name: &str) -> Result<(), ScriptError> {
    let ty = ctx.pin_type(pin)?;
    if ty.name() != name {
        return Err(compiler_bug(format!("expected a `{}` pin, found `{}`", name, ty.name())).at_pin(pin));
    }
    Ok(())
}

fn compiler_bug(message: impl Into<String>) -> ScriptError {
    ScriptError::new(ErrorKind::CompilerBug, message)
}

fn call_failed(message: impl Into<String>) -> ScriptError {
    ScriptError::new(ErrorKind::FunctionCallFailed, message)
}

fn null_input(pin: PinId) -> ScriptError {
    ScriptError::new(ErrorKind::ValueWasNull, "input had no value").at_pin(pin)
}

/// Temporaries for one call, destroyed and released together.
struct TempScope<'a> {
    stack: &'a InterpreterStack,
    mark: StackMark,
    live: Vec<(NonNull<u8>, &'a TypeDescriptor)>,
}

impl<'a> TempScope<'a> {
    fn new(stack: &'a InterpreterStack) -> Self {
        Self {
            stack,
            mark: stack.mark(),
            live: Vec::new(),
        }
    }

    fn copy_of(&mut self, ty: &'a TypeDescriptor, src: NonNull<u8>) -> Result<NonNull<u8>, ScriptError> {
        let temp = self.stack.alloc(ty.layout()).ok_or_else(|| {
            ScriptError::new(ErrorKind::StackOverflow, "interpreter stack exhausted by call arguments")
        })?;
        // SAFETY: fresh stack memory for the type; src holds a live value of it.
        unsafe { ty.copy_construct_at(temp, src) }
            .map_err(|e| call_failed(format!("copying `{}` failed: {}", ty.name(), e.message())))?;
        self.live.push((temp, ty));
        Ok(temp)
    }

    /// Stop tracking the newest temporary; its value was moved out.
    fn release_last(&mut self) {
        self.live.pop();
    }
}

impl Drop for TempScope<'_> {
    fn drop(&mut self) {
        while let Some((ptr, ty)) = self.live.pop() {
            // SAFETY: tracked temporaries hold live values.
            unsafe { ty.destruct(ptr, false) };
        }
        self.stack.rewind(self.mark);
    }
}

struct CurrentGuard {
    previous: Option<NonNull<Interpreter>>,
}

impl CurrentGuard {
    fn enter(interpreter: &Interpreter) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(NonNull::from(interpreter))));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(self.previous));
    }
}

struct DepthGuard<'a>(&'a Cell<u32>);

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        Self(depth)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

struct WorldGuard<'a> {
    world: &'a Cell<Option<(TypeId, NonNull<u8>)>>,
    previous: Option<(TypeId, NonNull<u8>)>,
}

impl<'a> WorldGuard<'a> {
    fn enter(world: &'a Cell<Option<(TypeId, NonNull<u8>)>>, value: &DynamicValue) -> Self {
        let previous = world.replace(value.data_ptr().map(|ptr| (value.type_id(), ptr)));
        Self { world, previous }
    }
}

impl Drop for WorldGuard<'_> {
    fn drop(&mut self) {
        self.world.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::CompileContext;
    use parking_lot::Mutex;
    use script_graph::{FunctionSignature, GraphFunction, NodeKind, PinDirection, TypeRef};
    use script_registry::{OperatorKind, Reflect, TypeRegistry, arg, write_return};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe;

    impl Reflect for Probe {
        const TYPE_NAME: &'static str = "test::Probe";
    }

    struct Fixture {
        registry: TypeRegistry,
        evaluations: Arc<AtomicUsize>,
        records: Arc<Mutex<Vec<i32>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = TypeRegistry::with_builtins();
            let probe = registry.register_native::<Probe>();
            let evaluations = Arc::new(AtomicUsize::new(0));
            let records = Arc::new(Mutex::new(Vec::new()));

            let counter = evaluations.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Seven")
                    .returns_of::<i32>(ValueForm::Value)
                    .pure(true)
                    .build(move |_, ret| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        write_return(ret, 7i32)
                    }),
            ));
            let sink = records.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Record")
                    .param_of::<i32>("value", ValueForm::ConstRef)
                    .build(move |args, _| {
                        sink.lock().push(*arg::<i32>(args, 0)?);
                        Ok(None)
                    }),
            ));
            let sink = records.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Pair")
                    .param_of::<i32>("a", ValueForm::ConstRef)
                    .param_of::<i32>("b", ValueForm::ConstRef)
                    .build(move |args, _| {
                        let (a, b) = (*arg::<i32>(args, 0)?, *arg::<i32>(args, 1)?);
                        sink.lock().extend([a, b]);
                        Ok(None)
                    }),
            ));

            // Pointer inputs record what they point at, or -1 for null.
            let sink = records.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Peek")
                    .param_of::<i32>("value", ValueForm::Ptr)
                    .build(move |args, _| {
                        // SAFETY: a non-null `value` points at a live i32.
                        let value = args[0].data_ptr().map_or(-1, |ptr| unsafe { ptr.cast::<i32>().read() });
                        sink.lock().push(value);
                        Ok(None)
                    }),
            ));
            let sink = records.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Touch")
                    .param_of::<Probe>("probe", ValueForm::Ptr)
                    .build(move |args, _| {
                        sink.lock().push(if args[0].is_null() { -1 } else { 1 });
                        Ok(None)
                    }),
            ));
            let sink = records.clone();
            probe.add_function(Arc::new(
                FunctionDescriptor::builder("Inspect")
                    .param_of::<Probe>("probe", ValueForm::ConstRef)
                    .build(move |_, _| {
                        sink.lock().push(1);
                        Ok(None)
                    }),
            ));

            Self {
                registry,
                evaluations,
                records,
            }
        }

        fn probe(&self, name: &str) -> NodeKind {
            let probe = self.registry.lookup_name(Probe::TYPE_NAME).unwrap();
            NodeKind::call(Probe::TYPE_NAME, &probe.functions_named(name)[0])
        }

        fn operator(&self, op: OperatorKind) -> NodeKind {
            let i32_type = self.registry.lookup_name("i32").unwrap();
            NodeKind::call("i32", &i32_type.functions(op.into())[0])
        }

        fn add(&self, function: &mut GraphFunction, kind: NodeKind) -> NodeId {
            function.add_node(kind, &self.registry).unwrap()
        }

        fn run(&self, function: &GraphFunction, config: RuntimeConfig) -> Result<Option<DynamicValue>, ScriptError> {
            let compiled = CompiledFunction::compile(function, &self.registry, &CompileContext::new()).unwrap();
            let interpreter = Interpreter::new(config);
            let result = interpreter.execute(&compiled, &mut [], None);
            assert_eq!(interpreter.stack().used(), 0);
            result
        }

        fn records(&self) -> Vec<i32> {
            self.records.lock().clone()
        }
    }

    fn out(function: &GraphFunction, node: NodeId, name: &str) -> PinId {
        function.find_pin(node, PinDirection::Output, name).unwrap()
    }

    fn input(function: &GraphFunction, node: NodeId, name: &str) -> PinId {
        function.find_pin(node, PinDirection::Input, name).unwrap()
    }

    fn link(function: &mut GraphFunction, from: (NodeId, &str), to: (NodeId, &str)) {
        let output = out(function, from.0, from.1);
        let input = input(function, to.0, to.1);
        function.add_link(output, input).unwrap();
    }

    fn statement(fixture: &Fixture, name: &str) -> (GraphFunction, NodeId) {
        let function = GraphFunction::with_entry(name, FunctionSignature::new(), &fixture.registry).unwrap();
        let entry = function.entry_nodes().next().unwrap().id;
        (function, entry)
    }

    #[test]
    fn test_pure_node_reused_within_statement() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Cached");
        let seven = fixture.add(&mut function, fixture.probe("Seven"));
        let pair = fixture.add(&mut function, fixture.probe("Pair"));
        link(&mut function, (entry, "Then"), (pair, "Exec"));
        link(&mut function, (seven, "Return Value"), (pair, "a"));
        link(&mut function, (seven, "Return Value"), (pair, "b"));

        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.records(), [7, 7]);
    }

    #[test]
    fn test_pure_node_reevaluated_after_statement() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Uncached");
        let seven = fixture.add(&mut function, fixture.probe("Seven"));
        let first = fixture.add(&mut function, fixture.probe("Record"));
        let second = fixture.add(&mut function, fixture.probe("Record"));
        link(&mut function, (entry, "Then"), (first, "Exec"));
        link(&mut function, (first, "Then"), (second, "Exec"));
        link(&mut function, (seven, "Return Value"), (first, "value"));
        link(&mut function, (seven, "Return Value"), (second, "value"));

        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.evaluations.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.records(), [7, 7]);
    }

    #[test]
    fn test_for_loop_visits_body() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Count");
        let for_loop = fixture.add(&mut function, NodeKind::ForLoop);
        let record = fixture.add(&mut function, fixture.probe("Record"));
        link(&mut function, (entry, "Then"), (for_loop, "Exec"));
        link(&mut function, (for_loop, "Loop Body"), (record, "Exec"));
        link(&mut function, (for_loop, "Index"), (record, "value"));
        // Start stays unlinked and falls back to a default-constructed 0.
        let end = input(&function, for_loop, "End");
        function.set_pin_default(end, Some(json!(5))).unwrap();

        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.records(), [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_for_loop_break() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Break");
        let for_loop = fixture.add(&mut function, NodeKind::ForLoop);
        let record = fixture.add(&mut function, fixture.probe("Record"));
        let branch = fixture.add(&mut function, NodeKind::Branch);
        let at_least = fixture.add(&mut function, fixture.operator(OperatorKind::GreaterEqual));
        link(&mut function, (entry, "Then"), (for_loop, "Exec"));
        link(&mut function, (for_loop, "Loop Body"), (record, "Exec"));
        link(&mut function, (for_loop, "Index"), (record, "value"));
        link(&mut function, (record, "Then"), (branch, "Exec"));
        link(&mut function, (for_loop, "Index"), (at_least, "a"));
        link(&mut function, (at_least, "Return Value"), (branch, "Condition"));
        link(&mut function, (branch, "True"), (for_loop, "Break"));
        let end = input(&function, for_loop, "End");
        function.set_pin_default(end, Some(json!(10))).unwrap();
        let k = input(&function, at_least, "b");
        function.set_pin_default(k, Some(json!(2))).unwrap();

        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.records(), [0, 1, 2]);
    }

    #[test]
    fn test_nested_loops() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Grid");
        let outer = fixture.add(&mut function, NodeKind::ForLoop);
        let inner = fixture.add(&mut function, NodeKind::ForLoop);
        let record = fixture.add(&mut function, fixture.probe("Record"));
        link(&mut function, (entry, "Then"), (outer, "Exec"));
        link(&mut function, (outer, "Loop Body"), (inner, "Exec"));
        link(&mut function, (inner, "Loop Body"), (record, "Exec"));
        link(&mut function, (inner, "Index"), (record, "value"));
        let outer_end = input(&function, outer, "End");
        function.set_pin_default(outer_end, Some(json!(3))).unwrap();
        let inner_end = input(&function, inner, "End");
        function.set_pin_default(inner_end, Some(json!(4))).unwrap();

        fixture.run(&function, RuntimeConfig::default()).unwrap();
        let records = fixture.records();
        assert_eq!(records.len(), 12);
        assert_eq!(&records[..4], [0, 1, 2, 3]);
        assert_eq!(&records[8..], [0, 1, 2, 3]);
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Forever");
        let while_loop = fixture.add(&mut function, NodeKind::WhileLoop);
        link(&mut function, (entry, "Then"), (while_loop, "Exec"));
        let condition = input(&function, while_loop, "Condition");
        function.set_pin_default(condition, Some(json!(true))).unwrap();

        let err = fixture
            .run(&function, RuntimeConfig::default().with_max_steps(1000))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExecutionTimeOut);
        assert_eq!(err.location.function.as_deref(), Some("Forever"));
    }

    #[test]
    fn test_while_loop_exits_on_false() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Never");
        let while_loop = fixture.add(&mut function, NodeKind::WhileLoop);
        let record = fixture.add(&mut function, fixture.probe("Record"));
        link(&mut function, (entry, "Then"), (while_loop, "Exec"));
        link(&mut function, (while_loop, "Completed"), (record, "Exec"));

        // The unlinked condition default-constructs to false.
        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.records(), [0]);
    }

    #[test]
    fn test_pure_function_returns_value() {
        let fixture = Fixture::new();
        let signature = FunctionSignature::new()
            .with_param("x", TypeRef::new("i32"), ValueForm::Value)
            .with_return(TypeRef::new("i32"), ValueForm::Value)
            .pure(true);
        let mut function = GraphFunction::with_entry("Increment", signature, &fixture.registry).unwrap();
        let entry = function.entry_nodes().next().unwrap().id;
        let ret = function.return_nodes().next().unwrap().id;
        let plus = fixture.add(&mut function, fixture.operator(OperatorKind::Add));
        link(&mut function, (entry, "x"), (plus, "a"));
        link(&mut function, (plus, "Return Value"), (ret, "Return Value"));
        let one = input(&function, plus, "b");
        function.set_pin_default(one, Some(json!(1))).unwrap();

        let compiled = CompiledFunction::compile(&function, &fixture.registry, &CompileContext::new()).unwrap();
        let interpreter = Interpreter::new(RuntimeConfig::default());
        let value = interpreter
            .execute(&compiled, &mut [DynamicValue::new(41i32)], None)
            .unwrap()
            .unwrap();
        assert_eq!(value.get::<i32>(), Some(&42));

        let mut out = 0i32;
        let written = interpreter
            .execute(&compiled, &mut [DynamicValue::new(1i32)], Some(NonNull::from(&mut out).cast()))
            .unwrap();
        assert!(written.is_none());
        assert_eq!(out, 2);

        let err = interpreter.execute(&compiled, &mut [], None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FunctionCallFailed);
    }

    #[test]
    fn test_implicit_return_default_constructs() {
        let fixture = Fixture::new();
        let signature = FunctionSignature::new().with_return(TypeRef::new("String"), ValueForm::Value);
        let function = GraphFunction::with_entry("Nothing", signature, &fixture.registry).unwrap();

        let value = fixture.run(&function, RuntimeConfig::default()).unwrap().unwrap();
        assert_eq!(value.get::<String>().map(String::as_str), Some(""));
    }

    #[test]
    fn test_failed_call_is_located() {
        let fixture = Fixture::new();
        let signature = FunctionSignature::new()
            .with_return(TypeRef::new("i32"), ValueForm::Value)
            .pure(true);
        let mut function = GraphFunction::with_entry("Divide", signature, &fixture.registry).unwrap();
        let ret = function.return_nodes().next().unwrap().id;
        let divide = fixture.add(&mut function, fixture.operator(OperatorKind::Divide));
        link(&mut function, (divide, "Return Value"), (ret, "Return Value"));
        let numerator = input(&function, divide, "a");
        function.set_pin_default(numerator, Some(json!(1))).unwrap();

        let err = fixture.run(&function, RuntimeConfig::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FunctionCallFailed);
        assert_eq!(err.location.node, Some(divide));
        assert!(err.message.contains("operator/"));
    }

    #[test]
    fn test_bad_default_fails_call() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "BadDefault");
        let record = fixture.add(&mut function, fixture.probe("Record"));
        link(&mut function, (entry, "Then"), (record, "Exec"));
        let value = input(&function, record, "value");
        function.set_pin_default(value, Some(json!("not a number"))).unwrap();

        let err = fixture.run(&function, RuntimeConfig::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::FunctionCallFailed);
        assert_eq!(err.location.pin, Some(value));
        assert!(fixture.records().is_empty());
    }

    #[test]
    fn test_unlinked_inputs_default_construct() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "Unlinked");
        let record = fixture.add(&mut function, fixture.probe("Record"));
        let peek = fixture.add(&mut function, fixture.probe("Peek"));
        let touch = fixture.add(&mut function, fixture.probe("Touch"));
        link(&mut function, (entry, "Then"), (record, "Exec"));
        link(&mut function, (record, "Then"), (peek, "Exec"));
        link(&mut function, (peek, "Then"), (touch, "Exec"));

        // A pointer input gets a fresh value when its type can make one, and
        // null only when it cannot.
        fixture.run(&function, RuntimeConfig::default()).unwrap();
        assert_eq!(fixture.records(), [0, 0, -1]);
    }

    #[test]
    fn test_unlinked_input_without_value_fails() {
        let fixture = Fixture::new();
        let (mut function, entry) = statement(&fixture, "NoValue");
        let inspect = fixture.add(&mut function, fixture.probe("Inspect"));
        link(&mut function, (entry, "Then"), (inspect, "Exec"));
        let probe = input(&function, inspect, "probe");

        let err = fixture.run(&function, RuntimeConfig::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueWasNull);
        assert_eq!(err.location.node, Some(inspect));
        assert_eq!(err.location.pin, Some(probe));
        assert!(fixture.records().is_empty());
    }

    #[test]
    fn test_stack_too_small_overflows() {
        let fixture = Fixture::new();
        let (function, _) = statement(&fixture, "Tiny");
        let err = fixture
            .run(&function, RuntimeConfig::default().with_stack_size(1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }
}
