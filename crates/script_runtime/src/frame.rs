//! Execution frames
//!
//! One frame per call, carved from the interpreter stack: a slot per pin id of
//! the function and a block holding the values those slots own.

use std::alloc::Layout;
use std::ptr::{self, NonNull};

use script_graph::{NodeId, PinId};

use crate::compiled::CompiledFunction;
use crate::stack::{InterpreterStack, StackMark};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Not computed yet
    Empty,
    /// A live value in the pin's own storage
    Owned,
    /// Data living elsewhere
    Borrowed(NonNull<u8>),
    /// A null pointer
    Null,
}

/// A loop whose body is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopMarker {
    For(NodeId),
    While(NodeId),
}

impl LoopMarker {
    pub fn node(self) -> NodeId {
        match self {
            LoopMarker::For(node) | LoopMarker::While(node) => node,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    /// Impure-step counter at the time the slot was filled
    stamp: u32,
}

pub(crate) struct ExecutionFrame<'a> {
    function: &'a CompiledFunction,
    stack: &'a InterpreterStack,
    mark: StackMark,
    slots: NonNull<Slot>,
    storage: NonNull<u8>,
    /// Enclosing loops, innermost last
    pub loops: Vec<LoopMarker>,
    pub impure_steps: u32,
}

impl<'a> ExecutionFrame<'a> {
    /// `None` when the stack cannot hold the frame.
    pub fn new(function: &'a CompiledFunction, stack: &'a InterpreterStack) -> Option<Self> {
        let mark = stack.mark();
        let allocated = Layout::array::<Slot>(function.pin_capacity())
            .ok()
            .and_then(|layout| stack.alloc(layout))
            .and_then(|slots| stack.alloc(function.storage_layout()).map(|storage| (slots, storage)));
        let Some((slots, storage)) = allocated else {
            stack.rewind(mark);
            return None;
        };
        let slots = slots.cast::<Slot>();
        for index in 0..function.pin_capacity() {
            // SAFETY: the array was allocated for pin_capacity slots.
            unsafe {
                slots.add(index).write(Slot {
                    state: SlotState::Empty,
                    stamp: 0,
                })
            };
        }
        Some(Self {
            function,
            stack,
            mark,
            slots,
            storage,
            loops: Vec::new(),
            impure_steps: 0,
        })
    }

    pub fn mark(&self) -> StackMark {
        self.mark
    }

    pub fn innermost_loop(&self) -> Option<NodeId> {
        self.loops.last().map(|marker| marker.node())
    }

    fn slot(&self, pin: PinId) -> Option<&Slot> {
        let index = pin.index();
        // SAFETY: bounds checked, the array lives as long as the frame.
        (index < self.function.pin_capacity()).then(|| unsafe { self.slots.add(index).as_ref() })
    }

    fn slot_mut(&mut self, pin: PinId) -> Option<&mut Slot> {
        let index = pin.index();
        // SAFETY: as for `slot`, and `&mut self` makes the access unique.
        (index < self.function.pin_capacity()).then(|| unsafe { self.slots.add(index).as_mut() })
    }

    pub fn state(&self, pin: PinId) -> SlotState {
        self.slot(pin).map_or(SlotState::Empty, |s| s.state)
    }

    pub fn is_filled(&self, pin: PinId) -> bool {
        self.state(pin) != SlotState::Empty
    }

    pub fn stamp(&self, pin: PinId) -> Option<u32> {
        self.slot(pin).map(|s| s.stamp)
    }

    /// Uninitialised or owned storage of a data pin
    pub fn storage(&self, pin: PinId) -> Option<NonNull<u8>> {
        let info = self.function.pin(pin)?;
        info.ty.as_ref()?;
        // SAFETY: the offset was laid out within the storage block.
        Some(unsafe { self.storage.add(info.storage) })
    }

    /// Where a filled pin's data is; `None` for empty and null slots.
    pub fn value(&self, pin: PinId) -> Option<NonNull<u8>> {
        match self.state(pin) {
            SlotState::Owned => self.storage(pin),
            SlotState::Borrowed(ptr) => Some(ptr),
            SlotState::Empty | SlotState::Null => None,
        }
    }

    /// Destroy whatever the slot owns and mark it empty.
    pub fn clear(&mut self, pin: PinId) {
        if self.state(pin) == SlotState::Owned {
            if let (Some(ptr), Some(ty)) = (self.storage(pin), self.function.pin(pin).and_then(|p| p.ty.as_ref())) {
                // SAFETY: an owned slot holds a live value of its pin's type.
                unsafe { ty.destruct(ptr, false) };
            }
        }
        self.set(pin, SlotState::Empty);
    }

    /// Mark the pin's storage as holding a live value.
    pub fn set_owned(&mut self, pin: PinId) {
        self.set(pin, SlotState::Owned);
    }

    pub fn set_borrowed(&mut self, pin: PinId, ptr: NonNull<u8>) {
        self.clear(pin);
        self.set(pin, SlotState::Borrowed(ptr));
    }

    pub fn set_null(&mut self, pin: PinId) {
        self.clear(pin);
        self.set(pin, SlotState::Null);
    }

    /// Mark empty without destroying; the value was moved out.
    pub fn forget(&mut self, pin: PinId) {
        self.set(pin, SlotState::Empty);
    }

    fn set(&mut self, pin: PinId, state: SlotState) {
        let stamp = self.impure_steps;
        if let Some(slot) = self.slot_mut(pin) {
            *slot = Slot { state, stamp };
        }
    }

    /// The pin whose storage owns the value at `ptr`, if any.
    pub fn owner_of(&self, ptr: NonNull<u8>) -> Option<PinId> {
        (0..self.function.pin_capacity())
            .map(PinId::from_index)
            .find(|pin| self.state(*pin) == SlotState::Owned && self.storage(*pin) == Some(ptr))
    }

    pub fn read<T: Copy>(&self, pin: PinId) -> Option<T> {
        // SAFETY: callers read pins declared with type T.
        self.value(pin).map(|ptr| unsafe { ptr.cast::<T>().read() })
    }

    /// Store a plain value in the pin's own storage.
    pub fn write<T: Copy>(&mut self, pin: PinId, value: T) -> bool {
        self.clear(pin);
        let Some(ptr) = self.storage(pin) else {
            return false;
        };
        // SAFETY: the storage was laid out for the pin's type, which callers match to T.
        unsafe { ptr::write(ptr.cast::<T>().as_ptr(), value) };
        self.set_owned(pin);
        true
    }
}

impl Drop for ExecutionFrame<'_> {
    fn drop(&mut self) {
        for index in (0..self.function.pin_capacity()).rev() {
            self.clear(PinId::from_index(index));
        }
        self.stack.rewind(self.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::CompileContext;
    use script_graph::{FunctionSignature, GraphFunction, NodeKind, PinDirection, TypeRef};
    use script_registry::{TypeRegistry, ValueForm};

    fn compiled(registry: &TypeRegistry) -> (CompiledFunction, PinId) {
        let signature = FunctionSignature::new().with_param("name", TypeRef::new("String"), ValueForm::Value);
        let mut function = GraphFunction::with_entry("Frame", signature, registry).unwrap();
        let node = function.add_node(NodeKind::ForLoop, registry).unwrap();
        let index = function.find_pin(node, PinDirection::Output, "Index").unwrap();
        let compiled = CompiledFunction::compile(&function, registry, &CompileContext::new()).unwrap();
        (compiled, index)
    }

    #[test]
    fn test_frame_rewinds_stack() {
        let registry = TypeRegistry::with_builtins();
        let (function, index) = compiled(&registry);
        let stack = InterpreterStack::new(4096);
        {
            let mut frame = ExecutionFrame::new(&function, &stack).unwrap();
            assert!(stack.used() > 0);
            assert!(frame.write(index, 7i32));
            assert_eq!(frame.read::<i32>(index), Some(7));
            frame.clear(index);
            assert!(!frame.is_filled(index));
        }
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_frame_destroys_owned_values() {
        let registry = TypeRegistry::with_builtins();
        let (function, _) = compiled(&registry);
        let string = registry.lookup_name("String").unwrap();
        let stack = InterpreterStack::new(4096);
        let mut frame = ExecutionFrame::new(&function, &stack).unwrap();

        // The String parameter pin of the Entry node.
        let pin = PinId::new(2);
        let ptr = frame.storage(pin).unwrap();
        unsafe { string.from_json_at(&serde_json::json!("a heap string"), ptr).unwrap() };
        frame.set_owned(pin);
        assert_eq!(frame.owner_of(ptr), Some(pin));
        // Dropping the frame frees the string; leaks show up under miri.
        drop(frame);
        assert_eq!(stack.used(), 0);
    }

    #[test]
    fn test_frame_too_large_for_stack() {
        let registry = TypeRegistry::with_builtins();
        let (function, _) = compiled(&registry);
        let stack = InterpreterStack::new(16);
        assert!(ExecutionFrame::new(&function, &stack).is_none());
        assert_eq!(stack.used(), 0);
    }
}
