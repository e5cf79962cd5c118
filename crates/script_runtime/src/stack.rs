//! Interpreter stack
//!
//! A fixed-capacity bump allocator. Execution frames and call temporaries are
//! carved from it in LIFO order and released by rewinding to a mark.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;

use crate::fatal;

/// Alignment of the stack's backing block
const STACK_ALIGN: usize = 16;

/// A position to rewind the stack to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackMark(usize);

pub struct InterpreterStack {
    base: NonNull<u8>,
    layout: Layout,
    top: Cell<usize>,
    high_water: Cell<usize>,
}

// SAFETY: the stack owns its block exclusively; `Cell` keeps it `!Sync`.
unsafe impl Send for InterpreterStack {}

impl InterpreterStack {
    /// Reserve `capacity` bytes. Failing to get them is fatal.
    pub fn new(capacity: usize) -> Self {
        let layout = match Layout::from_size_align(capacity.max(1), STACK_ALIGN) {
            Ok(layout) => layout,
            Err(e) => fatal(&format!("invalid interpreter stack size {}: {}", capacity, e)),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            fatal(&format!("could not allocate a {} byte interpreter stack", capacity));
        };
        Self {
            base,
            layout,
            top: Cell::new(0),
            high_water: Cell::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes currently in use
    pub fn used(&self) -> usize {
        self.top.get()
    }

    /// Most bytes ever in use at once
    pub fn high_water(&self) -> usize {
        self.high_water.get()
    }

    pub fn mark(&self) -> StackMark {
        StackMark(self.top.get())
    }

    /// Release everything allocated since `mark`.
    ///
    /// Values living in the released region must already have been destroyed.
    pub fn rewind(&self, mark: StackMark) {
        debug_assert!(mark.0 <= self.top.get());
        self.top.set(mark.0.min(self.top.get()));
    }

    /// Carve out uninitialised memory, or `None` when the stack is exhausted.
    pub fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let base = self.base.as_ptr() as usize;
        let start = (base + self.top.get()).checked_next_multiple_of(layout.align())? - base;
        let end = start.checked_add(layout.size())?;
        if end > self.capacity() {
            return None;
        }
        self.top.set(end);
        self.high_water.set(self.high_water.get().max(end));
        // SAFETY: start is within the block.
        Some(unsafe { self.base.add(start) })
    }

    /// Whether `ptr` lies in the region allocated since `mark`.
    pub fn contains_since(&self, mark: StackMark, ptr: NonNull<u8>) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base + mark.0 && addr < base + self.top.get()
    }
}

impl Drop for InterpreterStack {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_respects_alignment() {
        let stack = InterpreterStack::new(256);
        let a = stack.alloc(Layout::new::<u8>()).unwrap();
        let b = stack.alloc(Layout::new::<u64>()).unwrap();
        assert_eq!(b.as_ptr() as usize % 8, 0);
        assert!(b.as_ptr() as usize > a.as_ptr() as usize);
        assert_eq!(stack.used(), 16);
    }

    #[test]
    fn test_exhaustion_and_rewind() {
        let stack = InterpreterStack::new(64);
        let mark = stack.mark();
        assert!(stack.alloc(Layout::from_size_align(48, 8).unwrap()).is_some());
        assert!(stack.alloc(Layout::from_size_align(32, 8).unwrap()).is_none());
        // A failed allocation leaves the stack untouched.
        assert_eq!(stack.used(), 48);

        stack.rewind(mark);
        assert_eq!(stack.used(), 0);
        assert_eq!(stack.high_water(), 48);
        assert!(stack.alloc(Layout::from_size_align(64, 8).unwrap()).is_some());
    }

    #[test]
    fn test_contains_since() {
        let stack = InterpreterStack::new(64);
        let outer = stack.alloc(Layout::new::<u32>()).unwrap();
        let mark = stack.mark();
        let inner = stack.alloc(Layout::new::<u32>()).unwrap();
        assert!(stack.contains_since(mark, inner));
        assert!(!stack.contains_since(mark, outer));
    }
}
