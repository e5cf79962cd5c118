//! Type-erased values
//!
//! A [`DynamicValue`] pairs a [`TypeId`] and [`ValueForm`] with the data it refers
//! to. Owned values destroy and free their allocation when dropped; borrowed and
//! pointer values never do.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::{Reflect, TypeId, ValueForm, type_id_of};

/// Destroys the value at a pointer in place, without freeing its memory.
pub type DestructorFn = Arc<dyn Fn(NonNull<u8>) + Send + Sync>;

/// Allocate uninitialised memory for `layout`. Zero-sized layouts get a dangling,
/// suitably aligned pointer.
pub fn allocate(layout: Layout) -> NonNull<u8> {
    if layout.size() == 0 {
        // Non-null and aligned; never dereferenced for a zero-sized value.
        return NonNull::new(ptr::without_provenance_mut(layout.align())).unwrap_or(NonNull::dangling());
    }
    // SAFETY: layout has a non-zero size.
    let raw = unsafe { alloc::alloc(layout) };
    NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout))
}

/// Free memory obtained from [`allocate`] with the same layout.
///
/// # Safety
/// `ptr` must come from `allocate(layout)` and not have been freed.
pub unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    if layout.size() != 0 {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// The destructor for a native type, or `None` when dropping it is a no-op.
pub fn native_destructor<T: 'static>() -> Option<DestructorFn> {
    if !std::mem::needs_drop::<T>() {
        return None;
    }
    Some(Arc::new(|ptr: NonNull<u8>| {
        // SAFETY: destructor contract, ptr holds a live T.
        unsafe { ptr::drop_in_place(ptr.cast::<T>().as_ptr()) }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Owned storage
// ─────────────────────────────────────────────────────────────────────────────

/// A registry allocation holding one initialised value.
pub struct OwnedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    destructor: Option<DestructorFn>,
}

impl OwnedBuffer {
    /// Take ownership of an initialised allocation.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`] with `layout` and hold a live value that
    /// `destructor` knows how to destroy.
    pub unsafe fn from_raw(ptr: NonNull<u8>, layout: Layout, destructor: Option<DestructorFn>) -> Self {
        Self { ptr, layout, destructor }
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Give up the allocation without running the destructor or freeing it.
    fn into_raw(self) -> (NonNull<u8>, Layout) {
        let raw = (self.ptr, self.layout);
        std::mem::forget(self);
        raw
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if let Some(destructor) = &self.destructor {
            destructor(self.ptr);
        }
        // SAFETY: allocated by `allocate` with this layout.
        unsafe { deallocate(self.ptr, self.layout) };
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dynamic Value
// ─────────────────────────────────────────────────────────────────────────────

enum Storage {
    /// Registry allocation owned by this value
    Owned(OwnedBuffer),
    /// Non-null data owned elsewhere
    Borrowed(NonNull<u8>),
    /// Pointer forms, possibly null
    Raw(Option<NonNull<u8>>),
}

/// A type-erased value of a registered type.
pub struct DynamicValue {
    type_id: TypeId,
    form: ValueForm,
    storage: Storage,
}

impl DynamicValue {
    /// Move a native value into a fresh registry allocation.
    pub fn new<T: Reflect>(value: T) -> Self {
        let layout = Layout::new::<T>();
        let ptr = allocate(layout);
        // SAFETY: freshly allocated for T.
        unsafe { ptr.cast::<T>().as_ptr().write(value) };
        Self {
            type_id: type_id_of::<T>(),
            form: ValueForm::Value,
            storage: Storage::Owned(OwnedBuffer {
                ptr,
                layout,
                destructor: native_destructor::<T>(),
            }),
        }
    }

    /// Wrap an owned buffer as a `Value`.
    pub fn from_owned(type_id: TypeId, buffer: OwnedBuffer) -> Self {
        Self {
            type_id,
            form: ValueForm::Value,
            storage: Storage::Owned(buffer),
        }
    }

    /// A non-owning value referring to data held elsewhere.
    ///
    /// `form` may be any form; pointer forms are stored as non-null pointers.
    ///
    /// # Safety
    /// `ptr` must point to a live value of `type_id` for as long as this value
    /// (and anything derived from it) is used, and must not be mutated through
    /// another path while a mutable form is in use.
    pub unsafe fn borrowed(type_id: TypeId, form: ValueForm, ptr: NonNull<u8>) -> Self {
        let storage = if form.is_pointer() {
            Storage::Raw(Some(ptr))
        } else {
            Storage::Borrowed(ptr)
        };
        Self { type_id, form, storage }
    }

    /// A pointer-form value, possibly null.
    ///
    /// # Safety
    /// Same contract as [`DynamicValue::borrowed`] when `ptr` is non-null.
    pub unsafe fn pointer(type_id: TypeId, form: ValueForm, ptr: Option<NonNull<u8>>) -> Self {
        debug_assert!(form.is_pointer());
        Self {
            type_id,
            form,
            storage: Storage::Raw(ptr),
        }
    }

    /// A null pointer of the given pointer form.
    pub fn null(type_id: TypeId, form: ValueForm) -> Self {
        Self {
            type_id,
            form,
            storage: Storage::Raw(None),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn form(&self) -> ValueForm {
        self.form
    }

    /// Whether dropping this value destroys and frees its data.
    pub fn is_owning(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    pub fn is_null(&self) -> bool {
        self.data_ptr().is_none()
    }

    pub fn data_ptr(&self) -> Option<NonNull<u8>> {
        match &self.storage {
            Storage::Owned(buffer) => Some(buffer.ptr),
            Storage::Borrowed(ptr) => Some(*ptr),
            Storage::Raw(ptr) => *ptr,
        }
    }

    /// Typed shared access, `None` on type mismatch or null.
    pub fn get<T: Reflect>(&self) -> Option<&T> {
        if self.type_id != type_id_of::<T>() {
            return None;
        }
        // SAFETY: the type id matches and construction guarantees a live value.
        self.data_ptr().map(|ptr| unsafe { ptr.cast::<T>().as_ref() })
    }

    /// Typed mutable access, `None` on type mismatch, null or a const form.
    pub fn get_mut<T: Reflect>(&mut self) -> Option<&mut T> {
        if self.type_id != type_id_of::<T>() || !self.form.is_mutable() {
            return None;
        }
        // SAFETY: as for `get`, and the form grants mutation.
        self.data_ptr().map(|ptr| unsafe { ptr.cast::<T>().as_mut() })
    }

    /// Move the native value out of an owning value.
    pub fn into_inner<T: Reflect>(self) -> Result<T, Self> {
        if self.type_id != type_id_of::<T>() {
            return Err(self);
        }
        match self.storage {
            Storage::Owned(buffer) => {
                let (ptr, layout) = buffer.into_raw();
                // SAFETY: the buffer held a live T which we now own.
                let value = unsafe { ptr.cast::<T>().as_ptr().read() };
                unsafe { deallocate(ptr, layout) };
                Ok(value)
            }
            storage => Err(Self { storage, ..self }),
        }
    }

    /// Bitwise-move an owned value into `dst` and free the old allocation.
    ///
    /// Non-owning values are handed back unchanged.
    ///
    /// # Safety
    /// `dst` must be valid for writes of the value's layout and hold no live value.
    pub unsafe fn relocate_into(self, dst: NonNull<u8>) -> Result<(), Self> {
        match self.storage {
            Storage::Owned(buffer) => {
                let (ptr, layout) = buffer.into_raw();
                unsafe {
                    ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), layout.size());
                    deallocate(ptr, layout);
                }
                Ok(())
            }
            storage => Err(Self { storage, ..self }),
        }
    }

    /// A non-owning view of this value's data in another form.
    ///
    /// # Safety
    /// The view must not outlive `self`.
    pub unsafe fn view(&self, form: ValueForm) -> Self {
        match self.data_ptr() {
            Some(ptr) => unsafe { Self::borrowed(self.type_id, form, ptr) },
            None => Self::null(self.type_id, form),
        }
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicValue")
            .field("type_id", &self.type_id)
            .field("form", &self.form)
            .field("owning", &self.is_owning())
            .field("data", &self.data_ptr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Reflect for Tracked {
        const TYPE_NAME: &'static str = "Tracked";
    }

    #[test]
    fn test_owned_value_destroys_on_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = DynamicValue::new(Tracked(drops.clone()));
        assert!(value.is_owning());
        assert_eq!(value.form(), ValueForm::Value);
        drop(value);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrowed_value_does_not_own() {
        let mut number = 41i32;
        let mut value =
            unsafe { DynamicValue::borrowed(type_id_of::<i32>(), ValueForm::Ref, NonNull::from(&mut number).cast()) };
        assert!(!value.is_owning());
        *value.get_mut::<i32>().unwrap() += 1;
        drop(value);
        assert_eq!(number, 42);
    }

    #[test]
    fn test_const_forms_refuse_mutation() {
        let number = 5i32;
        let mut value =
            unsafe { DynamicValue::borrowed(type_id_of::<i32>(), ValueForm::ConstRef, NonNull::from(&number).cast()) };
        assert_eq!(value.get::<i32>(), Some(&5));
        assert!(value.get_mut::<i32>().is_none());
    }

    #[test]
    fn test_type_mismatch_returns_none() {
        let value = DynamicValue::new(3.5f32);
        assert!(value.get::<i32>().is_none());
        assert_eq!(value.get::<f32>(), Some(&3.5));
    }

    #[test]
    fn test_null_pointer() {
        let value = DynamicValue::null(type_id_of::<i32>(), ValueForm::Ptr);
        assert!(value.is_null());
        assert!(value.get::<i32>().is_none());
    }

    #[test]
    fn test_into_inner_moves_without_double_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let value = DynamicValue::new(Tracked(drops.clone()));
        let tracked = value.into_inner::<Tracked>().ok().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(tracked);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relocate_into() {
        let value = DynamicValue::new(String::from("moved"));
        let mut slot = std::mem::MaybeUninit::<String>::uninit();
        unsafe { value.relocate_into(NonNull::new_unchecked(slot.as_mut_ptr().cast())) }.unwrap();
        let moved = unsafe { slot.assume_init() };
        assert_eq!(moved, "moved");
    }
}
