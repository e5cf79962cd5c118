//! Type descriptors
//!
//! A [`TypeDescriptor`] is everything the runtime knows about a type: its
//! layout, trait flags, fields and the functions it exposes. Construction,
//! copying, moving and equality are ordinary [`FunctionDescriptor`]s keyed by
//! operator, so native and scripted types are driven the same way.

use std::alloc::Layout;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    CallError, CallResult, DestructorFn, DynamicValue, FuncId, FunctionDescriptor, FunctionKey, OperatorKind,
    OwnedBuffer, TypeId, ValueForm, allocate, deallocate, name_hash,
};

// ─────────────────────────────────────────────────────────────────────────────
// Trait Flags
// ─────────────────────────────────────────────────────────────────────────────

/// Capabilities of a type, as a small bit set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeTraits(u8);

impl TypeTraits {
    pub const NONE: Self = Self(0);
    pub const DEFAULT_CONSTRUCTIBLE: Self = Self(1 << 0);
    pub const COPY_CONSTRUCTIBLE: Self = Self(1 << 1);
    pub const MOVE_CONSTRUCTIBLE: Self = Self(1 << 2);
    pub const COPY_ASSIGNABLE: Self = Self(1 << 3);
    pub const MOVE_ASSIGNABLE: Self = Self(1 << 4);
    pub const TRIVIALLY_DESTRUCTIBLE: Self = Self(1 << 5);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for TypeTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TypeTraits, &str); 6] = [
            (TypeTraits::DEFAULT_CONSTRUCTIBLE, "DEFAULT_CONSTRUCTIBLE"),
            (TypeTraits::COPY_CONSTRUCTIBLE, "COPY_CONSTRUCTIBLE"),
            (TypeTraits::MOVE_CONSTRUCTIBLE, "MOVE_CONSTRUCTIBLE"),
            (TypeTraits::COPY_ASSIGNABLE, "COPY_ASSIGNABLE"),
            (TypeTraits::MOVE_ASSIGNABLE, "MOVE_ASSIGNABLE"),
            (TypeTraits::TRIVIALLY_DESTRUCTIBLE, "TRIVIALLY_DESTRUCTIBLE"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TypeTraits({})", set.join(" | "))
    }
}

/// Where a type definition came from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeSource {
    /// Described from Rust code
    #[default]
    Native,
    /// Declared by a compiled script
    Script { script: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Fields & Codecs
// ─────────────────────────────────────────────────────────────────────────────

/// A data member at a fixed offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub name_hash: u32,
    pub type_id: TypeId,
    pub offset: usize,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, type_id: TypeId, offset: usize) -> Self {
        let name = name.into();
        Self {
            name_hash: name_hash(&name),
            name,
            type_id,
            offset,
        }
    }
}

/// Encodes a live value as JSON.
pub type EncodeFn = Arc<dyn Fn(NonNull<u8>) -> serde_json::Value + Send + Sync>;
/// Decodes JSON into an uninitialised buffer.
pub type DecodeFn = Arc<dyn Fn(&serde_json::Value, NonNull<u8>) -> Result<(), String> + Send + Sync>;

/// JSON conversion for a type's values.
#[derive(Clone)]
pub struct JsonCodec {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

// ─────────────────────────────────────────────────────────────────────────────
// Type Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime description of a native or scripted type.
pub struct TypeDescriptor {
    id: TypeId,
    name: String,
    layout: Layout,
    traits: TypeTraits,
    script_visible: bool,
    source: TypeSource,
    fields: Vec<FieldDescriptor>,
    functions: RwLock<HashMap<FunctionKey, Vec<Arc<FunctionDescriptor>>>>,
    bases: Vec<TypeId>,
    /// Back-references only; the registry keeps them in sync.
    derived: RwLock<Vec<TypeId>>,
    destructor: Option<DestructorFn>,
    codec: Option<JsonCodec>,
}

impl TypeDescriptor {
    pub fn builder(name: impl Into<String>, layout: Layout) -> TypeBuilder {
        TypeBuilder::new(name, layout)
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn traits(&self) -> TypeTraits {
        self.traits
    }

    pub fn is_default_constructible(&self) -> bool {
        self.traits.contains(TypeTraits::DEFAULT_CONSTRUCTIBLE)
    }

    pub fn is_copy_constructible(&self) -> bool {
        self.traits.contains(TypeTraits::COPY_CONSTRUCTIBLE)
    }

    pub fn is_move_constructible(&self) -> bool {
        self.traits.contains(TypeTraits::MOVE_CONSTRUCTIBLE)
    }

    pub fn is_trivially_destructible(&self) -> bool {
        self.traits.contains(TypeTraits::TRIVIALLY_DESTRUCTIBLE)
    }

    /// Whether scripts may name this type at all.
    pub fn is_script_visible(&self) -> bool {
        self.script_visible
    }

    /// Whether scripts may hold values of this type by value.
    pub fn is_ownable_by_scripts(&self) -> bool {
        self.script_visible && (self.is_copy_constructible() || self.is_move_constructible())
    }

    pub fn source(&self) -> &TypeSource {
        &self.source
    }

    pub fn is_scripted(&self) -> bool {
        matches!(self.source, TypeSource::Script { .. })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        let hash = name_hash(name);
        self.fields.iter().find(|f| f.name_hash == hash && f.name == name)
    }

    pub fn bases(&self) -> &[TypeId] {
        &self.bases
    }

    pub fn derived(&self) -> Vec<TypeId> {
        self.derived.read().clone()
    }

    pub(crate) fn add_derived(&self, id: TypeId) {
        let mut derived = self.derived.write();
        if !derived.contains(&id) {
            derived.push(id);
        }
    }

    pub(crate) fn remove_derived(&self, id: TypeId) {
        self.derived.write().retain(|d| *d != id);
    }

    pub fn codec(&self) -> Option<&JsonCodec> {
        self.codec.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Functions
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an overload. A function with the same key and signature is replaced.
    pub fn add_function(&self, function: Arc<FunctionDescriptor>) {
        let mut functions = self.functions.write();
        let overloads = functions.entry(function.key()).or_default();
        overloads.retain(|f| f.signature() != function.signature());
        overloads.push(function);
    }

    /// All overloads registered under a key.
    pub fn functions(&self, key: FunctionKey) -> Vec<Arc<FunctionDescriptor>> {
        self.functions.read().get(&key).cloned().unwrap_or_default()
    }

    pub fn functions_named(&self, name: &str) -> Vec<Arc<FunctionDescriptor>> {
        self.functions(FunctionKey::from_name(name))
            .into_iter()
            .filter(|f| f.name() == name)
            .collect()
    }

    pub fn all_functions(&self) -> Vec<Arc<FunctionDescriptor>> {
        let mut all: Vec<_> = self.functions.read().values().flatten().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()).then(a.signature().cmp(&b.signature())));
        all
    }

    /// A function by name and structural signature.
    pub fn find_function(&self, name: &str, signature: FuncId) -> Option<Arc<FunctionDescriptor>> {
        self.functions_named(name).into_iter().find(|f| f.signature() == signature)
    }

    /// Drop every function. Breaks reference cycles through interpreter-backed thunks.
    pub fn clear_functions(&self) {
        self.functions.write().clear();
    }

    /// Pick the overload whose parameters accept the given argument types and forms.
    pub fn resolve_overload(
        &self,
        key: FunctionKey,
        args: &[(TypeId, ValueForm, bool)],
    ) -> Result<Arc<FunctionDescriptor>, CallError> {
        let overloads = self.functions(key);
        if overloads.is_empty() {
            return Err(CallError::new(format!("`{}` has no function {}", self.name, describe_key(key))));
        }
        let mut best: Option<(usize, Arc<FunctionDescriptor>)> = None;
        let mut last_error = None;
        for overload in overloads {
            match overload.check_arguments(args.iter().copied()) {
                Ok(()) => {
                    // Prefer the overload whose forms match exactly (move over copy).
                    let exact = overload
                        .params()
                        .iter()
                        .zip(args)
                        .filter(|(param, (_, form, _))| param.form == *form)
                        .count();
                    if best.as_ref().is_none_or(|(score, _)| exact > *score) {
                        best = Some((exact, overload));
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }
        if let Some((_, overload)) = best {
            return Ok(overload);
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(CallError::new(format!(
            "no overload of {} on `{}` accepts the arguments: {}",
            describe_key(key),
            self.name,
            reason
        )))
    }

    /// Call a function or operator by name, resolving overloads from the arguments.
    pub fn call(&self, name: &str, args: &mut [DynamicValue]) -> CallResult {
        self.call_key(FunctionKey::from_name(name), args, None)
    }

    pub fn call_key(&self, key: FunctionKey, args: &mut [DynamicValue], ret: Option<NonNull<u8>>) -> CallResult {
        let signature: Vec<_> = args.iter().map(|a| (a.type_id(), a.form(), a.is_null())).collect();
        let function = self.resolve_overload(key, &signature)?;
        function.invoke(args, ret)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Value lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Uninitialised storage for one value.
    pub fn allocate(&self) -> NonNull<u8> {
        allocate(self.layout)
    }

    /// # Safety
    /// `ptr` must come from [`TypeDescriptor::allocate`] and hold no live value.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        unsafe { deallocate(ptr, self.layout) }
    }

    /// Take ownership of an allocated, initialised value.
    ///
    /// # Safety
    /// `ptr` must come from [`TypeDescriptor::allocate`] and hold a live value.
    pub unsafe fn adopt(&self, ptr: NonNull<u8>) -> DynamicValue {
        let buffer = unsafe { OwnedBuffer::from_raw(ptr, self.layout, self.destructor.clone()) };
        DynamicValue::from_owned(self.id, buffer)
    }

    /// Construct a new owned value with the constructor matching `args`.
    pub fn construct(&self, args: &mut [DynamicValue]) -> CallResult {
        let ptr = self.allocate();
        // SAFETY: fresh allocation of this type's layout.
        match unsafe { self.construct_at(ptr, args) } {
            Ok(()) => Ok(Some(unsafe { self.adopt(ptr) })),
            Err(e) => {
                unsafe { self.deallocate(ptr) };
                Err(e)
            }
        }
    }

    /// Construct in caller-provided storage.
    ///
    /// # Safety
    /// `buffer` must be valid for writes of `size()` bytes and hold no live value.
    pub unsafe fn construct_at(&self, buffer: NonNull<u8>, args: &mut [DynamicValue]) -> Result<(), CallError> {
        if buffer.as_ptr().align_offset(self.alignment()) != 0 {
            return Err(CallError::new(format!(
                "buffer for `{}` is not aligned to {} bytes",
                self.name,
                self.alignment()
            )));
        }
        let signature: Vec<_> = args.iter().map(|a| (a.type_id(), a.form(), a.is_null())).collect();
        let constructor = self.resolve_overload(OperatorKind::Constructor.into(), &signature)?;
        match constructor.invoke(args, Some(buffer))? {
            None => Ok(()),
            // A constructor that ignored the buffer handed back an owned value instead.
            Some(value) => unsafe { value.relocate_into(buffer) }
                .map_err(|_| CallError::new(format!("constructor of `{}` returned a borrowed value", self.name))),
        }
    }

    /// # Safety
    /// As for [`TypeDescriptor::construct_at`].
    pub unsafe fn construct_default_at(&self, buffer: NonNull<u8>) -> Result<(), CallError> {
        unsafe { self.construct_at(buffer, &mut []) }
    }

    /// # Safety
    /// `dst` as for [`TypeDescriptor::construct_at`]; `src` must hold a live value of this type.
    pub unsafe fn copy_construct_at(&self, dst: NonNull<u8>, src: NonNull<u8>) -> Result<(), CallError> {
        let mut args = [unsafe { DynamicValue::borrowed(self.id, ValueForm::ConstRef, src) }];
        unsafe { self.construct_at(dst, &mut args) }
    }

    /// Move-construct, leaving `src` in its moved-from (but live) state.
    ///
    /// # Safety
    /// As for [`TypeDescriptor::copy_construct_at`], and `src` must be mutable.
    pub unsafe fn move_construct_at(&self, dst: NonNull<u8>, src: NonNull<u8>) -> Result<(), CallError> {
        let mut args = [unsafe { DynamicValue::borrowed(self.id, ValueForm::RValue, src) }];
        unsafe { self.construct_at(dst, &mut args) }
    }

    /// Destroy a value in place and optionally free its registry allocation.
    ///
    /// # Safety
    /// `ptr` must hold a live value of this type; with `free` it must also come
    /// from [`TypeDescriptor::allocate`].
    pub unsafe fn destruct(&self, ptr: NonNull<u8>, free: bool) {
        if let Some(destructor) = &self.destructor {
            destructor(ptr);
        }
        if free {
            unsafe { self.deallocate(ptr) };
        }
    }

    /// Compare two values with the equality operator, if the type has one.
    ///
    /// # Safety
    /// Both pointers must hold live values of this type.
    pub unsafe fn equals(&self, a: NonNull<u8>, b: NonNull<u8>) -> Option<bool> {
        let bool_id = TypeId::of_name("bool");
        let function = self
            .functions(OperatorKind::Equal.into())
            .into_iter()
            .find(|f| f.return_param().is_some_and(|r| r.type_id == bool_id) && f.params().len() == 2)?;
        let mut args = unsafe {
            [
                DynamicValue::borrowed(self.id, ValueForm::ConstRef, a),
                DynamicValue::borrowed(self.id, ValueForm::ConstRef, b),
            ]
        };
        let mut out = false;
        function.invoke(&mut args, Some(NonNull::from(&mut out).cast())).ok()?;
        Some(out)
    }

    /// # Safety
    /// `ptr` must hold a live value of this type.
    pub unsafe fn to_json(&self, ptr: NonNull<u8>) -> Option<serde_json::Value> {
        self.codec.as_ref().map(|codec| (codec.encode)(ptr))
    }

    /// # Safety
    /// `buffer` must be valid for writes of `size()` bytes and hold no live value.
    pub unsafe fn from_json_at(&self, json: &serde_json::Value, buffer: NonNull<u8>) -> Result<(), String> {
        match &self.codec {
            Some(codec) => (codec.decode)(json, buffer),
            None => Err(format!("`{}` cannot be read from JSON", self.name)),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("traits", &self.traits)
            .field("source", &self.source)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

fn describe_key(key: FunctionKey) -> String {
    match key {
        FunctionKey::Operator(op) => format!("`{}`", op.function_name()),
        FunctionKey::Named(hash) => format!("with name hash {:08x}", hash),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Untyped builder shared by native and scripted type declarations.
pub struct TypeBuilder {
    name: String,
    layout: Layout,
    traits: TypeTraits,
    script_visible: bool,
    source: TypeSource,
    fields: Vec<FieldDescriptor>,
    functions: Vec<FunctionDescriptor>,
    bases: Vec<TypeId>,
    destructor: Option<DestructorFn>,
    codec: Option<JsonCodec>,
}

impl TypeBuilder {
    pub fn new(name: impl Into<String>, layout: Layout) -> Self {
        Self {
            name: name.into(),
            layout,
            traits: TypeTraits::TRIVIALLY_DESTRUCTIBLE,
            script_visible: true,
            source: TypeSource::Native,
            fields: Vec::new(),
            functions: Vec::new(),
            bases: Vec::new(),
            destructor: None,
            codec: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn traits(mut self, traits: TypeTraits) -> Self {
        self.traits.insert(traits);
        self
    }

    pub fn source(mut self, source: TypeSource) -> Self {
        self.source = source;
        self
    }

    pub fn script_visible(mut self, visible: bool) -> Self {
        self.script_visible = visible;
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn function(mut self, function: FunctionDescriptor) -> Self {
        self.functions.push(function);
        self
    }

    pub fn base(mut self, base: TypeId) -> Self {
        if !self.bases.contains(&base) {
            self.bases.push(base);
        }
        self
    }

    /// Set the destructor. `None` marks the type trivially destructible.
    pub fn destructor(mut self, destructor: Option<DestructorFn>) -> Self {
        if destructor.is_some() {
            self.traits.remove(TypeTraits::TRIVIALLY_DESTRUCTIBLE);
        } else {
            self.traits.insert(TypeTraits::TRIVIALLY_DESTRUCTIBLE);
        }
        self.destructor = destructor;
        self
    }

    pub fn codec(mut self, codec: JsonCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> TypeDescriptor {
        let descriptor = TypeDescriptor {
            id: TypeId::of_name(&self.name),
            name: self.name,
            layout: self.layout,
            traits: self.traits,
            script_visible: self.script_visible,
            source: self.source,
            fields: self.fields,
            functions: RwLock::new(HashMap::new()),
            bases: self.bases,
            derived: RwLock::new(Vec::new()),
            destructor: self.destructor,
            codec: self.codec,
        };
        for function in self.functions {
            descriptor.add_function(Arc::new(function));
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Reflect, TypeRegistry, arg, type_id_of, write_return};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tag {
        label: String,
        weight: i32,
    }

    impl Reflect for Tag {
        const TYPE_NAME: &'static str = "Tag";

        fn describe(builder: crate::NativeTypeBuilder<Self>) -> crate::NativeTypeBuilder<Self> {
            builder
                .with_default()
                .with_clone()
                .with_eq()
                .field::<String>("label", std::mem::offset_of!(Tag, label))
                .field::<i32>("weight", std::mem::offset_of!(Tag, weight))
                .function(
                    FunctionDescriptor::operator(OperatorKind::Constructor)
                        .param_of::<String>("label", ValueForm::ConstRef)
                        .returns_of::<Tag>(ValueForm::Value)
                        .build(|args, ret| {
                            let label = arg::<String>(args, 0)?.clone();
                            write_return(ret, Tag { label, weight: 1 })
                        }),
                )
        }
    }

    fn tag_type() -> Arc<TypeDescriptor> {
        let registry = TypeRegistry::with_builtins();
        registry.register_native::<Tag>()
    }

    #[test]
    fn test_traits_follow_rust_impls() {
        let tag = tag_type();
        assert!(tag.is_default_constructible());
        assert!(tag.is_copy_constructible());
        assert!(tag.is_move_constructible());
        assert!(!tag.is_trivially_destructible());
        assert!(tag.is_ownable_by_scripts());
        assert_eq!(tag.size(), std::mem::size_of::<Tag>());
    }

    #[test]
    fn test_construct_selects_overload_by_arguments() {
        let tag = tag_type();
        let default = tag.construct(&mut []).unwrap().unwrap();
        assert_eq!(default.get::<Tag>(), Some(&Tag::default()));

        let mut args = [DynamicValue::new(String::from("enemy"))];
        let labelled = tag.construct(&mut args).unwrap().unwrap();
        assert_eq!(labelled.get::<Tag>().unwrap().label, "enemy");
        assert_eq!(labelled.get::<Tag>().unwrap().weight, 1);
    }

    #[test]
    fn test_construct_with_unmatched_arguments_fails() {
        let tag = tag_type();
        let mut args = [DynamicValue::new(3.0f64)];
        let err = tag.construct(&mut args).unwrap_err();
        assert!(err.message().contains("no overload of `operator new` on `Tag`"));
    }

    #[test]
    fn test_construct_at_rejects_misaligned_buffer() {
        let registry = TypeRegistry::with_builtins();
        let i64_type = registry.lookup_native::<i64>().unwrap();
        let mut storage = [0u64; 2];
        let misaligned = unsafe { NonNull::new_unchecked(storage.as_mut_ptr().cast::<u8>().add(1)) };
        let err = unsafe { i64_type.construct_at(misaligned, &mut []) }.unwrap_err();
        assert!(err.message().contains("not aligned"));
    }

    #[test]
    fn test_copy_move_and_equality() {
        let tag = tag_type();
        let original = Tag {
            label: "a".into(),
            weight: 3,
        };
        let src = NonNull::from(&original).cast::<u8>();

        let copy = tag.allocate();
        unsafe { tag.copy_construct_at(copy, src) }.unwrap();
        assert_eq!(unsafe { tag.equals(copy, src) }, Some(true));

        let mut source = original.clone();
        let moved = tag.allocate();
        unsafe { tag.move_construct_at(moved, NonNull::from(&mut source).cast()) }.unwrap();
        assert_eq!(source, Tag::default());
        assert_eq!(unsafe { tag.equals(moved, src) }, Some(true));

        unsafe {
            tag.destruct(copy, true);
            tag.destruct(moved, true);
        }
    }

    #[test]
    fn test_field_lookup() {
        let tag = tag_type();
        let weight = tag.field("weight").unwrap();
        assert_eq!(weight.type_id, type_id_of::<i32>());
        assert_eq!(weight.offset, std::mem::offset_of!(Tag, weight));
        assert!(tag.field("missing").is_none());
    }

    #[test]
    fn test_call_by_name_reports_failure() {
        let tag = tag_type();
        let err = tag.call("Explode", &mut []).unwrap_err();
        assert!(err.message().contains("`Tag` has no function"));
    }

    #[test]
    fn test_trivial_destruct_is_noop() {
        let registry = TypeRegistry::with_builtins();
        let i32_type = registry.lookup_native::<i32>().unwrap();
        assert!(i32_type.is_trivially_destructible());
        let ptr = i32_type.allocate();
        unsafe {
            i32_type.construct_default_at(ptr).unwrap();
            i32_type.destruct(ptr, true);
        }
    }
}
