//! Type Registry
//!
//! Stores every [`TypeDescriptor`] by id and broadcasts changes to subscribers,
//! so editors can refresh their palettes when scripts are recompiled.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    CallResult, DynamicValue, FunctionKey, ParamDesc, Reflect, TypeDescriptor, TypeId, describe_native, name_hash,
    register_builtin_types, type_id_of,
};

// ─────────────────────────────────────────────────────────────────────────────
// Change Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Notification of a change in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeChange {
    Added { id: TypeId, name: String },
    Removed { id: TypeId, name: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Events
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed signature of a well-known engine event (tick, begin-play, ...).
///
/// The world is passed implicitly and is not part of `params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSignature {
    pub name: String,
    pub params: Vec<ParamDesc>,
    pub ret: Option<ParamDesc>,
}

impl EventSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
        }
    }

    pub fn with_param(mut self, param: ParamDesc) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_return(mut self, ret: ParamDesc) -> Self {
        self.ret = Some(ret);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Registry of every type known to the runtime.
///
/// Cheap concurrent reads; writes happen during startup and script compilation.
pub struct TypeRegistry {
    types: DashMap<TypeId, Arc<TypeDescriptor>>,
    events: DashMap<u32, Arc<EventSignature>>,
    change_tx: broadcast::Sender<TypeChange>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            types: DashMap::new(),
            events: DashMap::new(),
            change_tx,
        }
    }

    /// Create a registry with the primitive types registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtin_types(&registry);
        registry
    }

    /// Create a shared registry
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::with_builtins())
    }

    /// Subscribe to registry changes
    pub fn subscribe(&self) -> broadcast::Receiver<TypeChange> {
        self.change_tx.subscribe()
    }

    /// Register a type. Registering an id that already exists is a no-op and
    /// returns the existing descriptor.
    pub fn register(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let id = descriptor.id();
        let descriptor = match self.types.entry(id) {
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(Arc::new(descriptor)).clone(),
        };

        for base in descriptor.bases() {
            if let Some(base) = self.lookup(*base) {
                base.add_derived(id);
            }
        }
        // Types registered before this one may name it as a base.
        let derived: Vec<TypeId> = self
            .types
            .iter()
            .filter(|entry| entry.value().bases().contains(&id))
            .map(|entry| *entry.key())
            .collect();
        for derived_id in derived {
            descriptor.add_derived(derived_id);
        }

        debug!(type_name = %descriptor.name(), type_id = %id, "Registered type");
        let _ = self.change_tx.send(TypeChange::Added {
            id,
            name: descriptor.name().to_string(),
        });
        descriptor
    }

    /// Describe and register a native type
    pub fn register_native<T: Reflect>(&self) -> Arc<TypeDescriptor> {
        if let Some(existing) = self.lookup_native::<T>() {
            return existing;
        }
        self.register(describe_native::<T>())
    }

    pub fn lookup(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.types.get(&id).map(|entry| entry.value().clone())
    }

    /// Look up by name. A hash collision with a different name yields `None`.
    pub fn lookup_name(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.lookup(TypeId::of_name(name)).filter(|d| d.name() == name)
    }

    pub fn lookup_native<T: Reflect>(&self) -> Option<Arc<TypeDescriptor>> {
        self.lookup(type_id_of::<T>())
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.types.contains_key(&id)
    }

    /// Remove a type, unlinking it from its bases and dropping its functions.
    pub fn remove(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        let (_, descriptor) = self.types.remove(&id)?;
        for base in descriptor.bases() {
            if let Some(base) = self.lookup(*base) {
                base.remove_derived(id);
            }
        }
        descriptor.clear_functions();

        debug!(type_name = %descriptor.name(), type_id = %id, "Removed type");
        let _ = self.change_tx.send(TypeChange::Removed {
            id,
            name: descriptor.name().to_string(),
        });
        Some(descriptor)
    }

    /// Remove every type declared by scripts. Returns how many were removed.
    pub fn remove_scripted(&self) -> usize {
        let scripted: Vec<TypeId> = self
            .types
            .iter()
            .filter(|entry| entry.value().is_scripted())
            .map(|entry| *entry.key())
            .collect();
        scripted.iter().filter(|id| self.remove(**id).is_some()).count()
    }

    /// Every registered type, sorted by name
    pub fn types(&self) -> Vec<Arc<TypeDescriptor>> {
        let mut types: Vec<_> = self.types.iter().map(|entry| entry.value().clone()).collect();
        types.sort_by(|a, b| a.name().cmp(b.name()));
        types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Whether `derived` is `base` or inherits from it, directly or transitively.
    pub fn is_derived_from(&self, derived: TypeId, base: TypeId) -> bool {
        let mut pending = vec![derived];
        let mut seen = HashSet::new();
        while let Some(id) = pending.pop() {
            if id == base {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(descriptor) = self.lookup(id) {
                pending.extend_from_slice(descriptor.bases());
            }
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Construct a value of a registered type.
    pub fn construct(&self, id: TypeId, args: &mut [DynamicValue]) -> CallResult {
        let descriptor = self
            .lookup(id)
            .ok_or_else(|| crate::CallError::new(format!("type {} is not registered", id)))?;
        descriptor.construct(args)
    }

    /// Call a function or operator on a registered type.
    pub fn call(&self, id: TypeId, name: &str, args: &mut [DynamicValue]) -> CallResult {
        let descriptor = self
            .lookup(id)
            .ok_or_else(|| crate::CallError::new(format!("type {} is not registered", id)))?;
        descriptor.call_key(FunctionKey::from_name(name), args, None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    /// Register an engine event signature. Idempotent by name.
    pub fn register_event(&self, event: EventSignature) -> Arc<EventSignature> {
        self.events
            .entry(name_hash(&event.name))
            .or_insert_with(|| Arc::new(event))
            .clone()
    }

    pub fn event(&self, name: &str) -> Option<Arc<EventSignature>> {
        self.events
            .get(&name_hash(name))
            .map(|entry| entry.value().clone())
            .filter(|e| e.name == name)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TypeSource, ValueForm};
    use std::alloc::Layout;

    #[derive(Debug, Clone, Default, PartialEq, crate::Reflect)]
    #[reflect(name = "test::Actor", default, clone)]
    struct Actor {
        id: u32,
    }

    #[derive(Debug, Clone, Default, PartialEq, crate::Reflect)]
    #[reflect(name = "test::Pawn", default, clone, base = Actor)]
    struct Pawn {
        id: u32,
        speed: f32,
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TypeRegistry::with_builtins();
        let first = registry.register_native::<Actor>();
        let count = registry.len();
        let second = registry.register(describe_native::<Actor>());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), count);
    }

    #[test]
    fn test_lookup_unknown_returns_none() {
        let registry = TypeRegistry::with_builtins();
        assert!(registry.lookup(TypeId::of_name("Nope")).is_none());
        assert!(registry.lookup_name("Nope").is_none());
        assert!(registry.lookup_name("i32").is_some());
    }

    #[test]
    fn test_base_links_in_either_order() {
        let registry = TypeRegistry::with_builtins();
        registry.register_native::<Pawn>();
        let actor = registry.register_native::<Actor>();
        let pawn_id = type_id_of::<Pawn>();
        assert_eq!(actor.derived(), vec![pawn_id]);
        assert!(registry.is_derived_from(pawn_id, actor.id()));
        assert!(!registry.is_derived_from(actor.id(), pawn_id));

        registry.remove(pawn_id);
        assert!(actor.derived().is_empty());
    }

    #[test]
    fn test_remove_scripted_keeps_native() {
        let registry = TypeRegistry::with_builtins();
        registry.register(
            TypeDescriptor::builder("ScriptThing", Layout::new::<()>())
                .source(TypeSource::Script {
                    script: "ScriptThing".into(),
                })
                .build(),
        );
        let before = registry.len();
        assert_eq!(registry.remove_scripted(), 1);
        assert_eq!(registry.len(), before - 1);
        assert!(registry.lookup_name("i32").is_some());
    }

    #[test]
    fn test_changes_are_broadcast() {
        let registry = TypeRegistry::new();
        let mut rx = registry.subscribe();
        registry.register_native::<i32>();
        registry.remove(type_id_of::<i32>());

        assert_eq!(
            rx.try_recv().unwrap(),
            TypeChange::Added {
                id: type_id_of::<i32>(),
                name: "i32".into()
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), TypeChange::Removed { .. }));
    }

    #[test]
    fn test_call_failure_has_message() {
        let registry = TypeRegistry::with_builtins();
        let mut args = [DynamicValue::new(1i32), DynamicValue::new(String::from("x"))];
        let err = registry.call(type_id_of::<i32>(), "operator+", &mut args).unwrap_err();
        assert!(err.message().contains("no overload of `operator+` on `i32`"));

        let err = registry.construct(TypeId::of_name("Missing"), &mut []).unwrap_err();
        assert!(err.message().contains("is not registered"));
    }

    #[test]
    fn test_events_are_idempotent() {
        let registry = TypeRegistry::with_builtins();
        let tick = EventSignature::new("OnTick").with_param(ParamDesc::new("delta", type_id_of::<f32>(), ValueForm::Value));
        let first = registry.register_event(tick.clone());
        let second = registry.register_event(EventSignature::new("OnTick"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.event("OnTick").unwrap().params.len(), 1);
        assert!(registry.event("OnDestroy").is_none());
    }
}
