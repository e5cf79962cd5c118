//! Scripted type descriptors
//!
//! A scripted type is a plain aggregate of its fields. Its layout follows
//! declaration order with natural alignment, and every lifecycle operation is
//! the field-wise composition of the field types' own operations.

use std::alloc::{Layout, LayoutError};
use std::ptr::NonNull;
use std::sync::Arc;

use script_registry::{
    CallError, CallResult, DestructorFn, DynamicValue, FieldDescriptor, FunctionDescriptor, JsonCodec, OperatorKind,
    OwnedBuffer, TypeDescriptor, TypeId, TypeSource, TypeTraits, ValueForm, allocate, deallocate, write_return,
};

/// A field of a scripted type, placed
pub(crate) struct Member {
    pub name: String,
    pub ty: Arc<TypeDescriptor>,
    pub offset: usize,
    pub default: Option<serde_json::Value>,
}

impl Member {
    /// # Safety
    /// `base` must point to storage for the whole aggregate.
    unsafe fn at(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { base.add(self.offset) }
    }

    /// Initialise this member from its declared default or its default constructor.
    ///
    /// # Safety
    /// `dst` must be uninitialised storage for the member.
    unsafe fn init_default(&self, dst: NonNull<u8>) -> Result<(), CallError> {
        match &self.default {
            Some(json) => unsafe { self.ty.from_json_at(json, dst) }
                .map_err(|e| CallError::new(format!("default of field `{}`: {}", self.name, e))),
            None => unsafe { self.ty.construct_default_at(dst) },
        }
    }
}

/// Place fields in declaration order. Returns the padded aggregate layout.
pub(crate) fn layout_members(
    fields: Vec<(String, Arc<TypeDescriptor>, Option<serde_json::Value>)>,
) -> Result<(Layout, Vec<Member>), LayoutError> {
    let mut layout = Layout::from_size_align(0, 1)?;
    let mut members = Vec::with_capacity(fields.len());
    for (name, ty, default) in fields {
        let (extended, offset) = layout.extend(ty.layout())?;
        layout = extended;
        members.push(Member {
            name,
            ty,
            offset,
            default,
        });
    }
    Ok((layout.pad_to_align(), members))
}

/// Build the descriptor of a scripted aggregate.
pub(crate) fn build_scripted_type(script: &str, layout: Layout, members: Vec<Member>) -> TypeDescriptor {
    let type_id = TypeId::of_name(script);
    let members: Arc<[Member]> = members.into();

    let default_constructible = members
        .iter()
        .all(|m| m.default.is_some() || m.ty.is_default_constructible());
    let copy_constructible = members.iter().all(|m| m.ty.is_copy_constructible());
    let move_constructible = members
        .iter()
        .all(|m| m.ty.is_move_constructible() || m.ty.is_copy_constructible());
    let comparable = members
        .iter()
        .all(|m| !m.ty.functions(OperatorKind::Equal.into()).is_empty());

    let destructor: Option<DestructorFn> = if members.iter().all(|m| m.ty.is_trivially_destructible()) {
        None
    } else {
        let members = members.clone();
        Some(Arc::new(move |ptr: NonNull<u8>| {
            // SAFETY: destructor contract, ptr holds a live aggregate.
            unsafe { destroy_members(&members, ptr, members.len()) }
        }))
    };

    let new_value = ValueFactory {
        type_id,
        layout,
        destructor: destructor.clone(),
    };

    let mut builder = TypeDescriptor::builder(script, layout)
        .source(TypeSource::Script {
            script: script.to_string(),
        })
        .destructor(destructor);
    for member in members.iter() {
        builder = builder.field(FieldDescriptor::new(member.name.clone(), member.ty.id(), member.offset));
    }

    if default_constructible {
        let members = members.clone();
        let factory = new_value.clone();
        builder = builder
            .traits(TypeTraits::DEFAULT_CONSTRUCTIBLE)
            .function(
                FunctionDescriptor::operator(OperatorKind::Constructor)
                    .returns(type_id, ValueForm::Value)
                    .build(move |_, ret| {
                        factory.emit(ret, |dst| {
                            // SAFETY: dst is uninitialised aggregate storage.
                            unsafe { construct_members(&members, dst, |m, at| m.init_default(at)) }
                        })
                    }),
            );
    }

    if copy_constructible {
        let members = members.clone();
        let factory = new_value.clone();
        builder = builder.traits(TypeTraits::COPY_CONSTRUCTIBLE).function(
            FunctionDescriptor::operator(OperatorKind::Constructor)
                .param("other", type_id, ValueForm::ConstRef)
                .returns(type_id, ValueForm::Value)
                .build(move |args, ret| {
                    let src = source_of(args)?;
                    factory.emit(ret, |dst| {
                        // SAFETY: src holds a live aggregate, dst is uninitialised.
                        unsafe {
                            construct_members(&members, dst, |m, at| m.ty.copy_construct_at(at, m.at(src)))
                        }
                    })
                }),
        );
    }

    if move_constructible {
        let members = members.clone();
        let factory = new_value.clone();
        builder = builder.traits(TypeTraits::MOVE_CONSTRUCTIBLE).function(
            FunctionDescriptor::operator(OperatorKind::Constructor)
                .param("other", type_id, ValueForm::RValue)
                .returns(type_id, ValueForm::Value)
                .build(move |args, ret| {
                    let src = source_of(args)?;
                    factory.emit(ret, |dst| {
                        // SAFETY: as for the copy constructor.
                        unsafe {
                            construct_members(&members, dst, |m, at| {
                                if m.ty.is_move_constructible() {
                                    m.ty.move_construct_at(at, m.at(src))
                                } else {
                                    m.ty.copy_construct_at(at, m.at(src))
                                }
                            })
                        }
                    })
                }),
        );
    }

    if comparable {
        for (op, expect_equal) in [(OperatorKind::Equal, true), (OperatorKind::NotEqual, false)] {
            let members = members.clone();
            builder = builder.function(
                FunctionDescriptor::operator(op)
                    .param("a", type_id, ValueForm::ConstRef)
                    .param("b", type_id, ValueForm::ConstRef)
                    .returns(TypeId::of_name("bool"), ValueForm::Value)
                    .build(move |args, ret| {
                        let (a, b) = match args {
                            [a, b] => (a.data_ptr(), b.data_ptr()),
                            _ => (None, None),
                        };
                        let (Some(a), Some(b)) = (a, b) else {
                            return Err(CallError::new("comparison needs two values"));
                        };
                        let mut equal = true;
                        for member in members.iter() {
                            // SAFETY: both arguments hold live aggregates.
                            let same = unsafe { member.ty.equals(member.at(a), member.at(b)) }.ok_or_else(|| {
                                CallError::new(format!("field `{}` cannot be compared", member.name))
                            })?;
                            if !same {
                                equal = false;
                                break;
                            }
                        }
                        write_return(ret, equal == expect_equal)
                    }),
            );
        }
    }

    if members.iter().all(|m| m.ty.codec().is_some()) {
        builder = builder.codec(json_codec(members.clone()));
    }

    builder.build()
}

/// Allocates or fills return storage for aggregate constructors.
#[derive(Clone)]
struct ValueFactory {
    type_id: TypeId,
    layout: Layout,
    destructor: Option<DestructorFn>,
}

impl ValueFactory {
    fn emit(&self, ret: Option<NonNull<u8>>, init: impl FnOnce(NonNull<u8>) -> Result<(), CallError>) -> CallResult {
        if let Some(buffer) = ret {
            init(buffer)?;
            return Ok(None);
        }
        let ptr = allocate(self.layout);
        if let Err(e) = init(ptr) {
            // SAFETY: nothing was left alive in the allocation.
            unsafe { deallocate(ptr, self.layout) };
            return Err(e);
        }
        // SAFETY: ptr was allocated with this layout and now holds a live aggregate.
        let buffer = unsafe { OwnedBuffer::from_raw(ptr, self.layout, self.destructor.clone()) };
        Ok(Some(DynamicValue::from_owned(self.type_id, buffer)))
    }
}

fn source_of(args: &[DynamicValue]) -> Result<NonNull<u8>, CallError> {
    args.first()
        .and_then(DynamicValue::data_ptr)
        .ok_or_else(|| CallError::new("source value is null"))
}

/// Initialise every member in order. On failure the members already built are
/// destroyed again.
///
/// # Safety
/// `dst` must be uninitialised storage for the aggregate.
unsafe fn construct_members(
    members: &[Member],
    dst: NonNull<u8>,
    mut init: impl FnMut(&Member, NonNull<u8>) -> Result<(), CallError>,
) -> Result<(), CallError> {
    for (index, member) in members.iter().enumerate() {
        if let Err(e) = init(member, unsafe { member.at(dst) }) {
            unsafe { destroy_members(members, dst, index) };
            return Err(e);
        }
    }
    Ok(())
}

/// Destroy the first `count` members in reverse order.
///
/// # Safety
/// Those members must be live.
unsafe fn destroy_members(members: &[Member], base: NonNull<u8>, count: usize) {
    for member in members[..count].iter().rev() {
        unsafe { member.ty.destruct(member.at(base), false) };
    }
}

fn json_codec(members: Arc<[Member]>) -> JsonCodec {
    let encode_members = members.clone();
    JsonCodec {
        encode: Arc::new(move |ptr| {
            let mut object = serde_json::Map::new();
            for member in encode_members.iter() {
                // SAFETY: codec contract, ptr holds a live aggregate.
                let value = unsafe { member.ty.to_json(member.at(ptr)) }.unwrap_or(serde_json::Value::Null);
                object.insert(member.name.clone(), value);
            }
            serde_json::Value::Object(object)
        }),
        decode: Arc::new(move |json, ptr| {
            let object = json
                .as_object()
                .ok_or_else(|| format!("expected a JSON object, got {}", json))?;
            // SAFETY: codec contract, ptr is uninitialised aggregate storage.
            unsafe {
                construct_members(&members, ptr, |member, at| match object.get(&member.name) {
                    Some(value) => member
                        .ty
                        .from_json_at(value, at)
                        .map_err(|e| CallError::new(format!("field `{}`: {}", member.name, e))),
                    None => member.init_default(at),
                })
            }
            .map_err(|e| e.message().to_string())
        }),
    }
}
