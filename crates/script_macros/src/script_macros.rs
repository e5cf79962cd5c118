//! Script Macros - Derive macro for native type reflection
//!
//! This crate provides `#[derive(Reflect)]`, which describes a Rust struct to
//! the script type registry: its name, its fields with their offsets, and the
//! operations it supports.

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Data, DeriveInput, Fields, Lit, Token, Type,
    parse::{Parse, ParseStream},
    parse_macro_input,
};

/// Parsed `#[reflect(...)]` attributes on the type
#[derive(Default)]
struct ReflectAttrs {
    name: Option<String>,
    default: bool,
    clone: bool,
    eq: bool,
    ord: bool,
    serde: bool,
    hidden: bool,
    bases: Vec<Type>,
}

impl Parse for ReflectAttrs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut attrs = ReflectAttrs::default();

        while !input.is_empty() {
            let ident: syn::Ident = input.parse()?;

            match ident.to_string().as_str() {
                "name" => {
                    input.parse::<Token![=]>()?;
                    let lit: Lit = input.parse()?;
                    match lit {
                        Lit::Str(s) => attrs.name = Some(s.value()),
                        _ => return Err(syn::Error::new(ident.span(), "expected a string literal")),
                    }
                }
                "base" => {
                    input.parse::<Token![=]>()?;
                    attrs.bases.push(input.parse()?);
                }
                "default" => attrs.default = true,
                "clone" => attrs.clone = true,
                "eq" => attrs.eq = true,
                "ord" => attrs.ord = true,
                "serde" => attrs.serde = true,
                "hidden" => attrs.hidden = true,
                _ => {
                    return Err(syn::Error::new(ident.span(), "unknown reflect attribute"));
                }
            }

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(attrs)
    }
}

/// Whether a field carries `#[reflect(skip)]`
fn is_skipped(attrs: &[syn::Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs.iter().filter(|a| a.path().is_ident("reflect")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unknown field attribute, expected `skip`"))
            }
        })?;
    }
    Ok(skip)
}

/// Derive `script_registry::Reflect` for a struct.
///
/// # Attributes
///
/// - `name = "..."`: registered type name (defaults to the struct's name)
/// - `default`, `clone`, `eq`, `ord`, `serde`: register the operations backed
///   by the corresponding Rust traits
/// - `base = Type`: declare a reflected base type (repeatable)
/// - `hidden`: keep the type out of scripts
///
/// Fields are reflected in declaration order unless marked `#[reflect(skip)]`;
/// each field's type must itself implement `Reflect`.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Default, PartialEq, Reflect)]
/// #[reflect(name = "Vec3", default, clone, eq)]
/// struct Vec3 {
///     x: f32,
///     y: f32,
///     z: f32,
/// }
/// ```
#[proc_macro_derive(Reflect, attributes(reflect))]
pub fn derive_reflect(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = &input.ident;
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(&input.generics, "Reflect cannot be derived for generic types"));
    }

    let mut attrs = ReflectAttrs::default();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("reflect")) {
        let parsed: ReflectAttrs = attr.parse_args()?;
        attrs.name = parsed.name.or(attrs.name);
        attrs.default |= parsed.default;
        attrs.clone |= parsed.clone;
        attrs.eq |= parsed.eq;
        attrs.ord |= parsed.ord;
        attrs.serde |= parsed.serde;
        attrs.hidden |= parsed.hidden;
        attrs.bases.extend(parsed.bases);
    }

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => named.named.iter().collect::<Vec<_>>(),
            Fields::Unit => Vec::new(),
            Fields::Unnamed(_) => {
                return Err(syn::Error::new_spanned(ident, "Reflect requires named fields"));
            }
        },
        _ => return Err(syn::Error::new_spanned(ident, "Reflect can only be derived for structs")),
    };

    let mut field_calls = Vec::new();
    for field in fields {
        if is_skipped(&field.attrs)? {
            continue;
        }
        let Some(field_ident) = &field.ident else { continue };
        let field_name = field_ident.to_string();
        let field_ty = &field.ty;
        field_calls.push(quote! {
            .field::<#field_ty>(#field_name, ::core::mem::offset_of!(#ident, #field_ident))
        });
    }

    let type_name = attrs.name.unwrap_or_else(|| ident.to_string());
    let default = attrs.default.then(|| quote! { .with_default() });
    let clone = attrs.clone.then(|| quote! { .with_clone() });
    let eq = attrs.eq.then(|| quote! { .with_eq() });
    let ord = attrs.ord.then(|| quote! { .with_ord() });
    let serde = attrs.serde.then(|| quote! { .with_serde() });
    let hidden = attrs.hidden.then(|| quote! { .hidden_from_scripts() });
    let bases = attrs.bases.iter().map(|base| quote! { .base::<#base>() });

    Ok(quote! {
        impl ::script_registry::Reflect for #ident {
            const TYPE_NAME: &'static str = #type_name;

            fn describe(
                builder: ::script_registry::NativeTypeBuilder<Self>,
            ) -> ::script_registry::NativeTypeBuilder<Self> {
                builder
                    #default
                    #clone
                    #eq
                    #ord
                    #serde
                    #hidden
                    #(#bases)*
                    #(#field_calls)*
            }
        }
    })
}
