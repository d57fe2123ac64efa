//! Derive macro for calltrap-object `SlotValue`.
//!
//! This crate provides `#[derive(SlotValue)]`, which lets a type travel
//! through the argument and result slots of an instrumented function.
//!
//! # Example
//!
//! ```ignore
//! use calltrap_object::SlotValue;
//! use serde::Serialize;
//!
//! #[derive(Serialize, SlotValue)]
//! struct Point {
//!     x: i64,
//!     y: i64,
//! }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, parse_quote, Attribute, Data, DeriveInput, GenericParam};

/// Derive macro for `calltrap_object::SlotValue`.
///
/// By default the type is snapshotted through `serde_json`, so it must also
/// implement `serde::Serialize`.
///
/// # Attributes
///
/// - `#[slot(opaque)]` - No snapshot; trace output shows the value as `{}`.
///   The type does not need to be `Serialize`.
/// - `#[slot(trap_error)]` - The type implements `From<TrapError>`, so a
///   result of this type (or `Result<_, ThisType>`) can carry interceptor
///   errors back to the caller.
/// - `#[slot(default)]` - `Default::default()` is the zero value returned by
///   a skipped call whose result no interceptor wrote.
///
/// ```ignore
/// #[derive(Debug, SlotValue)]
/// #[slot(opaque, trap_error)]
/// struct StoreError(String);
///
/// impl From<TrapError> for StoreError {
///     fn from(err: TrapError) -> Self {
///         StoreError(err.to_string())
///     }
/// }
/// ```
#[proc_macro_derive(SlotValue, attributes(slot))]
pub fn derive_slot_value(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    if let Data::Union(_) = &input.data {
        return syn::Error::new_spanned(&input, "SlotValue cannot be derived for unions")
            .to_compile_error()
            .into();
    }

    let options = match SlotOptions::from_attrs(&input.attrs) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    expand(&input, &options).into()
}

#[derive(Default)]
struct SlotOptions {
    opaque: bool,
    trap_error: bool,
    default: bool,
}

impl SlotOptions {
    /// Parse `#[slot(...)]` attributes.
    fn from_attrs(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = SlotOptions::default();
        for attr in attrs {
            if !attr.path().is_ident("slot") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("opaque") {
                    options.opaque = true;
                    Ok(())
                } else if meta.path.is_ident("trap_error") {
                    options.trap_error = true;
                    Ok(())
                } else if meta.path.is_ident("default") {
                    options.default = true;
                    Ok(())
                } else {
                    Err(meta.error(
                        "unknown slot attribute, expected `opaque`, `trap_error` or `default`",
                    ))
                }
            })?;
        }
        Ok(options)
    }
}

fn expand(input: &DeriveInput, options: &SlotOptions) -> proc_macro2::TokenStream {
    let name = &input.ident;

    // Slot values are type-erased through `Any`, so every type parameter
    // must be 'static.
    let mut generics = input.generics.clone();
    for param in &mut generics.params {
        if let GenericParam::Type(ty) = param {
            ty.bounds.push(parse_quote!('static));
        }
    }
    if !options.opaque {
        generics
            .make_where_clause()
            .predicates
            .push(parse_quote!(Self: calltrap_object::__private::serde::Serialize));
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let to_json = if options.opaque {
        quote! {}
    } else {
        quote! {
            fn to_json(&self) -> calltrap_object::__private::Option<calltrap_object::__private::serde_json::Value> {
                calltrap_object::__private::Some(calltrap_object::json::snapshot(self))
            }
        }
    };

    let from_trap_error = if options.trap_error {
        quote! {
            fn from_trap_error(err: &calltrap_object::TrapError) -> calltrap_object::__private::Option<Self> {
                calltrap_object::__private::Some(
                    <Self as calltrap_object::__private::From<calltrap_object::TrapError>>::from(err.clone())
                )
            }
        }
    } else {
        quote! {}
    };

    let zero = if options.default {
        quote! {
            fn zero() -> calltrap_object::__private::Option<Self> {
                calltrap_object::__private::Some(<Self as calltrap_object::__private::Default>::default())
            }
        }
    } else {
        quote! {}
    };

    quote! {
        impl #impl_generics calltrap_object::SlotValue for #name #ty_generics #where_clause {
            #to_json
            #from_trap_error
            #zero
        }
    }
}
