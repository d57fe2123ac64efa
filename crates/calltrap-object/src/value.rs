//! Slot element values
//!
//! Every value an instrumented function exposes through an [`Object`] view
//! implements [`SlotValue`]. The trait is deliberately small: the dynamic
//! plumbing (downcasting, assignment, type tags) comes for free from the
//! [`AsAny`] blanket impl, and the two hooks a type may customize are
//! JSON snapshots for tracing and absorbing interceptor errors.
//!
//! [`Object`]: crate::Object

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::TrapError;

/// Runtime type tag of a slot element: a `TypeId` plus a readable name.
///
/// Equality and hashing only consider the `TypeId`.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// The tag of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is the tag of `()`.
    pub fn is_unit(&self) -> bool {
        self.id == TypeId::of::<()>()
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Dynamic access to a concrete slot element.
///
/// Implemented for every `'static` sized type; never implement it by hand.
/// Call these methods on `&dyn SlotValue` / `&mut dyn SlotValue`, not on a
/// reference to a reference.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_tag(&self) -> TypeTag;
    /// Overwrite `self` with `value` if it holds the same concrete type.
    /// The rejected box is handed back on mismatch.
    fn assign(&mut self, value: Box<dyn Any>) -> Result<(), Box<dyn Any>>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_tag(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn assign(&mut self, value: Box<dyn Any>) -> Result<(), Box<dyn Any>> {
        let value = value.downcast::<T>()?;
        *self = *value;
        Ok(())
    }
}

/// A value that can live in an object slot.
///
/// The defaults make a type opaque: snapshots show it as `{}`, it cannot
/// absorb interceptor errors and it has no zero value. Serializable types usually want
/// `#[derive(SlotValue)]` (feature `derive`) or [`impl_slot_value!`], which
/// snapshot through `serde_json`.
///
/// [`impl_slot_value!`]: crate::impl_slot_value
pub trait SlotValue: AsAny {
    /// Best-effort JSON snapshot; `None` means "opaque".
    fn to_json(&self) -> Option<Value> {
        None
    }

    /// Build a value of this type that carries an interceptor error.
    ///
    /// Error-shaped results (`Result<T, E>`) use this to surface `pre`/`post`
    /// failures to the caller of an instrumented function.
    fn from_trap_error(err: &TrapError) -> Option<Self>
    where
        Self: Sized,
    {
        let _ = err;
        None
    }

    /// The value a skipped call returns when no interceptor wrote its result.
    ///
    /// Types without one make such a call panic instead of running the body
    /// that was skipped.
    fn zero() -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

/// The JSON stand-in for values that cannot be encoded.
pub fn placeholder() -> Value {
    Value::Object(Map::new())
}

/// Snapshot `value`, falling back to the placeholder when it is opaque.
pub fn json_or_placeholder(value: &dyn SlotValue) -> Value {
    value.to_json().unwrap_or_else(placeholder)
}

/// Implement [`SlotValue`] for `serde::Serialize` types, snapshotting them
/// through [`json::snapshot`](crate::json::snapshot).
#[macro_export]
macro_rules! impl_slot_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::SlotValue for $ty {
                fn to_json(&self) -> ::std::option::Option<$crate::__private::serde_json::Value> {
                    ::std::option::Option::Some($crate::json::snapshot(self))
                }
            }
        )*
    };
}

/// Like [`impl_slot_value!`], for `Default` types whose default is also their
/// zero value.
#[macro_export]
macro_rules! impl_default_slot_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::SlotValue for $ty {
                fn to_json(&self) -> ::std::option::Option<$crate::__private::serde_json::Value> {
                    ::std::option::Option::Some($crate::json::snapshot(self))
                }

                fn zero() -> ::std::option::Option<Self> {
                    ::std::option::Option::Some(<$ty as ::std::default::Default>::default())
                }
            }
        )*
    };
}

/// Implement [`SlotValue`] for types that have no useful snapshot.
#[macro_export]
macro_rules! impl_opaque_slot_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::SlotValue for $ty {}
        )*
    };
}

impl_default_slot_value!(
    bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, &'static str,
);

impl SlotValue for () {
    fn to_json(&self) -> Option<Value> {
        Some(Value::Null)
    }

    fn zero() -> Option<Self> {
        Some(())
    }
}

impl SlotValue for String {
    fn to_json(&self) -> Option<Value> {
        Some(Value::String(self.clone()))
    }

    fn from_trap_error(err: &TrapError) -> Option<Self> {
        Some(err.to_string())
    }

    fn zero() -> Option<Self> {
        Some(String::new())
    }
}

impl SlotValue for TrapError {
    fn to_json(&self) -> Option<Value> {
        Some(Value::String(self.to_string()))
    }

    fn from_trap_error(err: &TrapError) -> Option<Self> {
        Some(err.clone())
    }
}

impl<T: SlotValue> SlotValue for Vec<T> {
    fn to_json(&self) -> Option<Value> {
        Some(Value::Array(
            self.iter().map(|item| json_or_placeholder(item)).collect(),
        ))
    }

    fn zero() -> Option<Self> {
        Some(Vec::new())
    }
}

impl<T: SlotValue> SlotValue for Option<T> {
    fn to_json(&self) -> Option<Value> {
        match self {
            Some(value) => Some(json_or_placeholder(value)),
            None => Some(Value::Null),
        }
    }

    fn zero() -> Option<Self> {
        Some(None)
    }
}

impl<T: SlotValue, E: SlotValue> SlotValue for Result<T, E> {
    fn to_json(&self) -> Option<Value> {
        let (tag, inner) = match self {
            Ok(value) => ("Ok", json_or_placeholder(value)),
            Err(err) => ("Err", json_or_placeholder(err)),
        };
        let mut map = Map::new();
        map.insert(tag.to_string(), inner);
        Some(Value::Object(map))
    }

    fn from_trap_error(err: &TrapError) -> Option<Self> {
        E::from_trap_error(err).map(Err)
    }

    fn zero() -> Option<Self> {
        T::zero().map(Ok)
    }
}

impl<T: SlotValue> SlotValue for Arc<T> {
    fn to_json(&self) -> Option<Value> {
        (**self).to_json()
    }

    fn zero() -> Option<Self> {
        T::zero().map(Arc::new)
    }
}

impl<V: SlotValue> SlotValue for BTreeMap<String, V> {
    fn to_json(&self) -> Option<Value> {
        Some(Value::Object(
            self.iter()
                .map(|(k, v)| (k.clone(), json_or_placeholder(v)))
                .collect(),
        ))
    }

    fn zero() -> Option<Self> {
        Some(Self::new())
    }
}

impl<V: SlotValue> SlotValue for HashMap<String, V> {
    fn to_json(&self) -> Option<Value> {
        // serde_json::Map is ordered by key, so the snapshot is stable even
        // though HashMap iteration order is not.
        Some(Value::Object(
            self.iter()
                .map(|(k, v)| (k.clone(), json_or_placeholder(v)))
                .collect(),
        ))
    }

    fn zero() -> Option<Self> {
        Some(Self::new())
    }
}

impl<A: SlotValue, B: SlotValue> SlotValue for (A, B) {
    fn to_json(&self) -> Option<Value> {
        Some(Value::Array(vec![
            json_or_placeholder(&self.0),
            json_or_placeholder(&self.1),
        ]))
    }

    fn zero() -> Option<Self> {
        Some((A::zero()?, B::zero()?))
    }
}

impl<A: SlotValue, B: SlotValue, C: SlotValue> SlotValue for (A, B, C) {
    fn to_json(&self) -> Option<Value> {
        Some(Value::Array(vec![
            json_or_placeholder(&self.0),
            json_or_placeholder(&self.1),
            json_or_placeholder(&self.2),
        ]))
    }

    fn zero() -> Option<Self> {
        Some((A::zero()?, B::zero()?, C::zero()?))
    }
}

// Callables are opaque.
impl_opaque_slot_value!(
    Box<dyn Fn()>,
    Box<dyn Fn() + Send + Sync>,
    Box<dyn FnMut() + Send>,
    Box<dyn FnOnce() + Send>,
    fn(),
);

#[cfg(feature = "anyhow")]
impl SlotValue for anyhow::Error {
    fn to_json(&self) -> Option<Value> {
        Some(Value::String(format!("{:#}", self)))
    }

    fn from_trap_error(err: &TrapError) -> Option<Self> {
        Some(anyhow::Error::new(err.clone()))
    }
}
