//! Object views
//!
//! An [`Object`] is an ordered, named window over the slots of one call: its
//! receiver, its arguments, or its results. It borrows the storage for the
//! duration of the call; the lifetime parameter keeps a view from outliving
//! the call that created it.

use std::any::Any;
use std::borrow::Cow;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::slot::{SetRefusal, Slot};
use crate::value::{SlotValue, TypeTag};
use crate::ObjectError;

/// What an object's slots hold. Decides the default slot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Receiver,
    Args,
    Results,
}

impl ObjectKind {
    fn default_name(self, index: usize) -> String {
        match self {
            ObjectKind::Receiver => "_recv".to_string(),
            ObjectKind::Args => format!("_a{}", index),
            ObjectKind::Results => format!("_r{}", index),
        }
    }
}

/// A type-erased view over the live slots of a call.
pub struct Object<'a> {
    kind: ObjectKind,
    names: &'a [String],
    slots: Vec<Slot<'a>>,
    nil: bool,
}

impl<'a> Object<'a> {
    pub fn new(kind: ObjectKind, slots: Vec<Slot<'a>>) -> Self {
        Self {
            kind,
            names: &[],
            slots,
            nil: false,
        }
    }

    pub fn args(slots: Vec<Slot<'a>>) -> Self {
        Self::new(ObjectKind::Args, slots)
    }

    pub fn results(slots: Vec<Slot<'a>>) -> Self {
        Self::new(ObjectKind::Results, slots)
    }

    pub fn receiver(slot: Slot<'a>) -> Self {
        Self::new(ObjectKind::Receiver, vec![slot])
    }

    /// The view of an absent receiver.
    pub fn nil() -> Self {
        Self {
            kind: ObjectKind::Receiver,
            names: &[],
            slots: Vec::new(),
            nil: true,
        }
    }

    /// Attach slot names. Missing names fall back to `_a{i}` / `_r{i}`.
    pub fn with_names(mut self, names: &'a [String]) -> Self {
        self.names = names;
        self
    }

    pub fn set_names(&mut self, names: &'a [String]) {
        self.names = names;
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_nil(&self) -> bool {
        self.nil
    }

    /// Name of slot `index`.
    pub fn name(&self, index: usize) -> Cow<'_, str> {
        match self.names.get(index) {
            Some(name) if !name.is_empty() => Cow::Borrowed(name.as_str()),
            _ => Cow::Owned(self.kind.default_name(index)),
        }
    }

    pub fn names(&self) -> Vec<Cow<'_, str>> {
        (0..self.slots.len()).map(|i| self.name(i)).collect()
    }

    fn position(&self, name: &str) -> Option<usize> {
        (0..self.slots.len()).find(|&i| self.name(i) == name)
    }

    /// Bounds-checked field access (`GetFieldIndex`).
    pub fn field_index(&mut self, index: usize) -> Result<Field<'_, 'a>, ObjectError> {
        let len = self.slots.len();
        if index >= len {
            return Err(ObjectError::IndexOutOfRange { index, len });
        }
        let name = self.name(index).into_owned();
        Ok(Field {
            name,
            slot: &mut self.slots[index],
        })
    }

    /// Field access by slot name.
    pub fn field(&mut self, name: &str) -> Result<Field<'_, 'a>, ObjectError> {
        match self.position(name) {
            Some(index) => self.field_index(index),
            None => Err(ObjectError::NoSuchField(name.to_string())),
        }
    }

    /// Read-only access to a slot.
    pub fn slot(&self, index: usize) -> Result<&Slot<'a>, ObjectError> {
        self.slots.get(index).ok_or(ObjectError::IndexOutOfRange {
            index,
            len: self.slots.len(),
        })
    }

    /// Typed read of slot `index`.
    pub fn value_as<T: Any>(&self, index: usize) -> Result<&T, ObjectError> {
        let slot = self.slot(index)?;
        read_as(&self.name(index), slot)
    }

    pub fn slots(&self) -> &[Slot<'a>] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [Slot<'a>] {
        &mut self.slots
    }

    /// Element types of all slots, in order.
    pub fn type_tags(&self) -> Vec<TypeTag> {
        self.slots.iter().map(Slot::type_tag).collect()
    }

    /// Deep copy of the current slot values as JSON, in slot order.
    pub fn snapshot(&self) -> Fields {
        Fields(
            self.slots
                .iter()
                .enumerate()
                .map(|(i, slot)| (self.name(i).into_owned(), slot.to_json()))
                .collect(),
        )
    }
}

impl std::fmt::Debug for Object<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("kind", &self.kind)
            .field("nil", &self.nil)
            .field("slots", &self.slots)
            .finish()
    }
}

/// Objects serialize as a JSON map in slot order. Each slot falls back to
/// `{}` on its own, so one opaque value never spoils its siblings.
impl Serialize for Object<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for (i, slot) in self.slots.iter().enumerate() {
            let name = self.name(i);
            map.serialize_entry(&*name, &slot.to_json())?;
        }
        map.end()
    }
}

fn read_as<'s, T: Any>(name: &str, slot: &'s Slot<'_>) -> Result<&'s T, ObjectError> {
    let value = slot.get().ok_or_else(|| ObjectError::Unset {
        field: name.to_string(),
    })?;
    let expected = slot.type_tag().name();
    (*value)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ObjectError::TypeMismatch {
            field: name.to_string(),
            expected,
            got: std::any::type_name::<T>(),
        })
}

/// One slot of an [`Object`], borrowed for reading or writing.
pub struct Field<'o, 'a> {
    name: String,
    slot: &'o mut Slot<'a>,
}

impl<'o, 'a> Field<'o, 'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> TypeTag {
        self.slot.type_tag()
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_set()
    }

    /// The current value, `None` for an unset result.
    pub fn get(&self) -> Option<&dyn SlotValue> {
        self.slot.get()
    }

    pub fn get_as<T: Any>(&self) -> Result<&T, ObjectError> {
        read_as(&self.name, self.slot)
    }

    pub fn get_mut_as<T: Any>(&mut self) -> Result<&mut T, ObjectError> {
        let expected = self.slot.type_tag().name();
        if self.slot.is_read_only() {
            return Err(ObjectError::ReadOnly {
                field: self.name.clone(),
            });
        }
        let value = self.slot.get_mut().ok_or_else(|| ObjectError::Unset {
            field: self.name.clone(),
        })?;
        (*value)
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| ObjectError::TypeMismatch {
                field: self.name.clone(),
                expected,
                got: std::any::type_name::<T>(),
            })
    }

    /// Write `value` through to the call's storage after checking it against
    /// the slot's element type.
    pub fn set<T: Any>(&mut self, value: T) -> Result<(), ObjectError> {
        let got = std::any::type_name::<T>();
        self.store(Box::new(value), got)
    }

    /// Like [`set`](Self::set) for an already boxed value.
    pub fn set_boxed(&mut self, value: Box<dyn Any>) -> Result<(), ObjectError> {
        self.store(value, "<boxed value>")
    }

    fn store(&mut self, value: Box<dyn Any>, got: &'static str) -> Result<(), ObjectError> {
        let expected = self.slot.type_tag().name();
        self.slot.set_boxed(value).map_err(|refusal| match refusal {
            SetRefusal::ReadOnly => ObjectError::ReadOnly {
                field: self.name.clone(),
            },
            SetRefusal::TypeMismatch => ObjectError::TypeMismatch {
                field: self.name.clone(),
                expected,
                got,
            },
        })
    }
}

/// An owned, ordered snapshot of an object's slots.
///
/// Serializes as a JSON map that keeps slot order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Map<String, serde_json::Value>")]
#[serde(into = "OrderedMap")]
pub struct Fields(pub Vec<(String, serde_json::Value)>);

impl Fields {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Apply `f` to every value in place.
    pub fn map_values(&mut self, mut f: impl FnMut(&mut serde_json::Value)) {
        for (_, value) in &mut self.0 {
            f(value);
        }
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Fields {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Fields(map.into_iter().collect())
    }
}

/// Serialization proxy for [`Fields`].
#[derive(Clone)]
struct OrderedMap(Vec<(String, serde_json::Value)>);

impl From<Fields> for OrderedMap {
    fn from(fields: Fields) -> Self {
        OrderedMap(fields.0)
    }
}

impl Serialize for OrderedMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
