//! Tagged slots
//!
//! A [`Slot`] borrows one live storage location of an instrumented call: an
//! argument, the receiver, or a result. Results start out unset, so their
//! storage is an `Option<T>` and the slot reports the element type `T`.

use std::any::Any;

use serde_json::Value;

use crate::value::{json_or_placeholder, SlotValue, TypeTag};
use crate::TrapError;

/// Storage behind a result slot.
trait ResultPlace {
    fn elem(&self) -> TypeTag;
    fn value(&self) -> Option<&dyn SlotValue>;
    fn value_mut(&mut self) -> Option<&mut dyn SlotValue>;
    fn store(&mut self, value: Box<dyn Any>) -> Result<(), Box<dyn Any>>;
    fn absorb(&mut self, err: &TrapError) -> bool;
}

impl<T: SlotValue> ResultPlace for Option<T> {
    fn elem(&self) -> TypeTag {
        TypeTag::of::<T>()
    }

    fn value(&self) -> Option<&dyn SlotValue> {
        match self {
            Some(value) => Some(value),
            None => None,
        }
    }

    fn value_mut(&mut self) -> Option<&mut dyn SlotValue> {
        match self {
            Some(value) => Some(value),
            None => None,
        }
    }

    fn store(&mut self, value: Box<dyn Any>) -> Result<(), Box<dyn Any>> {
        let value = value.downcast::<T>()?;
        *self = Some(*value);
        Ok(())
    }

    fn absorb(&mut self, err: &TrapError) -> bool {
        match T::from_trap_error(err) {
            Some(value) => {
                *self = Some(value);
                true
            }
            None => false,
        }
    }
}

enum Place<'a> {
    Value(&'a mut dyn SlotValue),
    Shared(&'a dyn SlotValue),
    Result(&'a mut dyn ResultPlace),
}

/// Why a write into a slot was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRefusal {
    ReadOnly,
    TypeMismatch,
}

/// One borrowed, type-tagged storage location.
pub struct Slot<'a> {
    place: Place<'a>,
}

impl<'a> Slot<'a> {
    /// A writable slot over an argument (or a `&mut self` receiver).
    pub fn value<T: SlotValue>(value: &'a mut T) -> Self {
        Self {
            place: Place::Value(value),
        }
    }

    /// A read-only slot, used for `&self` receivers.
    pub fn shared<T: SlotValue>(value: &'a T) -> Self {
        Self {
            place: Place::Shared(value),
        }
    }

    /// A result slot; `None` means the result has not been produced yet.
    pub fn result<T: SlotValue>(value: &'a mut Option<T>) -> Self {
        Self {
            place: Place::Result(value),
        }
    }

    /// The static element type of this slot.
    pub fn type_tag(&self) -> TypeTag {
        match &self.place {
            Place::Value(value) => (**value).type_tag(),
            Place::Shared(value) => (**value).type_tag(),
            Place::Result(place) => (**place).elem(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.place, Place::Shared(_))
    }

    pub fn is_result(&self) -> bool {
        matches!(self.place, Place::Result(_))
    }

    /// Whether the slot holds a value; only results can be unset.
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    pub fn get(&self) -> Option<&dyn SlotValue> {
        match &self.place {
            Place::Value(value) => Some(&**value),
            Place::Shared(value) => Some(*value),
            Place::Result(place) => (**place).value(),
        }
    }

    /// Mutable access to the element; `None` for read-only or unset slots.
    pub fn get_mut(&mut self) -> Option<&mut dyn SlotValue> {
        match &mut self.place {
            Place::Value(value) => {
                let value: &mut dyn SlotValue = &mut **value;
                Some(value)
            }
            Place::Shared(_) => None,
            Place::Result(place) => (**place).value_mut(),
        }
    }

    /// Write `value` through to the underlying storage.
    pub fn set_boxed(&mut self, value: Box<dyn Any>) -> Result<(), SetRefusal> {
        let stored = match &mut self.place {
            Place::Value(target) => (**target).assign(value),
            Place::Shared(_) => return Err(SetRefusal::ReadOnly),
            Place::Result(place) => (**place).store(value),
        };
        stored.map_err(|_| SetRefusal::TypeMismatch)
    }

    /// Let an error-shaped result take `err`. Returns whether it did.
    pub fn absorb_error(&mut self, err: &TrapError) -> bool {
        match &mut self.place {
            Place::Result(place) => (**place).absorb(err),
            _ => false,
        }
    }

    /// JSON snapshot: `null` when unset, `{}` when opaque.
    pub fn to_json(&self) -> Value {
        match self.get() {
            Some(value) => json_or_placeholder(value),
            None => Value::Null,
        }
    }
}

impl std::fmt::Debug for Slot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("type", &self.type_tag())
            .field("set", &self.is_set())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}
