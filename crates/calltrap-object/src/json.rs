//! Bounded JSON snapshots
//!
//! [`to_value`] encodes any `serde::Serialize` value into a
//! `serde_json::Value` with two guarantees plain `serde_json::to_value`
//! lacks:
//!
//! - containers nested `max_depth` levels or deeper become `{}` *before*
//!   their contents are visited, so self-referential values terminate;
//! - an element that fails to encode becomes `{}` on its own, leaving its
//!   siblings and the surrounding structure intact.
//!
//! ```
//! use calltrap_object::json;
//! use serde_json::json;
//!
//! let nested = vec![vec![vec![1]]];
//! assert_eq!(json::to_value(&nested, 2), json!([[{}]]));
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::ser::{self, Serialize};
use serde_json::{Map, Value};

use crate::placeholder;

/// Default container depth for [`snapshot`].
pub const DEFAULT_DEPTH_LIMIT: usize = 32;

/// Wrappers (`Some`, newtypes) add no JSON nesting, so they are bounded
/// separately.
const NESTING_LIMIT: usize = 256;

static DEPTH_LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_DEPTH_LIMIT);

/// Set the container depth used by [`snapshot`].
pub fn set_depth_limit(max_depth: usize) {
    DEPTH_LIMIT.store(max_depth, Ordering::Relaxed);
}

pub fn depth_limit() -> usize {
    DEPTH_LIMIT.load(Ordering::Relaxed)
}

/// Encode `value` with the process-wide depth limit.
pub fn snapshot<T: Serialize + ?Sized>(value: &T) -> Value {
    to_value(value, depth_limit())
}

/// Encode `value`, cutting containers at `max_depth` and replacing values
/// that fail to encode with `{}`.
pub fn to_value<T: Serialize + ?Sized>(value: &T, max_depth: usize) -> Value {
    Bounded {
        limit: max_depth,
        level: 0,
        nesting: 0,
    }
    .encode(value)
}

// ============================================================================
// Serializer
// ============================================================================

#[derive(Clone, Copy)]
struct Bounded {
    limit: usize,
    /// JSON container level of the value being encoded.
    level: usize,
    /// Serializer calls on the current path, wrappers included.
    nesting: usize,
}

impl Bounded {
    fn child(self) -> Self {
        Self {
            level: self.level + 1,
            nesting: self.nesting + 1,
            ..self
        }
    }

    fn wrapped(self) -> Self {
        Self {
            nesting: self.nesting + 1,
            ..self
        }
    }

    fn pruned(self) -> bool {
        self.level >= self.limit || self.nesting >= NESTING_LIMIT
    }

    fn encode<T: Serialize + ?Sized>(self, value: &T) -> Value {
        value.serialize(self).unwrap_or_else(|_| placeholder())
    }

    /// Map keys follow serde_json: strings, numbers and booleans only.
    fn key<T: Serialize + ?Sized>(self, key: &T) -> Option<String> {
        match key.serialize(self.child()).ok()? {
            Value::String(key) => Some(key),
            Value::Number(key) => Some(key.to_string()),
            Value::Bool(key) => Some(key.to_string()),
            _ => None,
        }
    }
}

/// `{variant: body}` for enum variants, `body` otherwise.
fn tagged(variant: Option<&'static str>, body: Value) -> Value {
    match variant {
        Some(variant) => {
            let mut map = Map::new();
            map.insert(variant.to_string(), body);
            Value::Object(map)
        }
        None => body,
    }
}

macro_rules! forward_primitives {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, v: $ty) -> Result<Value, serde_json::Error> {
                ser::Serializer::$method(serde_json::value::Serializer, v)
            }
        )*
    };
}

impl ser::Serializer for Bounded {
    type Ok = Value;
    type Error = serde_json::Error;
    type SerializeSeq = SeqState;
    type SerializeTuple = SeqState;
    type SerializeTupleStruct = SeqState;
    type SerializeTupleVariant = SeqState;
    type SerializeMap = MapState;
    type SerializeStruct = MapState;
    type SerializeStructVariant = MapState;

    forward_primitives!(
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_i128(i128),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_u128(u128),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
    );

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, serde_json::Error> {
        if self.pruned() {
            return Ok(placeholder());
        }
        Ok(Value::Array(v.iter().map(|&b| Value::from(b)).collect()))
    }

    fn serialize_none(self) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, serde_json::Error> {
        let inner = self.wrapped();
        if inner.nesting >= NESTING_LIMIT {
            return Ok(placeholder());
        }
        Ok(inner.encode(value))
    }

    fn serialize_unit(self) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, serde_json::Error> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Value, serde_json::Error> {
        Ok(Value::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, serde_json::Error> {
        ser::Serializer::serialize_some(self, value)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, serde_json::Error> {
        if self.pruned() {
            return Ok(placeholder());
        }
        Ok(tagged(Some(variant), self.child().encode(value)))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqState, serde_json::Error> {
        Ok(SeqState::open(self, None, len.unwrap_or(0)))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqState, serde_json::Error> {
        Ok(SeqState::open(self, None, len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqState, serde_json::Error> {
        Ok(SeqState::open(self, None, len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SeqState, serde_json::Error> {
        Ok(SeqState::open(self, Some(variant), len))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapState, serde_json::Error> {
        Ok(MapState::open(self, None))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<MapState, serde_json::Error> {
        Ok(MapState::open(self, None))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<MapState, serde_json::Error> {
        Ok(MapState::open(self, Some(variant)))
    }
}

// ============================================================================
// Compound values
// ============================================================================

/// Bookkeeping shared by sequences and maps. A compound past the limit
/// keeps no element storage, so its elements are never visited.
struct Frame {
    elements: Bounded,
    variant: Option<&'static str>,
    /// The whole value, variant wrapper included, is past the limit.
    cut: bool,
}

impl Frame {
    /// Variant bodies sit one level below their `{variant: ...}` wrapper.
    fn open(at: Bounded, variant: Option<&'static str>) -> (Self, bool) {
        let cut = variant.is_some() && at.pruned();
        let body = if variant.is_some() { at.child() } else { at };
        let frame = Frame {
            elements: body.child(),
            variant,
            cut,
        };
        (frame, cut || body.pruned())
    }

    fn close(self, body: Option<Value>) -> Value {
        if self.cut {
            return placeholder();
        }
        tagged(self.variant, body.unwrap_or_else(placeholder))
    }
}

struct SeqState {
    frame: Frame,
    items: Option<Vec<Value>>,
}

impl SeqState {
    fn open(at: Bounded, variant: Option<&'static str>, len: usize) -> Self {
        let (frame, pruned) = Frame::open(at, variant);
        let items = (!pruned).then(|| Vec::with_capacity(len));
        SeqState { frame, items }
    }

    fn push<T: Serialize + ?Sized>(&mut self, value: &T) {
        if let Some(items) = self.items.as_mut() {
            items.push(self.frame.elements.encode(value));
        }
    }

    fn finish(self) -> Result<Value, serde_json::Error> {
        Ok(self.frame.close(self.items.map(Value::Array)))
    }
}

impl ser::SerializeSeq for SeqState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

impl ser::SerializeTuple for SeqState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for SeqState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for SeqState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        self.push(value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

struct MapState {
    frame: Frame,
    entries: Option<Map<String, Value>>,
    /// Key of the entry whose value comes next; `None` after a key that
    /// could not be encoded, which drops that entry.
    next_key: Option<String>,
}

impl MapState {
    fn open(at: Bounded, variant: Option<&'static str>) -> Self {
        let (frame, pruned) = Frame::open(at, variant);
        let entries = (!pruned).then(Map::new);
        MapState {
            frame,
            entries,
            next_key: None,
        }
    }

    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) {
        if let Some(entries) = self.entries.as_mut() {
            entries.insert(key, self.frame.elements.encode(value));
        }
    }

    fn finish(self) -> Result<Value, serde_json::Error> {
        Ok(self.frame.close(self.entries.map(Value::Object)))
    }
}

impl ser::SerializeMap for MapState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), serde_json::Error> {
        self.next_key = match self.entries {
            Some(_) => self.frame.elements.key(key),
            None => None,
        };
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        if let Some(key) = self.next_key.take() {
            self.insert(key, value);
        }
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

impl ser::SerializeStruct for MapState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.insert(key.to_string(), value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}

impl ser::SerializeStructVariant for MapState {
    type Ok = Value;
    type Error = serde_json::Error;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        self.insert(key.to_string(), value);
        Ok(())
    }

    fn end(self) -> Result<Value, serde_json::Error> {
        self.finish()
    }
}
