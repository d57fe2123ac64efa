//! Best-effort JSON marshaling
//!
//! Marshaling never fails because of the value itself: a value that cannot
//! be encoded becomes `{}`, and nesting deeper than the configured limit is
//! cut off with `{}`. The only reportable failures are writer errors.

use std::io::{self, Write};

use calltrap_object::{json, placeholder};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for MarshalError {
    fn from(err: serde_json::Error) -> Self {
        MarshalError::Io(err.into())
    }
}

/// Replace containers nested `max_depth` levels or deeper with `{}`.
pub fn prune(value: &mut Value, max_depth: usize) {
    prune_at(value, max_depth, 0);
}

fn prune_at(value: &mut Value, max_depth: usize, level: usize) {
    if level >= max_depth && (value.is_array() || value.is_object()) {
        *value = placeholder();
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                prune_at(item, max_depth, level + 1);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                prune_at(item, max_depth, level + 1);
            }
        }
        _ => {}
    }
}

/// Convert `value` to a JSON tree. Containers at `max_depth` are cut off
/// before they are visited, and each element that fails to encode becomes
/// `{}` on its own.
pub fn to_json_value<T: Serialize + ?Sized>(value: &T, max_depth: usize) -> Value {
    json::to_value(value, max_depth)
}

/// Marshal `value` as JSON with the current trace depth limit.
///
/// Object views marshal slot by slot, so a results object holding one
/// unencodable value gives `{"_r0":{}}`.
pub fn marshal_any_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, MarshalError> {
    let mut out = Vec::new();
    marshal_any_json_to(&mut out, value)?;
    Ok(out)
}

/// Like [`marshal_any_json`], writing into `writer`.
pub fn marshal_any_json_to<W: Write, T: Serialize + ?Sized>(
    writer: W,
    value: &T,
) -> Result<(), MarshalError> {
    let json = to_json_value(value, super::config().max_depth);
    serde_json::to_writer(writer, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde::Serializer;
    use serde_json::json;

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cannot encode"))
        }
    }

    #[test]
    fn test_unencodable_value_becomes_placeholder() {
        assert_eq!(marshal_any_json(&Unencodable).unwrap(), b"{}");
    }

    #[derive(Serialize)]
    struct Order {
        id: u32,
        name: &'static str,
        handle: Unencodable,
    }

    #[test]
    fn test_unencodable_field_becomes_placeholder_alone() {
        let order = Order {
            id: 7,
            name: "x",
            handle: Unencodable,
        };
        let bytes = marshal_any_json(&order).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"id": 7, "name": "x", "handle": {}}));
    }

    #[test]
    fn test_prune_cuts_deep_nesting() {
        let mut value = json!({"a": {"b": {"c": [1, 2]}}, "n": 1});
        prune(&mut value, 2);
        assert_eq!(value, json!({"a": {"b": {}}, "n": 1}));

        let mut scalar = json!(7);
        prune(&mut scalar, 0);
        assert_eq!(scalar, json!(7));
    }

    #[test]
    fn test_output_is_deterministic() {
        let mut map = std::collections::HashMap::new();
        for key in ["delta", "alpha", "charlie", "bravo"] {
            map.insert(key, key.len());
        }
        let first = marshal_any_json(&map).unwrap();
        let second = marshal_any_json(&map.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            String::from_utf8(first).unwrap(),
            r#"{"alpha":5,"bravo":5,"charlie":7,"delta":5}"#
        );
    }

    #[test]
    fn test_writer_errors_are_reported() {
        struct Broken;

        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let err = marshal_any_json_to(Broken, &json!({"k": 1})).unwrap_err();
        assert!(matches!(err, MarshalError::Io(_)));
    }
}
