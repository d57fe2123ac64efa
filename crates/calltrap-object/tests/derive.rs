//! Tests for `#[derive(SlotValue)]`.

use calltrap_derive::SlotValue;
use calltrap_object::{json_or_placeholder, Object, Slot, SlotValue as _, TrapError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, SlotValue)]
struct Point {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, SlotValue)]
enum Shape {
    Circle { radius: f64 },
    Dot,
}

#[derive(Debug, Clone, PartialEq, Serialize, SlotValue)]
struct Tagged<T> {
    tag: String,
    value: T,
}

/// Holds a non-serializable handle, so it can only be opaque.
#[derive(SlotValue)]
#[slot(opaque)]
struct Connection {
    _fd: std::sync::Mutex<i32>,
}

#[derive(Debug, Default, PartialEq, Serialize, SlotValue)]
#[slot(default)]
struct Totals {
    count: u32,
    label: String,
}

/// Serializes its contents but fails on the `secret` field.
#[derive(Serialize, SlotValue)]
struct Credentials {
    user: String,
    #[serde(serialize_with = "refuse")]
    secret: String,
}

fn refuse<S: serde::Serializer>(_value: &String, _serializer: S) -> Result<S::Ok, S::Error> {
    Err(serde::ser::Error::custom("not serializable"))
}

#[derive(Debug, PartialEq, Serialize, SlotValue)]
#[slot(trap_error)]
struct StoreError(String);

impl From<TrapError> for StoreError {
    fn from(err: TrapError) -> Self {
        StoreError(err.to_string())
    }
}

#[test]
fn test_serializable_struct_snapshot() {
    let point = Point { x: 1, y: -2 };
    assert_eq!(point.to_json(), Some(serde_json::json!({"x": 1, "y": -2})));
}

#[test]
fn test_enum_snapshot() {
    let shape = Shape::Circle { radius: 1.5 };
    assert_eq!(
        shape.to_json(),
        Some(serde_json::json!({"Circle": {"radius": 1.5}}))
    );
    assert_eq!(Shape::Dot.to_json(), Some(serde_json::json!("Dot")));
}

#[test]
fn test_generic_struct_snapshot() {
    let tagged = Tagged {
        tag: "answer".to_string(),
        value: 42u32,
    };
    assert_eq!(
        tagged.to_json(),
        Some(serde_json::json!({"tag": "answer", "value": 42}))
    );
}

#[test]
fn test_opaque_type_uses_placeholder() {
    let conn = Connection {
        _fd: std::sync::Mutex::new(3),
    };
    assert_eq!(conn.to_json(), None);
    assert_eq!(json_or_placeholder(&conn), serde_json::json!({}));
}

#[test]
fn test_default_attribute_provides_zero_value() {
    assert_eq!(Totals::zero(), Some(Totals::default()));
    assert_eq!(Point::zero(), None);
}

#[test]
fn test_unencodable_field_keeps_sibling_fields() {
    let creds = Credentials {
        user: "ana".to_string(),
        secret: "hunter2".to_string(),
    };
    assert_eq!(
        creds.to_json(),
        Some(serde_json::json!({"user": "ana", "secret": {}}))
    );
}

#[test]
fn test_trap_error_type_absorbs_errors() {
    let err = TrapError::msg("disk full");
    assert_eq!(
        StoreError::from_trap_error(&err),
        Some(StoreError("disk full".to_string()))
    );

    let mut out: Option<Result<Point, StoreError>> = None;
    {
        let mut slot = Slot::result(&mut out);
        assert!(slot.absorb_error(&err));
    }
    assert_eq!(out, Some(Err(StoreError("disk full".to_string()))));
}

#[test]
fn test_derived_values_flow_through_objects() {
    let mut origin = Point { x: 0, y: 0 };
    let mut moved: Option<Point> = None;
    {
        let names = vec!["origin".to_string()];
        let mut args = Object::args(vec![Slot::value(&mut origin)]).with_names(&names);
        let mut results = Object::results(vec![Slot::result(&mut moved)]);

        let start = args.field("origin").unwrap().get_as::<Point>().unwrap().clone();
        results
            .field_index(0)
            .unwrap()
            .set(Point {
                x: start.x + 1,
                y: start.y + 1,
            })
            .unwrap();

        assert_eq!(
            serde_json::to_string(&args).unwrap(),
            r#"{"origin":{"x":0,"y":0}}"#
        );
        assert_eq!(
            serde_json::to_string(&results).unwrap(),
            r#"{"_r0":{"x":1,"y":1}}"#
        );
    }
    assert_eq!(moved, Some(Point { x: 1, y: 1 }));
}
