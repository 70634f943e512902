//! Inverse of the serializer, where an inverse exists.
//!
//! Built-ins with a value-like shape come back as themselves. Records and all
//! markers come back as plain records; the original graph (shared children,
//! cycles) is not rebuilt.

use super::node::{SerializedNode, TypedValue};
use crate::value::{
    ErrorObject, FunctionInfo, HostObject, Record, TypedArray, TypedArrayKind, Value,
};
use chrono::DateTime;
use reqwest::Url;

pub fn deserialize(node: &SerializedNode) -> Value {
    match node {
        SerializedNode::Null => Value::Null,
        SerializedNode::Bool(b) => Value::Bool(*b),
        SerializedNode::Number(n) => Value::Number(*n),
        SerializedNode::String(s) => Value::String(s.clone()),
        SerializedNode::Array { items, .. } => Value::array(items.iter().map(deserialize)),
        SerializedNode::Record {
            constructor,
            fields,
            ..
        } => {
            let mut record = Record {
                constructor: constructor.clone(),
                properties: Vec::with_capacity(fields.len()),
            };
            for (key, field) in fields {
                record.set(key.clone(), deserialize(field));
            }
            record.into_value()
        }
        SerializedNode::Typed(typed) => typed_value(node, typed),
        SerializedNode::Circular { .. }
        | SerializedNode::DepthExceeded { .. }
        | SerializedNode::AccessError { .. } => Value::from(node.to_json()),
    }
}

fn typed_value(node: &SerializedNode, typed: &TypedValue) -> Value {
    match typed {
        TypedValue::Undefined => Value::Undefined,
        TypedValue::NonFinite(n) => Value::Number(n.to_f64()),
        TypedValue::BigInt(digits) => match digits.parse::<i128>() {
            Ok(n) => Value::BigInt(n),
            Err(_) => Value::String(digits.clone()),
        },
        TypedValue::Symbol(description) => Value::Symbol(description.clone()),
        TypedValue::Function {
            name,
            arity,
            source,
        } => Value::Function(FunctionInfo {
            name: name.clone(),
            arity: *arity,
            source: source.clone(),
        }),
        TypedValue::Date(iso) => {
            let millis = iso
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.timestamp_millis());
            Value::object(HostObject::Date(millis))
        }
        TypedValue::RegExp { source, flags } => Value::object(HostObject::RegExp {
            source: source.clone(),
            flags: flags.clone(),
        }),
        TypedValue::Error {
            name,
            message,
            stack,
            extra,
            ..
        } => {
            let mut error = ErrorObject::new(name.clone(), message.clone());
            error.stack = stack.clone();
            error.extra = extra
                .iter()
                .map(|(key, field)| (key.clone(), deserialize(field)))
                .collect();
            Value::object(HostObject::Error(error))
        }
        TypedValue::Map { entries, .. } => Value::object(HostObject::Map(
            entries
                .iter()
                .map(|(k, v)| (deserialize(k), deserialize(v)))
                .collect(),
        )),
        TypedValue::Set { values, .. } => {
            Value::object(HostObject::Set(values.iter().map(deserialize).collect()))
        }
        TypedValue::ArrayBuffer(bytes) => Value::object(HostObject::ArrayBuffer(bytes.clone())),
        TypedValue::TypedArray {
            type_name, data, ..
        } => match TypedArrayKind::from_name(type_name) {
            Some(kind) => Value::object(HostObject::TypedArray(TypedArray {
                kind,
                buffer: data.clone(),
            })),
            None => Value::object(HostObject::ArrayBuffer(data.clone())),
        },
        TypedValue::Url(parts) => match Url::parse(&parts.href) {
            Ok(url) => Value::object(HostObject::Url(url)),
            Err(_) => Value::from(node.to_json()),
        },
        TypedValue::SearchParams(pairs) => Value::object(HostObject::SearchParams(pairs.clone())),
        TypedValue::Headers(headers) => Value::object(HostObject::Headers(headers.clone())),
        TypedValue::Request(_) | TypedValue::Response(_) => Value::from(node.to_json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{serialize, SerializeOptions, TypeTag};
    use crate::value::ObjectRef;
    use bytes::Bytes;

    fn round_trip(value: &Value) -> (SerializedNode, SerializedNode) {
        let options = SerializeOptions::default();
        let first = serialize(value, &options);
        let second = serialize(&deserialize(&first), &options);
        (first, second)
    }

    #[test]
    fn plain_graph_round_trips() {
        let value = Value::record([
            ("name", Value::from("checkout")),
            ("count", Value::from(3)),
            ("ok", Value::Bool(false)),
            ("missing", Value::Null),
            ("tags", Value::array(["a", "b"])),
            (
                "nested",
                Value::record([("deeper", Value::record([("x", 1.5)]))]),
            ),
        ]);
        let (first, second) = round_trip(&value);
        assert_eq!(first, second);
    }

    #[test]
    fn constructor_name_survives() {
        let mut record = Record::with_constructor("Invoice");
        record.set("total", 10);
        let (first, second) = round_trip(&record.into_value());
        assert_eq!(first, second);
        match second {
            SerializedNode::Record { constructor, .. } => {
                assert_eq!(constructor.as_deref(), Some("Invoice"))
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn builtins_are_rebuilt() {
        let value = Value::record([
            ("when", Value::date_millis(1_700_000_000_123)),
            (
                "pattern",
                Value::object(HostObject::RegExp {
                    source: "^a+$".to_string(),
                    flags: "gi".to_string(),
                }),
            ),
            (
                "lookup",
                Value::object(HostObject::Map(vec![(Value::from("k"), Value::from(1))])),
            ),
            (
                "unique",
                Value::object(HostObject::Set(vec![Value::from(1), Value::from(2)])),
            ),
            (
                "raw",
                Value::object(HostObject::ArrayBuffer(Bytes::from_static(b"\x00\x01"))),
            ),
            (
                "view",
                Value::object(HostObject::TypedArray(TypedArray {
                    kind: TypedArrayKind::Float32,
                    buffer: Bytes::from_static(&[0, 0, 128, 63]),
                })),
            ),
            ("big", Value::BigInt(-12345678901234567890)),
            ("nothing", Value::Undefined),
            ("nan", Value::Number(f64::NAN)),
            ("err", Value::error("TypeError", "nope")),
        ]);
        let (first, second) = round_trip(&value);
        assert_eq!(first, second);
    }

    #[test]
    fn date_is_rebuilt_as_date() {
        let node = serialize(&Value::date_millis(86_400_000), &SerializeOptions::default());
        let value = deserialize(&node);
        let obj = value.as_object().unwrap();
        match &*obj.try_borrow().unwrap() {
            HostObject::Date(millis) => assert_eq!(*millis, Some(86_400_000)),
            other => panic!("expected date, got {}", other.type_name()),
        };
    }

    #[test]
    fn url_is_rebuilt() {
        let url = Url::parse("https://example.com/a?b=c").unwrap();
        let (first, second) = round_trip(&Value::object(HostObject::Url(url)));
        assert_eq!(first.kind(), Some(TypeTag::Url));
        assert_eq!(first, second);
    }

    #[test]
    fn circular_marker_comes_back_as_plain_record() {
        let obj = ObjectRef::new(HostObject::Record(Record::new()));
        obj.set("self", obj.clone());
        let node = serialize(&Value::Object(obj), &SerializeOptions::default());

        let rebuilt = serialize(&deserialize(&node), &SerializeOptions::default());
        let marker = rebuilt.get("self").unwrap();
        assert_eq!(marker.get("circular"), Some(&SerializedNode::Bool(true)));
        assert_eq!(marker.get("ref"), Some(&SerializedNode::Number(1.0)));
    }
}
