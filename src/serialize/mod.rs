//! Generic value serializer.
//!
//! Flattens an arbitrary [`Value`] graph into a [`SerializedNode`] tree that is
//! bounded in depth, free of cycles and always JSON-encodable. Failures never
//! escape: they are captured as marker nodes next to the key that caused them.

mod builtins;
mod deserialize;
mod node;

pub use deserialize::deserialize;
pub use node::{
    NonFinite, RequestSnapshot, ResponseSnapshot, SerializedNode, TypeTag, TypedValue, UrlParts,
};

use crate::value::{FunctionInfo, HostObject, ObjectRef, Record, Slot, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Converter for a domain type, keyed by constructor name.
pub type TypeHandler = Arc<dyn Fn(&Record) -> Result<SerializedNode, String> + Send + Sync>;

#[derive(Clone)]
pub struct SerializeOptions {
    pub max_depth: usize,
    pub include_non_enumerable: bool,
    pub include_function_bodies: bool,
    pub custom_type_handlers: HashMap<String, TypeHandler>,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            include_non_enumerable: false,
            include_function_bodies: false,
            custom_type_handlers: HashMap::new(),
        }
    }
}

impl SerializeOptions {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_non_enumerable(mut self, include: bool) -> Self {
        self.include_non_enumerable = include;
        self
    }

    pub fn with_function_bodies(mut self, include: bool) -> Self {
        self.include_function_bodies = include;
        self
    }

    pub fn with_handler<F>(mut self, constructor: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Record) -> Result<SerializedNode, String> + Send + Sync + 'static,
    {
        self.custom_type_handlers
            .insert(constructor.into(), Arc::new(handler));
        self
    }
}

impl fmt::Debug for SerializeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.custom_type_handlers.keys().collect();
        handlers.sort();
        f.debug_struct("SerializeOptions")
            .field("max_depth", &self.max_depth)
            .field("include_non_enumerable", &self.include_non_enumerable)
            .field("include_function_bodies", &self.include_function_bodies)
            .field("custom_type_handlers", &handlers)
            .finish()
    }
}

/// Serializes `value` under `options`. Never panics on values reachable
/// through their own structure.
pub fn serialize(value: &Value, options: &SerializeOptions) -> SerializedNode {
    Traversal::new(options).visit(value, 0)
}

/// State for one top-level call: the objects on the current path and the
/// circular ids handed out so far, both keyed by object identity.
struct Traversal<'a> {
    options: &'a SerializeOptions,
    on_path: HashSet<usize>,
    circular_ids: HashMap<usize, u32>,
    next_id: u32,
}

impl<'a> Traversal<'a> {
    fn new(options: &'a SerializeOptions) -> Self {
        Self {
            options,
            on_path: HashSet::new(),
            circular_ids: HashMap::new(),
            next_id: 0,
        }
    }

    fn visit(&mut self, value: &Value, depth: usize) -> SerializedNode {
        match value {
            Value::Undefined => SerializedNode::Typed(TypedValue::Undefined),
            Value::Null => SerializedNode::Null,
            Value::Bool(b) => SerializedNode::Bool(*b),
            Value::Number(n) => SerializedNode::number(*n),
            Value::String(s) => SerializedNode::String(s.clone()),
            Value::BigInt(n) => SerializedNode::Typed(TypedValue::BigInt(n.to_string())),
            Value::Symbol(description) => {
                SerializedNode::Typed(TypedValue::Symbol(description.clone()))
            }
            Value::Function(info) => self.function(info),
            Value::Object(obj) => self.visit_object(obj, depth),
        }
    }

    fn function(&self, info: &FunctionInfo) -> SerializedNode {
        let source = if self.options.include_function_bodies {
            info.source.clone()
        } else {
            None
        };
        SerializedNode::Typed(TypedValue::Function {
            name: info.name.clone(),
            arity: info.arity,
            source,
        })
    }

    fn visit_object(&mut self, obj: &ObjectRef, depth: usize) -> SerializedNode {
        let identity = obj.identity();
        if self.on_path.contains(&identity) {
            return SerializedNode::Circular {
                reference: self.circular_id(identity),
            };
        }

        // Work on a snapshot so getters and handlers may borrow the object again.
        let snapshot = match obj.try_borrow() {
            Ok(borrowed) => borrowed.clone(),
            Err(e) => return SerializedNode::access_error(format!("object is borrowed: {}", e)),
        };

        if depth >= self.options.max_depth {
            return SerializedNode::DepthExceeded {
                type_name: snapshot.type_name(),
            };
        }

        self.on_path.insert(identity);
        let mut node = self.convert(&snapshot, depth);
        self.on_path.remove(&identity);

        if let Some(&id) = self.circular_ids.get(&identity) {
            node.set_anchor(id);
        }
        node
    }

    fn circular_id(&mut self, identity: usize) -> u32 {
        if let Some(&id) = self.circular_ids.get(&identity) {
            return id;
        }
        self.next_id += 1;
        self.circular_ids.insert(identity, self.next_id);
        self.next_id
    }

    fn convert(&mut self, object: &HostObject, depth: usize) -> SerializedNode {
        match object {
            HostObject::Record(record) => match self.custom_handler(record) {
                Some(node) => node,
                None => self.record(record, depth),
            },
            HostObject::Array(items) => SerializedNode::Array {
                items: items.iter().map(|v| self.visit(v, depth + 1)).collect(),
                anchor: None,
            },
            HostObject::Date(millis) => builtins::date(*millis),
            HostObject::RegExp { source, flags } => SerializedNode::Typed(TypedValue::RegExp {
                source: source.clone(),
                flags: flags.clone(),
            }),
            HostObject::Error(error) => self.error(error, depth),
            HostObject::Map(entries) => self.map(entries, depth),
            HostObject::Set(values) => SerializedNode::Typed(TypedValue::Set {
                values: values.iter().map(|v| self.visit(v, depth + 1)).collect(),
                anchor: None,
            }),
            HostObject::ArrayBuffer(bytes) => {
                SerializedNode::Typed(TypedValue::ArrayBuffer(bytes.clone()))
            }
            HostObject::TypedArray(view) => builtins::typed_array(view),
            HostObject::Url(url) => builtins::url(url),
            HostObject::SearchParams(pairs) => {
                SerializedNode::Typed(TypedValue::SearchParams(pairs.clone()))
            }
            HostObject::Headers(headers) => {
                SerializedNode::Typed(TypedValue::Headers(builtins::normalize_headers(headers)))
            }
            HostObject::Request(request) => {
                builtins::request(request, depth, self.options.max_depth)
            }
            HostObject::Response(response) => {
                builtins::response(response, depth, self.options.max_depth)
            }
        }
    }

    fn custom_handler(&self, record: &Record) -> Option<SerializedNode> {
        let name = record.constructor.as_deref()?;
        let handler = self.options.custom_type_handlers.get(name)?;
        let node = match panic::catch_unwind(AssertUnwindSafe(|| handler(record))) {
            Ok(Ok(node)) => node,
            Ok(Err(message)) => SerializedNode::access_error(message),
            Err(_) => SerializedNode::access_error(format!("handler for {} panicked", name)),
        };
        Some(node)
    }

    fn record(&mut self, record: &Record, depth: usize) -> SerializedNode {
        let mut fields = Vec::with_capacity(record.properties.len());
        for (key, property) in &record.properties {
            if !property.enumerable && !self.options.include_non_enumerable {
                continue;
            }
            let node = match &property.slot {
                Slot::Data(value) => self.visit(value, depth + 1),
                Slot::Accessor {
                    get: Some(getter),
                    has_setter: true,
                } => match panic::catch_unwind(AssertUnwindSafe(|| getter())) {
                    Ok(Ok(value)) => self.visit(&value, depth + 1),
                    Ok(Err(message)) => SerializedNode::access_error(message),
                    Err(_) => SerializedNode::access_error(format!("getter for {} panicked", key)),
                },
                // Getter-only accessors may be computed or throw; write-only has nothing to read.
                Slot::Accessor { .. } => continue,
            };
            fields.push((key.clone(), node));
        }
        SerializedNode::Record {
            constructor: record.constructor.clone(),
            fields,
            anchor: None,
        }
    }

    fn error(&mut self, error: &crate::value::ErrorObject, depth: usize) -> SerializedNode {
        let extra = error
            .extra
            .iter()
            .map(|(key, value)| (key.clone(), self.visit(value, depth + 1)))
            .collect();
        SerializedNode::Typed(TypedValue::Error {
            name: error.name.clone(),
            message: error.message.clone(),
            stack: error.stack.clone(),
            extra,
            anchor: None,
        })
    }

    fn map(&mut self, entries: &[(Value, Value)], depth: usize) -> SerializedNode {
        let entries = entries
            .iter()
            .map(|(k, v)| (self.visit(k, depth + 1), self.visit(v, depth + 1)))
            .collect();
        SerializedNode::Typed(TypedValue::Map {
            entries,
            anchor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ErrorObject, Getter, Property};
    use std::rc::Rc;

    fn getter(f: impl Fn() -> Result<Value, String> + 'static) -> Getter {
        Rc::new(f)
    }

    fn nested(depth: usize) -> Value {
        let mut value = Value::from("leaf");
        for _ in 0..depth {
            value = Value::record([("child", value)]);
        }
        value
    }

    #[test]
    fn primitives_pass_through() {
        let options = SerializeOptions::default();
        assert_eq!(serialize(&Value::Null, &options), SerializedNode::Null);
        assert_eq!(serialize(&Value::Bool(true), &options), SerializedNode::Bool(true));
        assert_eq!(serialize(&Value::from(2.5), &options), SerializedNode::Number(2.5));
        assert_eq!(
            serialize(&Value::from("x"), &options),
            SerializedNode::String("x".to_string())
        );
        assert_eq!(
            serialize(&Value::Undefined, &options),
            SerializedNode::Typed(TypedValue::Undefined)
        );
    }

    #[test]
    fn bigint_and_symbol_become_wrappers() {
        let options = SerializeOptions::default();
        let big = serialize(&Value::BigInt(i128::MAX), &options);
        assert_eq!(
            big,
            SerializedNode::Typed(TypedValue::BigInt(i128::MAX.to_string()))
        );
        let symbol = serialize(&Value::Symbol(Some("token".to_string())), &options);
        assert_eq!(symbol.kind(), Some(TypeTag::Symbol));
    }

    #[test]
    fn function_source_is_opt_in() {
        let func = Value::Function(FunctionInfo {
            name: "handler".to_string(),
            arity: 2,
            source: Some("function handler(a, b) { return SECRET }".to_string()),
        });

        let hidden = serialize(&func, &SerializeOptions::default());
        assert_eq!(
            hidden,
            SerializedNode::Typed(TypedValue::Function {
                name: "handler".to_string(),
                arity: 2,
                source: None,
            })
        );

        let shown = serialize(&func, &SerializeOptions::default().with_function_bodies(true));
        match shown {
            SerializedNode::Typed(TypedValue::Function { source, .. }) => {
                assert!(source.unwrap().contains("SECRET"))
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn self_reference_becomes_circular_marker() {
        let obj = ObjectRef::new(HostObject::Record(Record::new()));
        obj.set("name", "root");
        obj.set("self", obj.clone());

        let node = serialize(&Value::Object(obj), &SerializeOptions::default());
        assert_eq!(node.get("self"), Some(&SerializedNode::Circular { reference: 1 }));
        match node {
            SerializedNode::Record { anchor, .. } => assert_eq!(anchor, Some(1)),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn repeated_cycles_reuse_the_same_id() {
        let root = ObjectRef::new(HostObject::Record(Record::new()));
        let child = ObjectRef::new(HostObject::Record(Record::new()));
        child.set("up", root.clone());
        child.set("again", root.clone());
        root.set("child", child.clone());
        root.set("me", root.clone());

        let node = serialize(&Value::Object(root), &SerializeOptions::default());
        let child_node = node.get("child").unwrap();
        assert_eq!(child_node.get("up"), Some(&SerializedNode::Circular { reference: 1 }));
        assert_eq!(
            child_node.get("again"),
            Some(&SerializedNode::Circular { reference: 1 })
        );
        assert_eq!(node.get("me"), Some(&SerializedNode::Circular { reference: 1 }));
    }

    #[test]
    fn shared_siblings_are_serialized_independently() {
        let shared = Value::record([("n", 1)]);
        let parent = Value::record([("a", shared.clone()), ("b", shared)]);

        let node = serialize(&parent, &SerializeOptions::default());
        let expected = SerializedNode::record(vec![("n".to_string(), SerializedNode::Number(1.0))]);
        assert_eq!(node.get("a"), Some(&expected));
        assert_eq!(node.get("b"), Some(&expected));
    }

    #[test]
    fn depth_limit_emits_marker_and_stops() {
        let options = SerializeOptions::default().with_max_depth(3);
        let node = serialize(&nested(5), &options);

        let level3 = node.get("child").unwrap().get("child").unwrap().get("child").unwrap();
        assert_eq!(
            level3,
            &SerializedNode::DepthExceeded {
                type_name: "Object".to_string()
            }
        );
        assert!(level3.get("child").is_none());
    }

    #[test]
    fn values_within_depth_are_untouched() {
        let options = SerializeOptions::default().with_max_depth(3);
        let node = serialize(&nested(2), &options);
        let leaf = node.get("child").unwrap().get("child").unwrap();
        assert_eq!(leaf, &SerializedNode::String("leaf".to_string()));
    }

    #[test]
    fn non_enumerable_properties_follow_option() {
        let mut record = Record::new();
        record.set("visible", 1);
        record.define("hidden", Property::hidden(2));
        let value = record.into_value();

        let default = serialize(&value, &SerializeOptions::default());
        assert!(default.get("hidden").is_none());

        let all = serialize(&value, &SerializeOptions::default().with_non_enumerable(true));
        assert_eq!(all.get("hidden"), Some(&SerializedNode::Number(2.0)));
    }

    #[test]
    fn getter_only_accessors_are_skipped() {
        let mut record = Record::new();
        record.define(
            "computed",
            Property::accessor(getter(|| Err("should not run".to_string())), false),
        );
        record.set("plain", true);

        let node = serialize(&record.into_value(), &SerializeOptions::default());
        assert!(node.get("computed").is_none());
        assert_eq!(node.get("plain"), Some(&SerializedNode::Bool(true)));
    }

    #[test]
    fn failing_accessor_is_scoped_to_its_key() {
        let mut record = Record::new();
        record.define(
            "broken",
            Property::accessor(getter(|| Err("permission denied".to_string())), true),
        );
        record.define(
            "working",
            Property::accessor(getter(|| Ok(Value::from("ok"))), true),
        );
        record.set("after", 1);

        let node = serialize(&record.into_value(), &SerializeOptions::default());
        assert_eq!(
            node.get("broken"),
            Some(&SerializedNode::access_error("permission denied"))
        );
        assert_eq!(
            node.get("working"),
            Some(&SerializedNode::String("ok".to_string()))
        );
        assert_eq!(node.get("after"), Some(&SerializedNode::Number(1.0)));
    }

    #[test]
    fn panicking_accessor_does_not_escape() {
        let mut record = Record::new();
        record.define(
            "explodes",
            Property::accessor(getter(|| panic!("kaboom")), true),
        );
        let node = serialize(&record.into_value(), &SerializeOptions::default());
        assert!(matches!(
            node.get("explodes"),
            Some(SerializedNode::AccessError { .. })
        ));
    }

    #[test]
    fn mutably_borrowed_object_becomes_access_error() {
        let inner = ObjectRef::new(HostObject::Record(Record::new()));
        let outer = Value::record([("inner", inner.clone())]);

        let _held = inner.borrow_mut();
        let node = serialize(&outer, &SerializeOptions::default());
        assert!(matches!(
            node.get("inner"),
            Some(SerializedNode::AccessError { .. })
        ));
    }

    #[test]
    fn custom_handler_runs_before_record_path() {
        let options = SerializeOptions::default().with_handler("Money", |record| {
            let amount = match record.get("cents").map(|p| &p.slot) {
                Some(Slot::Data(Value::Number(n))) => *n / 100.0,
                _ => return Err("missing cents".to_string()),
            };
            Ok(SerializedNode::String(format!("${:.2}", amount)))
        });

        let mut money = Record::with_constructor("Money");
        money.set("cents", 1234);
        let broken = Record::with_constructor("Money");

        let node = serialize(
            &Value::record([("price", money.into_value()), ("bad", broken.into_value())]),
            &options,
        );
        assert_eq!(
            node.get("price"),
            Some(&SerializedNode::String("$12.34".to_string()))
        );
        assert_eq!(node.get("bad"), Some(&SerializedNode::access_error("missing cents")));
    }

    #[test]
    fn error_objects_keep_name_message_and_extras() {
        let mut error = ErrorObject::new("RangeError", "out of bounds");
        error.stack = Some("at main".to_string());
        error.extra.push(("code".to_string(), Value::from("E_RANGE")));

        let node = serialize(&Value::object(HostObject::Error(error)), &SerializeOptions::default());
        let json = node.to_json();
        assert_eq!(json["kind"], "Error");
        assert_eq!(json["name"], "RangeError");
        assert_eq!(json["message"], "out of bounds");
        assert_eq!(json["stack"], "at main");
        assert_eq!(json["code"], "E_RANGE");
    }

    #[test]
    fn map_containing_itself_terminates() {
        let map = ObjectRef::new(HostObject::Map(Vec::new()));
        if let HostObject::Map(entries) = &mut *map.borrow_mut() {
            entries.push((Value::from("me"), Value::Object(map.clone())));
        }

        let node = serialize(&Value::Object(map), &SerializeOptions::default());
        match &node {
            SerializedNode::Typed(TypedValue::Map { entries, anchor }) => {
                assert_eq!(entries[0].1, SerializedNode::Circular { reference: 1 });
                assert_eq!(*anchor, Some(1));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(node.to_json()["$id"], 1);
    }

    #[test]
    fn cycles_through_sets_and_errors_resolve_to_an_anchor() {
        let set = ObjectRef::new(HostObject::Set(Vec::new()));
        if let HostObject::Set(values) = &mut *set.borrow_mut() {
            values.push(Value::Object(set.clone()));
        }
        let json = serialize(&Value::Object(set), &SerializeOptions::default()).to_json();
        assert_eq!(json["$id"], 1);
        assert_eq!(json["values"][0]["ref"], 1);

        let error = ObjectRef::new(HostObject::Error(ErrorObject::new("Error", "wrapped")));
        if let HostObject::Error(inner) = &mut *error.borrow_mut() {
            inner.extra.push(("cause".to_string(), Value::Object(error.clone())));
        }
        let json = serialize(&Value::Object(error), &SerializeOptions::default()).to_json();
        assert_eq!(json["$id"], 1);
        assert_eq!(json["cause"], serde_json::json!({"circular": true, "ref": 1}));
    }

    #[test]
    fn output_is_always_json_encodable() {
        let obj = ObjectRef::new(HostObject::Record(Record::new()));
        obj.set("nan", f64::NAN);
        obj.set("inf", f64::INFINITY);
        obj.set("loop", obj.clone());
        obj.set("deep", nested(20));

        let node = serialize(&Value::Object(obj), &SerializeOptions::default());
        let text = serde_json::to_string(&node).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(reparsed["nan"]["value"], "NaN");
        assert_eq!(reparsed["loop"]["circular"], true);
    }
}
