//! Bounded, acyclic output of the serializer and its JSON wire form.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde_json::{json, Map, Value as JsonValue};

/// Tag carried in the `kind` field of every typed wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Undefined,
    Number,
    BigInt,
    Symbol,
    Function,
    Date,
    RegExp,
    Error,
    Map,
    Set,
    ArrayBuffer,
    TypedArray,
    Url,
    SearchParams,
    Headers,
    Request,
    Response,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Undefined => "Undefined",
            TypeTag::Number => "Number",
            TypeTag::BigInt => "BigInt",
            TypeTag::Symbol => "Symbol",
            TypeTag::Function => "Function",
            TypeTag::Date => "Date",
            TypeTag::RegExp => "RegExp",
            TypeTag::Error => "Error",
            TypeTag::Map => "Map",
            TypeTag::Set => "Set",
            TypeTag::ArrayBuffer => "ArrayBuffer",
            TypeTag::TypedArray => "TypedArray",
            TypeTag::Url => "URL",
            TypeTag::SearchParams => "URLSearchParams",
            TypeTag::Headers => "Headers",
            TypeTag::Request => "Request",
            TypeTag::Response => "Response",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonFinite {
    NaN,
    Infinity,
    NegInfinity,
}

impl NonFinite {
    pub fn classify(n: f64) -> Option<NonFinite> {
        if n.is_nan() {
            Some(NonFinite::NaN)
        } else if n == f64::INFINITY {
            Some(NonFinite::Infinity)
        } else if n == f64::NEG_INFINITY {
            Some(NonFinite::NegInfinity)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NonFinite::NaN => "NaN",
            NonFinite::Infinity => "Infinity",
            NonFinite::NegInfinity => "-Infinity",
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            NonFinite::NaN => f64::NAN,
            NonFinite::Infinity => f64::INFINITY,
            NonFinite::NegInfinity => f64::NEG_INFINITY,
        }
    }
}

/// Decomposed URL, mirroring the fields a URL object exposes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UrlParts {
    pub href: String,
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
    pub origin: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body_used: bool,
    pub body: Option<Box<SerializedNode>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body_used: bool,
    pub body: Option<Box<SerializedNode>>,
}

/// Typed wrapper for a recognised built-in.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Undefined,
    NonFinite(NonFinite),
    /// Decimal digits.
    BigInt(String),
    Symbol(Option<String>),
    Function {
        name: String,
        arity: u32,
        source: Option<String>,
    },
    /// ISO-8601 instant; `None` for an invalid date.
    Date(Option<String>),
    RegExp {
        source: String,
        flags: String,
    },
    Error {
        name: String,
        message: String,
        stack: Option<String>,
        extra: Vec<(String, SerializedNode)>,
        anchor: Option<u32>,
    },
    Map {
        entries: Vec<(SerializedNode, SerializedNode)>,
        anchor: Option<u32>,
    },
    Set {
        values: Vec<SerializedNode>,
        anchor: Option<u32>,
    },
    ArrayBuffer(Bytes),
    TypedArray {
        type_name: String,
        length: usize,
        data: Bytes,
    },
    Url(UrlParts),
    SearchParams(Vec<(String, String)>),
    Headers(Vec<(String, String)>),
    Request(RequestSnapshot),
    Response(ResponseSnapshot),
}

impl TypedValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            TypedValue::Undefined => TypeTag::Undefined,
            TypedValue::NonFinite(_) => TypeTag::Number,
            TypedValue::BigInt(_) => TypeTag::BigInt,
            TypedValue::Symbol(_) => TypeTag::Symbol,
            TypedValue::Function { .. } => TypeTag::Function,
            TypedValue::Date(_) => TypeTag::Date,
            TypedValue::RegExp { .. } => TypeTag::RegExp,
            TypedValue::Error { .. } => TypeTag::Error,
            TypedValue::Map { .. } => TypeTag::Map,
            TypedValue::Set { .. } => TypeTag::Set,
            TypedValue::ArrayBuffer(_) => TypeTag::ArrayBuffer,
            TypedValue::TypedArray { .. } => TypeTag::TypedArray,
            TypedValue::Url(_) => TypeTag::Url,
            TypedValue::SearchParams(_) => TypeTag::SearchParams,
            TypedValue::Headers(_) => TypeTag::Headers,
            TypedValue::Request(_) => TypeTag::Request,
            TypedValue::Response(_) => TypeTag::Response,
        }
    }
}

/// One node of the serializer output. Always acyclic and JSON-encodable.
#[derive(Clone, Debug, PartialEq)]
pub enum SerializedNode {
    Null,
    Bool(bool),
    /// Finite numbers only; non-finite values are typed wrappers.
    Number(f64),
    String(String),
    Array {
        items: Vec<SerializedNode>,
        anchor: Option<u32>,
    },
    Record {
        constructor: Option<String>,
        fields: Vec<(String, SerializedNode)>,
        anchor: Option<u32>,
    },
    Typed(TypedValue),
    /// Back-reference to an object already on the active path.
    Circular { reference: u32 },
    DepthExceeded { type_name: String },
    AccessError { message: String },
}

impl SerializedNode {
    pub fn number(n: f64) -> Self {
        match NonFinite::classify(n) {
            Some(non_finite) => SerializedNode::Typed(TypedValue::NonFinite(non_finite)),
            None => SerializedNode::Number(n),
        }
    }

    pub fn record(fields: Vec<(String, SerializedNode)>) -> Self {
        SerializedNode::Record {
            constructor: None,
            fields,
            anchor: None,
        }
    }

    pub fn access_error(message: impl Into<String>) -> Self {
        SerializedNode::AccessError {
            message: message.into(),
        }
    }

    /// Field lookup on records.
    pub fn get(&self, key: &str) -> Option<&SerializedNode> {
        match self {
            SerializedNode::Record { fields, .. } => {
                fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<TypeTag> {
        match self {
            SerializedNode::Typed(typed) => Some(typed.tag()),
            _ => None,
        }
    }

    /// Marks a node as the target of circular references. Only containers
    /// can be on the active path, so other nodes are left alone.
    pub(crate) fn set_anchor(&mut self, id: u32) {
        match self {
            SerializedNode::Array { anchor, .. }
            | SerializedNode::Record { anchor, .. }
            | SerializedNode::Typed(TypedValue::Map { anchor, .. })
            | SerializedNode::Typed(TypedValue::Set { anchor, .. })
            | SerializedNode::Typed(TypedValue::Error { anchor, .. }) => *anchor = Some(id),
            _ => {}
        }
    }

    /// Wire form. Typed wrappers become `{"kind": ..., ...}`, markers become
    /// flagged objects, anchors are written as `"$id"`. User keys that would
    /// read as `$id` or `$constructor` get one more leading `$`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SerializedNode::Null => JsonValue::Null,
            SerializedNode::Bool(b) => JsonValue::Bool(*b),
            SerializedNode::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SerializedNode::String(s) => JsonValue::String(s.clone()),
            SerializedNode::Array { items, anchor } => {
                let items: Vec<JsonValue> = items.iter().map(|n| n.to_json()).collect();
                match anchor {
                    // An array has nowhere to carry an id, so anchored arrays are boxed.
                    Some(id) => json!({ "$id": id, "items": items }),
                    None => JsonValue::Array(items),
                }
            }
            SerializedNode::Record {
                constructor,
                fields,
                anchor,
            } => {
                let mut map = Map::new();
                if let Some(name) = constructor {
                    map.insert("$constructor".to_string(), JsonValue::String(name.clone()));
                }
                if let Some(id) = anchor {
                    map.insert("$id".to_string(), json!(id));
                }
                for (key, node) in fields {
                    map.insert(escape_key(key), node.to_json());
                }
                JsonValue::Object(map)
            }
            SerializedNode::Typed(typed) => typed_to_json(typed),
            SerializedNode::Circular { reference } => {
                json!({ "circular": true, "ref": reference })
            }
            SerializedNode::DepthExceeded { type_name } => {
                json!({ "depthExceeded": true, "type": type_name })
            }
            SerializedNode::AccessError { message } => {
                json!({ "accessError": true, "message": message })
            }
        }
    }

    /// Converts parsed JSON into nodes. Objects become unanchored records
    /// without a constructor; no typed wrappers are inferred.
    pub fn from_json(json: &JsonValue) -> Self {
        Self::from_json_within(json, 0, usize::MAX)
    }

    /// Like [`from_json`](Self::from_json) for JSON found at `depth` of a
    /// traversal: objects and arrays at `max_depth` or deeper become
    /// depth-exceeded markers.
    pub(crate) fn from_json_within(json: &JsonValue, depth: usize, max_depth: usize) -> Self {
        match json {
            JsonValue::Null => SerializedNode::Null,
            JsonValue::Bool(b) => SerializedNode::Bool(*b),
            JsonValue::Number(n) => SerializedNode::number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => SerializedNode::String(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) if depth >= max_depth => {
                SerializedNode::DepthExceeded {
                    type_name: if json.is_array() { "Array" } else { "Object" }.to_string(),
                }
            }
            JsonValue::Array(items) => SerializedNode::Array {
                items: items
                    .iter()
                    .map(|v| Self::from_json_within(v, depth + 1, max_depth))
                    .collect(),
                anchor: None,
            },
            JsonValue::Object(map) => SerializedNode::record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json_within(v, depth + 1, max_depth)))
                    .collect(),
            ),
        }
    }
}

impl serde::Serialize for SerializedNode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn escape_key(key: &str) -> String {
    let bare = key.trim_start_matches('$');
    if bare.len() < key.len() && (bare == "id" || bare == "constructor") {
        format!("${}", key)
    } else {
        key.to_string()
    }
}

fn pairs_to_json(pairs: &[(String, String)]) -> JsonValue {
    JsonValue::Array(pairs.iter().map(|(k, v)| json!([k, v])).collect())
}

fn headers_to_json(headers: &[(String, String)]) -> JsonValue {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.clone(), JsonValue::String(value.clone()));
    }
    JsonValue::Object(map)
}

fn typed_to_json(typed: &TypedValue) -> JsonValue {
    let mut map = Map::new();
    map.insert("kind".to_string(), json!(typed.tag().as_str()));
    match typed {
        TypedValue::Undefined => {}
        TypedValue::NonFinite(n) => {
            map.insert("value".to_string(), json!(n.as_str()));
        }
        TypedValue::BigInt(digits) => {
            map.insert("value".to_string(), json!(digits));
        }
        TypedValue::Symbol(description) => {
            map.insert("description".to_string(), json!(description));
        }
        TypedValue::Function {
            name,
            arity,
            source,
        } => {
            map.insert("name".to_string(), json!(name));
            map.insert("arity".to_string(), json!(arity));
            if let Some(source) = source {
                map.insert("source".to_string(), json!(source));
            }
        }
        TypedValue::Date(iso) => {
            map.insert("iso".to_string(), json!(iso));
            if iso.is_none() {
                map.insert("invalid".to_string(), json!(true));
            }
        }
        TypedValue::RegExp { source, flags } => {
            map.insert("source".to_string(), json!(source));
            map.insert("flags".to_string(), json!(flags));
        }
        TypedValue::Error {
            name,
            message,
            stack,
            extra,
            anchor,
        } => {
            if let Some(id) = anchor {
                map.insert("$id".to_string(), json!(id));
            }
            map.insert("name".to_string(), json!(name));
            map.insert("message".to_string(), json!(message));
            if let Some(stack) = stack {
                map.insert("stack".to_string(), json!(stack));
            }
            for (key, node) in extra {
                // Own props never shadow the standard fields.
                let key = escape_key(key);
                if !map.contains_key(&key) {
                    map.insert(key, node.to_json());
                }
            }
        }
        TypedValue::Map { entries, anchor } => {
            if let Some(id) = anchor {
                map.insert("$id".to_string(), json!(id));
            }
            let entries: Vec<JsonValue> = entries
                .iter()
                .map(|(k, v)| JsonValue::Array(vec![k.to_json(), v.to_json()]))
                .collect();
            map.insert("entries".to_string(), JsonValue::Array(entries));
        }
        TypedValue::Set { values, anchor } => {
            if let Some(id) = anchor {
                map.insert("$id".to_string(), json!(id));
            }
            let values: Vec<JsonValue> = values.iter().map(|v| v.to_json()).collect();
            map.insert("values".to_string(), JsonValue::Array(values));
        }
        TypedValue::ArrayBuffer(bytes) => {
            map.insert("byteLength".to_string(), json!(bytes.len()));
            map.insert("data".to_string(), json!(STANDARD.encode(bytes)));
        }
        TypedValue::TypedArray {
            type_name,
            length,
            data,
        } => {
            map.insert("type".to_string(), json!(type_name));
            map.insert("length".to_string(), json!(length));
            map.insert("byteLength".to_string(), json!(data.len()));
            map.insert("data".to_string(), json!(STANDARD.encode(data)));
        }
        TypedValue::Url(parts) => {
            map.insert("href".to_string(), json!(parts.href));
            map.insert("protocol".to_string(), json!(parts.protocol));
            map.insert("host".to_string(), json!(parts.host));
            map.insert("hostname".to_string(), json!(parts.hostname));
            map.insert("port".to_string(), json!(parts.port));
            map.insert("pathname".to_string(), json!(parts.pathname));
            map.insert("search".to_string(), json!(parts.search));
            map.insert("hash".to_string(), json!(parts.hash));
            map.insert("origin".to_string(), json!(parts.origin));
        }
        TypedValue::SearchParams(pairs) => {
            map.insert("entries".to_string(), pairs_to_json(pairs));
            map.insert(
                "query".to_string(),
                json!(super::builtins::encode_query(pairs)),
            );
        }
        TypedValue::Headers(headers) => {
            map.insert("entries".to_string(), headers_to_json(headers));
        }
        TypedValue::Request(request) => {
            map.insert("method".to_string(), json!(request.method));
            map.insert("url".to_string(), json!(request.url));
            map.insert("headers".to_string(), headers_to_json(&request.headers));
            map.insert("bodyUsed".to_string(), json!(request.body_used));
            if let Some(body) = &request.body {
                map.insert("body".to_string(), body.to_json());
            }
        }
        TypedValue::Response(response) => {
            map.insert("status".to_string(), json!(response.status));
            map.insert("statusText".to_string(), json!(response.status_text));
            map.insert(
                "ok".to_string(),
                json!((200..300).contains(&response.status)),
            );
            map.insert("url".to_string(), json!(response.url));
            map.insert("headers".to_string(), headers_to_json(&response.headers));
            map.insert("bodyUsed".to_string(), json!(response.body_used));
            if let Some(body) = &response.body {
                map.insert("body".to_string(), body.to_json());
            }
        }
    }
    JsonValue::Object(map)
}
