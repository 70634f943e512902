//! Dynamic value model for data handed to the logger.
//!
//! Objects are shared, mutable and identity-bearing (`Rc<RefCell<_>>`), so an
//! application can build graphs with shared children and reference cycles the
//! same way it would in a dynamic runtime. The serializer walks this model.

use bytes::Bytes;
use reqwest::Url;
use std::cell::{BorrowError, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// Accessor callback. Errors are reported as strings and never propagate
/// out of the serializer.
pub type Getter = Rc<dyn Fn() -> Result<Value, String>>;

/// An arbitrary application value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    BigInt(i128),
    /// Unique symbolic name, optionally described.
    Symbol(Option<String>),
    Function(FunctionInfo),
    Object(ObjectRef),
}

/// Function metadata. `source` is only emitted when the caller opts in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub arity: u32,
    pub source: Option<String>,
}

/// Shared handle to a host object. Cloning shares identity.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<HostObject>>);

impl ObjectRef {
    pub fn new(object: HostObject) -> Self {
        Self(Rc::new(RefCell::new(object)))
    }

    pub fn try_borrow(&self) -> Result<Ref<'_, HostObject>, BorrowError> {
        self.0.try_borrow()
    }

    /// Mutable access, used to close cycles after construction.
    ///
    /// Panics if the object is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, HostObject> {
        self.0.borrow_mut()
    }

    /// Stable identity of the underlying allocation.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Sets a data property when the object is a plain record. Other shapes
    /// are left untouched.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let HostObject::Record(record) = &mut *self.0.borrow_mut() {
            record.set(key, value);
        }
    }

    /// Appends an element when the object is an array.
    pub fn push(&self, value: impl Into<Value>) {
        if let HostObject::Array(items) = &mut *self.0.borrow_mut() {
            items.push(value.into());
        }
    }
}

impl fmt::Debug for ObjectRef {
    // Cycles make a derived Debug recurse forever.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_name = self
            .try_borrow()
            .map(|o| o.type_name())
            .unwrap_or_else(|_| "<borrowed>".to_string());
        write!(f, "ObjectRef({} @ {:#x})", type_name, self.identity())
    }
}

/// The closed set of object shapes the serializer recognises.
#[derive(Clone, Debug)]
pub enum HostObject {
    Record(Record),
    Array(Vec<Value>),
    /// Milliseconds since the Unix epoch; `None` is an invalid date.
    Date(Option<i64>),
    RegExp {
        source: String,
        flags: String,
    },
    Error(ErrorObject),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    ArrayBuffer(Bytes),
    TypedArray(TypedArray),
    Url(Url),
    SearchParams(Vec<(String, String)>),
    Headers(Vec<(String, String)>),
    Request(HttpRequest),
    Response(HttpResponse),
}

impl HostObject {
    /// Runtime type name, as reported in depth-exceeded markers.
    pub fn type_name(&self) -> String {
        match self {
            HostObject::Record(record) => record
                .constructor
                .clone()
                .unwrap_or_else(|| "Object".to_string()),
            HostObject::Array(_) => "Array".to_string(),
            HostObject::Date(_) => "Date".to_string(),
            HostObject::RegExp { .. } => "RegExp".to_string(),
            HostObject::Error(error) => error.name.clone(),
            HostObject::Map(_) => "Map".to_string(),
            HostObject::Set(_) => "Set".to_string(),
            HostObject::ArrayBuffer(_) => "ArrayBuffer".to_string(),
            HostObject::TypedArray(view) => view.kind.name().to_string(),
            HostObject::Url(_) => "URL".to_string(),
            HostObject::SearchParams(_) => "URLSearchParams".to_string(),
            HostObject::Headers(_) => "Headers".to_string(),
            HostObject::Request(_) => "Request".to_string(),
            HostObject::Response(_) => "Response".to_string(),
        }
    }
}

/// Ordered property bag with an optional constructor name.
#[derive(Clone, Debug, Default)]
pub struct Record {
    pub constructor: Option<String>,
    pub properties: Vec<(String, Property)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constructor(name: impl Into<String>) -> Self {
        Self {
            constructor: Some(name.into()),
            properties: Vec::new(),
        }
    }

    /// Sets an enumerable data property, replacing an existing key in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.define(key, Property::data(value));
    }

    pub fn define(&mut self, key: impl Into<String>, property: Property) {
        let key = key.into();
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = property,
            None => self.properties.push((key, property)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, p)| p)
    }

    pub fn into_value(self) -> Value {
        Value::Object(ObjectRef::new(HostObject::Record(self)))
    }
}

#[derive(Clone)]
pub enum Slot {
    Data(Value),
    Accessor {
        get: Option<Getter>,
        has_setter: bool,
    },
}

#[derive(Clone)]
pub struct Property {
    pub slot: Slot,
    pub enumerable: bool,
}

impl Property {
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            slot: Slot::Data(value.into()),
            enumerable: true,
        }
    }

    pub fn hidden(value: impl Into<Value>) -> Self {
        Self {
            slot: Slot::Data(value.into()),
            enumerable: false,
        }
    }

    pub fn accessor(get: Getter, has_setter: bool) -> Self {
        Self {
            slot: Slot::Accessor {
                get: Some(get),
                has_setter,
            },
            enumerable: true,
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Data(value) => f
                .debug_struct("Property")
                .field("value", value)
                .field("enumerable", &self.enumerable)
                .finish(),
            Slot::Accessor { get, has_setter } => f
                .debug_struct("Property")
                .field("getter", &get.is_some())
                .field("setter", has_setter)
                .field("enumerable", &self.enumerable)
                .finish(),
        }
    }
}

/// Error object: the standard fields plus any own extra properties.
#[derive(Clone, Debug)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub extra: Vec<(String, Value)>,
}

impl ErrorObject {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            extra: Vec::new(),
        }
    }

    /// Captures a Rust error, including its source chain as `cause`.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut object = Self::new("Error", error.to_string());
        if let Some(source) = error.source() {
            let cause = Self::from_error(source);
            object.extra.push((
                "cause".to_string(),
                Value::Object(ObjectRef::new(HostObject::Error(cause))),
            ));
        }
        object
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl TypedArrayKind {
    pub fn name(&self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
            TypedArrayKind::BigInt64 => "BigInt64Array",
            TypedArrayKind::BigUint64 => "BigUint64Array",
            TypedArrayKind::DataView => "DataView",
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            TypedArrayKind::Int8
            | TypedArrayKind::Uint8
            | TypedArrayKind::Uint8Clamped
            | TypedArrayKind::DataView => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 | TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => 8,
        }
    }

    pub fn all() -> &'static [TypedArrayKind] {
        &[
            TypedArrayKind::Int8,
            TypedArrayKind::Uint8,
            TypedArrayKind::Uint8Clamped,
            TypedArrayKind::Int16,
            TypedArrayKind::Uint16,
            TypedArrayKind::Int32,
            TypedArrayKind::Uint32,
            TypedArrayKind::Float32,
            TypedArrayKind::Float64,
            TypedArrayKind::BigInt64,
            TypedArrayKind::BigUint64,
            TypedArrayKind::DataView,
        ]
    }

    pub fn from_name(name: &str) -> Option<TypedArrayKind> {
        Self::all().iter().copied().find(|k| k.name() == name)
    }
}

/// Typed view over a byte buffer.
#[derive(Clone, Debug)]
pub struct TypedArray {
    pub kind: TypedArrayKind,
    pub buffer: Bytes,
}

impl TypedArray {
    /// Element count; trailing bytes that do not fill an element are ignored.
    pub fn len(&self) -> usize {
        self.buffer.len() / self.kind.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of a request or response.
#[derive(Clone, Debug)]
pub struct HttpBody {
    /// The stream was already consumed by the application.
    pub used: bool,
    /// Result of reading the body; `Err` carries the read failure.
    pub content: Result<Bytes, String>,
}

impl HttpBody {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            used: false,
            content: Ok(content.into()),
        }
    }

    pub fn consumed() -> Self {
        Self {
            used: true,
            content: Ok(Bytes::new()),
        }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            used: false,
            content: Err(reason.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HttpBody>,
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<HttpBody>,
}

impl Value {
    pub fn object(object: HostObject) -> Self {
        Value::Object(ObjectRef::new(object))
    }

    /// Plain record from key/value pairs, in order.
    pub fn record<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Record::new();
        for (key, value) in pairs {
            record.set(key, value);
        }
        record.into_value()
    }

    pub fn array<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Value::object(HostObject::Array(
            items.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn date_millis(millis: i64) -> Self {
        Value::object(HostObject::Date(Some(millis)))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::object(HostObject::Error(ErrorObject::new(name, message)))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

impl From<HostObject> for Value {
    fn from(v: HostObject) -> Self {
        Value::object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from))
            }
            serde_json::Value::Object(map) => Value::record(map),
        }
    }
}
