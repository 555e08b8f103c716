//! Runtime value graph.
//!
//! Values cross the wire between client stubs and registered handlers. Besides
//! plain data the graph carries shared nodes (one allocation reachable from
//! several places), deferred values that settle after the root has been sent,
//! and stable references minted by `ref$`.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// VALUE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Decimal digits, optionally signed.
    BigInt(String),
    String(String),
    Array(Vec<Value>),
    /// Entries in insertion order.
    Object(Vec<(String, Value)>),
    /// A node whose identity survives serialization.
    Shared(Arc<Value>),
    Error { name: String, message: String },
    Reference(Arc<StableReference>),
    Deferred(Deferred),
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String(value.into())
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Error {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn shared(value: Value) -> Self {
        Value::Shared(Arc::new(value))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn reference(id: impl Into<String>, value: Value) -> Self {
        Value::Reference(Arc::new(StableReference {
            id: id.into(),
            value,
        }))
    }

    /// Looks through shared wrappers.
    pub fn resolved(&self) -> &Value {
        match self {
            Value::Shared(inner) => inner.resolved(),
            other => other,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.resolved() {
            Value::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.resolved() {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.resolved() {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.resolved() {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.resolved(), Value::Undefined)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Shared(a), Value::Shared(b)) => Arc::ptr_eq(a, b) || a == b,
            (
                Value::Error { name, message },
                Value::Error {
                    name: other_name,
                    message: other_message,
                },
            ) => name == other_name && message == other_message,
            (Value::Reference(a), Value::Reference(b)) => a.id == b.id,
            (Value::Deferred(a), Value::Deferred(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::BigInt(digits) => write!(f, "{}n", digits),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Value::Shared(inner) => write!(f, "&{:?}", inner),
            Value::Error { name, message } => write!(f, "{}({:?})", name, message),
            Value::Reference(reference) => write!(f, "ref({:?})", reference.id),
            Value::Deferred(_) => f.write_str("<deferred>"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Error { name, message } => write!(f, "{}: {}", name, message),
            Value::String(s) => f.write_str(s),
            Value::Shared(inner) => fmt::Display::fmt(inner.as_ref(), f),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABLE REFERENCES
// ═══════════════════════════════════════════════════════════════════════════════

/// A value given a durable identity by `ref$`. Only the id travels; each side
/// resolves it against its own reference table.
#[derive(Debug)]
pub struct StableReference {
    pub id: String,
    pub value: Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFERRED VALUES
// ═══════════════════════════════════════════════════════════════════════════════

pub type Settlement = Result<Value, Value>;

/// A value that settles later. Cloning shares the same pending computation.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<Shared<BoxFuture<'static, Settlement>>>,
}

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Settlement> + Send + 'static,
    {
        Deferred {
            inner: Arc::new(future.boxed().shared()),
        }
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(error: Value) -> Self {
        Self::new(futures::future::ready(Err(error)))
    }

    /// Waits for the value to settle.
    pub async fn settle(&self) -> Settlement {
        self.inner.as_ref().clone().await
    }

    pub(crate) fn ptr_eq(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl From<Deferred> for Value {
    fn from(deferred: Deferred) -> Self {
        Value::Deferred(deferred)
    }
}
