//! Dynamically typed named values
//!
//! Action parameters and workflow data fields are heterogeneous mappings of
//! `String -> Value`. [`NamedValues`] preserves insertion order, which matters
//! for persistence and for the event log. Typed access goes through the
//! [`ValueCodec`] trait so mismatches fail with a clear error instead of a
//! silent coercion.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// The sort of a [`Value`], used by data-field declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Timestamp,
    Handle,
}

/// A tagged dynamic value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Handle(OperationHandle),
}

impl Value {
    /// The kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Handle(_) => ValueKind::Handle,
        }
    }

    /// True when this value equals the zero value of its kind
    ///
    /// Writing a zero value into a persistent data field removes the entry.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Timestamp(t) => *t == zero_timestamp(),
            Value::Handle(_) => false,
        }
    }

    /// String form used when logging event parameters
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("{} bytes", b.len()),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Handle(h) => format!("operation #{}", h.id()),
        }
    }
}

fn zero_timestamp() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

/// Opaque handle to an in-progress operation, exported through action
/// parameters
///
/// The handle is safe to move across threads; disposing it marshals back onto
/// the owning workflow's scheduler. Disposing twice is a no-op.
#[derive(Clone)]
pub struct OperationHandle {
    id: u64,
    state: Arc<HandleState>,
}

struct HandleState {
    id: u64,
    disposed: AtomicBool,
    disposer: Option<Box<dyn Fn(u64) + Send + Sync>>,
}

// a handle abandoned by every holder must still release its operation
impl Drop for HandleState {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            if let Some(disposer) = &self.disposer {
                disposer(self.id);
            }
        }
    }
}

impl OperationHandle {
    /// Create a live handle whose disposal invokes `disposer` exactly once
    pub(crate) fn new(id: u64, disposer: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            id,
            state: Arc::new(HandleState {
                id,
                disposed: AtomicBool::new(false),
                disposer: Some(Box::new(disposer)),
            }),
        }
    }

    /// A handle with no backing operation (deserialized or zero value)
    pub fn detached(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(HandleState {
                id,
                disposed: AtomicBool::new(true),
                disposer: None,
            }),
        }
    }

    /// Identity of the underlying operation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Release the operation; idempotent across clones
    pub fn dispose(&self) {
        if !self.state.disposed.swap(true, Ordering::AcqRel) {
            if let Some(disposer) = &self.state.disposer {
                disposer(self.id);
            }
        }
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("disposed", &self.state.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl PartialEq for OperationHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Serialize for OperationHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.id)
    }
}

impl<'de> Deserialize<'de> for OperationHandle {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let id = u64::deserialize(deserializer)?;
        Ok(OperationHandle::detached(id))
    }
}

/// Conversion between Rust types and [`Value`]
pub trait ValueCodec: Sized {
    /// The kind this type maps to
    fn kind() -> ValueKind;

    /// Decode, failing on a kind mismatch
    fn from_value(value: &Value) -> Result<Self>;

    /// Encode
    fn to_value(&self) -> Value;

    /// The zero value returned when a data field is absent
    fn zero() -> Self;
}

macro_rules! impl_codec {
    ($ty:ty, $kind:ident, $variant:ident, $zero:expr) => {
        impl ValueCodec for $ty {
            fn kind() -> ValueKind {
                ValueKind::$kind
            }

            fn from_value(value: &Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v.clone()),
                    other => Err(WorkflowError::invalid_usage(format!(
                        "expected {:?} value, found {:?}",
                        ValueKind::$kind,
                        other.kind()
                    ))),
                }
            }

            fn to_value(&self) -> Value {
                Value::$variant(self.clone())
            }

            fn zero() -> Self {
                $zero
            }
        }
    };
}

impl_codec!(bool, Bool, Bool, false);
impl_codec!(i64, Int, Int, 0);
impl_codec!(f64, Float, Float, 0.0);
impl_codec!(String, String, String, String::new());
impl_codec!(Vec<u8>, Bytes, Bytes, Vec::new());
impl_codec!(DateTime<Utc>, Timestamp, Timestamp, zero_timestamp());
impl_codec!(OperationHandle, Handle, Handle, OperationHandle::detached(0));

/// Insertion-ordered mapping of `String -> Value`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedValues {
    entries: Vec<(String, Value)>,
}

impl NamedValues {
    /// An empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Insert or replace, preserving the original position on replace
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Typed read; `NotFound` when the name is absent
    pub fn get_as<T: ValueCodec>(&self, name: &str) -> Result<T> {
        match self.get(name) {
            Some(value) => T::from_value(value),
            None => Err(WorkflowError::not_found(format!("value '{name}'"))),
        }
    }

    /// Typed write
    pub fn set_from<T: ValueCodec>(&mut self, name: impl Into<String>, value: &T) {
        self.set(name, value.to_value());
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Stringified form of every entry, for the event log
    pub fn to_display_map(&self) -> std::collections::BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(n, v)| (n.clone(), v.to_display_string()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for NamedValues {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut values = NamedValues::new();
        for (name, value) in iter {
            values.set(name, value);
        }
        values
    }
}
