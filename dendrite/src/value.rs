//! The tagged value model shared by the kernel, the bridge and the log.
//!
//! Primitives, lists and maps compare structurally; objects and foreign
//! handles compare by identity. Lists and maps are tree values on this side
//! of the bridge; reference semantics only exist for objects (via the
//! kernel arena) and for foreign values (via handles).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique, stable identifier of a kernel object.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the bridge owns the wrapped object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// Wraps a kernel object exposed to foreign code.
    NativeToForeign,
    /// Wraps an opaque foreign object exposed to the kernel.
    ForeignToNative,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandleKind::NativeToForeign => write!(f, "n2f"),
            HandleKind::ForeignToNative => write!(f, "f2n"),
        }
    }
}

impl std::str::FromStr for HandleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "n2f" => Ok(HandleKind::NativeToForeign),
            "f2n" => Ok(HandleKind::ForeignToNative),
            other => Err(format!("unknown handle kind '{}'", other)),
        }
    }
}

/// Reference to an entry in the handle registry.
///
/// Two refs are equal iff their ids are equal; the kind tags along so that
/// a ref can be logged and re-resolved without consulting the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub handle_id: String,
    pub kind: HandleKind,
}

/// A value as seen by the kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, derive_more::From)]
pub enum Value {
    Nil,
    #[from]
    Bool(bool),
    #[from]
    Number(f64),
    #[from]
    String(String),
    #[from]
    List(Vec<Value>),
    #[from]
    Map(IndexMap<String, Value>),
    #[from]
    Object(ObjectId),
    #[from]
    ForeignHandle(HandleRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&HandleRef> {
        match self {
            Value::ForeignHandle(handle) => Some(handle),
            _ => None,
        }
    }

    /// Short name of the value's kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::ForeignHandle(_) => "foreign-handle",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use proptest::prelude::*;

    /// Strategy over values with no object or handle references and no
    /// non-finite numbers, suitable for round-trip properties.
    pub(crate) fn arb_plain_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            (-1.0e12f64..1.0e12).prop_map(Value::Number),
            "[ -~]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..5).prop_map(Value::List),
                // Keys include spaces on purpose: boundary whitespace must
                // survive encoding and field trimming.
                prop::collection::vec(("[a-z ]{1,6}", inner), 0..5).prop_map(|entries| {
                    Value::Map(entries.into_iter().collect::<IndexMap<String, Value>>())
                }),
            ]
        })
    }
}
