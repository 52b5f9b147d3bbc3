//! The contract expected of the foreign numeric runtime.
//!
//! The interpreter itself is an external collaborator; the kernel only
//! depends on the shapes below. Primitives cross the boundary by value,
//! everything else crosses as a [`ForeignRef`] into the runtime's heap,
//! introspectable through [`ForeignHeap`]. Errors cross exactly once, as a
//! [`ForeignErrorRecord`].
//!
//! One implementation ships with the crate: [`EmbeddedRuntime`], an
//! expression interpreter with reference-semantics collections and a small
//! module library, standing in for an out-of-process numeric runtime.

mod embedded;

pub use embedded::EmbeddedRuntime;

use crate::bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference into the foreign runtime's heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignRef(pub u64);

impl fmt::Display for ForeignRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A value as it crosses the gate. Compounds and opaque objects cross as
/// refs; only primitives are carried inline.
#[derive(Clone, Debug, PartialEq)]
pub enum ForeignValue {
    Null,
    Bool(bool),
    Float(f64),
    Str(String),
    Ref(ForeignRef),
}

/// What a [`ForeignRef`] turned out to be, as reported by introspection.
#[derive(Clone, Debug)]
pub enum ForeignRepr {
    /// Ordered sequence; may be cyclic through refs.
    Seq(Vec<ForeignValue>),
    /// Key/value pairs in insertion order. Keys are arbitrary foreign
    /// values; the marshaller insists on strings.
    Dict(Vec<(ForeignValue, ForeignValue)>),
    /// A proxy for a kernel object, carrying the handle id it was built
    /// from.
    Proxy(String),
    /// A callable (function or bound builtin).
    Callable { name: String },
    /// A loaded module.
    Module { name: String },
    /// Anything else the runtime cannot decompose.
    Opaque { type_name: String },
}

/// Structured record of a foreign exception, captured at the gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForeignErrorRecord {
    /// Coarse classification (`RuntimeError`, `SyntaxError`, ...), used to
    /// pick the kernel-side error variant.
    pub kind: String,
    pub message: String,
    pub traceback: Vec<String>,
    /// The foreign exception type's own name (`TypeError`, `NameError`, ...).
    pub foreign_type_name: String,
    /// Byte offset for syntax errors.
    pub position: Option<usize>,
}

impl ForeignErrorRecord {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        foreign_type_name: impl Into<String>,
    ) -> ForeignErrorRecord {
        ForeignErrorRecord {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
            foreign_type_name: foreign_type_name.into(),
            position: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> ForeignErrorRecord {
        self.traceback = traceback;
        self
    }

    pub fn with_position(mut self, position: usize) -> ForeignErrorRecord {
        self.position = Some(position);
        self
    }
}

impl fmt::Display for ForeignErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.foreign_type_name, self.message)
    }
}

/// Result type used on the foreign side of the gate.
pub type FResult<T> = std::result::Result<T, ForeignErrorRecord>;

/// Heap surface of the runtime: enough to build and inspect foreign values
/// without evaluating code. The marshaller works exclusively against this.
pub trait ForeignHeap {
    fn introspect(&self, r: ForeignRef) -> FResult<ForeignRepr>;
    fn make_seq(&mut self, items: Vec<ForeignValue>) -> ForeignRef;
    fn make_dict(&mut self, entries: Vec<(String, ForeignValue)>) -> ForeignRef;
    fn make_proxy(&mut self, handle_id: &str) -> ForeignRef;
    fn retain_ref(&mut self, r: ForeignRef);
    fn release_ref(&mut self, r: ForeignRef);
}

/// Callback surface foreign code uses to reach back into the kernel when
/// it holds a proxy. The heap is passed in so results can be built without
/// re-entering the runtime.
pub trait ProxyDispatch: Sync {
    fn get_slot(
        &self,
        handle_id: &str,
        name: &str,
        heap: &mut dyn ForeignHeap,
    ) -> FResult<ForeignValue>;

    fn set_slot(
        &self,
        handle_id: &str,
        name: &str,
        value: ForeignValue,
        heap: &mut dyn ForeignHeap,
    ) -> FResult<()>;

    fn perform(
        &self,
        handle_id: &str,
        message: &str,
        args: &[ForeignValue],
        heap: &mut dyn ForeignHeap,
    ) -> FResult<ForeignValue>;

    fn clone_object(&self, handle_id: &str, heap: &mut dyn ForeignHeap) -> FResult<ForeignValue>;
}

/// The full runtime contract. Every method is invoked with the gate held.
pub trait ForeignRuntime: Send {
    fn initialize(&mut self, config: &BridgeConfig) -> FResult<()>;

    /// Evaluate a source fragment with `bindings` visible as names.
    fn eval(
        &mut self,
        code: &str,
        bindings: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue>;

    fn load_module(&mut self, name: &str) -> FResult<ForeignRef>;

    /// Attribute access on a module or object; may yield a non-callable.
    fn get_attr(&mut self, target: ForeignRef, name: &str) -> FResult<ForeignValue>;

    fn call(
        &mut self,
        callable: ForeignRef,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue>;

    fn instantiate(
        &mut self,
        class: ForeignRef,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignRef>;

    fn call_method(
        &mut self,
        target: ForeignRef,
        name: &str,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue>;

    /// The runtime's heap, for marshalling.
    fn as_heap(&mut self) -> &mut dyn ForeignHeap;
}

/// A dispatcher that refuses every proxy callback; used where no kernel is
/// reachable (tests, teardown).
pub struct NoProxies;

impl ProxyDispatch for NoProxies {
    fn get_slot(
        &self,
        _handle_id: &str,
        _name: &str,
        _heap: &mut dyn ForeignHeap,
    ) -> FResult<ForeignValue> {
        Err(ForeignErrorRecord::new(
            "RuntimeError",
            "no proxy dispatcher installed",
            "RuntimeError",
        ))
    }

    fn set_slot(
        &self,
        _handle_id: &str,
        _name: &str,
        _value: ForeignValue,
        _heap: &mut dyn ForeignHeap,
    ) -> FResult<()> {
        Err(ForeignErrorRecord::new(
            "RuntimeError",
            "no proxy dispatcher installed",
            "RuntimeError",
        ))
    }

    fn perform(
        &self,
        _handle_id: &str,
        _message: &str,
        _args: &[ForeignValue],
        _heap: &mut dyn ForeignHeap,
    ) -> FResult<ForeignValue> {
        Err(ForeignErrorRecord::new(
            "RuntimeError",
            "no proxy dispatcher installed",
            "RuntimeError",
        ))
    }

    fn clone_object(
        &self,
        _handle_id: &str,
        _heap: &mut dyn ForeignHeap,
    ) -> FResult<ForeignValue> {
        Err(ForeignErrorRecord::new(
            "RuntimeError",
            "no proxy dispatcher installed",
            "RuntimeError",
        ))
    }
}
