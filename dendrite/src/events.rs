//! The inbound event contract.
//!
//! External producers (GUI, timers, network) inject events as
//! `(kind, payload)` pairs; the kernel answers by performing the kind's
//! well-known message on the root object with the payload as argument.
//! Payload schemas are fixed per kind and checked before any dispatch.

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::value::Value;
use indexmap::IndexMap;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    MouseDown,
    MouseUp,
    MouseMove,
    Key,
    Custom(String),
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<EventKind> {
        match s {
            "mouseDown" => Ok(EventKind::MouseDown),
            "mouseUp" => Ok(EventKind::MouseUp),
            "mouseMove" => Ok(EventKind::MouseMove),
            "key" => Ok(EventKind::Key),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(EventKind::Custom(name.to_string())),
                _ => Err(Error::Kernel(format!("unknown event kind '{}'", other))),
            },
        }
    }
}

impl EventKind {
    /// The message performed on the root object for this kind.
    pub fn message(&self) -> &str {
        match self {
            EventKind::MouseDown => "mouseDown",
            EventKind::MouseUp => "mouseUp",
            EventKind::MouseMove => "mouseMove",
            EventKind::Key => "key",
            EventKind::Custom(name) => name,
        }
    }

    fn check_payload(&self, payload: &IndexMap<String, Value>) -> Result<()> {
        match self {
            EventKind::MouseDown | EventKind::MouseUp | EventKind::MouseMove => {
                for field in ["x", "y"] {
                    match payload.get(field) {
                        Some(Value::Number(_)) => {}
                        _ => {
                            return Err(Error::Kernel(format!(
                                "mouse event payload needs a numeric '{}'",
                                field
                            )))
                        }
                    }
                }
                Ok(())
            }
            EventKind::Key => match payload.get("key") {
                Some(Value::String(_)) => Ok(()),
                _ => Err(Error::Kernel(
                    "key event payload needs a string 'key'".to_string(),
                )),
            },
            EventKind::Custom(_) => Ok(()),
        }
    }
}

/// Deliver one event to the kernel. Delivery is single-threaded; handlers
/// that call into the foreign runtime serialize behind the gate like any
/// other caller.
pub fn dispatch_event(
    kernel: &Kernel,
    kind: &str,
    payload: &IndexMap<String, Value>,
) -> Result<Value> {
    let kind = kind.parse::<EventKind>()?;
    kind.check_payload(payload)?;
    tracing::trace!(message = kind.message(), "dispatching event");
    kernel.perform(
        kernel.root(),
        kind.message(),
        &[Value::Map(payload.clone())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(entries: Vec<(&str, Value)>) -> IndexMap<String, Value> {
        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }

    #[test]
    fn mouse_events_reach_a_root_handler() {
        let kernel = Kernel::new();
        let handler = kernel.define_method("mouseDown", |kernel, receiver, args| {
            kernel.set_slot(receiver, "last_event", args[0].clone())?;
            Ok(Value::from(true))
        });
        kernel
            .set_slot(kernel.root(), "mouseDown", Value::Object(handler))
            .unwrap();

        let p = payload(vec![("x", Value::from(3.0)), ("y", Value::from(4.0))]);
        let out = dispatch_event(&kernel, "mouseDown", &p).unwrap();
        assert_eq!(out, Value::from(true));
        assert_eq!(
            kernel.get_slot(kernel.root(), "last_event").unwrap(),
            Value::Map(p)
        );
    }

    #[test]
    fn malformed_payloads_never_reach_the_handler() {
        let kernel = Kernel::new();
        let p = payload(vec![("x", Value::from(3.0)), ("y", Value::from("four"))]);
        assert!(dispatch_event(&kernel, "mouseDown", &p).is_err());

        let p = payload(vec![]);
        assert!(dispatch_event(&kernel, "key", &p).is_err());
    }

    #[test]
    fn custom_kinds_use_their_own_message() {
        let kernel = Kernel::new();
        let handler = kernel.define_method("tick", |_, _, args| Ok(args[0].clone()));
        kernel
            .set_slot(kernel.root(), "tick", Value::Object(handler))
            .unwrap();

        let p = payload(vec![("n", Value::from(1.0))]);
        let out = dispatch_event(&kernel, "custom:tick", &p).unwrap();
        assert_eq!(out, Value::Map(p));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let kernel = Kernel::new();
        assert!(dispatch_event(&kernel, "mouseWheel", &payload(vec![])).is_err());
        assert!(dispatch_event(&kernel, "custom:", &payload(vec![])).is_err());
    }
}
