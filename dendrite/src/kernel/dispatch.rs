//! Message dispatch.
//!
//! Resolution is a tagged step (`Resolved`, `Forward` or `Missing`) and
//! the dispatcher interprets the outcome uniformly: invocable values run
//! with `self` bound to the receiver, plain values are field accesses, and
//! a missing slot falls back to `forward` before failing with
//! `DoesNotUnderstand`. Errors unwind send frames until a `rescue` slot on
//! the receiver or an ancestor catches them.

use super::{lookup, Kernel};
use crate::error::{Error, Result};
use crate::value::{ObjectId, Value};
use indexmap::IndexMap;
use std::cell::Cell;
use std::sync::Arc;

/// A native method body. Receives the kernel, the receiver and the
/// arguments of the send.
pub type NativeFn = Arc<dyn Fn(&Kernel, ObjectId, &[Value]) -> Result<Value> + Send + Sync>;

/// Dispatch recursion bound, counted per OS thread across nested sends.
const MAX_DEPTH: usize = 128;

thread_local! {
    static DEPTH: Cell<usize> = Cell::new(0);
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<DepthGuard> {
        DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_DEPTH {
                return Err(Error::StackOverflow(MAX_DEPTH));
            }
            depth.set(current + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

enum Resolution {
    Resolved(Value),
    Forward(Value),
    Missing,
}

impl Kernel {
    /// Register a native method body and return the invocable method
    /// object carrying its tag. Setting the returned object as a slot
    /// value anywhere makes that slot a method.
    pub fn define_method<F>(&self, name: &str, body: F) -> ObjectId
    where
        F: Fn(&Kernel, ObjectId, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods
            .write()
            .insert(name.to_string(), Arc::new(body));
        let id = self.clone_object(self.root());
        // The tag is what the method table is keyed by.
        {
            let mut arena = self.arena.write();
            if let Ok(entry) = arena.entry_mut(id) {
                entry.tag = Some(name.to_string());
            }
        }
        id
    }

    fn method_body(&self, obj: ObjectId) -> Option<NativeFn> {
        let tag = {
            let arena = self.arena.read();
            arena.entry(obj).ok()?.tag.clone()?
        };
        self.methods.read().get(&tag).cloned()
    }

    /// Whether a value would be invoked (rather than returned) by `perform`.
    pub fn is_invocable(&self, value: &Value) -> bool {
        match value {
            Value::Object(id) => self.method_body(*id).is_some(),
            _ => false,
        }
    }

    fn resolve(&self, obj: ObjectId, message: &str) -> Result<Resolution> {
        let arena = self.arena.read();
        arena.live_entry(obj)?;
        if let Some(value) = lookup(&arena, obj, message) {
            return Ok(Resolution::Resolved(value));
        }
        match lookup(&arena, obj, "forward") {
            Some(value) => Ok(Resolution::Forward(value)),
            None => Ok(Resolution::Missing),
        }
    }

    /// Send `message` to `obj`: resolve the name along the delegation
    /// chain and invoke the result if it is a method, with `self = obj`.
    /// A non-invocable resolution is returned as-is (field access).
    pub fn perform(&self, obj: ObjectId, message: &str, args: &[Value]) -> Result<Value> {
        let _guard = DepthGuard::enter()?;
        let outcome = match self.resolve(obj, message)? {
            Resolution::Resolved(Value::Object(target)) => match self.method_body(target) {
                Some(body) => body(self, obj, args),
                None => return Ok(Value::Object(target)),
            },
            Resolution::Resolved(value) => return Ok(value),
            Resolution::Forward(Value::Object(target)) => match self.method_body(target) {
                Some(body) => {
                    let mut forwarded = Vec::with_capacity(args.len() + 1);
                    forwarded.push(Value::from(message));
                    forwarded.extend_from_slice(args);
                    body(self, obj, &forwarded)
                }
                None => Err(Error::DoesNotUnderstand(obj, message.to_string())),
            },
            Resolution::Forward(_) | Resolution::Missing => {
                Err(Error::DoesNotUnderstand(obj, message.to_string()))
            }
        };
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => self.rescue(obj, err),
        }
    }

    /// Offer an unwinding error to the receiver's `rescue` slot. Without a
    /// rescue handler the error keeps propagating.
    fn rescue(&self, obj: ObjectId, err: Error) -> Result<Value> {
        let handler = {
            let arena = self.arena.read();
            lookup(&arena, obj, "rescue")
        };
        match handler {
            Some(Value::Object(target)) => match self.method_body(target) {
                Some(body) => body(self, obj, &[error_value(&err)]),
                None => Err(err),
            },
            _ => Err(err),
        }
    }
}

/// Reify an error as a map value for `rescue` handlers.
pub fn error_value(err: &Error) -> Value {
    let mut entries = IndexMap::new();
    entries.insert("kind".to_string(), Value::from(err.kind()));
    entries.insert("message".to_string(), Value::from(err.to_string()));
    if let Error::Foreign(record) = err {
        entries.insert(
            "foreign_type".to_string(),
            Value::from(record.foreign_type_name.as_str()),
        );
        entries.insert(
            "traceback".to_string(),
            Value::List(
                record
                    .traceback
                    .iter()
                    .map(|line| Value::from(line.as_str()))
                    .collect(),
            ),
        );
    }
    Value::Map(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_access_returns_the_slot_value() {
        let kernel = Kernel::new();
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "color", Value::from("red")).unwrap();
        assert_eq!(
            kernel.perform(obj, "color", &[]).unwrap(),
            Value::from("red")
        );
    }

    #[test]
    fn methods_run_with_self_bound_to_the_receiver() {
        let kernel = Kernel::new();
        let double = kernel.define_method("double", |kernel, receiver, _args| {
            let n = kernel
                .get_slot(receiver, "n")?
                .as_number()
                .unwrap_or_default();
            Ok(Value::from(n * 2.0))
        });
        let proto = kernel.clone_object(kernel.root());
        kernel.set_slot(proto, "double", Value::Object(double)).unwrap();
        kernel.set_slot(proto, "n", Value::from(3.0)).unwrap();

        let child = kernel.clone_object(proto);
        kernel.set_slot(child, "n", Value::from(5.0)).unwrap();
        // The method is found on the prototype but `self` is the child.
        assert_eq!(
            kernel.perform(child, "double", &[]).unwrap(),
            Value::from(10.0)
        );
    }

    #[test]
    fn missing_message_without_forward_is_does_not_understand() {
        let kernel = Kernel::new();
        let obj = kernel.clone_object(kernel.root());
        match kernel.perform(obj, "nope", &[]) {
            Err(Error::DoesNotUnderstand(id, message)) => {
                assert_eq!(id, obj);
                assert_eq!(message, "nope");
            }
            other => panic!("expected DoesNotUnderstand, got {:?}", other),
        }
    }

    #[test]
    fn forward_receives_the_original_message_first() {
        let kernel = Kernel::new();
        let forward = kernel.define_method("forward", |kernel, receiver, args| {
            kernel.set_slot(receiver, "last_forward", Value::List(args.to_vec()))?;
            Ok(Value::from("forwarded"))
        });
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "forward", Value::Object(forward)).unwrap();

        let out = kernel
            .perform(obj, "greet", &[Value::from(1.0)])
            .unwrap();
        assert_eq!(out, Value::from("forwarded"));
        assert_eq!(
            kernel.get_slot(obj, "last_forward").unwrap(),
            Value::List(vec![Value::from("greet"), Value::from(1.0)])
        );
    }

    #[test]
    fn rescue_on_an_ancestor_catches_method_errors() {
        let kernel = Kernel::new();
        let boom = kernel.define_method("boom", |_, _, _| {
            Err(Error::Kernel("intentional".to_string()))
        });
        let rescue = kernel.define_method("rescue", |_, _, args| {
            // The handler receives the reified error.
            let kind = args[0]
                .as_map()
                .and_then(|entries| entries.get("kind"))
                .cloned()
                .unwrap_or(Value::Nil);
            Ok(kind)
        });
        let proto = kernel.clone_object(kernel.root());
        kernel.set_slot(proto, "rescue", Value::Object(rescue)).unwrap();
        let obj = kernel.clone_object(proto);
        kernel.set_slot(obj, "boom", Value::Object(boom)).unwrap();

        assert_eq!(
            kernel.perform(obj, "boom", &[]).unwrap(),
            Value::from("KernelError")
        );
    }

    #[test]
    fn does_not_understand_is_also_rescuable() {
        let kernel = Kernel::new();
        let rescue = kernel.define_method("rescue", |_, _, _| Ok(Value::from("caught")));
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "rescue", Value::Object(rescue)).unwrap();
        assert_eq!(
            kernel.perform(obj, "whatever", &[]).unwrap(),
            Value::from("caught")
        );
    }

    #[test]
    fn unbounded_recursion_is_cut_off() {
        let kernel = Kernel::new();
        let spin = kernel.define_method("spin", |kernel, receiver, _| {
            kernel.perform(receiver, "spin", &[])
        });
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "spin", Value::Object(spin)).unwrap();
        match kernel.perform(obj, "spin", &[]) {
            Err(Error::StackOverflow(limit)) => assert_eq!(limit, MAX_DEPTH),
            other => panic!("expected StackOverflow, got {:?}", other),
        }
    }

    #[test]
    fn reentrant_sends_are_fine_below_the_bound() {
        let kernel = Kernel::new();
        let countdown = kernel.define_method("countdown", |kernel, receiver, args| {
            let n = args[0].as_number().unwrap_or_default();
            if n <= 0.0 {
                return Ok(Value::from(0.0));
            }
            kernel.perform(receiver, "countdown", &[Value::from(n - 1.0)])
        });
        let obj = kernel.clone_object(kernel.root());
        kernel
            .set_slot(obj, "countdown", Value::Object(countdown))
            .unwrap();
        assert_eq!(
            kernel.perform(obj, "countdown", &[Value::from(60.0)]).unwrap(),
            Value::from(0.0)
        );
    }
}
