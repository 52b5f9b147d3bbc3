//! The marshaller: primitives copy, everything else becomes a handle.
//!
//! Going out, kernel objects surface foreign-side as proxies bound to a
//! `NativeToForeign` handle; repeated references to the same object reuse
//! the same handle, which is how self-referential object graphs marshal.
//! Coming in, foreign compounds are introspected recursively; sequences
//! and dicts have reference semantics over there and may be cyclic, which
//! is detected with a visit set and reported as `CycleInGraph`. Anything
//! the runtime cannot decompose becomes (or reuses) a `ForeignToNative`
//! handle.

use crate::error::{Error, MarshalFault, Result};
use crate::foreign::{ForeignHeap, ForeignRef, ForeignRepr, ForeignValue};
use crate::registry::HandleRegistry;
use crate::value::{HandleKind, HandleRef, Value};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Translate a kernel value for the foreign side.
pub fn marshal(
    value: &Value,
    registry: &HandleRegistry,
    heap: &mut dyn ForeignHeap,
) -> Result<ForeignValue> {
    let mut proxies: HashMap<crate::value::ObjectId, ForeignValue> = HashMap::new();
    marshal_inner(value, registry, heap, &mut proxies)
}

fn marshal_inner(
    value: &Value,
    registry: &HandleRegistry,
    heap: &mut dyn ForeignHeap,
    proxies: &mut HashMap<crate::value::ObjectId, ForeignValue>,
) -> Result<ForeignValue> {
    Ok(match value {
        Value::Nil => ForeignValue::Null,
        Value::Bool(b) => ForeignValue::Bool(*b),
        Value::Number(n) => ForeignValue::Float(*n),
        Value::String(s) => ForeignValue::Str(s.clone()),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(marshal_inner(item, registry, heap, proxies)?);
            }
            ForeignValue::Ref(heap.make_seq(out))
        }
        Value::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                out.push((key.clone(), marshal_inner(item, registry, heap, proxies)?));
            }
            ForeignValue::Ref(heap.make_dict(out))
        }
        Value::Object(id) => {
            if let Some(proxy) = proxies.get(id) {
                return Ok(proxy.clone());
            }
            let handle = object_handle(registry, *id)?;
            let proxy = ForeignValue::Ref(heap.make_proxy(&handle.handle_id));
            proxies.insert(*id, proxy.clone());
            proxy
        }
        Value::ForeignHandle(handle) => {
            let (_, native_ref, foreign_ref) = registry.resolve(&handle.handle_id)?;
            match (foreign_ref, native_ref) {
                // The original foreign object, handle resolved.
                (Some(fref), _) => ForeignValue::Ref(fref),
                // A handle that wraps a kernel object crosses as a proxy.
                (None, Some(_)) => ForeignValue::Ref(heap.make_proxy(&handle.handle_id)),
                (None, None) => {
                    return Err(Error::Kernel(format!(
                        "handle '{}' resolves to nothing",
                        handle.handle_id
                    )))
                }
            }
        }
    })
}

/// The `NativeToForeign` handle for a kernel object: reused (and retained)
/// when it already exists, freshly acquired otherwise.
pub(crate) fn object_handle(
    registry: &HandleRegistry,
    id: crate::value::ObjectId,
) -> Result<HandleRef> {
    match registry.lookup_native(id) {
        Some(handle) => {
            registry.retain(&handle.handle_id)?;
            Ok(handle)
        }
        None => Ok(registry.acquire(HandleKind::NativeToForeign, Some(id), None)),
    }
}

/// The kernel-side value for an opaque foreign object: a `ForeignToNative`
/// handle, reused when the same foreign ref was wrapped before. A fresh
/// handle takes its own reference on the foreign cell.
pub(crate) fn foreign_handle_value(
    registry: &HandleRegistry,
    heap: &mut dyn ForeignHeap,
    fref: ForeignRef,
) -> Result<Value> {
    let handle = match registry.lookup_foreign(fref) {
        Some(handle) => {
            registry.retain(&handle.handle_id)?;
            handle
        }
        None => {
            heap.retain_ref(fref);
            registry.acquire(HandleKind::ForeignToNative, None, Some(fref))
        }
    };
    Ok(Value::ForeignHandle(handle))
}

/// Translate a foreign value for the kernel.
pub fn unmarshal(
    value: &ForeignValue,
    registry: &HandleRegistry,
    heap: &mut dyn ForeignHeap,
) -> Result<Value> {
    let mut in_progress = HashSet::new();
    unmarshal_inner(value, registry, heap, &mut in_progress)
}

fn unmarshal_inner(
    value: &ForeignValue,
    registry: &HandleRegistry,
    heap: &mut dyn ForeignHeap,
    in_progress: &mut HashSet<ForeignRef>,
) -> Result<Value> {
    Ok(match value {
        ForeignValue::Null => Value::Nil,
        ForeignValue::Bool(b) => Value::Bool(*b),
        ForeignValue::Float(n) => Value::Number(*n),
        ForeignValue::Str(s) => Value::String(s.clone()),
        ForeignValue::Ref(r) => {
            let repr = heap.introspect(*r).map_err(Error::Foreign)?;
            match repr {
                ForeignRepr::Seq(items) => {
                    if !in_progress.insert(*r) {
                        return Err(MarshalFault::CycleInGraph.into());
                    }
                    let mut out = Vec::with_capacity(items.len());
                    for item in &items {
                        out.push(unmarshal_inner(item, registry, heap, in_progress)?);
                    }
                    in_progress.remove(r);
                    Value::List(out)
                }
                ForeignRepr::Dict(entries) => {
                    if !in_progress.insert(*r) {
                        return Err(MarshalFault::CycleInGraph.into());
                    }
                    let mut out = IndexMap::with_capacity(entries.len());
                    for (key, item) in &entries {
                        let key = match key {
                            ForeignValue::Str(key) => key.clone(),
                            _ => return Err(MarshalFault::NonStringMapKey.into()),
                        };
                        out.insert(key, unmarshal_inner(item, registry, heap, in_progress)?);
                    }
                    in_progress.remove(r);
                    Value::Map(out)
                }
                ForeignRepr::Proxy(handle_id) => {
                    let (_, native_ref, _) = registry.resolve(&handle_id)?;
                    match native_ref {
                        Some(id) => Value::Object(id),
                        None => {
                            return Err(Error::Kernel(format!(
                                "proxy handle '{}' has no kernel object",
                                handle_id
                            )))
                        }
                    }
                }
                ForeignRepr::Callable { .. }
                | ForeignRepr::Module { .. }
                | ForeignRepr::Opaque { .. } => foreign_handle_value(registry, heap, *r)?,
            }
        }
    })
}
