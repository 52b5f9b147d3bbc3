//! The synaptic bridge: the kernel's only door to the foreign runtime.
//!
//! Every operation marshals its inputs, crosses the gate, and unmarshals
//! the result; opaque results come back as handles, never copies. Foreign
//! exceptions convert exactly once, at the gate, into structured records.

mod future;

use self::future::FutureStore;
use crate::error::{Error, Result};
use crate::foreign::{
    ForeignErrorRecord, ForeignHeap, ForeignRef, ForeignRuntime, ForeignValue, ProxyDispatch,
};
use crate::gate::Gate;
use crate::kernel::Kernel;
use crate::marshal::{foreign_handle_value, marshal, object_handle, unmarshal};
use crate::registry::HandleRegistry;
use crate::value::{HandleKind, HandleRef, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Single,
}

impl Default for ThreadMode {
    fn default() -> Self {
        ThreadMode::Single
    }
}

/// Bridge configuration, usually populated by the embedder's CLI.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub runtime_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
    #[serde(default)]
    pub thread_mode: ThreadMode,
}

pub struct SynapticBridge {
    kernel: Arc<Kernel>,
    registry: Arc<HandleRegistry>,
    gate: Arc<Gate>,
    futures: Arc<FutureStore>,
    worker: tokio::runtime::Runtime,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl SynapticBridge {
    pub fn new(
        kernel: Arc<Kernel>,
        registry: Arc<HandleRegistry>,
        runtime: Box<dyn ForeignRuntime>,
    ) -> Result<SynapticBridge> {
        let worker = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("dendrite-bridge")
            .build()
            .map_err(|err| Error::RuntimeInitFailed(err.to_string()))?;
        Ok(SynapticBridge {
            kernel,
            registry,
            gate: Arc::new(Gate::new(runtime)),
            futures: Arc::new(FutureStore::default()),
            worker,
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }

    /// Bring the foreign runtime up and wire the registry's release
    /// protocol through the gate.
    pub fn initialize(&self, config: &BridgeConfig) -> Result<()> {
        let gate = Arc::clone(&self.gate);
        self.registry.set_release_hook(Arc::new(move |fref| {
            let outcome = gate.with("registry::release", |runtime| {
                runtime.as_heap().release_ref(fref);
                Ok(())
            });
            if let Err(err) = outcome {
                tracing::warn!(%err, %fref, "foreign release protocol failed");
            }
        }));
        self.gate.with("bridge::initialize", |runtime| {
            runtime.initialize(config).map_err(convert_record)
        })?;
        self.initialized.store(true, Ordering::SeqCst);
        self.shut_down.store(false, Ordering::SeqCst);
        tracing::info!("synaptic bridge initialized");
        Ok(())
    }

    /// Cancel pending futures and release every outstanding handle in
    /// acquisition order. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = self.futures.cancel_all();
        let released = self.registry.release_all();
        tracing::info!(cancelled, released, "synaptic bridge shut down");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Kernel(
                "synaptic bridge is not initialized".to_string(),
            ));
        }
        Ok(())
    }

    fn dispatcher(&self) -> KernelProxyDispatch {
        KernelProxyDispatch {
            kernel: Arc::clone(&self.kernel),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Evaluate a source fragment in a fresh namespace; `context` entries
    /// become bindings in that namespace.
    pub fn eval(&self, code: &str, context: Option<&IndexMap<String, Value>>) -> Result<Value> {
        self.ensure_ready()?;
        let dispatch = self.dispatcher();
        self.gate.with("bridge::eval", |runtime| {
            let bound = marshal_bindings(context, &self.registry, runtime)?;
            let out = runtime
                .eval(code, &bound, &dispatch)
                .map_err(convert_record)?;
            unmarshal(&out, &self.registry, runtime.as_heap())
        })
    }

    /// Import a module; the result is a handle, not a copy.
    pub fn load_module(&self, name: &str) -> Result<Value> {
        self.ensure_ready()?;
        self.gate.with("bridge::load_module", |runtime| {
            let module = runtime.load_module(name).map_err(convert_record)?;
            tracing::debug!(module = name, "loaded foreign module");
            foreign_handle_value(&self.registry, runtime.as_heap(), module)
        })
    }

    /// Invoke a foreign callable: either a handle, or a
    /// `{module, name}` pair resolved at call time.
    pub fn call(
        &self,
        callable: &Value,
        args: &[Value],
        kwargs: Option<&IndexMap<String, Value>>,
    ) -> Result<Value> {
        self.ensure_ready()?;
        let dispatch = self.dispatcher();
        self.gate.with("bridge::call", |runtime| {
            let target = self.resolve_callable(callable, runtime)?;
            let args = marshal_values(args, &self.registry, runtime)?;
            let kwargs = marshal_bindings(kwargs, &self.registry, runtime)?;
            let out = runtime
                .call(target, &args, &kwargs, &dispatch)
                .map_err(convert_record)?;
            unmarshal(&out, &self.registry, runtime.as_heap())
        })
    }

    pub fn create_instance(
        &self,
        class: &Value,
        args: &[Value],
        kwargs: Option<&IndexMap<String, Value>>,
    ) -> Result<Value> {
        self.ensure_ready()?;
        let dispatch = self.dispatcher();
        self.gate.with("bridge::create_instance", |runtime| {
            let class = self.foreign_ref_of(class)?;
            let args = marshal_values(args, &self.registry, runtime)?;
            let kwargs = marshal_bindings(kwargs, &self.registry, runtime)?;
            let instance = runtime
                .instantiate(class, &args, &kwargs, &dispatch)
                .map_err(convert_record)?;
            foreign_handle_value(&self.registry, runtime.as_heap(), instance)
        })
    }

    pub fn call_method(
        &self,
        target: &Value,
        method: &str,
        args: &[Value],
        kwargs: Option<&IndexMap<String, Value>>,
    ) -> Result<Value> {
        self.ensure_ready()?;
        let dispatch = self.dispatcher();
        self.gate.with("bridge::call_method", |runtime| {
            let target = self.foreign_ref_of(target)?;
            let args = marshal_values(args, &self.registry, runtime)?;
            let kwargs = marshal_bindings(kwargs, &self.registry, runtime)?;
            let out = runtime
                .call_method(target, method, &args, &kwargs, &dispatch)
                .map_err(convert_record)?;
            unmarshal(&out, &self.registry, runtime.as_heap())
        })
    }

    /// Submit an evaluation to a worker. The gate is taken at resolution
    /// time, not submission time; the returned handle is `wait`able.
    pub fn async_eval(
        &self,
        code: &str,
        context: Option<&IndexMap<String, Value>>,
    ) -> Result<Value> {
        self.ensure_ready()?;
        let ticket = self.futures.submit();
        let gate = Arc::clone(&self.gate);
        let registry = Arc::clone(&self.registry);
        let futures = Arc::clone(&self.futures);
        let dispatch = self.dispatcher();
        let code = code.to_string();
        let context = context.cloned();
        let worker_ticket = ticket.clone();
        tracing::debug!(future = %ticket.id, "submitted async evaluation");
        self.worker.spawn_blocking(move || {
            let result = gate.with("bridge::async_eval", |runtime| {
                let bound = marshal_bindings(context.as_ref(), &registry, runtime)?;
                let out = runtime
                    .eval(&code, &bound, &dispatch)
                    .map_err(convert_record)?;
                unmarshal(&out, &registry, runtime.as_heap())
            });
            futures.settle(&worker_ticket, result, &registry);
        });
        Ok(Value::ForeignHandle(HandleRef {
            handle_id: ticket.id,
            kind: HandleKind::ForeignToNative,
        }))
    }

    /// Block until the future resolves or the timeout expires. A timed-out
    /// future is abandoned: the computation continues but its result is
    /// discarded and any handles it produced are released.
    pub fn wait(&self, future: &Value, timeout_ms: Option<u64>) -> Result<Value> {
        self.ensure_ready()?;
        let handle = future
            .as_handle()
            .ok_or_else(|| Error::Kernel(format!("cannot wait on {}", future.kind_name())))?;
        let ticket = self
            .futures
            .lookup(&handle.handle_id)
            .ok_or_else(|| Error::UnknownHandle(handle.handle_id.clone()))?;

        let waited = self.worker.block_on(async {
            match timeout_ms {
                Some(ms) => {
                    match tokio::time::timeout(Duration::from_millis(ms), ticket.cell.take()).await
                    {
                        Ok(result) => Some(result),
                        Err(_) => None,
                    }
                }
                None => Some(ticket.cell.take().await),
            }
        });
        match waited {
            Some(result) => {
                self.futures.remove(&ticket.id);
                result
            }
            None => {
                self.futures.abandon(&ticket, &self.registry);
                tracing::debug!(future = %ticket.id, "wait timed out, future abandoned");
                Err(Error::TimedOut(timeout_ms.unwrap_or_default()))
            }
        }
    }

    fn resolve_callable(
        &self,
        callable: &Value,
        runtime: &mut dyn ForeignRuntime,
    ) -> Result<ForeignRef> {
        match callable {
            Value::ForeignHandle(_) => self.foreign_ref_of(callable),
            Value::Map(entries) => {
                let field = |name: &str| {
                    entries
                        .get(name)
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            Error::NotCallable(format!(
                                "callable map needs a string '{}' entry",
                                name
                            ))
                        })
                };
                let module_name = field("module")?;
                let attr = field("name")?;
                let module = runtime.load_module(module_name).map_err(convert_record)?;
                match runtime.get_attr(module, attr).map_err(convert_record)? {
                    ForeignValue::Ref(r) => Ok(r),
                    other => Err(Error::NotCallable(format!(
                        "{}.{} is not callable ({:?})",
                        module_name, attr, other
                    ))),
                }
            }
            other => Err(Error::NotCallable(other.kind_name().to_string())),
        }
    }

    /// The foreign object behind a handle value.
    fn foreign_ref_of(&self, value: &Value) -> Result<ForeignRef> {
        let handle = value
            .as_handle()
            .ok_or_else(|| Error::NotCallable(value.kind_name().to_string()))?;
        let (_, _, foreign_ref) = self.registry.resolve(&handle.handle_id)?;
        foreign_ref.ok_or_else(|| {
            Error::NotCallable(format!(
                "handle '{}' does not wrap a foreign object",
                handle.handle_id
            ))
        })
    }
}

fn marshal_values(
    values: &[Value],
    registry: &HandleRegistry,
    runtime: &mut dyn ForeignRuntime,
) -> Result<Vec<ForeignValue>> {
    values
        .iter()
        .map(|value| marshal(value, registry, runtime.as_heap()))
        .collect()
}

fn marshal_bindings(
    bindings: Option<&IndexMap<String, Value>>,
    registry: &HandleRegistry,
    runtime: &mut dyn ForeignRuntime,
) -> Result<Vec<(String, ForeignValue)>> {
    let mut out = Vec::new();
    if let Some(bindings) = bindings {
        for (name, value) in bindings {
            out.push((name.clone(), marshal(value, registry, runtime.as_heap())?));
        }
    }
    Ok(out)
}

/// The single conversion point for foreign failures. Taxonomy kinds map to
/// their kernel-side variants; everything else stays a structured
/// `ForeignError`.
fn convert_record(record: ForeignErrorRecord) -> Error {
    match record.kind.as_str() {
        "SyntaxError" => Error::Syntax {
            pos: record.position.unwrap_or_default(),
            message: record.message,
        },
        "ModuleNotFound" => Error::ModuleNotFound(record.message),
        "NotCallable" => Error::NotCallable(record.message),
        "RuntimeInitFailed" => Error::RuntimeInitFailed(record.message),
        "ShapeMismatch" => Error::ShapeMismatch(record.message),
        _ => Error::Foreign(record),
    }
}

/// Kernel-side errors crossing back into foreign code keep their record if
/// they had one, and otherwise become kernel-typed foreign exceptions.
fn record_of(err: Error) -> ForeignErrorRecord {
    match err {
        Error::Foreign(record) => record,
        other => ForeignErrorRecord::new(other.kind(), other.to_string(), "KernelError"),
    }
}

/// Proxy callbacks: the behavioral mirror foreign code sees when it holds
/// a kernel object. Operations delegate straight to the kernel.
struct KernelProxyDispatch {
    kernel: Arc<Kernel>,
    registry: Arc<HandleRegistry>,
}

impl KernelProxyDispatch {
    fn object_of(&self, handle_id: &str) -> std::result::Result<crate::value::ObjectId, ForeignErrorRecord> {
        let (_, native_ref, _) = self.registry.resolve(handle_id).map_err(record_of)?;
        native_ref.ok_or_else(|| {
            ForeignErrorRecord::new(
                "UnknownHandle",
                format!("handle '{}' does not wrap a kernel object", handle_id),
                "KernelError",
            )
        })
    }
}

impl ProxyDispatch for KernelProxyDispatch {
    fn get_slot(
        &self,
        handle_id: &str,
        name: &str,
        heap: &mut dyn ForeignHeap,
    ) -> std::result::Result<ForeignValue, ForeignErrorRecord> {
        let obj = self.object_of(handle_id)?;
        let value = self.kernel.get_slot(obj, name).map_err(record_of)?;
        marshal(&value, &self.registry, heap).map_err(record_of)
    }

    fn set_slot(
        &self,
        handle_id: &str,
        name: &str,
        value: ForeignValue,
        heap: &mut dyn ForeignHeap,
    ) -> std::result::Result<(), ForeignErrorRecord> {
        let obj = self.object_of(handle_id)?;
        let value = unmarshal(&value, &self.registry, heap).map_err(record_of)?;
        self.kernel
            .set_slot_from_bridge(obj, name, value)
            .map_err(record_of)
    }

    fn perform(
        &self,
        handle_id: &str,
        message: &str,
        args: &[ForeignValue],
        heap: &mut dyn ForeignHeap,
    ) -> std::result::Result<ForeignValue, ForeignErrorRecord> {
        let obj = self.object_of(handle_id)?;
        let mut unmarshalled = Vec::with_capacity(args.len());
        for arg in args {
            unmarshalled.push(unmarshal(arg, &self.registry, heap).map_err(record_of)?);
        }
        let out = self
            .kernel
            .perform(obj, message, &unmarshalled)
            .map_err(record_of)?;
        marshal(&out, &self.registry, heap).map_err(record_of)
    }

    fn clone_object(
        &self,
        handle_id: &str,
        heap: &mut dyn ForeignHeap,
    ) -> std::result::Result<ForeignValue, ForeignErrorRecord> {
        let obj = self.object_of(handle_id)?;
        let fresh = self.kernel.clone_object(obj);
        let handle = object_handle(&self.registry, fresh).map_err(record_of)?;
        Ok(ForeignValue::Ref(heap.make_proxy(&handle.handle_id)))
    }
}
