//! The embedder surface: one value that owns the whole stack.
//!
//! Bring-up is explicit and ordered (kernel, then log replay, then
//! bridge, then vector ops) and teardown reverses it: the bridge releases
//! its handles (under the gate) before the log goes away. Nothing here is
//! process-global; embedders may run several runtimes side by side.

use crate::bridge::{BridgeConfig, SynapticBridge};
use crate::error::Result;
use crate::events;
use crate::foreign::{EmbeddedRuntime, ForeignRuntime};
use crate::kernel::Kernel;
use crate::registry::HandleRegistry;
use crate::value::Value;
use crate::vsa::VsaOps;
use crate::wal::SlotLog;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

fn default_wal_path() -> PathBuf {
    PathBuf::from("./state.wal")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_wal_path")]
    pub wal_path: PathBuf,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            wal_path: default_wal_path(),
            bridge: BridgeConfig::default(),
        }
    }
}

pub struct Runtime {
    kernel: Arc<Kernel>,
    log: Arc<SlotLog>,
    bridge: Arc<SynapticBridge>,
    vsa: VsaOps,
}

impl Runtime {
    /// Bring the stack up with the embedded foreign interpreter.
    pub fn new(config: RuntimeConfig) -> Result<Runtime> {
        Runtime::with_foreign_runtime(config, Box::new(EmbeddedRuntime::new()))
    }

    /// Bring the stack up around a caller-provided foreign interpreter.
    pub fn with_foreign_runtime(
        config: RuntimeConfig,
        foreign: Box<dyn ForeignRuntime>,
    ) -> Result<Runtime> {
        let kernel = Arc::new(Kernel::new());

        let log = Arc::new(SlotLog::open(&config.wal_path)?);
        let mut replayed = 0usize;
        log.replay(&mut |record| {
            kernel.apply_replayed(record.object_id, &record.slot_name, record.value)?;
            replayed += 1;
            Ok(())
        })?;
        kernel.attach_log(Arc::clone(&log));
        tracing::info!(replayed, wal = %config.wal_path.display(), "kernel state replayed");

        let registry = Arc::new(HandleRegistry::new());
        let bridge = Arc::new(SynapticBridge::new(
            Arc::clone(&kernel),
            registry,
            foreign,
        )?);
        bridge.initialize(&config.bridge)?;

        let vsa = VsaOps::new(Arc::clone(&bridge));
        Ok(Runtime {
            kernel,
            log,
            bridge,
            vsa,
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn log(&self) -> &Arc<SlotLog> {
        &self.log
    }

    pub fn bridge(&self) -> &Arc<SynapticBridge> {
        &self.bridge
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        self.bridge.registry()
    }

    pub fn vsa(&self) -> &VsaOps {
        &self.vsa
    }

    /// Inject one external event (see the event dispatch contract).
    pub fn dispatch_event(
        &self,
        kind: &str,
        payload: &IndexMap<String, Value>,
    ) -> Result<Value> {
        events::dispatch_event(&self.kernel, kind, payload)
    }

    /// Reclaim objects unreachable from the lobby and from live handles.
    pub fn collect(&self) -> usize {
        self.kernel.collect(&self.bridge.registry().native_roots())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.bridge.shutdown() {
            tracing::warn!(%err, "bridge shutdown failed during teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::tempdir;

    fn config(dir: &tempfile::TempDir) -> RuntimeConfig {
        RuntimeConfig {
            wal_path: dir.path().join("state.wal"),
            bridge: BridgeConfig::default(),
        }
    }

    #[test]
    fn transactional_writes_survive_restart() {
        let dir = tempdir().unwrap();
        let obj;
        {
            let runtime = Runtime::new(config(&dir)).unwrap();
            let kernel = runtime.kernel();
            obj = kernel.clone_object(kernel.root());
            for i in 1..=5u64 {
                kernel
                    .set_slot_transactional(obj, &format!("k{}", i), Value::from(i as f64))
                    .unwrap();
            }
            assert_eq!(runtime.log().last_sequence(), 5);
        }
        let runtime = Runtime::new(config(&dir)).unwrap();
        assert_eq!(
            runtime.kernel().get_slot(obj, "k3").unwrap(),
            Value::from(3.0)
        );
        assert_eq!(runtime.log().last_sequence(), 5);
    }

    #[test]
    fn volatile_writes_do_not_survive_restart() {
        let dir = tempdir().unwrap();
        let obj;
        {
            let runtime = Runtime::new(config(&dir)).unwrap();
            let kernel = runtime.kernel();
            obj = kernel.clone_object(kernel.root());
            kernel
                .set_slot_transactional(obj, "kept", Value::from(1.0))
                .unwrap();
            kernel.set_slot(obj, "volatile", Value::from(2.0)).unwrap();
        }
        let runtime = Runtime::new(config(&dir)).unwrap();
        assert_eq!(
            runtime.kernel().get_slot(obj, "kept").unwrap(),
            Value::from(1.0)
        );
        assert_eq!(runtime.kernel().get_slot(obj, "volatile").unwrap(), Value::Nil);
    }

    #[test]
    fn bridge_writes_replay_too() {
        let dir = tempdir().unwrap();
        let obj;
        {
            let runtime = Runtime::new(config(&dir)).unwrap();
            let kernel = runtime.kernel();
            obj = kernel.clone_object(kernel.root());
            let mut ctx = IndexMap::new();
            ctx.insert("p".to_string(), Value::Object(obj));
            runtime
                .bridge()
                .eval("set_slot(p, \"width\", 7)", Some(&ctx))
                .unwrap();
        }
        let runtime = Runtime::new(config(&dir)).unwrap();
        assert_eq!(
            runtime.kernel().get_slot(obj, "width").unwrap(),
            Value::from(7.0)
        );
    }

    #[test]
    fn init_failure_surfaces_before_anything_runs() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir);
        config.bridge.runtime_path = Some(dir.path().join("no-such-interpreter"));
        match Runtime::new(config) {
            Err(Error::RuntimeInitFailed(_)) => {}
            other => panic!("expected RuntimeInitFailed, got {:?}", other.err()),
        }
    }

    #[test]
    fn collect_respects_handle_pins() {
        let dir = tempdir().unwrap();
        let runtime = Runtime::new(config(&dir)).unwrap();
        let kernel = runtime.kernel();

        let pinned = kernel.clone_object(kernel.root());
        let doomed = kernel.clone_object(kernel.root());
        // Marshal `pinned` across the bridge so a live handle pins it.
        let mut ctx = IndexMap::new();
        ctx.insert("p".to_string(), Value::Object(pinned));
        runtime.bridge().eval("p; null", Some(&ctx)).unwrap();

        let swept = runtime.collect();
        assert_eq!(swept, 1);
        assert!(matches!(
            kernel.get_slot(doomed, "x"),
            Err(Error::Dead(_))
        ));
        assert_eq!(kernel.get_slot(pinned, "x").unwrap(), Value::Nil);
    }
}
