//! The handle registry: the single authority for cross-language references.
//!
//! Handles are refcounted tokens, never copies of the underlying object.
//! Ids are opaque monotonic strings; they encode no pointer bits. Reverse
//! indexes guarantee that re-wrapping the same kernel object or the same
//! foreign object always yields the same handle id.

use crate::error::{Error, Result};
use crate::foreign::ForeignRef;
use crate::value::{HandleKind, HandleRef, ObjectId};
use dashmap::DashMap;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Invoked under the gate when a `ForeignToNative` entry is evicted, to
/// run the foreign runtime's release protocol.
pub type ReleaseHook = Arc<dyn Fn(ForeignRef) + Send + Sync>;

#[derive(Clone, Debug)]
struct HandleEntry {
    kind: HandleKind,
    native_ref: Option<ObjectId>,
    foreign_ref: Option<ForeignRef>,
    refcount: u32,
    /// Acquisition order, for ordered teardown.
    seq: u64,
}

#[derive(Default)]
pub struct HandleRegistry {
    entries: DashMap<String, HandleEntry>,
    by_native: DashMap<ObjectId, String>,
    by_foreign: DashMap<ForeignRef, String>,
    retired: Mutex<HashSet<String>>,
    next: AtomicU64,
    release_hook: RwLock<Option<ReleaseHook>>,
}

impl HandleRegistry {
    pub fn new() -> HandleRegistry {
        HandleRegistry::default()
    }

    /// Install the foreign release protocol. Without a hook, evicting a
    /// `ForeignToNative` entry only forgets the mapping.
    pub fn set_release_hook(&self, hook: ReleaseHook) {
        *self.release_hook.write() = Some(hook);
    }

    /// Allocate a fresh entry with refcount 1.
    pub fn acquire(
        &self,
        kind: HandleKind,
        native_ref: Option<ObjectId>,
        foreign_ref: Option<ForeignRef>,
    ) -> HandleRef {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let handle_id = format!("h{:06}", seq);
        self.entries.insert(
            handle_id.clone(),
            HandleEntry {
                kind,
                native_ref,
                foreign_ref,
                refcount: 1,
                seq,
            },
        );
        if let Some(obj) = native_ref {
            self.by_native.insert(obj, handle_id.clone());
        }
        if let Some(fref) = foreign_ref {
            self.by_foreign.insert(fref, handle_id.clone());
        }
        tracing::trace!(%handle_id, ?kind, "acquired handle");
        HandleRef { handle_id, kind }
    }

    /// The existing handle for a kernel object, if any. Does not retain.
    pub fn lookup_native(&self, obj: ObjectId) -> Option<HandleRef> {
        let handle_id = self.by_native.get(&obj)?.clone();
        let kind = self.entries.get(&handle_id)?.kind;
        Some(HandleRef { handle_id, kind })
    }

    /// The existing handle for a foreign object, if any. Does not retain.
    pub fn lookup_foreign(&self, fref: ForeignRef) -> Option<HandleRef> {
        let handle_id = self.by_foreign.get(&fref)?.clone();
        let kind = self.entries.get(&handle_id)?.kind;
        Some(HandleRef { handle_id, kind })
    }

    pub fn retain(&self, handle_id: &str) -> Result<()> {
        match self.entries.get_mut(handle_id) {
            Some(mut entry) => {
                entry.refcount += 1;
                Ok(())
            }
            None => Err(Error::UnknownHandle(handle_id.to_string())),
        }
    }

    /// Drop one reference; at zero the entry is evicted and, for
    /// `ForeignToNative` handles, the foreign release protocol runs.
    /// Releasing an already-evicted id is a marshalling bug and fails with
    /// `DoubleRelease` rather than being ignored.
    pub fn release(&self, handle_id: &str) -> Result<()> {
        let evict = match self.entries.get_mut(handle_id) {
            Some(mut entry) => {
                entry.refcount -= 1;
                entry.refcount == 0
            }
            None => {
                return if self.retired.lock().contains(handle_id) {
                    Err(Error::DoubleRelease(handle_id.to_string()))
                } else {
                    Err(Error::UnknownHandle(handle_id.to_string()))
                };
            }
        };
        if evict {
            if let Some((_, entry)) = self.entries.remove(handle_id) {
                self.evict(handle_id, &entry);
            }
        }
        Ok(())
    }

    fn evict(&self, handle_id: &str, entry: &HandleEntry) {
        self.retired.lock().insert(handle_id.to_string());
        if let Some(obj) = entry.native_ref {
            self.by_native.remove(&obj);
        }
        if let Some(fref) = entry.foreign_ref {
            self.by_foreign.remove(&fref);
        }
        tracing::trace!(%handle_id, "evicted handle");
        if entry.kind == HandleKind::ForeignToNative {
            if let (Some(fref), Some(hook)) =
                (entry.foreign_ref, self.release_hook.read().clone())
            {
                hook(fref);
            }
        }
    }

    /// Resolve without touching the refcount.
    pub fn resolve(
        &self,
        handle_id: &str,
    ) -> Result<(HandleKind, Option<ObjectId>, Option<ForeignRef>)> {
        match self.entries.get(handle_id) {
            Some(entry) => Ok((entry.kind, entry.native_ref, entry.foreign_ref)),
            None => Err(Error::UnknownHandle(handle_id.to_string())),
        }
    }

    pub fn refcount(&self, handle_id: &str) -> Result<u32> {
        match self.entries.get(handle_id) {
            Some(entry) => Ok(entry.refcount),
            None => Err(Error::UnknownHandle(handle_id.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kernel objects pinned by live `NativeToForeign` handles; these are
    /// reclamation roots.
    pub fn native_roots(&self) -> Vec<ObjectId> {
        self.entries
            .iter()
            .filter_map(|entry| entry.native_ref)
            .collect()
    }

    /// Evict every outstanding entry in acquisition order, regardless of
    /// refcount. Used by bridge shutdown.
    pub fn release_all(&self) -> usize {
        let outstanding: Vec<String> = self
            .entries
            .iter()
            .sorted_by_key(|entry| entry.value().seq)
            .map(|entry| entry.key().clone())
            .collect();
        let released = outstanding.len();
        for handle_id in &outstanding {
            if let Some((_, entry)) = self.entries.remove(handle_id) {
                self.evict(handle_id, &entry);
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn acquire_retain_release_accounting() {
        let registry = HandleRegistry::new();
        let handle = registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(9)));
        assert_eq!(registry.refcount(&handle.handle_id).unwrap(), 1);

        registry.retain(&handle.handle_id).unwrap();
        assert_eq!(registry.refcount(&handle.handle_id).unwrap(), 2);

        registry.release(&handle.handle_id).unwrap();
        assert_eq!(registry.len(), 1);
        registry.release(&handle.handle_id).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn double_release_is_distinguished_from_unknown() {
        let registry = HandleRegistry::new();
        let handle = registry.acquire(HandleKind::ForeignToNative, None, None);
        registry.release(&handle.handle_id).unwrap();

        match registry.release(&handle.handle_id) {
            Err(Error::DoubleRelease(id)) => assert_eq!(id, handle.handle_id),
            other => panic!("expected DoubleRelease, got {:?}", other),
        }
        match registry.release("h999999") {
            Err(Error::UnknownHandle(_)) => {}
            other => panic!("expected UnknownHandle, got {:?}", other),
        }
        match registry.retain(&handle.handle_id) {
            Err(Error::UnknownHandle(_)) => {}
            other => panic!("expected UnknownHandle, got {:?}", other),
        }
    }

    #[test]
    fn eviction_runs_the_foreign_release_protocol() {
        let registry = HandleRegistry::new();
        let released: Arc<PlMutex<Vec<ForeignRef>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        registry.set_release_hook(Arc::new(move |fref| sink.lock().push(fref)));

        let native = registry.acquire(
            HandleKind::NativeToForeign,
            Some(ObjectId(4)),
            None,
        );
        let foreign = registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(7)));

        registry.release(&native.handle_id).unwrap();
        registry.release(&foreign.handle_id).unwrap();
        // Only the foreign-to-native eviction reaches the runtime.
        assert_eq!(released.lock().clone(), vec![ForeignRef(7)]);
    }

    #[test]
    fn reverse_indexes_map_back_to_the_same_handle() {
        let registry = HandleRegistry::new();
        let obj = ObjectId(11);
        let handle = registry.acquire(HandleKind::NativeToForeign, Some(obj), None);
        assert_eq!(
            registry.lookup_native(obj).unwrap().handle_id,
            handle.handle_id
        );
        registry.release(&handle.handle_id).unwrap();
        assert!(registry.lookup_native(obj).is_none());
    }

    #[test]
    fn resolve_does_not_mutate_the_refcount() {
        let registry = HandleRegistry::new();
        let handle = registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(3)));
        for _ in 0..3 {
            let (kind, native, foreign) = registry.resolve(&handle.handle_id).unwrap();
            assert_eq!(kind, HandleKind::ForeignToNative);
            assert_eq!(native, None);
            assert_eq!(foreign, Some(ForeignRef(3)));
        }
        assert_eq!(registry.refcount(&handle.handle_id).unwrap(), 1);
    }

    #[test]
    fn release_all_tears_down_in_acquisition_order() {
        let registry = HandleRegistry::new();
        let released: Arc<PlMutex<Vec<ForeignRef>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        registry.set_release_hook(Arc::new(move |fref| sink.lock().push(fref)));

        for n in 0..3 {
            registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(n)));
        }
        assert_eq!(registry.release_all(), 3);
        assert!(registry.is_empty());
        assert_eq!(
            released.lock().clone(),
            vec![ForeignRef(0), ForeignRef(1), ForeignRef(2)]
        );
    }
}
