//! The prototypal object kernel.
//!
//! Objects live in an id-keyed arena; `parents` and slot references are ids,
//! never pointers, which keeps ownership unambiguous even for cyclic graphs.
//! A clone copies nothing but its delegation chain: slots of the prototype
//! stay visible through delegation until shadowed by a local write.

mod dispatch;

pub use dispatch::{error_value, NativeFn};

use crate::error::{Error, Result};
use crate::value::{ObjectId, Value};
use crate::wal::{Origin, SlotLog};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lifecycle states of a kernel object. There is no way back from `Dead`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Mutable,
    Frozen,
    Dead,
}

#[derive(Debug)]
struct ObjectEntry {
    slots: IndexMap<String, Value>,
    parents: Vec<ObjectId>,
    tag: Option<String>,
    state: ObjectState,
}

impl ObjectEntry {
    fn with_parents(parents: Vec<ObjectId>) -> ObjectEntry {
        ObjectEntry {
            slots: IndexMap::new(),
            parents,
            tag: None,
            state: ObjectState::Mutable,
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    objects: HashMap<ObjectId, ObjectEntry>,
    next_id: u64,
}

impl Arena {
    fn entry(&self, id: ObjectId) -> Result<&ObjectEntry> {
        self.objects
            .get(&id)
            .ok_or_else(|| Error::Kernel(format!("no object with id {}", id)))
    }

    fn entry_mut(&mut self, id: ObjectId) -> Result<&mut ObjectEntry> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| Error::Kernel(format!("no object with id {}", id)))
    }

    fn live_entry(&self, id: ObjectId) -> Result<&ObjectEntry> {
        let entry = self.entry(id)?;
        if entry.state == ObjectState::Dead {
            return Err(Error::Dead(id));
        }
        Ok(entry)
    }

    fn allocate(&mut self, entry: ObjectEntry) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, entry);
        id
    }
}

/// The object kernel: arena, native method table and (optionally) the
/// write-ahead log used for transactional slot writes.
pub struct Kernel {
    arena: RwLock<Arena>,
    methods: RwLock<HashMap<String, NativeFn>>,
    log: RwLock<Option<Arc<SlotLog>>>,
    root: ObjectId,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

impl Kernel {
    pub fn new() -> Kernel {
        let mut arena = Arena {
            objects: HashMap::new(),
            next_id: 1,
        };
        // The lobby: the only object without a parent.
        let root = arena.allocate(ObjectEntry::with_parents(Vec::new()));
        Kernel {
            arena: RwLock::new(arena),
            methods: RwLock::new(HashMap::new()),
            log: RwLock::new(None),
            root,
        }
    }

    /// The lobby object, root of all delegation chains.
    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// Attach the write-ahead log used by transactional slot writes.
    pub fn attach_log(&self, log: Arc<SlotLog>) {
        *self.log.write() = Some(log);
    }

    /// Clone a prototype: a fresh object whose delegation chain starts at
    /// `proto` and whose slot table is empty. Never fails.
    pub fn clone_object(&self, proto: ObjectId) -> ObjectId {
        let id = self
            .arena
            .write()
            .allocate(ObjectEntry::with_parents(vec![proto]));
        tracing::trace!(%proto, %id, "cloned object");
        id
    }

    /// First slot found along the delegation chain, or `Nil` if none.
    pub fn get_slot(&self, obj: ObjectId, name: &str) -> Result<Value> {
        let arena = self.arena.read();
        arena.live_entry(obj)?;
        Ok(lookup(&arena, obj, name).unwrap_or(Value::Nil))
    }

    /// Local-only slot presence check, no delegation.
    pub fn has_slot_local(&self, obj: ObjectId, name: &str) -> Result<bool> {
        let arena = self.arena.read();
        Ok(arena.live_entry(obj)?.slots.contains_key(name))
    }

    /// Volatile slot write: local to `obj`, never touches a parent, not
    /// recorded in the log.
    pub fn set_slot(&self, obj: ObjectId, name: &str, value: Value) -> Result<()> {
        let mut arena = self.arena.write();
        let entry = arena.entry_mut(obj)?;
        match entry.state {
            ObjectState::Frozen => Err(Error::Frozen(obj)),
            ObjectState::Dead => Err(Error::Dead(obj)),
            ObjectState::Mutable => {
                entry.slots.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    /// Journaled slot write: the record is appended and flushed *before*
    /// the in-memory table changes. If the append fails the slot keeps its
    /// prior value and the error surfaces to the caller.
    pub fn set_slot_transactional(&self, obj: ObjectId, name: &str, value: Value) -> Result<()> {
        self.set_slot_transactional_with(obj, name, value, Origin::Kernel)
    }

    pub(crate) fn set_slot_transactional_with(
        &self,
        obj: ObjectId,
        name: &str,
        value: Value,
        origin: Origin,
    ) -> Result<()> {
        // Refuse early so nothing is journaled for an unwritable object.
        {
            let arena = self.arena.read();
            let entry = arena.entry(obj)?;
            match entry.state {
                ObjectState::Frozen => return Err(Error::Frozen(obj)),
                ObjectState::Dead => return Err(Error::Dead(obj)),
                ObjectState::Mutable => {}
            }
        }
        let log = self
            .log
            .read()
            .clone()
            .ok_or_else(|| Error::LogUnavailable("no log attached to kernel".to_string()))?;
        // No kernel lock is held across the append (it flushes to disk).
        log.record(obj, name, &value, origin)?;
        self.set_slot(obj, name, value)
    }

    /// Bridge-originated write (proxy callbacks): journaled when a log is
    /// attached, volatile otherwise.
    pub(crate) fn set_slot_from_bridge(
        &self,
        obj: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        if self.log.read().is_some() {
            self.set_slot_transactional_with(obj, name, value, Origin::Bridge)
        } else {
            self.set_slot(obj, name, value)
        }
    }

    /// Replay-time write: materializes the object if this is the first
    /// record mentioning it, and never re-logs.
    pub(crate) fn apply_replayed(&self, obj: ObjectId, name: &str, value: Value) -> Result<()> {
        let mut arena = self.arena.write();
        if !arena.objects.contains_key(&obj) {
            arena
                .objects
                .insert(obj, ObjectEntry::with_parents(vec![self.root]));
            if arena.next_id <= obj.0 {
                arena.next_id = obj.0 + 1;
            }
        }
        let entry = arena.entry_mut(obj)?;
        entry.slots.insert(name.to_string(), value);
        Ok(())
    }

    /// `Mutable → Frozen`. Freezing a frozen object is a no-op.
    pub fn freeze(&self, obj: ObjectId) -> Result<()> {
        let mut arena = self.arena.write();
        let entry = arena.entry_mut(obj)?;
        match entry.state {
            ObjectState::Dead => Err(Error::Dead(obj)),
            _ => {
                entry.state = ObjectState::Frozen;
                Ok(())
            }
        }
    }

    pub fn state_of(&self, obj: ObjectId) -> Result<ObjectState> {
        Ok(self.arena.read().entry(obj)?.state)
    }

    pub fn parents(&self, obj: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.arena.read().entry(obj)?.parents.clone())
    }

    /// Append a delegation parent; lookup prefers earlier parents.
    pub fn push_parent(&self, obj: ObjectId, parent: ObjectId) -> Result<()> {
        let mut arena = self.arena.write();
        let entry = arena.entry_mut(obj)?;
        match entry.state {
            ObjectState::Frozen => Err(Error::Frozen(obj)),
            ObjectState::Dead => Err(Error::Dead(obj)),
            ObjectState::Mutable => {
                entry.parents.push(parent);
                Ok(())
            }
        }
    }

    pub fn tag_of(&self, obj: ObjectId) -> Result<Option<String>> {
        Ok(self.arena.read().entry(obj)?.tag.clone())
    }

    pub fn set_tag(&self, obj: ObjectId, tag: Option<String>) -> Result<()> {
        let mut arena = self.arena.write();
        let entry = arena.entry_mut(obj)?;
        match entry.state {
            ObjectState::Dead => Err(Error::Dead(obj)),
            _ => {
                entry.tag = tag;
                Ok(())
            }
        }
    }

    /// Number of objects in the arena that are not dead.
    pub fn live_count(&self) -> usize {
        self.arena
            .read()
            .objects
            .values()
            .filter(|entry| entry.state != ObjectState::Dead)
            .count()
    }

    /// Mark-and-sweep reclamation. Roots are the lobby plus `pinned`
    /// (callers pass live activations and the registry's native refs).
    /// Swept objects become tombstones so stale ids fail with `Dead`.
    pub fn collect(&self, pinned: &[ObjectId]) -> usize {
        let mut arena = self.arena.write();
        let mut marked: HashSet<ObjectId> = HashSet::new();
        let mut stack: Vec<ObjectId> = Vec::with_capacity(pinned.len() + 1);
        stack.push(self.root);
        stack.extend_from_slice(pinned);
        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            let entry = match arena.objects.get(&id) {
                Some(entry) if entry.state != ObjectState::Dead => entry,
                _ => continue,
            };
            stack.extend(entry.parents.iter().copied());
            for value in entry.slots.values() {
                collect_object_refs(value, &mut stack);
            }
        }
        let mut swept = 0;
        for (id, entry) in arena.objects.iter_mut() {
            if entry.state != ObjectState::Dead && !marked.contains(id) {
                entry.state = ObjectState::Dead;
                entry.slots.clear();
                entry.parents.clear();
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::debug!(swept, "reclaimed unreachable objects");
        }
        swept
    }
}

fn collect_object_refs(value: &Value, out: &mut Vec<ObjectId>) {
    match value {
        Value::Object(id) => out.push(*id),
        Value::List(items) => {
            for item in items {
                collect_object_refs(item, out);
            }
        }
        Value::Map(entries) => {
            for item in entries.values() {
                collect_object_refs(item, out);
            }
        }
        _ => {}
    }
}

/// Depth-first, left-to-right delegation lookup with a visited set, so
/// parent cycles terminate. The first parent wins ties.
fn lookup(arena: &Arena, start: ObjectId, name: &str) -> Option<Value> {
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut stack: Vec<ObjectId> = vec![start];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let entry = match arena.objects.get(&id) {
            Some(entry) if entry.state != ObjectState::Dead => entry,
            _ => continue,
        };
        if let Some(value) = entry.slots.get(name) {
            return Some(value.clone());
        }
        // Reverse push keeps the first parent on top of the stack.
        for parent in entry.parents.iter().rev() {
            if !visited.contains(parent) {
                stack.push(*parent);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clone_chain_and_slot_write() {
        let kernel = Kernel::new();
        let p = kernel.clone_object(kernel.root());
        kernel.set_slot(p, "color", Value::from("red")).unwrap();

        let c = kernel.clone_object(p);
        assert_eq!(kernel.get_slot(c, "color").unwrap(), Value::from("red"));

        kernel.set_slot(c, "color", Value::from("blue")).unwrap();
        assert_eq!(kernel.get_slot(c, "color").unwrap(), Value::from("blue"));
        assert_eq!(kernel.get_slot(p, "color").unwrap(), Value::from("red"));
    }

    #[test]
    fn fresh_clone_has_no_local_slots() {
        let kernel = Kernel::new();
        let p = kernel.clone_object(kernel.root());
        kernel.set_slot(p, "x", Value::from(1.0)).unwrap();
        let c = kernel.clone_object(p);
        assert!(!kernel.has_slot_local(c, "x").unwrap());
        assert!(kernel.has_slot_local(p, "x").unwrap());
    }

    #[test]
    fn multi_parent_lookup_prefers_first_parent() {
        let kernel = Kernel::new();
        let left = kernel.clone_object(kernel.root());
        let right = kernel.clone_object(kernel.root());
        kernel.set_slot(left, "who", Value::from("left")).unwrap();
        kernel.set_slot(right, "who", Value::from("right")).unwrap();
        kernel.set_slot(right, "only", Value::from("right")).unwrap();

        let child = kernel.clone_object(left);
        kernel.push_parent(child, right).unwrap();
        assert_eq!(kernel.get_slot(child, "who").unwrap(), Value::from("left"));
        assert_eq!(
            kernel.get_slot(child, "only").unwrap(),
            Value::from("right")
        );
    }

    #[test]
    fn parent_cycles_terminate() {
        let kernel = Kernel::new();
        let a = kernel.clone_object(kernel.root());
        let b = kernel.clone_object(a);
        kernel.push_parent(a, b).unwrap();
        assert_eq!(kernel.get_slot(a, "missing").unwrap(), Value::Nil);
        kernel.set_slot(b, "found", Value::from(3.0)).unwrap();
        assert_eq!(kernel.get_slot(a, "found").unwrap(), Value::from(3.0));
    }

    #[test]
    fn freeze_rejects_writes() {
        let kernel = Kernel::new();
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "a", Value::Nil).unwrap();
        kernel.freeze(obj).unwrap();
        assert_eq!(kernel.state_of(obj).unwrap(), ObjectState::Frozen);
        match kernel.set_slot(obj, "a", Value::from(1.0)) {
            Err(Error::Frozen(id)) => assert_eq!(id, obj),
            other => panic!("expected Frozen, got {:?}", other),
        }
        // Reads still work.
        assert_eq!(kernel.get_slot(obj, "a").unwrap(), Value::Nil);
    }

    #[test]
    fn transactional_write_without_log_fails_and_leaves_slot_unchanged() {
        let kernel = Kernel::new();
        let obj = kernel.clone_object(kernel.root());
        kernel.set_slot(obj, "k", Value::from(1.0)).unwrap();
        match kernel.set_slot_transactional(obj, "k", Value::from(2.0)) {
            Err(Error::LogUnavailable(_)) => {}
            other => panic!("expected LogUnavailable, got {:?}", other),
        }
        assert_eq!(kernel.get_slot(obj, "k").unwrap(), Value::from(1.0));
    }

    #[test]
    fn collect_sweeps_unreachable_and_keeps_pinned() {
        let kernel = Kernel::new();
        let kept = kernel.clone_object(kernel.root());
        kernel
            .set_slot(kernel.root(), "kept", Value::Object(kept))
            .unwrap();
        let pinned = kernel.clone_object(kernel.root());
        let doomed = kernel.clone_object(kernel.root());

        let swept = kernel.collect(&[pinned]);
        assert_eq!(swept, 1);
        assert_eq!(kernel.state_of(doomed).unwrap(), ObjectState::Dead);
        assert_eq!(kernel.state_of(kept).unwrap(), ObjectState::Mutable);
        assert_eq!(kernel.state_of(pinned).unwrap(), ObjectState::Mutable);
        match kernel.get_slot(doomed, "anything") {
            Err(Error::Dead(_)) => {}
            other => panic!("expected Dead, got {:?}", other),
        }
    }

    #[test]
    fn collect_follows_slot_values_inside_collections() {
        let kernel = Kernel::new();
        let inner = kernel.clone_object(kernel.root());
        kernel
            .set_slot(
                kernel.root(),
                "bag",
                Value::List(vec![Value::from(1.0), Value::Object(inner)]),
            )
            .unwrap();
        assert_eq!(kernel.collect(&[]), 0);
        assert_eq!(kernel.state_of(inner).unwrap(), ObjectState::Mutable);
    }

    proptest! {
        /// A clone with no local slot sees exactly what its prototype sees.
        #[test]
        fn delegation_is_transparent(chain_len in 1usize..6, value in -1.0e6f64..1.0e6) {
            let kernel = Kernel::new();
            let mut obj = kernel.clone_object(kernel.root());
            kernel.set_slot(obj, "s", Value::from(value)).unwrap();
            for _ in 0..chain_len {
                obj = kernel.clone_object(obj);
            }
            prop_assert_eq!(kernel.get_slot(obj, "s").unwrap(), Value::from(value));
        }

        /// A local write on a clone is invisible to every ancestor.
        #[test]
        fn local_writes_do_not_leak_upward(chain_len in 1usize..6) {
            let kernel = Kernel::new();
            let base = kernel.clone_object(kernel.root());
            kernel.set_slot(base, "s", Value::from("base")).unwrap();
            let mut ancestors = vec![base];
            let mut obj = base;
            for _ in 0..chain_len {
                obj = kernel.clone_object(obj);
                ancestors.push(obj);
            }
            kernel.set_slot(obj, "s", Value::from("leaf")).unwrap();
            for ancestor in &ancestors[..ancestors.len() - 1] {
                prop_assert_eq!(
                    kernel.get_slot(*ancestor, "s").unwrap(),
                    Value::from("base")
                );
            }
        }
    }
}
