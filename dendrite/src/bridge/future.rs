//! Futures returned by `async_eval`.
//!
//! Results park in one-shot cells keyed by future id. A timed-out `wait`
//! abandons the future: the computation keeps running, and whichever side
//! gets to the entry last releases any handles the discarded result
//! produced.

use crate::error::{Error, Result};
use crate::registry::HandleRegistry;
use crate::value::Value;
use async_cell::sync::AsyncCell;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FutureState {
    Pending,
    Abandoned,
    Done,
}

#[derive(Clone)]
pub(crate) struct FutureTicket {
    pub(crate) id: String,
    pub(crate) cell: Arc<AsyncCell<Result<Value>>>,
    state: Arc<Mutex<FutureState>>,
}

#[derive(Default)]
pub(crate) struct FutureStore {
    entries: DashMap<String, FutureTicket>,
    next: AtomicU64,
}

impl FutureStore {
    pub(crate) fn submit(&self) -> FutureTicket {
        let id = format!("fut{:06}", self.next.fetch_add(1, Ordering::Relaxed));
        let ticket = FutureTicket {
            id: id.clone(),
            cell: AsyncCell::shared(),
            state: Arc::new(Mutex::new(FutureState::Pending)),
        };
        self.entries.insert(id, ticket.clone());
        ticket
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<FutureTicket> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    pub(crate) fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Worker-side completion. For an abandoned future the result is
    /// discarded on the spot and its handles are released.
    pub(crate) fn settle(&self, ticket: &FutureTicket, result: Result<Value>, registry: &HandleRegistry) {
        let mut state = ticket.state.lock();
        match *state {
            FutureState::Abandoned => {
                drop(state);
                if let Ok(value) = &result {
                    release_result_handles(value, registry);
                }
                self.entries.remove(&ticket.id);
                tracing::debug!(future = %ticket.id, "discarded abandoned future result");
            }
            _ => {
                *state = FutureState::Done;
                drop(state);
                ticket.cell.set(result);
            }
        }
    }

    /// Waiter-side timeout. If completion won the race the parked result
    /// is taken and its handles released here instead.
    pub(crate) fn abandon(&self, ticket: &FutureTicket, registry: &HandleRegistry) {
        let mut state = ticket.state.lock();
        match *state {
            FutureState::Done => {
                drop(state);
                if let Some(Ok(value)) = ticket.cell.try_take() {
                    release_result_handles(&value, registry);
                }
                self.entries.remove(&ticket.id);
            }
            _ => {
                *state = FutureState::Abandoned;
            }
        }
    }

    /// Fail every pending future; waiters observe `Cancelled`.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.entries.iter() {
            let mut state = entry.state.lock();
            if *state == FutureState::Pending {
                *state = FutureState::Done;
                entry.cell.set(Err(Error::Cancelled));
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// Release every foreign handle reachable from a discarded result.
fn release_result_handles(value: &Value, registry: &HandleRegistry) {
    match value {
        Value::ForeignHandle(handle) => {
            if let Err(err) = registry.release(&handle.handle_id) {
                tracing::warn!(%err, handle = %handle.handle_id, "discarded result held a stale handle");
            }
        }
        Value::List(items) => {
            for item in items {
                release_result_handles(item, registry);
            }
        }
        Value::Map(entries) => {
            for item in entries.values() {
                release_result_handles(item, registry);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::ForeignRef;
    use crate::value::{HandleKind, HandleRef};

    #[test]
    fn settle_then_take() {
        let store = FutureStore::default();
        let registry = HandleRegistry::new();
        let ticket = store.submit();
        store.settle(&ticket, Ok(Value::from(5.0)), &registry);
        assert_eq!(ticket.cell.try_take().unwrap().unwrap(), Value::from(5.0));
    }

    #[test]
    fn abandoned_results_release_their_handles() {
        let store = FutureStore::default();
        let registry = HandleRegistry::new();
        let handle = registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(1)));

        let ticket = store.submit();
        store.abandon(&ticket, &registry);
        store.settle(
            &ticket,
            Ok(Value::ForeignHandle(HandleRef {
                handle_id: handle.handle_id.clone(),
                kind: handle.kind,
            })),
            &registry,
        );
        assert!(registry.is_empty());
        assert!(store.lookup(&ticket.id).is_none());
    }

    #[test]
    fn completion_racing_a_timeout_still_releases() {
        let store = FutureStore::default();
        let registry = HandleRegistry::new();
        let handle = registry.acquire(HandleKind::ForeignToNative, None, Some(ForeignRef(2)));

        let ticket = store.submit();
        store.settle(
            &ticket,
            Ok(Value::List(vec![Value::ForeignHandle(HandleRef {
                handle_id: handle.handle_id.clone(),
                kind: handle.kind,
            })])),
            &registry,
        );
        store.abandon(&ticket, &registry);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_fails_pending_futures() {
        let store = FutureStore::default();
        let ticket = store.submit();
        assert_eq!(store.cancel_all(), 1);
        match ticket.cell.try_take().unwrap() {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }
}
