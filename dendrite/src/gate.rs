//! The foreign runtime gate.
//!
//! Exactly one holder at a time: every touch of foreign state goes through
//! [`Gate::with`], which serializes callers behind a process-wide lock held
//! for the full duration of the call. The lock is reentrant for the same
//! OS thread, so callbacks that run while a foreign call is in flight do
//! not deadlock; what is *not* allowed is re-entering the runtime itself
//! from such a callback, which is reported as an error instead of aliasing
//! the interpreter.

use crate::error::{Error, Result};
use crate::foreign::ForeignRuntime;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One recorded gate occupancy, for serialization checks.
#[derive(Clone, Copy, Debug)]
pub struct GateSpan {
    pub site: &'static str,
    pub entered: Instant,
    pub exited: Instant,
}

pub struct Gate {
    runtime: ReentrantMutex<RefCell<Box<dyn ForeignRuntime>>>,
    spans: Mutex<Vec<GateSpan>>,
    record_spans: AtomicBool,
}

impl Gate {
    pub fn new(runtime: Box<dyn ForeignRuntime>) -> Gate {
        Gate {
            runtime: ReentrantMutex::new(RefCell::new(runtime)),
            spans: Mutex::new(Vec::new()),
            record_spans: AtomicBool::new(false),
        }
    }

    /// Run `body` with exclusive access to the foreign runtime.
    pub fn with<R>(
        &self,
        site: &'static str,
        body: impl FnOnce(&mut dyn ForeignRuntime) -> Result<R>,
    ) -> Result<R> {
        let guard = self.runtime.lock();
        tracing::trace!(site, "entered foreign gate");
        let entered = Instant::now();
        let mut cell = guard.try_borrow_mut().map_err(|_| {
            Error::Kernel(format!("reentrant foreign call from '{}'", site))
        })?;
        let out = body(cell.as_mut());
        drop(cell);
        let exited = Instant::now();
        if self.record_spans.load(Ordering::Relaxed) {
            self.spans.lock().push(GateSpan {
                site,
                entered,
                exited,
            });
        }
        tracing::trace!(site, "left foreign gate");
        out
    }

    /// Hold the gate without touching the runtime. Reentrant; used when a
    /// caller needs the serialization but not the interpreter.
    pub fn enter(&self, site: &'static str) -> GateGuard<'_> {
        let guard = self.runtime.lock();
        tracing::trace!(site, "holding foreign gate");
        GateGuard { _guard: guard }
    }

    /// Start (or stop) recording occupancy spans. Starting clears any
    /// previously recorded spans.
    pub fn record_spans(&self, on: bool) {
        if on {
            self.spans.lock().clear();
        }
        self.record_spans.store(on, Ordering::Relaxed);
    }

    pub fn spans(&self) -> Vec<GateSpan> {
        self.spans.lock().clone()
    }
}

pub struct GateGuard<'a> {
    _guard: parking_lot::ReentrantMutexGuard<'a, RefCell<Box<dyn ForeignRuntime>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foreign::EmbeddedRuntime;
    use std::sync::Arc;
    use std::time::Duration;

    fn gate() -> Arc<Gate> {
        Arc::new(Gate::new(Box::new(EmbeddedRuntime::new())))
    }

    #[test]
    fn lock_is_reentrant_on_the_same_thread() {
        let gate = gate();
        let _outer = gate.enter("outer");
        let _inner = gate.enter("inner");
    }

    #[test]
    fn runtime_reentry_is_an_error_not_a_deadlock() {
        let gate = gate();
        let result = gate.with("outer", |_| {
            // A nested `with` on the same thread relocks fine but must not
            // hand out a second mutable borrow of the interpreter.
            gate.with("inner", |_| Ok(()))
        });
        match result {
            Err(Error::Kernel(message)) => assert!(message.contains("reentrant")),
            other => panic!("expected reentrancy error, got {:?}", other),
        }
    }

    #[test]
    fn occupancies_never_overlap_across_threads() {
        let gate = gate();
        gate.record_spans(true);
        let mut workers = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            workers.push(std::thread::spawn(move || {
                for _ in 0..8 {
                    gate.with("stress", |_| {
                        std::thread::sleep(Duration::from_millis(2));
                        Ok(())
                    })
                    .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        gate.record_spans(false);

        let mut spans = gate.spans();
        assert_eq!(spans.len(), 32);
        spans.sort_by_key(|span| span.entered);
        for pair in spans.windows(2) {
            assert!(
                pair[0].exited <= pair[1].entered,
                "gate occupancies overlap"
            );
        }
    }
}
