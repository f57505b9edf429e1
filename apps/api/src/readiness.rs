//! Readiness gates: one-shot boolean flags with queued callbacks.
//!
//! A gate starts closed. `once_ready` either runs the callback right away (gate
//! open) or queues it; `transition` opens the gate and hands back the queue so
//! the caller decides where the callbacks run. Callbacks never run while the
//! gate's lock is held, so a callback may freely register more callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error};

pub type ReadyCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

enum GateState {
    Pending(Vec<ReadyCallback>),
    Ready,
}

pub struct Gate {
    name: &'static str,
    state: Mutex<GateState>,
}

impl Gate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState::Pending(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock(), GateState::Ready)
    }

    /// Runs `callback` now if the gate is open, otherwise when it opens.
    ///
    /// This is a level check, not an edge trigger: registering again after the
    /// gate opened runs the callback again.
    pub fn once_ready<F>(&self, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        {
            let mut state = self.lock();
            if let GateState::Pending(queue) = &mut *state {
                queue.push(Box::new(callback));
                return;
            }
        }
        run_isolated(self.name, Box::new(callback));
    }

    /// Opens the gate. Returns the queued callbacks, in registration order, on
    /// the closed-to-open edge and `None` when the gate was already open.
    pub fn transition(&self) -> Option<Vec<ReadyCallback>> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, GateState::Ready) {
            GateState::Pending(queue) => Some(queue),
            GateState::Ready => None,
        }
    }

    /// Opens the gate and drains its queue. A failing or panicking callback is
    /// logged and does not stop the rest. Returns `false` if already open.
    pub fn set_ready(&self) -> bool {
        let Some(queue) = self.transition() else {
            return false;
        };
        debug!("Gate '{}' opened, running {} callbacks", self.name, queue.len());
        for callback in queue {
            run_isolated(self.name, callback);
        }
        true
    }

    /// Resolves once the gate is open.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.once_ready(move || {
            let _ = tx.send(());
            Ok(())
        });
        let _ = rx.await;
    }
}

fn run_isolated(gate: &str, callback: ReadyCallback) {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Readiness callback on gate '{gate}' failed: {e:?}"),
        Err(_) => error!("Readiness callback on gate '{gate}' panicked"),
    }
}

/// The document's two independent gates.
pub struct Readiness {
    /// Filesystem holds the important files.
    pub load: Gate,
    /// Compiler and renderer are configured.
    pub compile: Gate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessFlags {
    pub ready_to_load: bool,
    pub ready_to_compile: bool,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            load: Gate::new("ready_to_load"),
            compile: Gate::new("ready_to_compile"),
        }
    }

    pub fn flags(&self) -> ReadinessFlags {
        ReadinessFlags {
            ready_to_load: self.load.is_ready(),
            ready_to_compile: self.compile.is_ready(),
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
