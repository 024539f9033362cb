//! Cache lifecycle: state machine, readiness flag and the single-fire stop signal.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle misuse. Reported to the caller and logged, never a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("authorization cache already started (state: {state})")]
    AlreadyStarted { state: LifecycleState },

    #[error("authorization cache already stopped")]
    AlreadyStopped,

    #[error("organization does not own its authorization cache")]
    NotOwner,

    #[error("no tokio runtime available to run the authorization cache")]
    NoRuntime,
}

// ═══════════════════════════════════════════════════════════════════════════════
// State Machine
// ═══════════════════════════════════════════════════════════════════════════════

/// `Created → Starting → Ready → Stopped`, with `Created → Stopped` and
/// `Starting → Stopped` allowed. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Starting,
    Ready,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Shared lifecycle of one cache.
///
/// The readiness flag is separate from the state: it records that one full
/// reconciliation completed, which stays true even after the cache stops.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    ready: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(LifecycleState::Created),
            ready,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// `Created → Starting`.
    pub fn begin_start(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Created => {
                *state = LifecycleState::Starting;
                Ok(())
            }
            LifecycleState::Stopped => Err(LifecycleError::AlreadyStopped),
            other => Err(LifecycleError::AlreadyStarted { state: other }),
        }
    }

    /// Record the first completed reconciliation. Idempotent.
    pub fn mark_ready(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Ready;
            }
        }
        self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    /// Move to `Stopped`, returning the previous state.
    pub fn mark_stopped(&self) -> LifecycleState {
        std::mem::replace(&mut *self.state.lock(), LifecycleState::Stopped)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stop Signal
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-fire broadcast stop signal.
///
/// Clones observe the same signal. Firing a second time is reported as
/// [`LifecycleError::AlreadyStopped`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) -> Result<(), LifecycleError> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyStopped);
        }
        self.token.cancel();
        Ok(())
    }

    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal fires.
    pub async fn fired(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
