//! Shared context handed to every state handler, plus the pieces a background
//! build uses to report back to its machine.

use crate::construction::CacheConstruction;
use crate::state::{CacheState, CacheStateFactory};
use crate::{CacheError, CacheImplementation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// ============================================================================
// EXCLUSIVITY MONITOR
// ============================================================================

/// Mutual exclusion for reader-triggered cache construction.
///
/// Cloning shares the underlying lock, so several machines can be made to
/// serialize their reader builds against each other.
#[derive(Debug, Clone, Default)]
pub struct ExclusivityMonitor {
    lock: Arc<Mutex<()>>,
}

impl ExclusivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the monitor; released when the guard drops.
    ///
    /// The monitor guards no data, so a poisoned lock is simply re-entered.
    pub fn enter(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// INITIALIZATION CALLBACK
// ============================================================================

/// Sink through which a background build reports its outcome.
///
/// Implemented by [`crate::CacheStateMachine`].
pub trait CacheInitializationCallback<C: CacheImplementation>: Send + Sync {
    /// Whether `state` is still the published state.
    fn is_current_state(&self, state: &Arc<CacheState<C>>) -> bool;

    /// Publish a finished build, provided `expected` is still current.
    fn commit_cache(&self, expected: &Arc<CacheState<C>>, cache: Arc<C>);

    /// Recover from a failed build started by `expected`.
    fn on_build_error(&self, expected: &Arc<CacheState<C>>, error: CacheError);
}

/// Lets a long-running build find out whether anyone still wants its result.
pub trait InitializationStatus {
    fn is_initialization_still_required(&self) -> bool;
}

/// Status used for builds that run on the caller's thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRequired;

impl InitializationStatus for AlwaysRequired {
    fn is_initialization_still_required(&self) -> bool {
        true
    }
}

/// Handle given to a delayed build.
///
/// Captures the initializing state that requested the build; that state is
/// the token compared against the machine's current state on completion.
pub struct InitializationContext<C: CacheImplementation> {
    callback: Weak<dyn CacheInitializationCallback<C>>,
    state: Arc<CacheState<C>>,
    abandoned: Arc<AtomicBool>,
}

impl<C: CacheImplementation> InitializationContext<C> {
    pub(crate) fn new(
        callback: Weak<dyn CacheInitializationCallback<C>>,
        state: Arc<CacheState<C>>,
        abandoned: Arc<AtomicBool>,
    ) -> Self {
        Self {
            callback,
            state,
            abandoned,
        }
    }

    /// Hand the built cache to the machine. Dropped silently if the machine
    /// is gone or has moved past the initializing state.
    pub fn on_complete(&self, cache: C) {
        if let Some(callback) = self.callback.upgrade() {
            callback.commit_cache(&self.state, Arc::new(cache));
        }
    }

    pub fn on_error(&self, error: CacheError) {
        if let Some(callback) = self.callback.upgrade() {
            callback.on_build_error(&self.state, error);
        }
    }
}

impl<C: CacheImplementation> InitializationStatus for InitializationContext<C> {
    fn is_initialization_still_required(&self) -> bool {
        if self.abandoned.load(Ordering::Acquire) {
            return false;
        }
        self.callback
            .upgrade()
            .map(|callback| callback.is_current_state(&self.state))
            .unwrap_or(false)
    }
}

impl<C: CacheImplementation> Clone for InitializationContext<C> {
    fn clone(&self) -> Self {
        Self {
            callback: Weak::clone(&self.callback),
            state: Arc::clone(&self.state),
            abandoned: Arc::clone(&self.abandoned),
        }
    }
}

// ============================================================================
// STATE MACHINE CONTEXT
// ============================================================================

/// Everything a state handler may need besides its own data.
pub struct StateMachineContext<C: CacheImplementation> {
    construction: Box<dyn CacheConstruction<C>>,
    state_factory: CacheStateFactory<C>,
    monitor: ExclusivityMonitor,
    callback: Weak<dyn CacheInitializationCallback<C>>,
}

impl<C: CacheImplementation> StateMachineContext<C> {
    pub(crate) fn new(
        construction: Box<dyn CacheConstruction<C>>,
        state_factory: CacheStateFactory<C>,
        monitor: ExclusivityMonitor,
        callback: Weak<dyn CacheInitializationCallback<C>>,
    ) -> Self {
        Self {
            construction,
            state_factory,
            monitor,
            callback,
        }
    }

    pub fn construction(&self) -> &dyn CacheConstruction<C> {
        self.construction.as_ref()
    }

    pub fn state_factory(&self) -> &CacheStateFactory<C> {
        &self.state_factory
    }

    pub fn monitor(&self) -> &ExclusivityMonitor {
        &self.monitor
    }

    /// Build the context a delayed initialization reports through.
    pub(crate) fn initialization_context(
        &self,
        state: &Arc<CacheState<C>>,
        abandoned: &Arc<AtomicBool>,
    ) -> InitializationContext<C> {
        InitializationContext::new(
            Weak::clone(&self.callback),
            Arc::clone(state),
            Arc::clone(abandoned),
        )
    }
}
