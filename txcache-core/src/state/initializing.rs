//! Background build in progress.

use super::{CacheState, StateCommandResult};
use crate::{CacheImplementation, DirtyTransactions, StateMachineContext, TransactionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Initializing state: callers receive the proxy until the build commits.
pub struct InitializingState<C> {
    cache: Arc<C>,
    abandoned: Arc<AtomicBool>,
}

impl<C: CacheImplementation> InitializingState<C> {
    pub(super) fn new(cache: Arc<C>, abandoned: Arc<AtomicBool>) -> Self {
        Self { cache, abandoned }
    }

    pub fn cache(&self) -> Arc<C> {
        Arc::clone(&self.cache)
    }

    /// Whether the build started for this state has been given up.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    /// The in-progress build can no longer be trusted; the proxy travels on.
    pub(super) fn on_change(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> StateCommandResult<C> {
        StateCommandResult::switch(
            context.state_factory().create_dirty(
                Some(self.cache()),
                DirtyTransactions::single(transaction),
                true,
                false,
            ),
            (),
        )
    }

    pub(super) fn commit_cache(
        &self,
        context: &StateMachineContext<C>,
        cache: Arc<C>,
    ) -> StateCommandResult<C> {
        cache.commit_cache();
        StateCommandResult::switch(context.state_factory().create_initialized(cache), ())
    }

    pub(super) fn discard(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub(super) fn activate(&self, this: &Arc<CacheState<C>>, context: &StateMachineContext<C>) {
        tracing::debug!(
            cache = std::any::type_name::<C>(),
            "Starting delayed cache initialization"
        );
        context
            .construction()
            .start_delayed_initialization(context.initialization_context(this, &self.abandoned));
    }
}
