//! No usable cache is published.

use super::{survives_change, StateCommandResult};
use crate::{
    CacheImplementation, CacheResult, ChangedObject, DirtyTransactions, StateMachineContext,
    TransactionId,
};
use std::sync::Arc;

/// Empty state.
///
/// May retain the instance of the state it replaced. A retained instance that
/// does not require reinitialization is re-published without building.
pub struct EmptyState<C> {
    cache: Option<Arc<C>>,
    reinitialization_required: bool,
}

impl<C: CacheImplementation> EmptyState<C> {
    pub(super) fn new(cache: Option<Arc<C>>, reinitialization_required: bool) -> Self {
        Self {
            cache,
            reinitialization_required,
        }
    }

    pub fn retained(&self) -> Option<&Arc<C>> {
        self.cache.as_ref()
    }

    pub fn is_reinitialization_required(&self) -> bool {
        self.reinitialization_required
    }

    pub(super) fn initiate_cache_creation(
        &self,
        context: &StateMachineContext<C>,
    ) -> CacheResult<StateCommandResult<C, Arc<C>>> {
        let factory = context.state_factory();

        if let Some(cache) = self.cache.as_ref().filter(|_| !self.reinitialization_required) {
            return Ok(StateCommandResult::switch(
                factory.create_initialized(Arc::clone(cache)),
                Arc::clone(cache),
            ));
        }

        let construction = context.construction();
        if construction.has_delayed_initialization() {
            let proxy = match &self.cache {
                Some(cache) => Arc::clone(cache),
                None => construction.create_cache()?,
            };
            return Ok(StateCommandResult::switch(
                factory.create_initializing(Arc::clone(&proxy)),
                proxy,
            ));
        }

        let cache = construction.create_cache()?;
        cache.commit_cache();
        Ok(StateCommandResult::switch(
            factory.create_initialized(Arc::clone(&cache)),
            cache,
        ))
    }

    pub(super) fn on_change(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
        changed: &ChangedObject,
    ) -> StateCommandResult<C> {
        let reinitialization_required =
            self.reinitialization_required || !survives_change(self.cache.as_ref(), changed);
        StateCommandResult::switch(
            context.state_factory().create_dirty(
                self.cache.clone(),
                DirtyTransactions::single(transaction),
                reinitialization_required,
                false,
            ),
            (),
        )
    }

    pub(super) fn complete_transaction(
        &self,
        context: &StateMachineContext<C>,
    ) -> StateCommandResult<C, bool> {
        tracing::error!("complete_transaction must not be called on an empty state");
        StateCommandResult::switch(
            context
                .state_factory()
                .create_empty(self.cache.clone(), self.reinitialization_required),
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{static_context, TestPayload};
    use crate::{StateKind, StatePolicy};

    #[test]
    fn test_static_build_publishes_initialized_and_commits() {
        let (context, builds) = static_context(StatePolicy::Default);
        let state = EmptyState::<TestPayload>::new(None, false);

        let (next, cache) = state.initiate_cache_creation(&context).unwrap().into_parts();
        assert_eq!(next.unwrap().kind(), StateKind::Initialized);
        assert_eq!(cache.commits(), 1);
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retained_instance_republished_without_build() {
        let (context, builds) = static_context(StatePolicy::Default);
        let retained = Arc::new(TestPayload::new(42));
        let state = EmptyState::new(Some(Arc::clone(&retained)), false);

        let (next, cache) = state.initiate_cache_creation(&context).unwrap().into_parts();
        assert_eq!(next.unwrap().kind(), StateKind::Initialized);
        assert!(Arc::ptr_eq(&cache, &retained));
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reinitialization_forces_build() {
        let (context, builds) = static_context(StatePolicy::Default);
        let retained = Arc::new(TestPayload::new(42));
        let state = EmptyState::new(Some(Arc::clone(&retained)), true);

        let (_, cache) = state.initiate_cache_creation(&context).unwrap().into_parts();
        assert!(!Arc::ptr_eq(&cache, &retained));
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_change_tracks_transaction() {
        let (context, _) = static_context(StatePolicy::Default);
        let tx = TransactionId::new();
        let state = EmptyState::<TestPayload>::new(None, false);

        let next = state
            .on_change(&context, tx, &ChangedObject::new("Actor", crate::ChangeType::Update))
            .into_parts()
            .0
            .unwrap();
        assert_eq!(next.kind(), StateKind::Dirty);
        assert!(next.is_dirty_transaction(tx));
    }
}
