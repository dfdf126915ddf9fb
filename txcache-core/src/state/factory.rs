//! Policy-aware construction of state variants.

use super::{CacheState, DirtyState, EmptyState, InitializedState, InitializingState};
use crate::{CacheImplementation, DirtyTransactions, StatePolicy};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Builds every state a machine publishes.
///
/// The policy is fixed at machine creation; it only affects whether a dirty
/// state keeps serving the instance it was created from.
pub struct CacheStateFactory<C> {
    policy: StatePolicy,
    _cache: PhantomData<fn() -> C>,
}

impl<C: CacheImplementation> CacheStateFactory<C> {
    pub fn new(policy: StatePolicy) -> Self {
        Self {
            policy,
            _cache: PhantomData,
        }
    }

    pub fn policy(&self) -> StatePolicy {
        self.policy
    }

    /// Empty state, optionally retaining the previous instance.
    pub fn create_empty(
        &self,
        cache: Option<Arc<C>>,
        reinitialization_required: bool,
    ) -> CacheState<C> {
        CacheState::Empty(EmptyState::new(cache, reinitialization_required))
    }

    /// Initializing state around a proxy. Each one gets its own abandonment flag.
    pub fn create_initializing(&self, proxy: Arc<C>) -> CacheState<C> {
        CacheState::Initializing(InitializingState::new(proxy, Arc::new(AtomicBool::new(false))))
    }

    pub fn create_initialized(&self, cache: Arc<C>) -> CacheState<C> {
        CacheState::Initialized(InitializedState::new(cache))
    }

    /// Dirty state tracking `transactions`.
    ///
    /// The snapshot is served only under the isolated policy, and only when
    /// `cache` was a fully built instance (`from_initialized`).
    pub fn create_dirty(
        &self,
        cache: Option<Arc<C>>,
        transactions: DirtyTransactions,
        reinitialization_required: bool,
        from_initialized: bool,
    ) -> CacheState<C> {
        let serves_snapshot = from_initialized && self.policy.retains_snapshot() && cache.is_some();
        CacheState::Dirty(DirtyState::new(
            cache,
            transactions,
            reinitialization_required,
            serves_snapshot,
        ))
    }
}

impl<C> fmt::Debug for CacheStateFactory<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStateFactory")
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::TestPayload;
    use crate::{StateKind, TransactionId};

    #[test]
    fn test_snapshot_served_only_under_isolated_policy() {
        let tx = TransactionId::new();
        let other = TransactionId::new();
        let cache = Arc::new(TestPayload::new(1));

        let default = CacheStateFactory::<TestPayload>::new(StatePolicy::Default);
        let state = default.create_dirty(
            Some(Arc::clone(&cache)),
            DirtyTransactions::single(tx),
            true,
            true,
        );
        assert_eq!(state.kind(), StateKind::Dirty);
        assert!(state.get_cache_quick_no_build(other).is_none());

        let isolated = CacheStateFactory::<TestPayload>::new(StatePolicy::Isolated);
        let state = isolated.create_dirty(
            Some(Arc::clone(&cache)),
            DirtyTransactions::single(tx),
            true,
            true,
        );
        let served = state.get_cache_quick_no_build(other).unwrap();
        assert!(Arc::ptr_eq(&served, &cache));
        assert!(state.get_cache_quick_no_build(tx).is_none());
    }

    #[test]
    fn test_proxy_is_never_served_as_snapshot() {
        let tx = TransactionId::new();
        let isolated = CacheStateFactory::<TestPayload>::new(StatePolicy::Isolated);
        let state = isolated.create_dirty(
            Some(Arc::new(TestPayload::new(1))),
            DirtyTransactions::single(tx),
            true,
            false,
        );
        assert!(state.get_cache_quick_no_build(TransactionId::new()).is_none());
    }
}
