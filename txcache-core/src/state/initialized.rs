//! A fully built cache is published.

use super::{survives_change, StateCommandResult};
use crate::{
    CacheImplementation, ChangedObject, DirtyTransactions, StateMachineContext, TransactionId,
};
use std::sync::Arc;

pub struct InitializedState<C> {
    cache: Arc<C>,
}

impl<C: CacheImplementation> InitializedState<C> {
    pub(super) fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> Arc<C> {
        Arc::clone(&self.cache)
    }

    /// Seeds the tracker with `transaction`. The instance decides whether it
    /// survives the change.
    pub(super) fn on_change(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
        changed: &ChangedObject,
    ) -> StateCommandResult<C> {
        let reinitialization_required = !survives_change(Some(&self.cache), changed);
        StateCommandResult::switch(
            context.state_factory().create_dirty(
                Some(self.cache()),
                DirtyTransactions::single(transaction),
                reinitialization_required,
                true,
            ),
            (),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::{static_context, TestPayload};
    use crate::{ChangeType, StateKind, StatePolicy};

    #[test]
    fn test_on_change_moves_to_dirty() {
        let (context, _) = static_context(StatePolicy::Default);
        let tx = TransactionId::new();
        let state = InitializedState::new(Arc::new(TestPayload::new(1)));

        let next = state
            .on_change(&context, tx, &ChangedObject::new("Executor", ChangeType::Delete))
            .into_parts()
            .0
            .unwrap();
        assert_eq!(next.kind(), StateKind::Dirty);
        assert_eq!(next.dirty_transaction_count(), 1);
        assert!(next.get_cache_quick_no_build(tx).is_none());
    }
}
