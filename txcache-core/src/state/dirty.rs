//! Data under the cache changed in transactions that are still open.
//!
//! Every handler here returns a new dirty state instead of touching the
//! published one, so the tracker seen by a reader never changes under it.

use super::{survives_change, CacheState, StateCommandResult};
use crate::{
    CacheImplementation, CacheResult, ChangedObject, DirtyTransactions, StateMachineContext,
    TransactionId,
};
use std::sync::Arc;

pub struct DirtyState<C> {
    /// Instance (or proxy) the state went dirty from.
    cache: Option<Arc<C>>,
    transactions: DirtyTransactions,
    reinitialization_required: bool,
    /// Isolated policy: `cache` is still handed to untracked readers.
    serves_snapshot: bool,
}

impl<C: CacheImplementation> DirtyState<C> {
    pub(super) fn new(
        cache: Option<Arc<C>>,
        transactions: DirtyTransactions,
        reinitialization_required: bool,
        serves_snapshot: bool,
    ) -> Self {
        Self {
            cache,
            transactions,
            reinitialization_required,
            serves_snapshot,
        }
    }

    pub fn transactions(&self) -> &DirtyTransactions {
        &self.transactions
    }

    pub fn is_reinitialization_required(&self) -> bool {
        self.reinitialization_required
    }

    pub fn serves_snapshot(&self) -> bool {
        self.serves_snapshot
    }

    /// Pre-dirty instance for a reader that did not dirty the cache, when
    /// the policy still allows it.
    pub fn snapshot_for(&self, transaction: TransactionId) -> Option<Arc<C>> {
        if !self.serves_snapshot || self.transactions.contains(transaction) {
            return None;
        }
        self.cache.clone()
    }

    fn successor(
        cache: Option<Arc<C>>,
        transactions: DirtyTransactions,
        reinitialization_required: bool,
        serves_snapshot: bool,
    ) -> CacheState<C> {
        let serves_snapshot = serves_snapshot && cache.is_some();
        CacheState::Dirty(Self::new(
            cache,
            transactions,
            reinitialization_required,
            serves_snapshot,
        ))
    }

    /// Callers that may not see the snapshot get a transient instance that is
    /// never published; the tracker stays in place.
    pub(super) fn get_cache(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> CacheResult<StateCommandResult<C, Arc<C>>> {
        if let Some(snapshot) = self.snapshot_for(transaction) {
            return Ok(StateCommandResult::stay(snapshot));
        }
        let cache = context.construction().build_transient()?;
        cache.commit_cache();
        Ok(StateCommandResult::stay(cache))
    }

    pub(super) fn on_change(
        &self,
        transaction: TransactionId,
        changed: &ChangedObject,
    ) -> StateCommandResult<C> {
        let reinitialization_required =
            self.reinitialization_required || !survives_change(self.cache.as_ref(), changed);
        StateCommandResult::switch(
            Self::successor(
                self.cache.clone(),
                self.transactions.with_transaction(transaction),
                reinitialization_required,
                self.serves_snapshot,
            ),
            (),
        )
    }

    /// A tracked transaction starting to commit makes the snapshot stale.
    pub(super) fn before_transaction_complete(
        &self,
        transaction: TransactionId,
    ) -> StateCommandResult<C> {
        if !self.serves_snapshot || !self.transactions.contains(transaction) {
            return StateCommandResult::stay(());
        }
        StateCommandResult::switch(
            Self::successor(
                self.cache.clone(),
                self.transactions.clone(),
                self.reinitialization_required,
                false,
            ),
            (),
        )
    }

    pub(super) fn complete_transaction(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> StateCommandResult<C, bool> {
        let remaining = self.transactions.without_transaction(transaction);
        if remaining.is_empty() {
            return StateCommandResult::switch(
                context
                    .state_factory()
                    .create_empty(self.cache.clone(), self.reinitialization_required),
                true,
            );
        }
        StateCommandResult::switch(
            Self::successor(
                self.cache.clone(),
                remaining,
                self.reinitialization_required,
                self.serves_snapshot,
            ),
            false,
        )
    }

    /// The tracker survives a drop; only the instance goes.
    pub(super) fn drop_cache(&self) -> StateCommandResult<C> {
        StateCommandResult::switch(
            Self::successor(None, self.transactions.clone(), true, false),
            (),
        )
    }
}
