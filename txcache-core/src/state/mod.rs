//! Cache lifecycle states.
//!
//! The set of states is closed, so it is modelled as one enum and every
//! operation is a `match` over the variant. Handlers never mutate a
//! published state: they return a [`StateCommandResult`] carrying the data for
//! the caller and, when the state must change, a freshly built next state.
//! Publishing that next state is the machine's job.
//!
//! # State Transition Diagram
//!
//! ```text
//!                 get_cache (static)
//!   Empty ───────────────────────────────→ Initialized
//!     │ get_cache (lazy)                        ↑
//!     └────────→ Initializing ── commit_cache ──┘
//!
//!   Empty | Initializing | Initialized ── on_change ──→ Dirty ↺ on_change
//!   Dirty ── last tracked transaction completes ──→ Empty
//!   any ── drop_cache ──→ Empty   (Dirty keeps its tracker)
//! ```

mod dirty;
mod empty;
mod factory;
mod initialized;
mod initializing;

pub use dirty::DirtyState;
pub use empty::EmptyState;
pub use factory::CacheStateFactory;
pub use initialized::InitializedState;
pub use initializing::InitializingState;

use crate::{CacheImplementation, CacheResult, ChangedObject, StateMachineContext, TransactionId};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// STATE KIND
// ============================================================================

/// Discriminant of a [`CacheState`], for logging and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Empty,
    Initializing,
    Initialized,
    Dirty,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Empty => "empty",
            StateKind::Initializing => "initializing",
            StateKind::Initialized => "initialized",
            StateKind::Dirty => "dirty",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// COMMAND RESULT
// ============================================================================

/// Outcome of a state handler: data for the caller plus an optional next state.
///
/// `next_state == None` means "stay in the current state".
pub struct StateCommandResult<C: CacheImplementation, D = ()> {
    next_state: Option<CacheState<C>>,
    data: D,
}

impl<C: CacheImplementation, D> StateCommandResult<C, D> {
    pub fn stay(data: D) -> Self {
        Self {
            next_state: None,
            data,
        }
    }

    pub fn switch(next_state: CacheState<C>, data: D) -> Self {
        Self {
            next_state: Some(next_state),
            data,
        }
    }

    pub fn is_stay(&self) -> bool {
        self.next_state.is_none()
    }

    pub fn into_parts(self) -> (Option<CacheState<C>>, D) {
        (self.next_state, self.data)
    }
}

// ============================================================================
// CACHE STATE
// ============================================================================

/// One lifecycle state of a cache.
pub enum CacheState<C: CacheImplementation> {
    /// No usable cache; the next `get_cache` builds or re-publishes one.
    Empty(EmptyState<C>),
    /// Background build in progress; callers get the proxy.
    Initializing(InitializingState<C>),
    /// Fully built cache, safe for every reader.
    Initialized(InitializedState<C>),
    /// Data under the cache changed in still-open transactions.
    Dirty(DirtyState<C>),
}

impl<C: CacheImplementation> CacheState<C> {
    pub fn kind(&self) -> StateKind {
        match self {
            CacheState::Empty(_) => StateKind::Empty,
            CacheState::Initializing(_) => StateKind::Initializing,
            CacheState::Initialized(_) => StateKind::Initialized,
            CacheState::Dirty(_) => StateKind::Dirty,
        }
    }

    /// True whenever any transaction is tracked as having dirtied the cache.
    pub fn is_dirty_transaction_exists(&self) -> bool {
        match self {
            CacheState::Dirty(state) => !state.transactions().is_empty(),
            _ => false,
        }
    }

    pub fn is_dirty_transaction(&self, transaction: TransactionId) -> bool {
        match self {
            CacheState::Dirty(state) => state.transactions().contains(transaction),
            _ => false,
        }
    }

    pub fn dirty_transaction_count(&self) -> usize {
        match self {
            CacheState::Dirty(state) => state.transactions().len(),
            _ => 0,
        }
    }

    /// Cache usable by `transaction` without any construction, if there is one.
    pub fn get_cache_quick_no_build(&self, transaction: TransactionId) -> Option<Arc<C>> {
        match self {
            CacheState::Empty(_) | CacheState::Initializing(_) => None,
            CacheState::Initialized(state) => Some(state.cache()),
            CacheState::Dirty(state) => state.snapshot_for(transaction),
        }
    }

    /// Build handler: a usable cache for `transaction`, building if needed.
    pub fn get_cache(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> CacheResult<StateCommandResult<C, Arc<C>>> {
        match self {
            CacheState::Empty(state) => state.initiate_cache_creation(context),
            CacheState::Initializing(state) => Ok(StateCommandResult::stay(state.cache())),
            CacheState::Initialized(state) => Ok(StateCommandResult::stay(state.cache())),
            CacheState::Dirty(state) => state.get_cache(context, transaction),
        }
    }

    /// Build handler used by `get_cache_if_not_locked`.
    ///
    /// The machine never reaches this with a dirty state, so every variant
    /// behaves like [`CacheState::get_cache`].
    pub fn get_cache_if_not_locked(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> CacheResult<StateCommandResult<C, Arc<C>>> {
        self.get_cache(context, transaction)
    }

    /// `transaction` changed data this cache depends on. Always switches.
    pub fn on_change(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
        changed: &ChangedObject,
    ) -> StateCommandResult<C> {
        match self {
            CacheState::Empty(state) => state.on_change(context, transaction, changed),
            CacheState::Initializing(state) => state.on_change(context, transaction),
            CacheState::Initialized(state) => state.on_change(context, transaction, changed),
            CacheState::Dirty(state) => state.on_change(transaction, changed),
        }
    }

    /// `transaction` is about to commit or roll back.
    pub fn before_transaction_complete(
        &self,
        _context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> StateCommandResult<C> {
        match self {
            CacheState::Dirty(state) => state.before_transaction_complete(transaction),
            _ => StateCommandResult::stay(()),
        }
    }

    /// `transaction` finished. The data flag is true once no tracked dirty
    /// transaction remains.
    pub fn complete_transaction(
        &self,
        context: &StateMachineContext<C>,
        transaction: TransactionId,
    ) -> StateCommandResult<C, bool> {
        match self {
            CacheState::Dirty(state) => state.complete_transaction(context, transaction),
            CacheState::Empty(state) => state.complete_transaction(context),
            other => {
                tracing::error!(
                    state = %other.kind(),
                    tx = %transaction,
                    "complete_transaction must not be called without a dirty transaction"
                );
                StateCommandResult::stay(true)
            }
        }
    }

    /// Background build finished for this state.
    pub fn commit_cache(
        &self,
        context: &StateMachineContext<C>,
        cache: Arc<C>,
    ) -> StateCommandResult<C> {
        match self {
            CacheState::Initializing(state) => state.commit_cache(context, cache),
            other => {
                tracing::error!(
                    state = %other.kind(),
                    "commit_cache must not be called on this state"
                );
                StateCommandResult::stay(())
            }
        }
    }

    /// Throw the cache away.
    pub fn drop_cache(&self, context: &StateMachineContext<C>) -> StateCommandResult<C> {
        match self {
            CacheState::Dirty(state) => state.drop_cache(),
            _ => StateCommandResult::switch(context.state_factory().create_empty(None, false), ()),
        }
    }

    /// Called once this state is superseded, or was never published.
    pub(crate) fn discard(&self) {
        if let CacheState::Initializing(state) = self {
            state.discard();
        }
    }

    /// Called once this state has been published.
    pub(crate) fn activate(this: &Arc<Self>, context: &StateMachineContext<C>) {
        if let CacheState::Initializing(state) = this.as_ref() {
            state.activate(this, context);
        }
    }
}

impl<C: CacheImplementation> fmt::Debug for CacheState<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("kind", &self.kind())
            .field("dirty_transactions", &self.dirty_transaction_count())
            .finish()
    }
}

/// Whether `cache` can absorb `changed` and remain valid.
fn survives_change<C: CacheImplementation>(
    cache: Option<&Arc<C>>,
    changed: &ChangedObject,
) -> bool {
    cache.map(|cache| cache.on_change(changed)).unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::construction::StaticConstruction;
    use crate::{
        BuildError, CacheError, CacheImplementation, CacheInitializationCallback, CacheState,
        CacheStateFactory, ChangedObject, ExclusivityMonitor, StateMachineContext, StatePolicy,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};

    #[derive(Debug, Default)]
    pub struct TestPayload {
        pub id: usize,
        pub is_proxy: bool,
        pub absorbs_changes: bool,
        commits: AtomicUsize,
    }

    impl TestPayload {
        pub fn new(id: usize) -> Self {
            Self {
                id,
                ..Self::default()
            }
        }

        pub fn proxy() -> Self {
            Self {
                is_proxy: true,
                ..Self::default()
            }
        }

        pub fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }
    }

    impl CacheImplementation for TestPayload {
        fn commit_cache(&self) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn on_change(&self, _changed: &ChangedObject) -> bool {
            self.absorbs_changes
        }
    }

    /// Callback for contexts that never run a background build.
    struct Detached;

    impl<C: CacheImplementation> CacheInitializationCallback<C> for Detached {
        fn is_current_state(&self, _state: &Arc<CacheState<C>>) -> bool {
            false
        }

        fn commit_cache(&self, _expected: &Arc<CacheState<C>>, _cache: Arc<C>) {}

        fn on_build_error(&self, _expected: &Arc<CacheState<C>>, _error: CacheError) {}
    }

    /// Context with a static strategy; the counter tracks factory calls.
    pub fn static_context(
        policy: StatePolicy,
    ) -> (StateMachineContext<TestPayload>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let construction = StaticConstruction::new(move || {
            let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, BuildError>(TestPayload::new(id))
        });
        let callback: Weak<dyn CacheInitializationCallback<TestPayload>> = Weak::<Detached>::new();
        let context = StateMachineContext::new(
            Box::new(construction),
            CacheStateFactory::new(policy),
            ExclusivityMonitor::new(),
            callback,
        );
        (context, builds)
    }
}
