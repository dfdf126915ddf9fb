//! The cache state machine.
//!
//! Owns the single published [`CacheState`] and runs every operation through
//! the same loop: read the current state, ask it for a result, try to publish
//! the proposed next state with a compare-and-swap on state identity, and
//! start over from the newly published state when the swap loses a race.
//!
//! Only the reader path of `get_cache` takes the exclusivity monitor. Writers
//! build and race freely; a losing candidate is discarded unpublished.

use crate::audit::CommandAudit;
use crate::construction::{
    CacheConstruction, DirectExecutor, LazyCacheFactory, LazyConstruction, StaticCacheFactory,
    StaticConstruction, TransactionalExecutor,
};
use crate::state::StateCommandResult;
use crate::{
    AuditCommand, AuditEventKind, CacheError, CacheImplementation, CacheInitializationCallback,
    CacheResult, CacheState, CacheStateFactory, CacheStateMachineAudit, ChangedObject,
    ExclusivityMonitor, StateKind, StateMachineConfig, StateMachineContext, StatePolicy,
    TracingAudit, TransactionId,
};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;

type BuildHandler<C> = fn(
    &CacheState<C>,
    &StateMachineContext<C>,
    TransactionId,
) -> CacheResult<StateCommandResult<C, Arc<C>>>;

// ============================================================================
// STATE SLOT
// ============================================================================

/// Atomically replaceable reference to the published state.
///
/// The lock is held only to clone or swap the `Arc`, never while a handler
/// runs.
struct StateSlot<C: CacheImplementation> {
    current: RwLock<Arc<CacheState<C>>>,
}

impl<C: CacheImplementation> StateSlot<C> {
    fn new(initial: CacheState<C>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    fn load(&self) -> Arc<CacheState<C>> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Publish `next` if `expected` is still current. Hands `next` back on
    /// failure.
    fn compare_and_set(
        &self,
        expected: &Arc<CacheState<C>>,
        next: Arc<CacheState<C>>,
    ) -> Result<(), Arc<CacheState<C>>> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&guard, expected) {
            return Err(next);
        }
        *guard = next;
        Ok(())
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Lifecycle state machine for one cache.
///
/// Created through [`CacheStateMachineBuilder`] or one of the
/// `with_*_factory` shortcuts. Always lives in an `Arc` so background builds
/// can report back through a weak reference.
pub struct CacheStateMachine<C: CacheImplementation> {
    context: StateMachineContext<C>,
    state: StateSlot<C>,
    audit: Arc<dyn CacheStateMachineAudit>,
}

impl<C: CacheImplementation> CacheStateMachine<C> {
    /// Machine that builds synchronously with `factory`.
    pub fn with_static_factory<F>(factory: F, config: &StateMachineConfig) -> Arc<Self>
    where
        F: StaticCacheFactory<C> + 'static,
    {
        CacheStateMachineBuilder::new(StaticConstruction::new(factory))
            .config(config)
            .build()
    }

    /// Machine that hands out proxies and builds on `runtime`.
    pub fn with_lazy_factory(
        factory: Arc<dyn LazyCacheFactory<C>>,
        config: &StateMachineConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        CacheStateMachineBuilder::lazy(factory, runtime).config(config).build()
    }

    pub fn policy(&self) -> StatePolicy {
        self.context.state_factory().policy()
    }

    pub fn current_state_kind(&self) -> StateKind {
        self.state.load().kind()
    }

    pub fn dirty_transaction_count(&self) -> usize {
        self.state.load().dirty_transaction_count()
    }

    /// Whether `transaction` is tracked as having dirtied the cache.
    pub fn is_dirty_for_transaction(&self, transaction: TransactionId) -> bool {
        self.state.load().is_dirty_transaction(transaction)
    }

    /// Cache usable by `transaction` right now. Never builds.
    pub fn get_cache_fast(&self, transaction: TransactionId) -> Option<Arc<C>> {
        self.state.load().get_cache_quick_no_build(transaction)
    }

    /// Cache usable by `transaction`, building one if necessary.
    ///
    /// Synchronous build failures are returned and leave the state as it was.
    pub fn get_cache(
        &self,
        transaction: TransactionId,
        is_write_transaction: bool,
    ) -> CacheResult<Arc<C>> {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::GetCache);
        loop {
            let current = self.state.load();
            if let Some(cache) = current.get_cache_quick_no_build(transaction) {
                audit.tx(AuditEventKind::QuickResult, transaction);
                return Ok(cache);
            }

            let built = if is_write_transaction {
                self.build(&audit, &current, transaction, CacheState::get_cache)?
            } else {
                let _guard = self.context.monitor().enter();
                let current = self.state.load();
                self.build(&audit, &current, transaction, CacheState::get_cache)?
            };
            if let Some(cache) = built {
                return Ok(cache);
            }
        }
    }

    /// Like [`CacheStateMachine::get_cache`], but returns `None` instead of
    /// building while any transaction holds the cache dirty.
    pub fn get_cache_if_not_locked(
        &self,
        transaction: TransactionId,
        is_write_transaction: bool,
    ) -> CacheResult<Option<Arc<C>>> {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::GetCache);
        loop {
            let current = self.state.load();
            if current.is_dirty_transaction_exists() {
                return Ok(None);
            }
            if let Some(cache) = current.get_cache_quick_no_build(transaction) {
                audit.tx(AuditEventKind::QuickResult, transaction);
                return Ok(Some(cache));
            }

            let built = if is_write_transaction {
                self.build(&audit, &current, transaction, CacheState::get_cache_if_not_locked)?
            } else {
                let _guard = self.context.monitor().enter();
                let current = self.state.load();
                if current.is_dirty_transaction_exists() {
                    return Ok(None);
                }
                self.build(&audit, &current, transaction, CacheState::get_cache_if_not_locked)?
            };
            if built.is_some() {
                return Ok(built);
            }
        }
    }

    /// `transaction` changed data the cache depends on.
    pub fn on_change(&self, transaction: TransactionId, changed: &ChangedObject) {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::OnChange);
        loop {
            let current = self.state.load();
            audit.tx(AuditEventKind::BeforeOnChange, transaction);
            let (next, ()) = current
                .on_change(&self.context, transaction, changed)
                .into_parts();

            let Some(next) = next else {
                self.report_missing_transition(&audit, &current, transaction);
                audit.tx(AuditEventKind::AfterOnChange, transaction);
                return;
            };
            let applied = self.apply(&audit, &current, Some(next), Some(transaction));
            audit.tx(AuditEventKind::AfterOnChange, transaction);
            if applied {
                return;
            }
        }
    }

    /// `transaction` is about to commit or roll back.
    pub fn before_transaction_complete(&self, transaction: TransactionId) {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::BeforeTransactionComplete);
        loop {
            let current = self.state.load();
            let (next, ()) = current
                .before_transaction_complete(&self.context, transaction)
                .into_parts();
            if self.apply(&audit, &current, next, Some(transaction)) {
                return;
            }
        }
    }

    /// `transaction` committed or rolled back. Returns true once no tracked
    /// dirty transaction remains.
    ///
    /// Completing a transaction this cache never tracked changes nothing.
    pub fn on_transaction_completed(&self, transaction: TransactionId) -> bool {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::CompleteTransaction);
        loop {
            let current = self.state.load();
            if !current.is_dirty_transaction(transaction) {
                audit.stayed(Some(transaction));
                return !current.is_dirty_transaction_exists();
            }

            audit.tx(AuditEventKind::BeforeCompleteTransaction, transaction);
            let (next, all_completed) = current
                .complete_transaction(&self.context, transaction)
                .into_parts();

            let Some(next) = next else {
                self.report_missing_transition(&audit, &current, transaction);
                audit.tx(AuditEventKind::AfterCompleteTransaction, transaction);
                return all_completed;
            };
            let applied = self.apply(&audit, &current, Some(next), Some(transaction));
            audit.tx(AuditEventKind::AfterCompleteTransaction, transaction);
            if applied {
                if all_completed {
                    audit.tx(AuditEventKind::AllTransactionsCompleted, transaction);
                }
                return all_completed;
            }
        }
    }

    /// Throw the current cache away.
    pub fn drop_cache(&self) {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::DropCache);
        loop {
            let current = self.state.load();
            let (next, ()) = current.drop_cache(&self.context).into_parts();
            if self.apply(&audit, &current, next, None) {
                tracing::debug!(cache = std::any::type_name::<C>(), "Cache dropped");
                return;
            }
        }
    }

    /// Run a build handler against `current` and try to publish its result.
    /// `None` means the publish lost a race and the caller must retry.
    fn build(
        &self,
        audit: &CommandAudit<'_>,
        current: &Arc<CacheState<C>>,
        transaction: TransactionId,
        handler: BuildHandler<C>,
    ) -> CacheResult<Option<Arc<C>>> {
        audit.tx(AuditEventKind::BeforeCreation, transaction);
        let result = handler(current, &self.context, transaction).inspect_err(|e| {
            tracing::error!(
                cache = std::any::type_name::<C>(),
                tx = %transaction,
                error = %e,
                "Cache build failed"
            );
        })?;
        let (next, cache) = result.into_parts();
        let applied = self.apply(audit, current, next, Some(transaction));
        audit.tx(AuditEventKind::AfterCreation, transaction);
        Ok(applied.then_some(cache))
    }

    /// Publish `next` in place of `current`.
    ///
    /// Returns false only when another thread published first; the candidate
    /// is discarded and the caller retries.
    fn apply(
        &self,
        audit: &CommandAudit<'_>,
        current: &Arc<CacheState<C>>,
        next: Option<CacheState<C>>,
        transaction: Option<TransactionId>,
    ) -> bool {
        let Some(next) = next else {
            audit.stayed(transaction);
            return true;
        };

        let from = current.kind();
        let to = next.kind();
        let next = Arc::new(next);
        match self.state.compare_and_set(current, Arc::clone(&next)) {
            Ok(()) => {
                current.discard();
                audit.emit(AuditEventKind::Switched { from, to }, transaction);
                CacheState::activate(&next, &self.context);
                true
            }
            Err(rejected) => {
                rejected.discard();
                tracing::debug!(
                    cache = std::any::type_name::<C>(),
                    from = %from,
                    to = %to,
                    "Cache state changed concurrently, retrying"
                );
                audit.emit(AuditEventKind::SwitchFailed { from, to }, transaction);
                false
            }
        }
    }

    fn report_missing_transition(
        &self,
        audit: &CommandAudit<'_>,
        current: &Arc<CacheState<C>>,
        transaction: TransactionId,
    ) {
        tracing::error!(
            cache = std::any::type_name::<C>(),
            state = %current.kind(),
            tx = %transaction,
            "State handler stayed where a transition is mandatory"
        );
        audit.fatal(current.kind(), Some(transaction));
    }
}

impl<C: CacheImplementation> CacheInitializationCallback<C> for CacheStateMachine<C> {
    fn is_current_state(&self, state: &Arc<CacheState<C>>) -> bool {
        Arc::ptr_eq(&self.state.load(), state)
    }

    fn commit_cache(&self, expected: &Arc<CacheState<C>>, cache: Arc<C>) {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::CommitCache);
        let current = self.state.load();
        if !Arc::ptr_eq(&current, expected) {
            tracing::debug!(
                cache = std::any::type_name::<C>(),
                state = %current.kind(),
                "Ignoring build result for a superseded state"
            );
            audit.emit(AuditEventKind::StaleCommit, None);
            return;
        }

        audit.emit(AuditEventKind::BeforeCommit, None);
        let (next, ()) = current.commit_cache(&self.context, cache).into_parts();
        if !self.apply(&audit, &current, next, None) {
            audit.emit(AuditEventKind::StaleCommit, None);
        }
        audit.emit(AuditEventKind::AfterCommit, None);
    }

    fn on_build_error(&self, expected: &Arc<CacheState<C>>, error: CacheError) {
        let audit = CommandAudit::new(self.audit.as_ref(), AuditCommand::InitializationError);
        tracing::error!(
            cache = std::any::type_name::<C>(),
            error = %error,
            "Delayed cache initialization failed"
        );
        audit.emit(
            AuditEventKind::InitializationError {
                reason: error.to_string(),
            },
            None,
        );

        let empty = self.context.state_factory().create_empty(None, false);
        if !self.apply(&audit, expected, Some(empty), None) {
            tracing::debug!(
                cache = std::any::type_name::<C>(),
                "Failed build already superseded, state left in place"
            );
        }
    }
}

impl<C: CacheImplementation> fmt::Debug for CacheStateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStateMachine")
            .field("cache", &std::any::type_name::<C>())
            .field("policy", &self.policy())
            .field("state", &self.state.load())
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

enum ConstructionChoice<C: CacheImplementation> {
    Ready(Box<dyn CacheConstruction<C>>),
    Lazy {
        factory: Arc<dyn LazyCacheFactory<C>>,
        executor: Arc<dyn TransactionalExecutor>,
        runtime: Handle,
    },
}

/// Assembles a [`CacheStateMachine`].
///
/// ```ignore
/// let machine = CacheStateMachineBuilder::lazy(factory, Handle::current())
///     .policy(StatePolicy::Isolated)
///     .executor(Arc::new(MyTransactionScope::new(pool)))
///     .audit(Arc::new(NoopAudit))
///     .build();
/// ```
pub struct CacheStateMachineBuilder<C: CacheImplementation> {
    construction: ConstructionChoice<C>,
    policy: StatePolicy,
    monitor: ExclusivityMonitor,
    audit: Arc<dyn CacheStateMachineAudit>,
}

impl<C: CacheImplementation> CacheStateMachineBuilder<C> {
    /// Builder around an already assembled construction strategy.
    pub fn new(construction: impl CacheConstruction<C> + 'static) -> Self {
        Self::with_choice(ConstructionChoice::Ready(Box::new(construction)))
    }

    /// Builder for a lazy strategy running on `runtime`.
    pub fn lazy(factory: Arc<dyn LazyCacheFactory<C>>, runtime: Handle) -> Self {
        Self::with_choice(ConstructionChoice::Lazy {
            factory,
            executor: Arc::new(DirectExecutor),
            runtime,
        })
    }

    fn with_choice(construction: ConstructionChoice<C>) -> Self {
        Self {
            construction,
            policy: StatePolicy::default(),
            monitor: ExclusivityMonitor::new(),
            audit: Arc::new(TracingAudit::default()),
        }
    }

    /// Take the policy and the default audit sink from `config`.
    pub fn config(mut self, config: &StateMachineConfig) -> Self {
        self.policy = config.policy;
        self.audit = Arc::new(TracingAudit::new(config.audit_transitions));
        self
    }

    pub fn policy(mut self, policy: StatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Transaction scope for background builds. Only used by lazy strategies.
    pub fn executor(mut self, executor: Arc<dyn TransactionalExecutor>) -> Self {
        match &mut self.construction {
            ConstructionChoice::Lazy { executor: slot, .. } => *slot = executor,
            ConstructionChoice::Ready(_) => {
                tracing::warn!("Executor ignored: construction strategy already assembled");
            }
        }
        self
    }

    /// Share a monitor with other machines.
    pub fn monitor(mut self, monitor: ExclusivityMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn CacheStateMachineAudit>) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> Arc<CacheStateMachine<C>> {
        let construction: Box<dyn CacheConstruction<C>> = match self.construction {
            ConstructionChoice::Ready(construction) => construction,
            ConstructionChoice::Lazy {
                factory,
                executor,
                runtime,
            } => Box::new(LazyConstruction::new(factory, executor, runtime)),
        };

        tracing::debug!(
            cache = std::any::type_name::<C>(),
            policy = %self.policy,
            delayed = construction.has_delayed_initialization(),
            "Creating cache state machine"
        );

        let policy = self.policy;
        let monitor = self.monitor;
        let audit = self.audit;
        Arc::new_cyclic(move |machine: &Weak<CacheStateMachine<C>>| {
            let callback: Weak<dyn CacheInitializationCallback<C>> = machine.clone();
            let state_factory = CacheStateFactory::new(policy);
            let initial = state_factory.create_empty(None, false);
            CacheStateMachine {
                context: StateMachineContext::new(construction, state_factory, monitor, callback),
                state: StateSlot::new(initial),
                audit,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::TestPayload;
    use crate::{AuditEvent, BuildError, ChangeType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<AuditEventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|event| event.kind.clone())
                .collect()
        }
    }

    impl CacheStateMachineAudit for Recorder {
        fn on_event(&self, event: &AuditEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn counting_machine(
        policy: StatePolicy,
    ) -> (Arc<CacheStateMachine<TestPayload>>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let construction = StaticConstruction::new(move || {
            let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, BuildError>(TestPayload::new(id))
        });
        let machine = CacheStateMachineBuilder::new(construction).policy(policy).build();
        (machine, builds)
    }

    fn change() -> ChangedObject {
        ChangedObject::new("Actor", ChangeType::Update)
    }

    #[test]
    fn test_machine_starts_empty() {
        let (machine, builds) = counting_machine(StatePolicy::Default);
        assert_eq!(machine.current_state_kind(), StateKind::Empty);
        assert!(machine.get_cache_fast(TransactionId::new()).is_none());
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_get_cache_builds_once_then_serves_fast() {
        let (machine, builds) = counting_machine(StatePolicy::Default);
        let tx = TransactionId::new();

        let first = machine.get_cache(tx, false).unwrap();
        let second = machine.get_cache(tx, true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(machine.current_state_kind(), StateKind::Initialized);
    }

    #[test]
    fn test_build_failure_propagates_without_state_change() {
        let machine = CacheStateMachine::<TestPayload>::with_static_factory(
            || Err::<TestPayload, _>(BuildError::failed("database offline")),
            &StateMachineConfig::default(),
        );

        let err = machine.get_cache(TransactionId::new(), true).unwrap_err();
        assert_eq!(err, CacheError::Build(BuildError::failed("database offline")));
        assert_eq!(machine.current_state_kind(), StateKind::Empty);
    }

    #[test]
    fn test_dirty_lifecycle_returns_flag_on_last_completion() {
        let (machine, _) = counting_machine(StatePolicy::Default);
        let tx1 = TransactionId::new();
        let tx2 = TransactionId::new();
        machine.get_cache(tx1, true).unwrap();

        machine.on_change(tx1, &change());
        machine.on_change(tx2, &change());
        assert_eq!(machine.dirty_transaction_count(), 2);

        assert!(!machine.on_transaction_completed(tx1));
        assert!(!machine.is_dirty_for_transaction(tx1));
        assert!(machine.is_dirty_for_transaction(tx2));
        assert!(machine.on_transaction_completed(tx2));
        assert_eq!(machine.current_state_kind(), StateKind::Empty);
    }

    #[test]
    fn test_untracked_completion_stays() {
        let (machine, _) = counting_machine(StatePolicy::Default);
        let tx = TransactionId::new();
        machine.on_change(tx, &change());

        assert!(!machine.on_transaction_completed(TransactionId::new()));
        assert!(machine.is_dirty_for_transaction(tx));
        assert!(machine.on_transaction_completed(tx));
        assert!(machine.on_transaction_completed(tx));
    }

    #[test]
    fn test_stale_commit_is_ignored() {
        let (machine, _) = counting_machine(StatePolicy::Default);
        let stale = Arc::new(
            CacheStateFactory::<TestPayload>::new(StatePolicy::Default)
                .create_initializing(Arc::new(TestPayload::proxy())),
        );

        assert!(!machine.is_current_state(&stale));
        machine.commit_cache(&stale, Arc::new(TestPayload::new(7)));
        assert_eq!(machine.current_state_kind(), StateKind::Empty);
    }

    #[test]
    fn test_build_error_for_superseded_state_leaves_current() {
        let (machine, _) = counting_machine(StatePolicy::Default);
        let tx = TransactionId::new();
        machine.get_cache(tx, true).unwrap();
        let stale = Arc::new(
            CacheStateFactory::<TestPayload>::new(StatePolicy::Default)
                .create_initializing(Arc::new(TestPayload::proxy())),
        );

        machine.on_build_error(&stale, BuildError::failed("late").into());
        assert_eq!(machine.current_state_kind(), StateKind::Initialized);
    }

    #[test]
    fn test_audit_sees_switch_and_quick_result() {
        let recorder = Arc::new(Recorder::default());
        let machine = CacheStateMachineBuilder::<TestPayload>::new(StaticConstruction::new(|| {
            Ok::<_, BuildError>(TestPayload::new(1))
        }))
        .audit(recorder.clone())
        .build();
        let tx = TransactionId::new();

        machine.get_cache(tx, true).unwrap();
        machine.get_cache(tx, true).unwrap();

        let kinds = recorder.kinds();
        assert!(kinds.contains(&AuditEventKind::Switched {
            from: StateKind::Empty,
            to: StateKind::Initialized,
        }));
        assert_eq!(kinds.last(), Some(&AuditEventKind::QuickResult));
    }

    #[test]
    fn test_panicking_audit_does_not_break_protocol() {
        struct Exploding;
        impl CacheStateMachineAudit for Exploding {
            fn on_event(&self, _event: &AuditEvent) {
                panic!("audit sink failure");
            }
        }

        let machine = CacheStateMachineBuilder::<TestPayload>::new(StaticConstruction::new(|| {
            Ok::<_, BuildError>(TestPayload::new(1))
        }))
        .audit(Arc::new(Exploding))
        .build();

        let tx = TransactionId::new();
        machine.get_cache(tx, true).unwrap();
        machine.on_change(tx, &change());
        assert!(machine.is_dirty_for_transaction(tx));
    }
}
