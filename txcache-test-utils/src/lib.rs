//! txcache Test Utilities
//!
//! Shared test infrastructure for the txcache workspace:
//! - A cache payload that records its generation and commits
//! - Counting static and lazy factories, including failing and gated builds
//! - A transactional executor that records, skips or fails its work
//! - A recording audit sink
//! - Proptest generators for transactions, changes and operation sequences
//! - Fixtures and assertions for common scenarios

// Re-export core types for convenience
pub use txcache_core::{
    AuditCommand, AuditEvent, AuditEventKind, BuildError, CacheError, CacheImplementation,
    CacheResult, CacheStateMachine, CacheStateMachineAudit, CacheStateMachineBuilder, ChangeType,
    ChangedObject, InitializationStatus, LazyCacheFactory, StateKind, StateMachineConfig,
    StatePolicy, StaticCacheFactory, TransactionError, TransactionId, TransactionalExecutor,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

// ============================================================================
// TEST CACHE
// ============================================================================

/// Cache payload used across the test suites.
///
/// `generation` is the factory's build counter at the time the instance was
/// built; proxies have generation 0.
#[derive(Debug, Default)]
pub struct TestCache {
    generation: usize,
    is_proxy: bool,
    absorbs_changes: bool,
    commits: AtomicUsize,
}

impl TestCache {
    pub fn new(generation: usize) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    pub fn proxy() -> Self {
        Self {
            is_proxy: true,
            ..Self::default()
        }
    }

    /// Instance that reports every change as absorbed.
    pub fn absorbing(generation: usize) -> Self {
        Self {
            generation,
            absorbs_changes: true,
            ..Self::default()
        }
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl CacheImplementation for TestCache {
    fn commit_cache(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_change(&self, _changed: &ChangedObject) -> bool {
        self.absorbs_changes
    }
}

// ============================================================================
// STATIC FACTORIES
// ============================================================================

/// Static factory counting its builds. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct CountingStaticFactory {
    builds: Arc<AtomicUsize>,
    absorbs_changes: bool,
    delay: Option<Duration>,
}

impl CountingStaticFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds instances that survive every change.
    pub fn absorbing() -> Self {
        Self {
            absorbs_changes: true,
            ..Self::default()
        }
    }

    /// Sleep inside every build, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl StaticCacheFactory<TestCache> for CountingStaticFactory {
    fn build_cache(&self) -> Result<TestCache, BuildError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let generation = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        if self.absorbs_changes {
            Ok(TestCache::absorbing(generation))
        } else {
            Ok(TestCache::new(generation))
        }
    }
}

/// Static factory that always fails.
#[derive(Debug, Clone)]
pub struct FailingStaticFactory {
    reason: String,
    attempts: Arc<AtomicUsize>,
}

impl FailingStaticFactory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StaticCacheFactory<TestCache> for FailingStaticFactory {
    fn build_cache(&self) -> Result<TestCache, BuildError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BuildError::failed(self.reason.clone()))
    }
}

// ============================================================================
// LAZY FACTORY
// ============================================================================

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// Blocks background builds until the test lets them through.
///
/// Clones share the gate.
#[derive(Debug, Clone)]
pub struct BuildGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl BuildGate {
    pub fn open() -> Self {
        Self::with_state(true)
    }

    pub fn closed() -> Self {
        Self::with_state(false)
    }

    fn with_state(open: bool) -> Self {
        Self {
            inner: Arc::new((Mutex::new(GateState { open, entered: 0 }), Condvar::new())),
        }
    }

    /// Let every waiting and future build through.
    pub fn release(&self) {
        let (lock, condvar) = &*self.inner;
        lock.lock().unwrap_or_else(PoisonError::into_inner).open = true;
        condvar.notify_all();
    }

    /// Number of builds that reached the gate.
    pub fn entered(&self) -> usize {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner).entered
    }

    fn pass(&self) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        state.entered += 1;
        while !state.open {
            state = condvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// What a [`CountingLazyFactory`] build does once past its gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LazyOutcome {
    Succeed,
    Fail(String),
    Panic(String),
    /// Report [`BuildError::Aborted`] whether or not the build is still wanted.
    Abort,
}

/// Lazy factory counting proxies and builds. Clones share counters and gate.
#[derive(Debug, Clone)]
pub struct CountingLazyFactory {
    proxies: Arc<AtomicUsize>,
    builds: Arc<AtomicUsize>,
    outcome: LazyOutcome,
    gate: BuildGate,
    cooperative: bool,
    scope: Option<RecordingExecutor>,
    unscoped_builds: Arc<AtomicUsize>,
}

impl CountingLazyFactory {
    pub fn new() -> Self {
        Self {
            proxies: Arc::new(AtomicUsize::new(0)),
            builds: Arc::new(AtomicUsize::new(0)),
            outcome: LazyOutcome::Succeed,
            gate: BuildGate::open(),
            cooperative: false,
            scope: None,
            unscoped_builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_outcome(mut self, outcome: LazyOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_gate(mut self, gate: BuildGate) -> Self {
        self.gate = gate;
        self
    }

    /// Poll the initialization status after the gate and abort when
    /// superseded.
    pub fn cooperative(mut self) -> Self {
        self.cooperative = true;
        self
    }

    /// Count builds that run while `executor` has no transaction open.
    pub fn with_scope(mut self, executor: RecordingExecutor) -> Self {
        self.scope = Some(executor);
        self
    }

    pub fn proxies(&self) -> usize {
        self.proxies.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Builds that ran outside the scope given to [`CountingLazyFactory::with_scope`].
    pub fn builds_outside_transaction(&self) -> usize {
        self.unscoped_builds.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn LazyCacheFactory<TestCache>> {
        Arc::new(self.clone())
    }
}

impl Default for CountingLazyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyCacheFactory<TestCache> for CountingLazyFactory {
    fn create_proxy(&self) -> TestCache {
        self.proxies.fetch_add(1, Ordering::SeqCst);
        TestCache::proxy()
    }

    fn build_cache(&self, status: &dyn InitializationStatus) -> Result<TestCache, BuildError> {
        self.gate.pass();
        if self.cooperative && !status.is_initialization_still_required() {
            return Err(BuildError::Aborted);
        }
        if self.scope.as_ref().is_some_and(|scope| !scope.in_transaction()) {
            self.unscoped_builds.fetch_add(1, Ordering::SeqCst);
        }
        let generation = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.outcome {
            LazyOutcome::Succeed => Ok(TestCache::new(generation)),
            LazyOutcome::Fail(reason) => Err(BuildError::failed(reason.clone())),
            LazyOutcome::Panic(message) => panic!("{message}"),
            LazyOutcome::Abort => Err(BuildError::Aborted),
        }
    }
}

// ============================================================================
// RECORDING EXECUTOR
// ============================================================================

/// What a [`RecordingExecutor`] does with the work it is handed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorMode {
    Run,
    /// Fail to open the transaction; the work never runs.
    Fail(String),
    /// Report success without running the work.
    Skip,
}

/// Transactional executor that counts transactions and tracks whether one is
/// open. Clones share counters.
#[derive(Debug, Clone)]
pub struct RecordingExecutor {
    transactions: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
    mode: ExecutorMode,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::with_mode(ExecutorMode::Run)
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_mode(ExecutorMode::Fail(reason.into()))
    }

    pub fn skipping() -> Self {
        Self::with_mode(ExecutorMode::Skip)
    }

    fn with_mode(mode: ExecutorMode) -> Self {
        Self {
            transactions: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicBool::new(false)),
            mode,
        }
    }

    /// Number of `execute_in_transaction` calls.
    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn in_transaction(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn TransactionalExecutor> {
        Arc::new(self.clone())
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionalExecutor for RecordingExecutor {
    fn execute_in_transaction(
        &self,
        work: &mut dyn FnMut() -> CacheResult<()>,
    ) -> CacheResult<()> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            ExecutorMode::Run => {}
            ExecutorMode::Fail(reason) => {
                return Err(TransactionError::Failed {
                    reason: reason.clone(),
                }
                .into());
            }
            ExecutorMode::Skip => return Ok(()),
        }
        self.open.store(true, Ordering::SeqCst);
        let result = work();
        self.open.store(false, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// RECORDING AUDIT
// ============================================================================

/// Audit sink that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }

    pub fn count(&self, predicate: impl Fn(&AuditEvent) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    pub fn contains(&self, kind: &AuditEventKind) -> bool {
        self.count(|event| &event.kind == kind) > 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CacheStateMachineAudit for RecordingAudit {
    fn on_event(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

// ============================================================================
// TRACING AND WAITING
// ============================================================================

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for txcache types and operation sequences.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_transaction_id() -> impl Strategy<Value = TransactionId> {
        any::<[u8; 16]>().prop_map(|bytes| TransactionId::from_uuid(Uuid::from_bytes(bytes)))
    }

    pub fn arb_change_type() -> impl Strategy<Value = ChangeType> {
        prop_oneof![
            Just(ChangeType::Create),
            Just(ChangeType::Update),
            Just(ChangeType::Delete),
        ]
    }

    pub fn arb_state_policy() -> impl Strategy<Value = StatePolicy> {
        prop_oneof![Just(StatePolicy::Default), Just(StatePolicy::Isolated)]
    }

    pub fn arb_changed_object() -> impl Strategy<Value = ChangedObject> {
        (
            prop_oneof![Just("Actor"), Just("Group"), Just("Substitution")],
            arb_change_type(),
            proptest::option::of(any::<[u8; 16]>()),
        )
            .prop_map(|(entity, change_type, id)| {
                let changed = ChangedObject::new(entity, change_type);
                match id {
                    Some(bytes) => changed.with_entity_id(Uuid::from_bytes(bytes)),
                    None => changed,
                }
            })
    }

    /// One call against a machine. `tx` indexes a fixed pool of transactions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MachineOp {
        GetCache { tx: usize, write: bool },
        GetCacheIfNotLocked { tx: usize, write: bool },
        OnChange { tx: usize },
        BeforeComplete { tx: usize },
        Complete { tx: usize },
        Drop,
    }

    pub fn arb_machine_op(transactions: usize) -> impl Strategy<Value = MachineOp> {
        let tx = 0..transactions;
        prop_oneof![
            3 => (tx.clone(), any::<bool>())
                .prop_map(|(tx, write)| MachineOp::GetCache { tx, write }),
            1 => (tx.clone(), any::<bool>())
                .prop_map(|(tx, write)| MachineOp::GetCacheIfNotLocked { tx, write }),
            3 => tx.clone().prop_map(|tx| MachineOp::OnChange { tx }),
            1 => tx.clone().prop_map(|tx| MachineOp::BeforeComplete { tx }),
            2 => tx.prop_map(|tx| MachineOp::Complete { tx }),
            1 => Just(MachineOp::Drop),
        ]
    }

    pub fn arb_machine_ops(
        transactions: usize,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<MachineOp>> {
        proptest::collection::vec(arb_machine_op(transactions), 1..max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired machines for common scenarios.

    use super::*;
    use tokio::runtime::Handle;

    /// Static machine with a counting factory and a recording audit.
    pub fn static_machine(
        policy: StatePolicy,
    ) -> (Arc<CacheStateMachine<TestCache>>, CountingStaticFactory, Arc<RecordingAudit>) {
        static_machine_with(CountingStaticFactory::new(), policy)
    }

    pub fn static_machine_with(
        factory: CountingStaticFactory,
        policy: StatePolicy,
    ) -> (Arc<CacheStateMachine<TestCache>>, CountingStaticFactory, Arc<RecordingAudit>) {
        let audit = RecordingAudit::new();
        let construction = txcache_core::StaticConstruction::new(factory.clone());
        let machine = CacheStateMachineBuilder::new(construction)
            .policy(policy)
            .audit(audit.clone())
            .build();
        (machine, factory, audit)
    }

    /// Lazy machine building on `runtime`.
    pub fn lazy_machine(
        factory: &CountingLazyFactory,
        policy: StatePolicy,
        runtime: Handle,
    ) -> (Arc<CacheStateMachine<TestCache>>, Arc<RecordingAudit>) {
        let audit = RecordingAudit::new();
        let machine = CacheStateMachineBuilder::lazy(factory.shared(), runtime)
            .policy(policy)
            .audit(audit.clone())
            .build();
        (machine, audit)
    }

    /// Lazy machine whose background builds run inside `executor`.
    pub fn lazy_machine_in_transaction(
        factory: &CountingLazyFactory,
        executor: &RecordingExecutor,
        policy: StatePolicy,
        runtime: Handle,
    ) -> (Arc<CacheStateMachine<TestCache>>, Arc<RecordingAudit>) {
        let audit = RecordingAudit::new();
        let machine = CacheStateMachineBuilder::lazy(factory.shared(), runtime)
            .policy(policy)
            .executor(executor.shared())
            .audit(audit.clone())
            .build();
        (machine, audit)
    }

    pub fn actor_update() -> ChangedObject {
        ChangedObject::new("Actor", ChangeType::Update).with_states(
            vec!["active".to_string()],
            serde_json::json!({ "active": true }),
            serde_json::json!({ "active": false }),
        )
    }

    pub fn substitution_delete() -> ChangedObject {
        ChangedObject::new("Substitution", ChangeType::Delete)
            .with_entity_id(Uuid::now_v7())
            .with_states(
                vec!["position".to_string()],
                serde_json::json!({ "position": 1 }),
                serde_json::Value::Null,
            )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for instance identity and machine state.

    use super::*;

    pub fn assert_same_instance(a: &Arc<TestCache>, b: &Arc<TestCache>) {
        assert!(
            Arc::ptr_eq(a, b),
            "expected the same instance, got generations {} and {}",
            a.generation(),
            b.generation()
        );
    }

    pub fn assert_distinct_instance(a: &Arc<TestCache>, b: &Arc<TestCache>) {
        assert!(
            !Arc::ptr_eq(a, b),
            "expected distinct instances, both are generation {}",
            a.generation()
        );
    }

    pub fn assert_state(machine: &CacheStateMachine<TestCache>, expected: StateKind) {
        assert_eq!(
            machine.current_state_kind(),
            expected,
            "unexpected machine state: {machine:?}"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
