//! txcache Core - Transaction-Aware Cache Lifecycle
//!
//! Keeps an in-memory cache consistent with data mutated inside database
//! transactions. A [`CacheStateMachine`] publishes one immutable
//! [`CacheState`] at a time and moves between states with a
//! compare-and-swap on state identity, so readers never wait on a global
//! lock and never receive an instance a still-open writer has invalidated.
//!
//! Hosts drive the machine with four notifications per transaction:
//! `get_cache`, `on_change`, `before_transaction_complete` and
//! `on_transaction_completed`.

pub mod audit;
pub mod change;
pub mod config;
pub mod construction;
pub mod context;
pub mod error;
pub mod identity;
pub mod implementation;
pub mod machine;
pub mod state;
pub mod tracker;

pub use audit::{
    AuditCommand, AuditEvent, AuditEventKind, CacheStateMachineAudit, NoopAudit, TracingAudit,
};
pub use change::{ChangeType, ChangedObject};
pub use config::{
    StateMachineConfig, StatePolicy, AUDIT_TRANSITIONS_ENV, ISOLATED_STATE_MACHINE_ENV,
};
pub use construction::{
    CacheConstruction, DirectExecutor, LazyCacheFactory, LazyConstruction, StaticCacheFactory,
    StaticConstruction, TransactionalExecutor,
};
pub use context::{
    AlwaysRequired, CacheInitializationCallback, ExclusivityMonitor, InitializationContext,
    InitializationStatus, StateMachineContext,
};
pub use error::{BuildError, CacheError, CacheResult, ConfigError, TransactionError};
pub use identity::TransactionId;
pub use implementation::CacheImplementation;
pub use machine::{CacheStateMachine, CacheStateMachineBuilder};
pub use state::{
    CacheState, CacheStateFactory, DirtyState, EmptyState, InitializedState, InitializingState,
    StateCommandResult, StateKind,
};
pub use tracker::DirtyTransactions;
