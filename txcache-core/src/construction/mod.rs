//! Cache construction strategies.
//!
//! A machine is created with exactly one strategy and keeps it for its whole
//! lifetime:
//!
//! - [`StaticConstruction`]: builds synchronously on the calling thread and
//!   returns a finished instance.
//! - [`LazyConstruction`]: returns a proxy immediately and builds the real
//!   instance on a background task, reporting through an
//!   [`InitializationContext`].

pub mod executor;
pub mod lazy;
pub mod static_build;

pub use executor::{DirectExecutor, TransactionalExecutor};
pub use lazy::{LazyCacheFactory, LazyConstruction};
pub use static_build::{StaticCacheFactory, StaticConstruction};

use crate::{CacheImplementation, CacheResult, InitializationContext};
use std::sync::Arc;

/// Strategy the state machine uses to obtain cache instances.
pub trait CacheConstruction<C: CacheImplementation>: Send + Sync {
    /// Whether [`CacheConstruction::create_cache`] returns a proxy that still
    /// needs a background build.
    fn has_delayed_initialization(&self) -> bool;

    /// Produce the instance (or proxy) published by an empty state's build.
    fn create_cache(&self) -> CacheResult<Arc<C>>;

    /// Launch the background build for a freshly published initializing state.
    fn start_delayed_initialization(&self, context: InitializationContext<C>);

    /// Build a finished instance on the calling thread, for callers that
    /// need a cache while the published one is dirty. The result is never
    /// published.
    fn build_transient(&self) -> CacheResult<Arc<C>>;
}
