//! Synchronous construction.

use super::CacheConstruction;
use crate::{BuildError, CacheImplementation, CacheResult, InitializationContext};
use std::sync::Arc;

/// User-supplied builder for caches that are built synchronously.
pub trait StaticCacheFactory<C>: Send + Sync {
    fn build_cache(&self) -> Result<C, BuildError>;
}

impl<C, F> StaticCacheFactory<C> for F
where
    F: Fn() -> Result<C, BuildError> + Send + Sync,
{
    fn build_cache(&self) -> Result<C, BuildError> {
        self()
    }
}

/// Strategy that builds on the calling thread and never delays.
pub struct StaticConstruction<F> {
    factory: F,
}

impl<F> StaticConstruction<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<C, F> CacheConstruction<C> for StaticConstruction<F>
where
    C: CacheImplementation,
    F: StaticCacheFactory<C>,
{
    fn has_delayed_initialization(&self) -> bool {
        false
    }

    fn create_cache(&self) -> CacheResult<Arc<C>> {
        tracing::debug!(cache = std::any::type_name::<C>(), "Creating cache");
        let cache = self.factory.build_cache()?;
        tracing::debug!(cache = std::any::type_name::<C>(), "Created cache");
        Ok(Arc::new(cache))
    }

    fn start_delayed_initialization(&self, _context: InitializationContext<C>) {}

    fn build_transient(&self) -> CacheResult<Arc<C>> {
        self.create_cache()
    }
}
