//! Delayed (background) construction.
//!
//! The state machine publishes an initializing state holding a proxy, then
//! activates it; activation lands here and spawns the real build onto the
//! tokio runtime the strategy was created with. The build itself is blocking
//! work, so it runs under `spawn_blocking` inside the configured
//! [`TransactionalExecutor`].
//!
//! There is no forced cancellation. A build whose initializing state was
//! superseded either notices through
//! [`InitializationStatus::is_initialization_still_required`] and stops, or
//! finishes and has its commit ignored by the machine. A build that stops
//! while its state is still current is reported as a failure, so the
//! machine never stays initializing without a build in flight.

use super::{CacheConstruction, TransactionalExecutor};
use crate::{
    AlwaysRequired, BuildError, CacheError, CacheImplementation, CacheResult, InitializationContext,
    InitializationStatus,
};
use std::any::Any;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinError;

/// User-supplied builder for caches that are built in the background.
pub trait LazyCacheFactory<C>: Send + Sync + 'static {
    /// Placeholder handed out while the real instance is being built.
    fn create_proxy(&self) -> C;

    /// Build the real instance. Long builds should poll `status` and return
    /// [`BuildError::Aborted`] once initialization is no longer required.
    fn build_cache(&self, status: &dyn InitializationStatus) -> Result<C, BuildError>;
}

/// Strategy that returns a proxy and builds on a background task.
pub struct LazyConstruction<C: CacheImplementation> {
    factory: Arc<dyn LazyCacheFactory<C>>,
    executor: Arc<dyn TransactionalExecutor>,
    runtime: Handle,
}

impl<C: CacheImplementation> LazyConstruction<C> {
    pub fn new(
        factory: Arc<dyn LazyCacheFactory<C>>,
        executor: Arc<dyn TransactionalExecutor>,
        runtime: Handle,
    ) -> Self {
        Self {
            factory,
            executor,
            runtime,
        }
    }
}

impl<C: CacheImplementation> CacheConstruction<C> for LazyConstruction<C> {
    fn has_delayed_initialization(&self) -> bool {
        true
    }

    fn create_cache(&self) -> CacheResult<Arc<C>> {
        Ok(Arc::new(self.factory.create_proxy()))
    }

    fn start_delayed_initialization(&self, context: InitializationContext<C>) {
        let factory = Arc::clone(&self.factory);
        let executor = Arc::clone(&self.executor);
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            if !context.is_initialization_still_required() {
                tracing::debug!(
                    cache = std::any::type_name::<C>(),
                    "Cache initialization superseded before start"
                );
                return;
            }

            let build_context = context.clone();
            let outcome = runtime
                .spawn_blocking(move || {
                    run_build(factory.as_ref(), executor.as_ref(), &build_context)
                })
                .await;

            match outcome {
                Ok(Ok(Some(cache))) => context.on_complete(cache),
                Ok(Ok(None)) | Ok(Err(CacheError::Build(BuildError::Aborted)))
                    if !context.is_initialization_still_required() =>
                {
                    tracing::debug!(
                        cache = std::any::type_name::<C>(),
                        "Cache initialization superseded during build"
                    );
                }
                // The state is still current, so nothing else will replace it.
                Ok(Ok(None)) => context.on_error(
                    BuildError::failed("transactional executor returned without running the build")
                        .into(),
                ),
                Ok(Err(e)) => context.on_error(e),
                Err(join_error) => context.on_error(
                    BuildError::Panicked {
                        reason: join_failure_reason(join_error),
                    }
                    .into(),
                ),
            }
        });
    }

    fn build_transient(&self) -> CacheResult<Arc<C>> {
        let cache = self.factory.build_cache(&AlwaysRequired)?;
        Ok(Arc::new(cache))
    }
}

/// Run one build inside the executor. `Ok(None)` means the build never ran,
/// either because its initializing state is no longer current or because the
/// executor skipped the work.
fn run_build<C: CacheImplementation>(
    factory: &dyn LazyCacheFactory<C>,
    executor: &dyn TransactionalExecutor,
    context: &InitializationContext<C>,
) -> CacheResult<Option<C>> {
    let mut built = None;
    let mut work = || -> CacheResult<()> {
        if !context.is_initialization_still_required() {
            return Ok(());
        }
        tracing::debug!(cache = std::any::type_name::<C>(), "Creating cache");
        built = Some(factory.build_cache(context)?);
        tracing::debug!(cache = std::any::type_name::<C>(), "Created cache");
        Ok(())
    };
    executor.execute_in_transaction(&mut work)?;
    Ok(built)
}

fn join_failure_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return "build task cancelled".to_string();
    }
    panic_message(error.into_panic())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
