//! Contract every cached payload must satisfy.

use crate::ChangedObject;

/// A cache payload managed by a [`crate::CacheStateMachine`].
///
/// Instances are shared as `Arc<Self>` between the published state and every
/// caller that received them, so all hooks take `&self`.
///
/// # Implementation Requirements
///
/// - `commit_cache()` is called exactly once per built instance, right after
///   the build completes and before the instance is published.
/// - `on_change()` must not block; it is called while a transition is computed.
pub trait CacheImplementation: Send + Sync + 'static {
    /// Finalize internal structures before the instance becomes visible.
    fn commit_cache(&self) {}

    /// Ask whether this instance stays valid once `change` commits.
    ///
    /// Returning `true` lets the machine reuse the instance after every dirty
    /// transaction completes instead of rebuilding it. The default is to
    /// require a rebuild.
    fn on_change(&self, _change: &ChangedObject) -> bool {
        false
    }
}
