use std::sync::Arc;

/// Verdict of a [`ReplacingPolicy`] comparing a candidate message against one
/// already held by the store.
///
/// The verdict is always phrased from the candidate's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationResult {
    /// The two messages are unrelated and may coexist.
    NoAction,
    /// The candidate supersedes the stored message, which must be dropped.
    Invalidates,
    /// The stored message supersedes the candidate, which must be discarded.
    Invalidated,
}

/// Decides, for a candidate and a stored message, which one (if any) wins.
///
/// Must be pure: the store may call it any number of times while holding its
/// internal lock.
pub type ReplacingPolicy<M> = Arc<dyn Fn(&M, &M) -> InvalidationResult + Send + Sync>;

/// Invoked once for every stored message displaced by a newer one.
pub type InvalidationTrigger<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Wraps a closure as a [`ReplacingPolicy`].
pub fn replacing_policy<M, F>(f: F) -> ReplacingPolicy<M>
where
    F: Fn(&M, &M) -> InvalidationResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as an [`InvalidationTrigger`].
pub fn invalidation_trigger<M, F>(f: F) -> InvalidationTrigger<M>
where
    F: Fn(&M) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A trigger that ignores every displaced message.
pub fn noop_trigger<M>() -> InvalidationTrigger<M> {
    Arc::new(|_: &M| {})
}
