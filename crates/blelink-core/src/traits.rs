//! Trait abstractions shared by entities that own a discovered collection.
//!
//! [`Explorable`] is implemented by [`Device`](crate::device::Device) (which
//! discovers services) and [`Service`](crate::service::Service) (which
//! discovers characteristics). Generic code can explore either one and query
//! the result without knowing which it holds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::collection::{Tracked, TrackedCollection};
use crate::entity::EntityKey;
use crate::error::{Error, Result};

/// How an exploration treats the existing collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExploreOptions {
    /// Dispose the tracked collection before discovering again.
    pub clear_first: bool,
    /// After discovery, explore each child's own collection in turn.
    pub recurse: bool,
}

impl ExploreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a full rediscovery: clear, then explore.
    pub fn rediscover() -> Self {
        Self {
            clear_first: true,
            recurse: false,
        }
    }

    #[must_use]
    pub fn clear_first(mut self, clear_first: bool) -> Self {
        self.clear_first = clear_first;
        self
    }

    #[must_use]
    pub fn recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }
}

/// An entity whose children are found by native discovery.
///
/// # Example
///
/// ```ignore
/// use blelink_core::{Explorable, Result};
///
/// async fn count_children<E: Explorable>(entity: &E) -> Result<usize> {
///     Ok(entity.explore_and_filter(|_| true).await?.len())
/// }
/// ```
#[async_trait]
pub trait Explorable: Send + Sync {
    /// Entity type of the discovered children.
    type Child: Tracked + Send + Sync + 'static;

    /// Key of the exploring entity.
    fn entity_key(&self) -> &EntityKey;

    /// Whether discovery completed since the last clear.
    fn is_explored(&self) -> bool;

    /// The tracked children.
    fn collection(&self) -> &TrackedCollection<Self::Child>;

    /// Configured default timeout for exploration.
    fn explore_timeout(&self) -> Duration;

    /// Discover children.
    async fn explore_with(
        &self,
        options: ExploreOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Discover children unless that already happened.
    async fn explore_if_needed(&self) -> Result<()> {
        self.explore_with(
            ExploreOptions::new(),
            self.explore_timeout(),
            &CancellationToken::new(),
        )
        .await
    }

    /// Explore if needed, then return the children matching `filter`.
    async fn explore_and_filter<F>(&self, filter: F) -> Result<Vec<Arc<Self::Child>>>
    where
        F: FnMut(&Self::Child) -> bool + Send,
    {
        self.explore_if_needed().await?;
        Ok(self.collection().filter(filter))
    }

    /// Explore if needed, then return the only child matching `filter`.
    ///
    /// Fails with [`Error::NotFound`] when no child matches and
    /// [`Error::MultipleFound`] when several do.
    async fn explore_and_get<F>(&self, what: &str, filter: F) -> Result<Arc<Self::Child>>
    where
        F: FnMut(&Self::Child) -> bool + Send,
    {
        self.explore_if_needed().await?;
        self.collection()
            .single(what, filter)?
            .ok_or_else(|| Error::not_found(format!("{} in {}", what, self.entity_key())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explore_options_builders() {
        let options = ExploreOptions::new();
        assert!(!options.clear_first);
        assert!(!options.recurse);

        let options = ExploreOptions::new().recurse(true);
        assert!(options.recurse);
        assert!(!options.clear_first);

        assert_eq!(ExploreOptions::rediscover(), ExploreOptions::new().clear_first(true));
    }
}
