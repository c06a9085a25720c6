//! Sequential stretches inside a query pipeline.

use core::fmt;

use log::debug;

use super::plan::DeferredSource;
use super::{OrderingMode, ParallelQuery, QuerySettings};
use crate::error::EngineError;
use crate::loops::ParallelOptions;

type Items<T> = Box<dyn Iterator<Item = Result<T, EngineError>> + Send>;

/// The output of a [`ParallelQuery`] consumed one element at a time, in source
/// order.
///
/// Created by [`ParallelQuery::as_sequential`]. Stages added here run on the
/// thread that pulls elements, never on the pool, so they may keep mutable
/// state. The stages before the boundary keep running on the pool while the
/// consumer works. [`as_parallel`](Self::as_parallel) hands the rest of the
/// pipeline back to the pool.
pub struct SequentialQuery<T> {
    items: Items<T>,
    settings: QuerySettings,
}

impl<T> fmt::Debug for SequentialQuery<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SequentialQuery")
            .field("options", &self.settings.options)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> SequentialQuery<T> {
    pub(super) fn new(query: ParallelQuery<T>) -> Self {
        let mut settings = query.settings.clone();
        settings.ordering = OrderingMode::Ordered;
        settings.error_filter = None;
        debug!("Query switches to sequential mode, merge={:?}", settings.merge);
        Self {
            items: Box::new(query.as_ordered().into_iter()),
            settings,
        }
    }

    pub fn map<U, F>(self, mut transform: F) -> SequentialQuery<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        SequentialQuery {
            items: Box::new(self.items.map(move |item| item.map(&mut transform))),
            settings: self.settings,
        }
    }

    #[must_use]
    pub fn filter<F>(self, mut predicate: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        let items = self.items.filter(move |item| match item {
            Ok(value) => predicate(value),
            Err(_) => true,
        });
        Self {
            items: Box::new(items),
            settings: self.settings,
        }
    }

    /// The first `count` elements in source order. Producers upstream stop
    /// once the rest is dropped.
    #[must_use]
    pub fn take(self, count: usize) -> Self {
        Self {
            items: Box::new(self.items.take(count)),
            settings: self.settings,
        }
    }

    /// Hand the rest of the pipeline back to the pool.
    ///
    /// The sequential output is drained when the returned query is evaluated;
    /// its elements are numbered in the order they were pulled, so the query
    /// stays ordered until [`ParallelQuery::as_unordered`] says otherwise.
    /// Pool, cancellation and degree of parallelism carry over.
    pub fn as_parallel(self) -> ParallelQuery<T> {
        let items = self.items;
        let drained = DeferredSource::new(move |_: &ParallelOptions| items.collect());
        ParallelQuery::with_plan(Box::new(drained), self.settings)
    }

    /// Collect the remaining output in source order.
    pub fn to_vec(self) -> Result<Vec<T>, EngineError> {
        self.collect()
    }
}

impl<T> Iterator for SequentialQuery<T> {
    type Item = Result<T, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}
