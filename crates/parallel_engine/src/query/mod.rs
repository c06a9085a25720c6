//! Parallel query pipelines.
//!
//! A [`ParallelQuery`] is a lazy source plus a list of element stages. Nothing
//! runs until a terminal (`to_vec`, `count`, `sum`, `aggregate`, `reduce`,
//! `for_all`) or enumeration forces it. Evaluation runs the stages on lanes
//! pulling partitions from the source, the same way loops do, and merges the
//! lane outputs according to the query's [`OrderingMode`] and [`MergeMode`].
//! [`ParallelQuery::as_sequential`] marks a stretch of stages that runs in
//! source order on the consuming thread.
//!
//! ```ignore
//! let evens = (1..=1000_u64)
//!     .into_par_query()
//!     .as_ordered()
//!     .filter(|value| value % 2 == 0)
//!     .to_vec()?;
//! ```

mod merge;
mod plan;
mod sequential;

use core::fmt;
use core::iter::Sum;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

pub use merge::QueryIter;
pub use plan::ErrorFilter;
pub use sequential::SequentialQuery;

use crate::cancel::CancellationToken;
use crate::error::{EngineError, OperationCanceled};
use crate::loops::{LoopResult, LoopState, ParallelOptions, Prepared, run_lanes};
use crate::partition::{LaneCursor, Partitioning};
use crate::pool::WorkerPool;
use plan::{DeferredSource, IterSource, Layout, Plan, Stage, StagePlan, VecSource};

/// Elements per batch handed to the consumer in [`MergeMode::Chunked`].
pub const CHUNKED_BATCH_SIZE: usize = 32;

/// Known-length inputs shorter than this run on a single lane in [`ExecutionMode::Auto`].
pub const SEQUENTIAL_THRESHOLD: usize = 512;

/// Whether output keeps source order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderingMode {
    /// Output follows source positions.
    Ordered,
    /// Output follows completion.
    #[default]
    Unordered,
}

/// How output is handed to an enumerating consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Every element is sent as soon as a lane produces it.
    Streaming,
    /// Lanes send small batches of [`CHUNKED_BATCH_SIZE`] elements.
    #[default]
    Chunked,
    /// The whole output is collected before the first element is yielded.
    FullyBuffered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Small inputs may run sequentially.
    #[default]
    Auto,
    ForcedParallel,
}

#[derive(Clone, Default)]
struct QuerySettings {
    options: ParallelOptions,
    ordering: OrderingMode,
    merge: MergeMode,
    execution: ExecutionMode,
    error_filter: Option<ErrorFilter>,
}

/// A lazy parallel pipeline producing elements of type `T`.
pub struct ParallelQuery<T> {
    plan: Box<dyn Plan<T>>,
    settings: QuerySettings,
}

impl<T> fmt::Debug for ParallelQuery<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ParallelQuery")
            .field("options", &self.settings.options)
            .field("ordering", &self.settings.ordering)
            .field("merge", &self.settings.merge)
            .field("execution", &self.settings.execution)
            .field("handles_errors", &self.settings.error_filter.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ParallelQuery<T> {
    /// Query over the elements of `items`, claimed by position ranges.
    pub fn from_vec(items: Vec<T>) -> Self {
        Self::with_plan(Box::new(VecSource::new(items)), QuerySettings::default())
    }

    /// Query over a lazily pulled iterator.
    ///
    /// Lanes pull chunks from the iterator under a lock; the length counts as
    /// known when the iterator's size hint is exact.
    pub fn from_source<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::with_plan(
            Box::new(IterSource::new(Box::new(source.into_iter()))),
            QuerySettings::default(),
        )
    }

    fn with_plan(plan: Box<dyn Plan<T>>, settings: QuerySettings) -> Self {
        Self { plan, settings }
    }

    #[must_use]
    pub fn as_ordered(mut self) -> Self {
        self.settings.ordering = OrderingMode::Ordered;
        self
    }

    #[must_use]
    pub fn as_unordered(mut self) -> Self {
        self.settings.ordering = OrderingMode::Unordered;
        self
    }

    #[must_use]
    pub fn with_merge(mut self, merge: MergeMode) -> Self {
        self.settings.merge = merge;
        self
    }

    #[must_use]
    pub fn with_execution_mode(mut self, execution: ExecutionMode) -> Self {
        self.settings.execution = execution;
        self
    }

    /// Run at most `max` lanes. Zero is rejected when the query is evaluated.
    #[must_use]
    pub fn with_degree_of_parallelism(mut self, max: usize) -> Self {
        self.settings.options = self.settings.options.with_max_degree_of_parallelism(max);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.settings.options = self.settings.options.with_cancellation(token);
        self
    }

    /// Claim source elements with `partitioning`. Striped partitioning cannot
    /// report contiguous progress, so queries use adaptive chunks instead.
    #[must_use]
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.settings.options = self.settings.options.with_partitioning(partitioning);
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.settings.options = self.settings.options.with_pool(pool);
        self
    }

    #[inline]
    pub const fn ordering(&self) -> OrderingMode {
        self.settings.ordering
    }

    #[inline]
    pub const fn merge_mode(&self) -> MergeMode {
        self.settings.merge
    }

    #[inline]
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.settings.execution
    }

    fn stage<U: Send + 'static>(self, stage: Stage<T, U>) -> ParallelQuery<U> {
        ParallelQuery {
            plan: Box::new(StagePlan::new(self.plan, stage)),
            settings: self.settings,
        }
    }

    pub fn map<U, F>(self, transform: F) -> ParallelQuery<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.stage(Box::new(move |item| Ok(Some(transform(item)))))
    }

    /// Map with a fallible stage. An error fails the query unless
    /// [`handle_errors`](Self::handle_errors) matches it.
    pub fn try_map<U, F>(self, transform: F) -> ParallelQuery<U>
    where
        U: Send + 'static,
        F: Fn(T) -> anyhow::Result<U> + Send + Sync + 'static,
    {
        self.stage(Box::new(move |item| transform(item).map(Some)))
    }

    #[must_use]
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stage(Box::new(move |item| Ok(predicate(&item).then_some(item))))
    }

    #[must_use]
    pub fn try_filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.stage(Box::new(move |item| Ok(predicate(&item)?.then_some(item))))
    }

    /// Drop elements whose stage error matches `filter` instead of failing.
    ///
    /// Filters accumulate: an error is suppressed when any of them matches.
    /// Unmatched errors are reported as usual.
    #[must_use]
    pub fn handle_errors<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        let combined: ErrorFilter = match self.settings.error_filter.take() {
            Some(previous) => {
                Arc::new(move |error: &anyhow::Error| previous(error) || filter(error))
            }
            None => Arc::new(filter),
        };
        self.settings.error_filter = Some(combined);
        self
    }

    /// Pair elements by position with `other`, yielding `min(len, other_len)`
    /// combined elements.
    ///
    /// Both inputs are evaluated in order, concurrently, once this query is
    /// forced. Inputs without a pool of their own run on the pool this query
    /// is evaluated with.
    pub fn zip<U, R, F>(self, other: ParallelQuery<U>, combine: F) -> ParallelQuery<R>
    where
        U: Send + 'static,
        R: Send + 'static,
        F: Fn(T, U) -> R + Send + Sync + 'static,
    {
        let mut settings = self.settings.clone();
        settings.error_filter = None;
        let left = self.as_ordered();
        let right = other.as_ordered();
        let pairs = DeferredSource::new(move |options: &ParallelOptions| {
            let left = left.inherit_pool(options);
            let right = right.inherit_pool(options);
            let mut right_items = None;
            let left_items = options.pool().scope(|scope| {
                let slot = &mut right_items;
                scope.spawn(move || *slot = Some(right.to_vec()));
                left.to_vec()
            });
            let right_items = right_items.ok_or_else(|| {
                EngineError::InvalidOperation("zip input was never evaluated".to_owned())
            })??;
            Ok(left_items?.into_iter().zip(right_items).collect::<Vec<_>>())
        });
        ParallelQuery::with_plan(Box::new(pairs), settings)
            .map(move |(left_item, right_item)| combine(left_item, right_item))
    }

    /// The first `count` elements. On an ordered query these are the first by
    /// source position; otherwise any `count` elements.
    #[must_use]
    pub fn take(self, count: usize) -> Self {
        let mut settings = self.settings.clone();
        settings.error_filter = None;
        let taken = DeferredSource::new(move |options: &ParallelOptions| {
            let mut items = self.inherit_pool(options).to_vec()?;
            items.truncate(count);
            Ok(items)
        });
        Self::with_plan(Box::new(taken), settings)
    }

    /// Switch to sequential mode: the stages added next see the output one
    /// element at a time, in source order, on the consuming thread.
    ///
    /// Use [`SequentialQuery::as_parallel`] to go back to the pool.
    pub fn as_sequential(self) -> SequentialQuery<T> {
        SequentialQuery::new(self)
    }

    fn inherit_pool(mut self, outer: &ParallelOptions) -> Self {
        self.settings.options.inherit_pool(outer);
        self
    }

    /// Evaluate the query on lanes, folding elements into lane-local state.
    ///
    /// `seal` runs after each finished partition with the source span it
    /// covered; `finish` runs once per lane that did not panic.
    fn drive<L, Init, Fold, Seal, Finish>(
        &self,
        init: Init,
        fold: Fold,
        seal: Seal,
        finish: Finish,
    ) -> Result<LoopResult, EngineError>
    where
        Init: Fn() -> L + Sync,
        Fold: Fn(&mut L, &LoopState, u64, T) -> anyhow::Result<()> + Sync,
        Seal: Fn(&mut L, &LoopState, Range<u64>) + Sync,
        Finish: Fn(L) + Sync,
    {
        let settings = &self.settings;
        let options = &settings.options;
        options.validate()?;
        if options.cancellation().is_canceled() {
            return Err(EngineError::Canceled(OperationCanceled));
        }
        self.plan.resolve(options)?;

        let len = self.plan.len_hint();
        let work = len.map_or(u64::MAX, |known| known as u64);
        let Prepared { pool, mut lanes } = options.prepare(work)?;
        let small = len.is_some_and(|known| known < SEQUENTIAL_THRESHOLD);
        if settings.execution == ExecutionMode::Auto && small {
            lanes = 1;
        }
        let partitioning = match options.partitioning() {
            Partitioning::Striped => Partitioning::Adaptive,
            other => other,
        };
        self.plan.bind(Layout { lanes, partitioning });
        debug!("Evaluating query over {len:?} element(s) on {lanes} lane(s)");

        let plan = &*self.plan;
        let filter = settings.error_filter.as_ref();
        run_lanes("query", &pool, lanes, options.cancellation(), |lane| {
            let state = lane.state();
            let mut cursor = LaneCursor::new(lane.id());
            let mut local = init();
            while !state.should_exit() {
                let mut emit = |position: u64, item: T| fold(&mut local, state, position, item);
                let Some(run) = plan.run_partition(&mut cursor, lane, filter, &mut emit) else {
                    break;
                };
                if run.failed {
                    break;
                }
                seal(&mut local, state, run.span);
            }
            finish(local);
        })
    }

    /// Collect the output. Ordered queries return it in source order.
    pub fn to_vec(self) -> Result<Vec<T>, EngineError> {
        let ordered = self.settings.ordering == OrderingMode::Ordered;
        let parts = Mutex::new(Vec::new());
        self.drive(
            Vec::new,
            |buffer: &mut Vec<(u64, T)>, _, position, item| {
                buffer.push((position, item));
                Ok(())
            },
            |_, _, _| {},
            |buffer| parts.lock().push(buffer),
        )?;
        let mut items: Vec<(u64, T)> = parts.into_inner().into_iter().flatten().collect();
        if ordered {
            items.sort_unstable_by_key(|&(position, _)| position);
        }
        Ok(items.into_iter().map(|(_, item)| item).collect())
    }

    pub fn count(self) -> Result<usize, EngineError> {
        let total = AtomicUsize::new(0);
        self.drive(
            || 0usize,
            |seen, _, _, _| {
                *seen += 1;
                Ok(())
            },
            |_, _, _| {},
            |seen| {
                total.fetch_add(seen, Ordering::Relaxed);
            },
        )?;
        Ok(total.into_inner())
    }

    pub fn sum(self) -> Result<T, EngineError>
    where
        T: Sum<T>,
    {
        let partials = Mutex::new(Vec::new());
        self.drive(
            || None,
            |total: &mut Option<T>, _, _, item| {
                *total = Some(match total.take() {
                    Some(previous) => [previous, item].into_iter().sum(),
                    None => item,
                });
                Ok(())
            },
            |_, _, _| {},
            |total| {
                if let Some(total) = total {
                    partials.lock().push(total);
                }
            },
        )?;
        Ok(partials.into_inner().into_iter().sum())
    }

    /// Fold each lane's elements starting from `seed()`, then merge lane
    /// results with `combine`.
    ///
    /// Lanes see arbitrary subsets of the input, so `fold` and `combine` must
    /// not depend on element order. An empty input yields `seed()`.
    pub fn aggregate<A, Seed, Fold, Combine>(
        self,
        seed: Seed,
        fold: Fold,
        combine: Combine,
    ) -> Result<A, EngineError>
    where
        A: Send,
        Seed: Fn() -> A + Sync,
        Fold: Fn(A, T) -> A + Sync,
        Combine: Fn(A, A) -> A,
    {
        let partials = Mutex::new(Vec::new());
        self.drive(
            || None,
            |accumulator: &mut Option<A>, _, _, item| {
                let current = accumulator.take().unwrap_or_else(&seed);
                *accumulator = Some(fold(current, item));
                Ok(())
            },
            |_, _, _| {},
            |accumulator| {
                if let Some(accumulator) = accumulator {
                    partials.lock().push(accumulator);
                }
            },
        )?;
        Ok(partials
            .into_inner()
            .into_iter()
            .reduce(combine)
            .unwrap_or_else(seed))
    }

    /// Combine all elements with an associative, commutative `combine`.
    /// `None` for an empty input.
    pub fn reduce<F>(self, combine: F) -> Result<Option<T>, EngineError>
    where
        F: Fn(T, T) -> T + Sync,
    {
        let partials = Mutex::new(Vec::new());
        self.drive(
            || None,
            |accumulator: &mut Option<T>, _, _, item| {
                *accumulator = Some(match accumulator.take() {
                    Some(previous) => combine(previous, item),
                    None => item,
                });
                Ok(())
            },
            |_, _, _| {},
            |accumulator| {
                if let Some(accumulator) = accumulator {
                    partials.lock().push(accumulator);
                }
            },
        )?;
        Ok(partials.into_inner().into_iter().reduce(&combine))
    }

    /// Run `action` on every element where it is produced, with no merge.
    pub fn for_all<F>(self, action: F) -> Result<(), EngineError>
    where
        F: Fn(T) + Sync,
    {
        self.drive(
            || (),
            |_, _, _, item| {
                action(item);
                Ok(())
            },
            |_, _, _| {},
            |()| {},
        )
        .map(|_| ())
    }
}

impl<T: Send + 'static> FromIterator<T> for ParallelQuery<T> {
    /// Collects the elements eagerly; use [`ParallelQuery::from_source`] to pull lazily.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<T: Send + 'static> IntoIterator for ParallelQuery<T> {
    type Item = Result<T, EngineError>;
    type IntoIter = QueryIter<T>;

    /// Enumerate the output according to the merge mode.
    ///
    /// Streaming and chunked merges evaluate on the pool in the background
    /// while the caller consumes; ordered output is released only once every
    /// earlier source position has been processed.
    fn into_iter(self) -> Self::IntoIter {
        QueryIter::new(self)
    }
}

/// Turn any sendable iterable into a [`ParallelQuery`].
pub trait IntoParallelQuery {
    type Item: Send + 'static;

    fn into_par_query(self) -> ParallelQuery<Self::Item>;
}

impl<I> IntoParallelQuery for I
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn into_par_query(self) -> ParallelQuery<Self::Item> {
        ParallelQuery::from_source(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn stages_are_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let query = ParallelQuery::from_vec((0..100).collect::<Vec<u32>>()).map(move |value| {
            counted.fetch_add(1, Ordering::Relaxed);
            value
        });
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(query.count().unwrap(), 100);
        assert_eq!(calls.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn ordered_to_vec_keeps_source_order() {
        let output = (0..5_000_u32)
            .into_par_query()
            .as_ordered()
            .with_execution_mode(ExecutionMode::ForcedParallel)
            .map(|value| value * 3)
            .to_vec()
            .unwrap();
        assert_eq!(output, (0..5_000_u32).map(|value| value * 3).collect::<Vec<_>>());
    }

    #[test]
    fn aggregate_and_reduce_match_sequential() {
        let values: Vec<u64> = (1..=2_000).collect();
        let expected: u64 = values.iter().map(|value| value * value).sum();
        let squares = ParallelQuery::from_vec(values.clone())
            .with_execution_mode(ExecutionMode::ForcedParallel)
            .aggregate(|| 0_u64, |acc, value| acc + value * value, |left, right| left + right)
            .unwrap();
        assert_eq!(squares, expected);

        let largest = ParallelQuery::from_vec(values).reduce(u64::max).unwrap();
        assert_eq!(largest, Some(2_000));
        let nothing = ParallelQuery::<u64>::from_vec(Vec::new()).reduce(u64::max).unwrap();
        assert_eq!(nothing, None);
    }

    #[test]
    fn try_map_failure_surfaces_as_aggregate() {
        let result = ParallelQuery::from_vec((0..1_000).collect::<Vec<i32>>())
            .try_map(|value| {
                if value == 700 {
                    return Err(anyhow!("bad element {value}"));
                }
                Ok(value)
            })
            .count();
        let errors = result.unwrap_err().as_aggregate().cloned().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.errors()[0].error().to_string(), "bad element 700");
    }

    #[test]
    fn zip_pairs_by_position() {
        let names = ParallelQuery::from_vec(vec!["a", "b", "c", "d"]);
        let numbers = (1..=3_u32).into_par_query();
        let zipped = names
            .zip(numbers, |name, number| format!("{name}{number}"))
            .as_ordered()
            .to_vec()
            .unwrap();
        assert_eq!(zipped, vec!["a1", "b2", "c3"]);
    }

    #[test]
    fn ordered_take_returns_prefix() {
        let first = (0..10_000_u32)
            .into_par_query()
            .as_ordered()
            .filter(|value| value % 7 == 0)
            .take(5)
            .to_vec()
            .unwrap();
        assert_eq!(first, vec![0, 7, 14, 21, 28]);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let result = ParallelQuery::from_vec(vec![1, 2, 3]).with_degree_of_parallelism(0).count();
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }
}
