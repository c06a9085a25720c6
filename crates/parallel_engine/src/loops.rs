//! Data-parallel loops over ranges and sequences.
//!
//! Every loop runs as a set of lanes. The calling thread runs lane 0 and the
//! pool runs the rest; each lane pulls partitions from a shared partitioner
//! until the work runs dry, the loop is stopped, a body fails or the
//! cancellation signal is observed. All entry points block until every lane
//! has finished.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{
    AggregateError, EngineError, ErrorCollector, ErrorOrigin, OperationCanceled, TaggedError,
    is_cancellation, panic_error,
};
use crate::partition::{LaneCursor, Partitioning, RangePartitioner, SequencePartitioner};
use crate::pool::WorkerPool;

/// Sentinel for "no break requested".
const NO_BREAK: i64 = i64::MAX;

/// An independent action for [`parallel_invoke`].
pub type Action<'env> = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'env>;

/// Shared control state of one running loop.
///
/// Bodies use it to request early termination; lanes read it before every
/// item.
pub struct LoopState {
    lowest_break: AtomicI64,
    stopped: AtomicBool,
    faulted: AtomicBool,
    canceled: AtomicBool,
    token: CancellationToken,
}

impl LoopState {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            lowest_break: AtomicI64::new(NO_BREAK),
            stopped: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            token,
        }
    }

    /// Stop dispatching indices above `index`.
    ///
    /// Indices at or below the lowest requested break are still attempted.
    /// Later calls with a higher index have no effect.
    pub fn break_at(&self, index: i64) {
        let previous = self.lowest_break.fetch_min(index, Ordering::AcqRel);
        if index < previous {
            trace!("Loop break requested at {index}");
        }
    }

    /// Stop dispatching new items as soon as possible, in any order.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            trace!("Loop stop requested");
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether some body in this loop has failed.
    #[inline]
    pub fn is_exceptional(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn lowest_break_index(&self) -> Option<i64> {
        let lowest = self.lowest_break.load(Ordering::Acquire);
        (lowest != NO_BREAK).then_some(lowest)
    }

    /// Whether a long-running body should return early.
    ///
    /// True after a stop, a failure elsewhere, or cancellation.
    pub fn should_exit_current_iteration(&self) -> bool {
        self.is_stopped() || self.is_exceptional() || self.token.is_canceled()
    }

    /// The loop's cancellation token, for bodies that check it themselves.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Checked by lanes before every item.
    pub(crate) fn should_exit(&self) -> bool {
        self.is_stopped() || self.is_exceptional() || self.poll_cancellation()
    }

    pub(crate) fn poll_cancellation(&self) -> bool {
        if self.token.is_canceled() {
            self.canceled.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub(crate) fn beyond_break(&self, index: i64) -> bool {
        index > self.lowest_break.load(Ordering::Acquire)
    }

    fn observed_cancellation(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LoopState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LoopState")
            .field("lowest_break", &self.lowest_break_index())
            .field("stopped", &self.is_stopped())
            .field("exceptional", &self.is_exceptional())
            .finish_non_exhaustive()
    }
}

/// How a loop that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopResult {
    completed: bool,
    lowest_break_index: Option<i64>,
}

impl LoopResult {
    const fn finished() -> Self {
        Self {
            completed: true,
            lowest_break_index: None,
        }
    }

    /// True only if every item ran with no stop and no break.
    #[inline]
    pub const fn completed(&self) -> bool {
        self.completed
    }

    /// Lowest index passed to [`LoopState::break_at`], if any.
    #[inline]
    pub const fn lowest_break_index(&self) -> Option<i64> {
        self.lowest_break_index
    }
}

/// Settings shared by every loop entry point.
#[derive(Clone, Debug, Default)]
pub struct ParallelOptions {
    max_degree_of_parallelism: Option<usize>,
    cancellation: CancellationToken,
    partitioning: Partitioning,
    pool: Option<Arc<WorkerPool>>,
}

pub(crate) struct Prepared {
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) lanes: usize,
}

impl ParallelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run at most `max` lanes at once. Zero is rejected when the loop starts.
    #[must_use]
    pub fn with_max_degree_of_parallelism(mut self, max: usize) -> Self {
        self.max_degree_of_parallelism = Some(max);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Run on `pool` instead of the global pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[inline]
    pub const fn max_degree_of_parallelism(&self) -> Option<usize> {
        self.max_degree_of_parallelism
    }

    #[inline]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[inline]
    pub const fn partitioning(&self) -> Partitioning {
        self.partitioning
    }

    /// The pool loops run on: the configured one, or the global pool.
    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone().unwrap_or_else(WorkerPool::global)
    }

    /// Adopt `outer`'s pool unless one was set here.
    pub(crate) fn inherit_pool(&mut self, outer: &Self) {
        if self.pool.is_none() {
            self.pool.clone_from(&outer.pool);
        }
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.max_degree_of_parallelism == Some(0) {
            return Err(EngineError::InvalidArgument(
                "max_degree_of_parallelism must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Validate, check for early cancellation and size the lane set for `work` items.
    pub(crate) fn prepare(&self, work: u64) -> Result<Prepared, EngineError> {
        self.validate()?;
        if self.cancellation.is_canceled() {
            return Err(EngineError::Canceled(OperationCanceled));
        }
        let pool = self.pool();
        let width = self
            .max_degree_of_parallelism
            .unwrap_or_else(|| pool.thread_count());
        let lanes = usize::try_from(work).map_or(width, |items| width.min(items)).max(1);
        Ok(Prepared { pool, lanes })
    }
}

/// One lane's handle on the running loop.
pub(crate) struct Lane<'run> {
    id: usize,
    partition: Cell<usize>,
    state: &'run LoopState,
    errors: &'run ErrorCollector,
}

impl<'run> Lane<'run> {
    #[inline]
    pub(crate) const fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) const fn state(&self) -> &'run LoopState {
        self.state
    }

    /// Record the partition this lane is working on, for error tags.
    pub(crate) fn enter(&self, partition: usize) {
        self.partition.set(partition);
    }

    /// Run one callable, recording a failure or panic against the current partition.
    pub(crate) fn invoke<R>(&self, call: impl FnOnce() -> anyhow::Result<R>) -> Option<R> {
        self.invoke_as(self.origin(), call)
    }

    pub(crate) fn invoke_as<R>(
        &self,
        origin: ErrorOrigin,
        call: impl FnOnce() -> anyhow::Result<R>,
    ) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.fail_as(origin, error);
                None
            }
            Err(payload) => {
                self.fail_as(origin, panic_error(payload.as_ref()));
                None
            }
        }
    }

    pub(crate) fn fail(&self, error: anyhow::Error) {
        self.fail_as(self.origin(), error);
    }

    fn fail_as(&self, origin: ErrorOrigin, error: anyhow::Error) {
        // A body that bails out on the loop's own token reports cancellation.
        if is_cancellation(&error) && self.state.poll_cancellation() {
            return;
        }
        trace!("Lane {} failed at {origin}: {error:#}", self.id);
        self.state.faulted.store(true, Ordering::Release);
        self.errors.record(origin, error);
    }

    fn origin(&self) -> ErrorOrigin {
        ErrorOrigin::Lane {
            lane: self.id,
            partition: self.partition.get(),
        }
    }
}

/// Run `lane_body` on `lanes` lanes and fold the shared outcome into a result.
pub(crate) fn run_lanes<F>(
    label: &str,
    pool: &WorkerPool,
    lanes: usize,
    token: &CancellationToken,
    lane_body: F,
) -> Result<LoopResult, EngineError>
where
    F: Fn(&Lane<'_>) + Sync,
{
    let state = LoopState::new(token.clone());
    let errors = ErrorCollector::default();
    let started = Instant::now();
    debug!("{label}: starting {lanes} lane(s)");

    let run_lane = |id: usize| {
        let lane = Lane {
            id,
            partition: Cell::new(0),
            state: &state,
            errors: &errors,
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| lane_body(&lane))) {
            lane.fail(panic_error(payload.as_ref()));
        }
    };

    if lanes <= 1 {
        run_lane(0);
    } else {
        pool.scope(|scope| {
            let run_lane = &run_lane;
            for id in 1..lanes {
                scope.spawn(move || run_lane(id));
            }
            run_lane(0);
        });
    }

    let outcome = conclude(&state, errors);
    debug!(
        "{label}: finished in {:?} ({})",
        started.elapsed(),
        match &outcome {
            Ok(result) if result.completed() => "completed".to_owned(),
            Ok(result) => format!(
                "stopped={}, break={:?}",
                state.is_stopped(),
                result.lowest_break_index()
            ),
            Err(error) => error.to_string(),
        }
    );
    outcome
}

fn conclude(state: &LoopState, errors: ErrorCollector) -> Result<LoopResult, EngineError> {
    let mut collected = errors.into_inner();
    if state.observed_cancellation() {
        if collected.is_empty() {
            return Err(EngineError::Canceled(OperationCanceled));
        }
        collected.push(TaggedError::canceled());
        return Err(EngineError::Aggregate(AggregateError::new(collected)));
    }
    if !collected.is_empty() {
        return Err(EngineError::Aggregate(AggregateError::new(collected)));
    }
    let lowest_break_index = state.lowest_break_index();
    Ok(LoopResult {
        completed: !state.is_stopped() && lowest_break_index.is_none(),
        lowest_break_index,
    })
}

/// Number of iterations in `[lo, hi)` stepped by `step`.
fn iteration_count(lo: i64, hi: i64, step: i64) -> u64 {
    if hi <= lo {
        return 0;
    }
    let span = i128::from(hi) - i128::from(lo);
    ((span + i128::from(step) - 1) / i128::from(step)) as u64
}

/// Index of iteration `iteration`; always inside `[lo, hi)`.
fn index_at(lo: i64, step: i64, iteration: u64) -> i64 {
    (i128::from(lo) + i128::from(iteration) * i128::from(step)) as i64
}

fn check_step(step: i64) -> Result<(), EngineError> {
    if step <= 0 {
        return Err(EngineError::InvalidArgument(format!(
            "step must be positive, got {step}"
        )));
    }
    Ok(())
}

fn for_range<L, Init, Body, Fin>(
    lo: i64,
    hi: i64,
    step: i64,
    options: &ParallelOptions,
    init: Init,
    body: Body,
    finalizer: Fin,
) -> Result<LoopResult, EngineError>
where
    Init: Fn() -> L + Sync,
    Body: Fn(i64, &LoopState, &mut L) -> anyhow::Result<()> + Sync,
    Fin: Fn(L) + Sync,
{
    check_step(step)?;
    options.validate()?;
    let count = iteration_count(lo, hi, step);
    if count == 0 {
        return Ok(LoopResult::finished());
    }

    let Prepared { pool, lanes } = options.prepare(count)?;
    let partitioner = RangePartitioner::new(count, lanes, options.partitioning);
    let label = format!("parallel_for [{lo}, {hi}) step {step}");

    run_lanes(&label, &pool, lanes, &options.cancellation, |lane| {
        let state = lane.state();
        let mut cursor = LaneCursor::new(lane.id());
        let mut local: Option<L> = None;

        'partitions: while let Some(partition) = partitioner.next_partition(&mut cursor) {
            lane.enter(partition.id());
            for iteration in partition.iter() {
                let index = index_at(lo, step, iteration);
                // Claims are monotonic, so later partitions lie beyond the break too.
                if state.should_exit() || state.beyond_break(index) {
                    break 'partitions;
                }
                if local.is_none() {
                    local = lane.invoke(|| Ok(init()));
                }
                let Some(acc) = local.as_mut() else {
                    break 'partitions;
                };
                if lane.invoke(|| body(index, state, acc)).is_none() {
                    break 'partitions;
                }
            }
        }

        // Faulted and canceled lanes still hand their accumulator back.
        if let Some(acc) = local {
            lane.invoke(|| {
                finalizer(acc);
                Ok(())
            });
        }
    })
}

fn for_sequence<I, L, Init, Body, Fin>(
    source: I,
    options: &ParallelOptions,
    init: Init,
    body: Body,
    finalizer: Fin,
) -> Result<LoopResult, EngineError>
where
    I: IntoIterator,
    I::IntoIter: Send,
    Init: Fn() -> L + Sync,
    Body: Fn(I::Item, i64, &LoopState, &mut L) -> anyhow::Result<()> + Sync,
    Fin: Fn(L) + Sync,
{
    let iter = source.into_iter();
    let work = iter.size_hint().1.map_or(u64::MAX, |upper| upper as u64);
    if work == 0 {
        options.validate()?;
        return Ok(LoopResult::finished());
    }

    let Prepared { pool, lanes } = options.prepare(work)?;
    let partitioner = SequencePartitioner::new(iter, options.partitioning);

    run_lanes("parallel_foreach", &pool, lanes, &options.cancellation, |lane| {
        let state = lane.state();
        let mut cursor = LaneCursor::new(lane.id());
        let mut local: Option<L> = None;

        'chunks: while !state.should_exit() {
            let Some(chunk) = partitioner.next_chunk(&mut cursor) else {
                break;
            };
            lane.enter(chunk.id());
            for (position, item) in chunk.into_positioned() {
                let index = position as i64;
                if state.should_exit() || state.beyond_break(index) {
                    break 'chunks;
                }
                if local.is_none() {
                    local = lane.invoke(|| Ok(init()));
                }
                let Some(acc) = local.as_mut() else {
                    break 'chunks;
                };
                if lane.invoke(|| body(item, index, state, acc)).is_none() {
                    break 'chunks;
                }
            }
        }

        // Faulted and canceled lanes still hand their accumulator back.
        if let Some(acc) = local {
            lane.invoke(|| {
                finalizer(acc);
                Ok(())
            });
        }
    })
}

/// Run `body(i)` for every `i` in `[lo, hi)` on the global pool.
///
/// # Errors
///
/// Returns [`EngineError::Aggregate`] with every captured error if any body
/// failed.
pub fn parallel_for<F>(lo: i64, hi: i64, body: F) -> Result<LoopResult, EngineError>
where
    F: Fn(i64) -> anyhow::Result<()> + Sync,
{
    parallel_for_step(lo, hi, 1, body)
}

/// Run `body(i)` for `i = lo, lo+step, ...` below `hi`.
///
/// # Errors
///
/// Returns [`EngineError::InvalidArgument`] if `step` is not positive, and
/// [`EngineError::Aggregate`] if any body failed.
pub fn parallel_for_step<F>(lo: i64, hi: i64, step: i64, body: F) -> Result<LoopResult, EngineError>
where
    F: Fn(i64) -> anyhow::Result<()> + Sync,
{
    for_range(
        lo,
        hi,
        step,
        &ParallelOptions::default(),
        || (),
        |index, _, _| body(index),
        |()| {},
    )
}

/// Run `body(i, state)` for every `i` in `[lo, hi)`.
///
/// The body may call [`LoopState::break_at`] or [`LoopState::stop`].
///
/// # Errors
///
/// Returns [`EngineError::Canceled`] if the options' token was observed set,
/// and [`EngineError::Aggregate`] if any body failed.
pub fn parallel_for_with_state<F>(
    lo: i64,
    hi: i64,
    options: &ParallelOptions,
    body: F,
) -> Result<LoopResult, EngineError>
where
    F: Fn(i64, &LoopState) -> anyhow::Result<()> + Sync,
{
    for_range(
        lo,
        hi,
        1,
        options,
        || (),
        |index, state, _| body(index, state),
        |()| {},
    )
}

/// Parallel for with a per-lane accumulator.
///
/// `init` seeds each lane's accumulator before its first item, `body` folds
/// items into it and `finalizer` consumes it once after the lane's last item.
/// Every lane that ran `init` reaches `finalizer`, including lanes whose body
/// failed or panicked and lanes cut short by cancellation. Combining lane
/// results is up to `finalizer`, which may run on several lanes at once.
///
/// # Errors
///
/// As for [`parallel_for_with_state`].
pub fn parallel_for_local<L, Init, Body, Fin>(
    lo: i64,
    hi: i64,
    options: &ParallelOptions,
    init: Init,
    body: Body,
    finalizer: Fin,
) -> Result<LoopResult, EngineError>
where
    Init: Fn() -> L + Sync,
    Body: Fn(i64, &LoopState, &mut L) -> anyhow::Result<()> + Sync,
    Fin: Fn(L) + Sync,
{
    for_range(lo, hi, 1, options, init, body, finalizer)
}

/// Run `body(item, state)` for every element of `source`.
///
/// Elements are pulled from `source` in chunks under a lock; their source
/// positions serve as indices for [`LoopState::break_at`].
///
/// # Errors
///
/// As for [`parallel_for_with_state`].
pub fn parallel_foreach<I, F>(
    source: I,
    options: &ParallelOptions,
    body: F,
) -> Result<LoopResult, EngineError>
where
    I: IntoIterator,
    I::IntoIter: Send,
    F: Fn(I::Item, &LoopState) -> anyhow::Result<()> + Sync,
{
    for_sequence(
        source,
        options,
        || (),
        |item, _, state, _| body(item, state),
        |()| {},
    )
}

/// Like [`parallel_foreach`], also passing each element's source position.
///
/// # Errors
///
/// As for [`parallel_for_with_state`].
pub fn parallel_foreach_indexed<I, F>(
    source: I,
    options: &ParallelOptions,
    body: F,
) -> Result<LoopResult, EngineError>
where
    I: IntoIterator,
    I::IntoIter: Send,
    F: Fn(I::Item, i64, &LoopState) -> anyhow::Result<()> + Sync,
{
    for_sequence(
        source,
        options,
        || (),
        |item, index, state, _| body(item, index, state),
        |()| {},
    )
}

/// Parallel foreach with a per-lane accumulator; see [`parallel_for_local`].
///
/// # Errors
///
/// As for [`parallel_for_with_state`].
pub fn parallel_foreach_local<I, L, Init, Body, Fin>(
    source: I,
    options: &ParallelOptions,
    init: Init,
    body: Body,
    finalizer: Fin,
) -> Result<LoopResult, EngineError>
where
    I: IntoIterator,
    I::IntoIter: Send,
    Init: Fn() -> L + Sync,
    Body: Fn(I::Item, i64, &LoopState, &mut L) -> anyhow::Result<()> + Sync,
    Fin: Fn(L) + Sync,
{
    for_sequence(source, options, init, body, finalizer)
}

/// Run every action, potentially in parallel, and wait for all of them.
///
/// A failing action does not prevent the others from running. Actions not yet
/// started when cancellation is observed are skipped.
///
/// # Errors
///
/// Returns [`EngineError::Aggregate`] tagged with [`ErrorOrigin::Action`] for
/// each failed action, or [`EngineError::Canceled`].
pub fn parallel_invoke(
    actions: Vec<Action<'_>>,
    options: &ParallelOptions,
) -> Result<(), EngineError> {
    options.validate()?;
    if actions.is_empty() {
        return Ok(());
    }

    let Prepared { pool, lanes } = options.prepare(actions.len() as u64)?;
    let slots: Vec<Mutex<Option<Action<'_>>>> =
        actions.into_iter().map(|action| Mutex::new(Some(action))).collect();
    let cursor = AtomicUsize::new(0);

    run_lanes("parallel_invoke", &pool, lanes, &options.cancellation, |lane| {
        while !lane.state().poll_cancellation() {
            let index = cursor.fetch_add(1, Ordering::AcqRel);
            let Some(slot) = slots.get(index) else {
                break;
            };
            if let Some(action) = slot.lock().take() {
                lane.invoke_as(ErrorOrigin::Action(index), action);
            }
        }
    })
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_count_and_index() {
        assert_eq!(iteration_count(0, 10, 3), 4);
        assert_eq!(iteration_count(5, 5, 1), 0);
        assert_eq!(iteration_count(10, 0, 1), 0);
        assert_eq!(iteration_count(i64::MIN, i64::MAX, i64::MAX), 3);
        assert_eq!(index_at(-4, 3, 2), 2);
        assert_eq!(index_at(i64::MIN, i64::MAX, 2), i64::MAX - 1);
    }

    #[test]
    fn break_keeps_lowest_index() {
        let state = LoopState::new(CancellationToken::none());
        assert_eq!(state.lowest_break_index(), None);
        state.break_at(40);
        state.break_at(55);
        state.break_at(12);
        assert_eq!(state.lowest_break_index(), Some(12));
        assert!(state.beyond_break(13));
        assert!(!state.beyond_break(12));
    }

    #[test]
    fn conclude_precedence() {
        let state = LoopState::new(CancellationToken::none());
        state.break_at(3);
        state.stop();
        let result = conclude(&state, ErrorCollector::default()).unwrap();
        assert!(!result.completed());
        assert_eq!(result.lowest_break_index(), Some(3));

        let canceled = LoopState::new(CancellationToken::none());
        canceled.canceled.store(true, Ordering::Release);
        let errors = ErrorCollector::default();
        errors.record(ErrorOrigin::Action(0), anyhow::anyhow!("boom"));
        match conclude(&canceled, errors) {
            Err(EngineError::Aggregate(aggregate)) => {
                assert_eq!(aggregate.len(), 2);
                assert!(aggregate.errors()[1].is_cancellation());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn invalid_arguments_rejected_before_work() {
        let ran = AtomicBool::new(false);
        let outcome = parallel_for_step(0, 10, 0, |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(outcome, Err(EngineError::InvalidArgument(_))));

        let options = ParallelOptions::new().with_max_degree_of_parallelism(0);
        let outcome = parallel_for_with_state(0, 10, &options, |_, _| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(outcome, Err(EngineError::InvalidArgument(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_range_completes() {
        let result = parallel_for(5, 5, |_| Ok(())).unwrap();
        assert!(result.completed());
        assert_eq!(result.lowest_break_index(), None);
    }

    #[test]
    fn lane_count_respects_work_and_degree() {
        let pool = Arc::new(WorkerPool::with_threads(4).unwrap());
        let options = ParallelOptions::new().with_pool(Arc::clone(&pool));
        assert_eq!(options.prepare(2).unwrap().lanes, 2);
        assert_eq!(options.prepare(100).unwrap().lanes, 4);
        let bounded = options.with_max_degree_of_parallelism(3);
        assert_eq!(bounded.prepare(100).unwrap().lanes, 3);
    }
}
