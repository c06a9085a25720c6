//! Execution plans behind a [`ParallelQuery`](super::ParallelQuery).
//!
//! A plan is a source wrapped by zero or more element stages. Lanes call
//! [`Plan::run_partition`] repeatedly; the source claims one partition and
//! pushes each element, tagged with its source position, through the stages
//! into the lane's sink.

use core::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::trace;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{EngineError, panic_error};
use crate::loops::{Lane, ParallelOptions};
use crate::partition::{LaneCursor, Partitioning, RangePartitioner, SequencePartitioner};

/// Caller-supplied predicate selecting element errors to suppress.
pub type ErrorFilter = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Receives each surviving element with its source position.
pub(crate) type Emit<'emit, T> = dyn FnMut(u64, T) -> anyhow::Result<()> + 'emit;

/// Element stage: `None` drops the element.
pub(crate) type Stage<S, T> = Box<dyn Fn(S) -> anyhow::Result<Option<T>> + Send + Sync>;

type Thunk<T> = Box<dyn FnOnce(&ParallelOptions) -> Result<Vec<T>, EngineError> + Send>;

/// How the lanes of one evaluation are laid out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Layout {
    pub(crate) lanes: usize,
    pub(crate) partitioning: Partitioning,
}

/// Outcome of one claimed partition.
pub(crate) struct PartitionRun {
    /// Source positions the lane finished with, failed or not
    pub(crate) span: Range<u64>,
    pub(crate) failed: bool,
}

pub(crate) trait Plan<T>: Send + Sync {
    /// Materialize deferred inputs with the evaluating query's options. Runs
    /// on the evaluating thread before any lane starts.
    fn resolve(&self, options: &ParallelOptions) -> Result<(), EngineError>;

    /// Source length, when known without evaluating anything.
    fn len_hint(&self) -> Option<usize>;

    /// Size partitioners for the lanes about to run.
    fn bind(&self, layout: Layout);

    /// Claim one partition and push its surviving elements into `emit`.
    ///
    /// Returns `None` once the source is drained.
    fn run_partition(
        &self,
        cursor: &mut LaneCursor,
        lane: &Lane<'_>,
        filter: Option<&ErrorFilter>,
        emit: &mut Emit<'_, T>,
    ) -> Option<PartitionRun>;
}

/// Push `items` through `emit`, stopping at the first unhandled failure.
fn feed<T>(
    lane: &Lane<'_>,
    filter: Option<&ErrorFilter>,
    id: usize,
    span: Range<u64>,
    items: impl IntoIterator<Item = (u64, T)>,
    emit: &mut Emit<'_, T>,
) -> PartitionRun {
    lane.enter(id);
    let state = lane.state();
    for (position, item) in items {
        if state.should_exit() {
            return PartitionRun {
                span: span.start..position,
                failed: false,
            };
        }
        let error = match panic::catch_unwind(AssertUnwindSafe(|| emit(position, item))) {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(payload) => panic_error(payload.as_ref()),
        };
        if filter.is_some_and(|handles| handles(&error)) {
            trace!("Suppressed error at position {position}: {error:#}");
            continue;
        }
        lane.fail(error);
        return PartitionRun {
            span: span.start..position,
            failed: true,
        };
    }
    PartitionRun {
        span,
        failed: false,
    }
}

/// A vector source, claimed by position ranges from an atomic cursor.
pub(crate) struct VecSource<T> {
    slots: Mutex<Vec<Option<T>>>,
    len: usize,
    partitioner: OnceCell<RangePartitioner>,
}

impl<T: Send> VecSource<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        let len = items.len();
        Self {
            slots: Mutex::new(items.into_iter().map(Some).collect()),
            len,
            partitioner: OnceCell::new(),
        }
    }
}

impl<T: Send> Plan<T> for VecSource<T> {
    fn resolve(&self, _options: &ParallelOptions) -> Result<(), EngineError> {
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len)
    }

    fn bind(&self, layout: Layout) {
        self.partitioner.get_or_init(|| {
            RangePartitioner::new(self.len as u64, layout.lanes, layout.partitioning)
        });
    }

    fn run_partition(
        &self,
        cursor: &mut LaneCursor,
        lane: &Lane<'_>,
        filter: Option<&ErrorFilter>,
        emit: &mut Emit<'_, T>,
    ) -> Option<PartitionRun> {
        let partition = self.partitioner.get()?.next_partition(cursor)?;
        let items: Vec<(u64, T)> = {
            let mut slots = self.slots.lock();
            partition
                .iter()
                .filter_map(|position| {
                    slots
                        .get_mut(position as usize)
                        .and_then(Option::take)
                        .map(|item| (position, item))
                })
                .collect()
        };
        Some(feed(
            lane,
            filter,
            partition.id(),
            partition.start()..partition.end(),
            items,
            emit,
        ))
    }
}

type BoxedIter<T> = Box<dyn Iterator<Item = T> + Send>;

/// A lazily pulled iterator source, claimed in chunks under a lock.
pub(crate) struct IterSource<T> {
    pending: Mutex<Option<BoxedIter<T>>>,
    len: Option<usize>,
    partitioner: OnceCell<SequencePartitioner<BoxedIter<T>>>,
}

impl<T: Send> IterSource<T> {
    pub(crate) fn new(iter: BoxedIter<T>) -> Self {
        let len = match iter.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(upper),
            _ => None,
        };
        Self {
            pending: Mutex::new(Some(iter)),
            len,
            partitioner: OnceCell::new(),
        }
    }
}

impl<T: Send> Plan<T> for IterSource<T> {
    fn resolve(&self, _options: &ParallelOptions) -> Result<(), EngineError> {
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        self.len
    }

    fn bind(&self, layout: Layout) {
        let Some(iter) = self.pending.lock().take() else {
            return;
        };
        if self
            .partitioner
            .set(SequencePartitioner::new(iter, layout.partitioning))
            .is_err()
        {
            trace!("Iterator source was already bound");
        }
    }

    fn run_partition(
        &self,
        cursor: &mut LaneCursor,
        lane: &Lane<'_>,
        filter: Option<&ErrorFilter>,
        emit: &mut Emit<'_, T>,
    ) -> Option<PartitionRun> {
        let chunk = self.partitioner.get()?.next_chunk(cursor)?;
        let id = chunk.id();
        let span = chunk.span();
        Some(feed(lane, filter, id, span, chunk.into_positioned(), emit))
    }
}

/// A source produced by evaluating other queries first (zip, take, re-entry
/// from sequential mode).
pub(crate) struct DeferredSource<T> {
    thunk: Mutex<Option<Thunk<T>>>,
    resolved: OnceCell<VecSource<T>>,
}

impl<T: Send> DeferredSource<T> {
    pub(crate) fn new<F>(thunk: F) -> Self
    where
        F: FnOnce(&ParallelOptions) -> Result<Vec<T>, EngineError> + Send + 'static,
    {
        Self {
            thunk: Mutex::new(Some(Box::new(thunk))),
            resolved: OnceCell::new(),
        }
    }
}

impl<T: Send> Plan<T> for DeferredSource<T> {
    fn resolve(&self, options: &ParallelOptions) -> Result<(), EngineError> {
        self.resolved
            .get_or_try_init(|| {
                let thunk = self.thunk.lock().take().ok_or_else(|| {
                    EngineError::InvalidOperation(
                        "deferred query source was already consumed".to_owned(),
                    )
                })?;
                thunk(options).map(VecSource::new)
            })
            .map(|_| ())
    }

    fn len_hint(&self) -> Option<usize> {
        self.resolved.get().map(|source| source.len)
    }

    fn bind(&self, layout: Layout) {
        if let Some(source) = self.resolved.get() {
            source.bind(layout);
        }
    }

    fn run_partition(
        &self,
        cursor: &mut LaneCursor,
        lane: &Lane<'_>,
        filter: Option<&ErrorFilter>,
        emit: &mut Emit<'_, T>,
    ) -> Option<PartitionRun> {
        self.resolved
            .get()?
            .run_partition(cursor, lane, filter, emit)
    }
}

/// An element stage over an inner plan; covers map, filter and their fallible forms.
pub(crate) struct StagePlan<S, T> {
    inner: Box<dyn Plan<S>>,
    stage: Stage<S, T>,
}

impl<S, T> StagePlan<S, T> {
    pub(crate) fn new(inner: Box<dyn Plan<S>>, stage: Stage<S, T>) -> Self {
        Self { inner, stage }
    }
}

impl<S, T> Plan<T> for StagePlan<S, T> {
    fn resolve(&self, options: &ParallelOptions) -> Result<(), EngineError> {
        self.inner.resolve(options)
    }

    fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }

    fn bind(&self, layout: Layout) {
        self.inner.bind(layout);
    }

    fn run_partition(
        &self,
        cursor: &mut LaneCursor,
        lane: &Lane<'_>,
        filter: Option<&ErrorFilter>,
        emit: &mut Emit<'_, T>,
    ) -> Option<PartitionRun> {
        let stage = &self.stage;
        self.inner
            .run_partition(cursor, lane, filter, &mut |position, item| {
                match stage(item)? {
                    Some(output) => emit(position, output),
                    None => Ok(()),
                }
            })
    }
}
