//! Tasks: units of work with a result, a terminal state and continuations.
//!
//! A task moves `Created -> Scheduled -> Running` and then to exactly one of
//! `RanToCompletion`, `Faulted` or `Canceled`. Every transition is a
//! compare-and-swap on the status word, so only one thread ever performs the
//! terminal transition. Continuations registered on a task are dispatched by
//! that thread; a continuation registered after the fact is dispatched
//! immediately by the registering thread.

use core::fmt;
use core::mem;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{
    AggregateError, EngineError, ErrorOrigin, OperationCanceled, TaggedError, is_cancellation,
    panic_error, tag,
};
use crate::pool::{Schedule, WorkerPool};
use crate::sync::{Awaitable, Event};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

/// Lifecycle state of a task.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Created = 0,
    Scheduled = 1,
    Running = 2,
    RanToCompletion = 3,
    Faulted = 4,
    Canceled = 5,
}

impl TaskStatus {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::RanToCompletion | Self::Faulted | Self::Canceled)
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Scheduled,
            2 => Self::Running,
            3 => Self::RanToCompletion,
            4 => Self::Faulted,
            _ => Self::Canceled,
        }
    }
}

/// Which antecedent outcomes a continuation runs for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContinuationPredicate {
    Always,
    OnlyOnSuccess,
    OnlyOnFailure,
    OnlyOnCancellation,
}

impl ContinuationPredicate {
    /// Whether a continuation should run after an antecedent ended in `status`.
    pub const fn matches(self, status: TaskStatus) -> bool {
        match self {
            Self::Always => status.is_terminal(),
            Self::OnlyOnSuccess => matches!(status, TaskStatus::RanToCompletion),
            Self::OnlyOnFailure => matches!(status, TaskStatus::Faulted),
            Self::OnlyOnCancellation => matches!(status, TaskStatus::Canceled),
        }
    }
}

type TaskBody<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

/// Dispatcher run once with the antecedent's terminal status.
type Continuation = Box<dyn FnOnce(TaskStatus, Arc<dyn Schedule>) + Send>;

struct Outcome<T> {
    value: Option<T>,
    errors: Vec<TaggedError>,
}

struct TaskCore<T> {
    id: TaskId,
    status: AtomicU8,
    /// Continuation tasks are only ever started by their antecedent
    is_continuation: bool,
    body: Mutex<Option<TaskBody<T>>>,
    outcome: Mutex<Outcome<T>>,
    continuations: Mutex<Vec<Continuation>>,
    done: Event,
    token: CancellationToken,
    scheduler: Mutex<Option<Arc<dyn Schedule>>>,
}

impl<T: Send + 'static> TaskCore<T> {
    #[inline]
    fn status(&self) -> TaskStatus {
        TaskStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn dispatch(self: &Arc<Self>, scheduler: Arc<dyn Schedule>) {
        *self.scheduler.lock() = Some(Arc::clone(&scheduler));
        let core = Arc::clone(self);
        trace!("Task {} scheduled", self.id);
        scheduler.schedule(Box::new(move || core.execute()));
    }

    fn execute(&self) {
        if self.token.is_canceled() {
            self.complete(TaskStatus::Scheduled, TaskStatus::Canceled, None, Vec::new());
            return;
        }
        if !self.transition(TaskStatus::Scheduled, TaskStatus::Running) {
            return;
        }
        let Some(body) = self.body.lock().take() else {
            return;
        };

        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(value)) => self.complete(
                TaskStatus::Running,
                TaskStatus::RanToCompletion,
                Some(value),
                Vec::new(),
            ),
            Ok(Err(error)) if is_cancellation(&error) && self.token.is_canceled() => {
                self.complete(TaskStatus::Running, TaskStatus::Canceled, None, Vec::new());
            }
            Ok(Err(error)) => self.complete(
                TaskStatus::Running,
                TaskStatus::Faulted,
                None,
                tag(ErrorOrigin::Task(self.id), error),
            ),
            Err(payload) => self.complete(
                TaskStatus::Running,
                TaskStatus::Faulted,
                None,
                vec![TaggedError::new(
                    ErrorOrigin::Task(self.id),
                    panic_error(payload.as_ref()),
                )],
            ),
        }
    }

    /// Perform the terminal transition `from -> to`, if nobody else has.
    fn complete(
        &self,
        from: TaskStatus,
        to: TaskStatus,
        value: Option<T>,
        errors: Vec<TaggedError>,
    ) {
        {
            let mut outcome = self.outcome.lock();
            if !self.transition(from, to) {
                return;
            }
            if to == TaskStatus::Faulted {
                // Faults surface through `result` or `errors`; nothing is raised here.
                debug!(
                    "Task {} faulted: {}",
                    self.id,
                    AggregateError::new(errors.clone())
                );
            } else {
                debug!("Task {} finished as {to:?}", self.id);
            }
            outcome.value = value;
            outcome.errors = errors;
        }
        drop(self.body.lock().take());
        self.done.set();

        let pending = mem::take(&mut *self.continuations.lock());
        if !pending.is_empty() {
            let scheduler = self.scheduler_or_global();
            for continuation in pending {
                continuation(to, Arc::clone(&scheduler));
            }
        }
    }

    fn register(&self, continuation: Continuation) {
        let mut pending = self.continuations.lock();
        let status = self.status();
        if status.is_terminal() {
            drop(pending);
            continuation(status, self.scheduler_or_global());
        } else {
            pending.push(continuation);
        }
    }

    fn scheduler_or_global(&self) -> Arc<dyn Schedule> {
        let configured = self.scheduler.lock().clone();
        match configured {
            Some(scheduler) => scheduler,
            None => WorkerPool::global(),
        }
    }
}

/// Handle to a unit of work producing a `T`.
///
/// Handles are cheap to clone; all clones observe the same task.
pub struct Task<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> Task<T> {
    /// Create an unstarted task.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::build(Box::new(body), CancellationToken::none(), false)
    }

    /// Create an unstarted task that observes `token`.
    ///
    /// If the token is set by the time a worker picks the task up, the body
    /// never runs and the task ends `Canceled`. A body that returns
    /// [`OperationCanceled`] while the token is set also ends `Canceled`.
    pub fn with_cancellation<F>(body: F, token: CancellationToken) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::build(Box::new(body), token, false)
    }

    fn build(body: TaskBody<T>, token: CancellationToken, is_continuation: bool) -> Self {
        Self {
            core: Arc::new(TaskCore {
                id: TaskId::next(),
                status: AtomicU8::new(TaskStatus::Created as u8),
                is_continuation,
                body: Mutex::new(Some(body)),
                outcome: Mutex::new(Outcome {
                    value: None,
                    errors: Vec::new(),
                }),
                continuations: Mutex::new(Vec::new()),
                done: Event::new(),
                token,
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Create and start a task on the global pool.
    pub fn run<F>(body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::run_on(WorkerPool::global(), body)
    }

    /// Create and start a task on `scheduler`.
    pub fn run_on<F>(scheduler: Arc<dyn Schedule>, body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let task = Self::new(body);
        task.launch(scheduler);
        task
    }

    /// Create and start a task on the global pool that observes `token`.
    pub fn run_with_cancellation<F>(body: F, token: CancellationToken) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let task = Self::with_cancellation(body, token);
        task.launch(WorkerPool::global());
        task
    }

    fn launch(&self, scheduler: Arc<dyn Schedule>) {
        if self.core.transition(TaskStatus::Created, TaskStatus::Scheduled) {
            self.core.dispatch(scheduler);
        }
    }

    /// Schedule the task on the global pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidOperation`] if the task was already
    /// started or is a continuation.
    pub fn start(&self) -> Result<(), EngineError> {
        self.start_on(WorkerPool::global())
    }

    /// Schedule the task on `scheduler`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidOperation`] if the task was already
    /// started or is a continuation.
    pub fn start_on(&self, scheduler: Arc<dyn Schedule>) -> Result<(), EngineError> {
        if self.core.is_continuation {
            return Err(EngineError::InvalidOperation(format!(
                "task {} is a continuation and is started by its antecedent",
                self.core.id
            )));
        }
        if !self.core.transition(TaskStatus::Created, TaskStatus::Scheduled) {
            return Err(EngineError::InvalidOperation(format!(
                "task {} has already been started",
                self.core.id
            )));
        }
        self.core.dispatch(scheduler);
        Ok(())
    }

    /// Create a task that runs after this one reaches a terminal state.
    ///
    /// If `predicate` does not match the outcome, the continuation goes
    /// straight to `Canceled` and `body` never runs. Otherwise `body` is
    /// scheduled on this task's scheduler and receives this task.
    pub fn continue_with<U, F>(&self, predicate: ContinuationPredicate, body: F) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(&Self) -> anyhow::Result<U> + Send + 'static,
    {
        self.continue_with_cancellation(predicate, CancellationToken::none(), body)
    }

    /// Like [`Task::continue_with`], with a token for the continuation itself.
    pub fn continue_with_cancellation<U, F>(
        &self,
        predicate: ContinuationPredicate,
        token: CancellationToken,
        body: F,
    ) -> Task<U>
    where
        U: Send + 'static,
        F: FnOnce(&Self) -> anyhow::Result<U> + Send + 'static,
    {
        let antecedent = self.clone();
        let continuation = Task::<U>::build(Box::new(move || body(&antecedent)), token, true);

        let target = continuation.clone();
        let antecedent_id = self.core.id;
        self.core.register(Box::new(move |status: TaskStatus, scheduler: Arc<dyn Schedule>| {
            if predicate.matches(status) {
                target.launch(scheduler);
            } else {
                trace!(
                    "Continuation {} skipped: {predicate:?} does not match {status:?} \
                     of task {antecedent_id}",
                    target.core.id
                );
                target
                    .core
                    .complete(TaskStatus::Created, TaskStatus::Canceled, None, Vec::new());
            }
        }));
        continuation
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.core.status()
    }

    /// Whether the task reached any terminal state.
    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_completed_successfully(&self) -> bool {
        self.status() == TaskStatus::RanToCompletion
    }

    pub fn is_faulted(&self) -> bool {
        self.status() == TaskStatus::Faulted
    }

    pub fn is_canceled(&self) -> bool {
        self.status() == TaskStatus::Canceled
    }

    /// The task's errors, if it faulted. Never blocks.
    pub fn errors(&self) -> Option<AggregateError> {
        if !self.is_faulted() {
            return None;
        }
        let outcome = self.core.outcome.lock();
        Some(AggregateError::new(outcome.errors.clone()))
    }

    /// Block until the task is terminal.
    pub fn wait(&self) {
        self.core.done.wait();
    }

    /// Block until the task is terminal or `timeout` elapses.
    ///
    /// Returns whether the task finished in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.core.done.wait_timeout(timeout)
    }

    /// Block and return a copy of the task's value.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Aggregate`] with the task's errors if it
    /// faulted, [`EngineError::Canceled`] if it was canceled, and
    /// [`EngineError::InvalidOperation`] if the value was already taken.
    pub fn result(&self) -> Result<T, EngineError>
    where
        T: Clone,
    {
        self.wait();
        let outcome = self.core.outcome.lock();
        match self.status() {
            TaskStatus::RanToCompletion => outcome.value.clone().ok_or_else(Self::taken),
            TaskStatus::Faulted => Err(EngineError::Aggregate(AggregateError::new(
                outcome.errors.clone(),
            ))),
            _ => Err(EngineError::Canceled(OperationCanceled)),
        }
    }

    /// Block and move the value out of the task.
    ///
    /// # Errors
    ///
    /// As for [`Task::result`]; a second call reports
    /// [`EngineError::InvalidOperation`].
    pub fn take_result(&self) -> Result<T, EngineError> {
        self.wait();
        let mut outcome = self.core.outcome.lock();
        match self.status() {
            TaskStatus::RanToCompletion => outcome.value.take().ok_or_else(Self::taken),
            TaskStatus::Faulted => Err(EngineError::Aggregate(AggregateError::new(
                outcome.errors.clone(),
            ))),
            _ => Err(EngineError::Canceled(OperationCanceled)),
        }
    }

    fn taken() -> EngineError {
        EngineError::InvalidOperation("task result has already been taken".to_owned())
    }
}

impl<T> Awaitable for Task<T> {
    fn completion(&self) -> &Event {
        &self.core.done
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Task")
            .field("id", &self.core.id)
            .field(
                "status",
                &TaskStatus::from_raw(self.core.status.load(Ordering::Acquire)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::with_threads(2).unwrap())
    }

    #[test]
    fn status_flow_to_completion() {
        let pool = pool();
        let task = Task::new(|| Ok(21 * 2));
        assert_eq!(task.status(), TaskStatus::Created);
        task.start_on(pool).unwrap();
        assert_eq!(task.result().unwrap(), 42);
        assert!(task.is_completed_successfully());
        assert!(task.errors().is_none());
    }

    #[test]
    fn start_twice_is_invalid() {
        let pool = pool();
        let task = Task::new(|| Ok(()));
        task.start_on(Arc::clone(&pool) as Arc<dyn Schedule>).unwrap();
        assert!(matches!(
            task.start_on(pool),
            Err(EngineError::InvalidOperation(_))
        ));
        task.wait();
    }

    #[test]
    fn precanceled_token_skips_body() {
        let source = CancellationSource::new();
        source.cancel();
        let task = Task::<u32>::with_cancellation(|| panic!("must not run"), source.token());
        task.start_on(pool()).unwrap();
        task.wait();
        assert!(task.is_canceled());
        assert!(matches!(task.result(), Err(EngineError::Canceled(_))));
    }

    #[test]
    fn nested_aggregate_is_flattened() {
        let task = Task::<()>::run_on(pool(), || {
            let nested = AggregateError::new(vec![
                TaggedError::new(ErrorOrigin::Action(0), anyhow::anyhow!("left")),
                TaggedError::new(ErrorOrigin::Action(1), anyhow::anyhow!("right")),
            ]);
            Err(EngineError::Aggregate(nested).into())
        });
        task.wait();
        let errors = task.errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.errors()[0].origin(), ErrorOrigin::Action(0));
    }

    #[test]
    fn take_result_moves_value_once() {
        let task = Task::run_on(pool(), || Ok(vec![1, 2, 3]));
        assert_eq!(task.take_result().unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            task.take_result(),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[test]
    fn continuation_cannot_be_started_directly() {
        let task = Task::run_on(pool(), || Ok(1));
        let next = task.continue_with(ContinuationPredicate::Always, |_| Ok(2));
        assert!(matches!(next.start(), Err(EngineError::InvalidOperation(_))));
        assert_eq!(next.result().unwrap(), 2);
    }

    #[test]
    fn predicate_matching() {
        use ContinuationPredicate::{Always, OnlyOnCancellation, OnlyOnFailure, OnlyOnSuccess};
        assert!(Always.matches(TaskStatus::Canceled));
        assert!(!Always.matches(TaskStatus::Running));
        assert!(OnlyOnSuccess.matches(TaskStatus::RanToCompletion));
        assert!(!OnlyOnSuccess.matches(TaskStatus::Faulted));
        assert!(OnlyOnFailure.matches(TaskStatus::Faulted));
        assert!(OnlyOnCancellation.matches(TaskStatus::Canceled));
    }
}
