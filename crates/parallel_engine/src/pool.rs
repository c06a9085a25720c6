//! Work-stealing worker pool.
//!
//! Each worker owns a LIFO deque. Jobs submitted from a worker land on its own
//! deque; jobs from any other thread go through a shared injector. An idle
//! worker drains the injector first, then steals from the FIFO end of its
//! siblings' deques, then backs off and parks.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use std::any::Any;
use std::cell::OnceCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::utils::Backoff;
use log::{debug, error, trace, warn};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::error::panic_message;
use crate::sync::{self, Awaitable, Event, Throttle};

/// A unit of work owned by the pool until a worker runs it.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that accepts jobs for later execution.
///
/// Tasks reach the pool through this seam, which lets a bounded scheduler
/// stand in for the pool itself.
pub trait Schedule: Send + Sync {
    /// Queue `job`. Never blocks.
    fn schedule(&self, job: Job);
}

static GLOBAL_POOL: Lazy<Arc<WorkerPool>> = Lazy::new(build_global_pool);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(0);

#[allow(
    clippy::expect_used,
    reason = "Nothing parallel can run without the process-wide pool"
)]
fn build_global_pool() -> Arc<WorkerPool> {
    Arc::new(
        WorkerPool::new(PoolConfig::from_env()).expect("Failed to create global worker pool"),
    )
}

thread_local! {
    static WORKER: OnceCell<WorkerContext> = const { OnceCell::new() };
}

/// Per-thread view of the pool a worker belongs to.
struct WorkerContext {
    shared: Arc<Shared>,
    index: usize,
    local: Worker<Job>,
}

impl WorkerContext {
    fn find_job(&self) -> Option<Job> {
        if let Some(job) = self.local.pop() {
            return Some(job);
        }
        let victims = self.shared.stealers.len();
        loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Retry => continue,
                Steal::Empty => {}
            }

            let mut contended = false;
            for offset in 1..victims {
                let victim = (self.index + offset) % victims;
                match self.shared.stealers[victim].steal() {
                    Steal::Success(job) => {
                        self.shared.counters.stolen.fetch_add(1, Ordering::Relaxed);
                        trace!("Worker {} stole a job from worker {victim}", self.index);
                        return Some(job);
                    }
                    Steal::Retry => contended = true,
                    Steal::Empty => {}
                }
            }
            if !contended {
                return None;
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    executed: AtomicUsize,
    stolen: AtomicUsize,
    panicked: AtomicUsize,
}

/// State shared by a pool handle and its worker threads.
struct Shared {
    injector: Injector<Job>,
    stealers: Vec<Stealer<Job>>,
    /// Guards the park/notify handshake
    sleep: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
    park_timeout: Duration,
    counters: Counters,
}

impl Shared {
    fn push(self: &Arc<Self>, job: Job) {
        let overflow = WORKER.with(|slot| match slot.get() {
            Some(ctx) if Arc::ptr_eq(&ctx.shared, self) => {
                ctx.local.push(job);
                None
            }
            _ => Some(job),
        });
        if let Some(job) = overflow {
            self.injector.push(job);
        }
        self.wake_one();
    }

    fn wake_one(&self) {
        let _sleeping = self.sleep.lock();
        self.wake.notify_one();
    }

    fn execute(&self, job: Job) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            self.report_panic(payload.as_ref());
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn report_panic(&self, payload: &(dyn Any + Send)) {
        self.counters.panicked.fetch_add(1, Ordering::Relaxed);
        error!("Pool job panicked: {}", panic_message(payload));
    }

    fn run_worker(ctx: &WorkerContext) {
        let shared = &ctx.shared;
        let backoff = Backoff::new();
        loop {
            if let Some(job) = ctx.find_job() {
                backoff.reset();
                shared.execute(job);
                continue;
            }
            if shared.shutdown.load(Ordering::Acquire) {
                if shared.injector.is_empty() {
                    break;
                }
                continue;
            }
            if backoff.is_completed() {
                let mut sleeping = shared.sleep.lock();
                if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    shared.wake.wait_for(&mut sleeping, shared.park_timeout);
                }
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        trace!("Worker {} exiting", ctx.index);
    }
}

/// Snapshot of a pool's job counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs run to completion or to a caught panic
    pub executed: usize,
    /// Jobs taken from another worker's deque
    pub stolen: usize,
    /// Jobs whose panic was caught by a worker
    pub panicked: usize,
}

/// Fixed-size pool of worker threads with work stealing.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a new pool and start its workers.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(config: PoolConfig) -> anyhow::Result<Self> {
        let threads = config.threads.max(1);
        let deques: Vec<Worker<Job>> = (0..threads).map(|_| Worker::new_lifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: deques.iter().map(Worker::stealer).collect(),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            park_timeout: config.park_timeout,
            counters: Counters::default(),
        });

        // Dropping a partially built pool joins the workers already started.
        let mut pool = Self {
            shared: Arc::clone(&shared),
            threads: Vec::with_capacity(threads),
        };
        for (index, local) in deques.into_iter().enumerate() {
            let ctx_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || {
                    WORKER.with(|slot| {
                        let ctx = slot.get_or_init(|| WorkerContext {
                            shared: ctx_shared,
                            index,
                            local,
                        });
                        Shared::run_worker(ctx);
                    });
                })
                .with_context(|| format!("Failed to spawn worker thread {index}"))?;
            pool.threads.push(handle);
        }

        debug!("Started worker pool with {threads} threads");
        Ok(pool)
    }

    /// Create a pool with `threads` workers and default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn with_threads(threads: usize) -> anyhow::Result<Self> {
        Self::new(PoolConfig::new(threads))
    }

    /// The lazily built process-wide pool, configured from the environment.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_POOL)
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_current(&self) -> bool {
        WORKER.with(|slot| {
            slot.get()
                .is_some_and(|ctx| Arc::ptr_eq(&ctx.shared, &self.shared))
        })
    }

    /// Queue `work` and return a handle that completes when it has run.
    ///
    /// The handle completes even if `work` panics.
    pub fn submit<F>(&self, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (handle, job) = JobHandle::wrap(work);
        self.shared.push(job);
        handle
    }

    /// Queue `work` without a completion handle.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Box::new(work));
    }

    /// Wait until every handle has completed, or `timeout` elapses.
    pub fn await_all(handles: &[JobHandle], timeout: Option<Duration>) -> bool {
        let items: Vec<&dyn Awaitable> =
            handles.iter().map(|handle| handle as &dyn Awaitable).collect();
        sync::wait_all(&items, timeout)
    }

    /// Index of the first handle to complete, or `None` on timeout.
    pub fn await_any(handles: &[JobHandle], timeout: Option<Duration>) -> Option<usize> {
        let items: Vec<&dyn Awaitable> =
            handles.iter().map(|handle| handle as &dyn Awaitable).collect();
        sync::wait_any(&items, timeout)
    }

    /// Run `op` with a scope for spawning jobs that borrow from the caller.
    ///
    /// Returns only after every job spawned in the scope has finished. A panic
    /// in `op` or in any scoped job is resumed on the caller once all jobs are
    /// done.
    pub fn scope<'env, F, R>(&self, op: F) -> R
    where
        F: FnOnce(&Scope<'env>) -> R,
    {
        let scope = Scope {
            shared: Arc::clone(&self.shared),
            latch: Arc::new(ScopeLatch::new()),
            marker: PhantomData,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(&scope)));

        // Release the count held for `op` itself, then wait for the jobs.
        scope.latch.finish_one();
        scope.latch.done.wait();

        if let Some(payload) = scope.latch.panic.lock().take() {
            panic::resume_unwind(payload);
        }
        match outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// A scheduler that runs at most `max` of its jobs at once on this pool.
    pub fn limited(self: &Arc<Self>, max: NonZeroUsize) -> LimitedScheduler {
        LimitedScheduler {
            pool: Arc::clone(self),
            throttle: Arc::new(Throttle::new(max)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            executed: counters.executed.load(Ordering::Relaxed),
            stolen: counters.stolen.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Schedule for WorkerPool {
    fn schedule(&self, job: Job) {
        self.shared.push(job);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _sleeping = self.shared.sleep.lock();
            self.shared.wake.notify_all();
        }

        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            // The last handle was dropped by one of our own jobs.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
        debug!("Worker pool shut down");
    }
}

/// Whether the calling thread belongs to any pool.
pub(crate) fn is_worker_thread() -> bool {
    WORKER.with(|slot| slot.get().is_some())
}

/// Run one queued job of the calling worker's pool, if there is one.
pub(crate) fn help_once() -> bool {
    let found = WORKER.with(|slot| {
        slot.get()
            .and_then(|ctx| ctx.find_job().map(|job| (Arc::clone(&ctx.shared), job)))
    });
    match found {
        Some((shared, job)) => {
            shared.execute(job);
            true
        }
        None => false,
    }
}

/// Completion handle for a submitted job.
#[derive(Clone)]
pub struct JobHandle {
    id: u64,
    done: Arc<Event>,
}

impl JobHandle {
    fn wrap<F>(work: F) -> (Self, Job)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            done: Arc::new(Event::new()),
        };
        let signal = SetOnDrop(Arc::clone(&handle.done));
        let job: Job = Box::new(move || {
            let _signal = signal;
            work();
        });
        (handle, job)
    }

    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.done.is_set()
    }

    pub fn wait(&self) {
        self.done.wait();
    }

    /// Returns false if `timeout` elapsed before the job finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }
}

impl Awaitable for JobHandle {
    fn completion(&self) -> &Event {
        &self.done
    }
}

/// Sets the event when dropped, including during unwinding.
struct SetOnDrop(Arc<Event>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct ScopeLatch {
    /// Outstanding jobs, plus one for the scope body
    pending: AtomicUsize,
    done: Event,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ScopeLatch {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(1),
            done: Event::new(),
            panic: Mutex::new(None),
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.set();
        }
    }
}

/// Spawner for jobs that may borrow data living for `'env`.
pub struct Scope<'env> {
    shared: Arc<Shared>,
    latch: Arc<ScopeLatch>,
    /// Invariant over `'env`
    marker: PhantomData<&'env mut &'env ()>,
}

impl<'env> Scope<'env> {
    /// Queue `work` on the pool. The enclosing `scope` call waits for it.
    pub fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'env,
    {
        self.latch.pending.fetch_add(1, Ordering::AcqRel);
        let latch = Arc::clone(&self.latch);
        let job: Box<dyn FnOnce() + Send + 'env> = Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                let mut first = latch.panic.lock();
                if first.is_none() {
                    *first = Some(payload);
                }
            }
            latch.finish_one();
        });
        // SAFETY: `WorkerPool::scope` does not return before the latch reaches
        // zero, and the latch only drops after `work` has been consumed, so no
        // borrow captured by `work` is used past `'env`.
        let job: Job = unsafe { mem::transmute::<Box<dyn FnOnce() + Send + 'env>, Job>(job) };
        self.shared.push(job);
    }
}

/// A [`Schedule`] that bounds how many of its jobs run at once.
///
/// Jobs over the limit queue inside the scheduler and are released to the
/// pool one by one as running jobs finish. Submission never blocks.
#[derive(Clone)]
pub struct LimitedScheduler {
    pool: Arc<WorkerPool>,
    throttle: Arc<Throttle>,
}

impl LimitedScheduler {
    #[inline]
    pub fn limit(&self) -> usize {
        self.throttle.limit()
    }

    /// Jobs currently holding a permit.
    pub fn active(&self) -> usize {
        self.throttle.active()
    }

    /// Jobs waiting for a permit.
    pub fn queued(&self) -> usize {
        self.throttle.queued()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Queue `work` and return a handle that completes when it has run.
    pub fn submit<F>(&self, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (handle, job) = JobHandle::wrap(work);
        self.schedule(job);
        handle
    }

    fn dispatch(shared: &Arc<Shared>, throttle: &Arc<Throttle>, job: Job) {
        let next_shared = Arc::clone(shared);
        let next_throttle = Arc::clone(throttle);
        shared.push(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                next_shared.report_panic(payload.as_ref());
            }
            if let Some(next) = next_throttle.release() {
                Self::dispatch(&next_shared, &next_throttle, next);
            }
        }));
    }
}

impl Schedule for LimitedScheduler {
    fn schedule(&self, job: Job) {
        if let Some(admitted) = self.throttle.admit(job) {
            Self::dispatch(&self.pool.shared, &self.throttle, admitted);
        } else {
            trace!("Limited scheduler saturated, job queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pool(threads: usize) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::with_threads(threads).unwrap())
    }

    #[test]
    fn submit_runs_every_job() {
        init();
        let pool = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<JobHandle> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert!(WorkerPool::await_all(&handles, Some(Duration::from_secs(10))));
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        init();
        let pool = pool(1);
        let failing = pool.submit(|| panic!("boom"));
        assert!(failing.wait_timeout(Duration::from_secs(5)));

        let value = Arc::new(AtomicI32::new(0));
        let setter = Arc::clone(&value);
        let after = pool.submit(move || setter.store(7, Ordering::SeqCst));
        assert!(after.wait_timeout(Duration::from_secs(5)));
        assert_eq!(value.load(Ordering::SeqCst), 7);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[test]
    fn scope_borrows_local_data() {
        init();
        let pool = pool(3);
        let mut slots = vec![0_usize; 16];
        pool.scope(|scope| {
            for (index, slot) in slots.iter_mut().enumerate() {
                scope.spawn(move || *slot = index * 2);
            }
        });
        assert_eq!(slots, (0..16).map(|index| index * 2).collect::<Vec<_>>());
    }

    #[test]
    fn nested_scope_on_single_worker_completes() {
        init();
        let pool = pool(1);
        let inner_total = Arc::new(AtomicUsize::new(0));
        let outer = pool.submit({
            let pool = Arc::clone(&pool);
            let inner_total = Arc::clone(&inner_total);
            move || {
                pool.scope(|scope| {
                    for _ in 0..8 {
                        scope.spawn(|| {
                            inner_total.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        assert!(outer.wait_timeout(Duration::from_secs(10)));
        assert_eq!(inner_total.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn is_current_only_on_own_workers() {
        init();
        let pool = pool(2);
        assert!(!pool.is_current());
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let inner = Arc::clone(&pool);
        let handle = pool.submit(move || flag.store(inner.is_current(), Ordering::SeqCst));
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert!(seen.load(Ordering::SeqCst));
    }
}
