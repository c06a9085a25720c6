//! Blocking primitives shared by pools, tasks and queries.
//!
//! Every blocking wait in the crate goes through [`Event`]. When the waiting
//! thread is a pool worker it keeps executing queued jobs instead of parking,
//! so nested parallel calls made from inside jobs cannot starve the pool.

use core::mem;
use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::pool::{self, Job};

/// Longest a helping worker parks before polling the queues again.
pub(crate) const HELP_SLICE: Duration = Duration::from_millis(1);

/// Set-once completion flag with blocking and timed waits.
pub struct Event {
    /// Fast-path mirror of `state.set`
    set: AtomicBool,
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Default)]
struct EventState {
    set: bool,
    /// `wait_any` waiters to notify, with the index they registered under
    watchers: Vec<(Arc<AnyWaiter>, usize)>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Set the event and wake every waiter.
    ///
    /// Returns true for the single call that performed the transition.
    pub fn set(&self) -> bool {
        let watchers = {
            let mut state = self.state.lock();
            if state.set {
                return false;
            }
            state.set = true;
            self.set.store(true, Ordering::Release);
            self.cond.notify_all();
            mem::take(&mut state.watchers)
        };
        for (watcher, index) in watchers {
            watcher.fire(index);
        }
        true
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        self.wait_deadline(None);
    }

    /// Block until the event is set or `timeout` elapses.
    ///
    /// Returns whether the event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_deadline(Some(Instant::now() + timeout))
    }

    pub(crate) fn wait_deadline(&self, deadline: Option<Instant>) -> bool {
        block_until(
            deadline,
            || self.is_set(),
            |slice| {
                let mut state = self.state.lock();
                if !state.set {
                    park(&self.cond, &mut state, slice);
                }
            },
        )
    }

    /// Register `waiter` under `index`. Returns true if the event is already set.
    fn watch(&self, waiter: &Arc<AnyWaiter>, index: usize) -> bool {
        let mut state = self.state.lock();
        if state.set {
            return true;
        }
        state.watchers.push((Arc::clone(waiter), index));
        false
    }

    fn unwatch(&self, waiter: &Arc<AnyWaiter>) {
        self.state
            .lock()
            .watchers
            .retain(|(registered, _)| !Arc::ptr_eq(registered, waiter));
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the first of several events to fire.
struct AnyWaiter {
    first: Mutex<Option<usize>>,
    cond: Condvar,
}

impl AnyWaiter {
    fn fire(&self, index: usize) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(index);
            self.cond.notify_all();
        }
    }
}

fn park<T>(cond: &Condvar, guard: &mut MutexGuard<'_, T>, slice: Option<Duration>) {
    match slice {
        Some(duration) => {
            cond.wait_for(guard, duration);
        }
        None => cond.wait(guard),
    }
}

/// Wait until `ready` holds or `deadline` passes, helping the pool meanwhile.
fn block_until(
    deadline: Option<Instant>,
    mut ready: impl FnMut() -> bool,
    mut park_for: impl FnMut(Option<Duration>),
) -> bool {
    let helping = pool::is_worker_thread();
    loop {
        if ready() {
            return true;
        }
        let remaining = match deadline {
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return false;
                }
                Some(at - now)
            }
            None => None,
        };
        if helping {
            if pool::help_once() {
                continue;
            }
            park_for(Some(remaining.map_or(HELP_SLICE, |left| left.min(HELP_SLICE))));
        } else {
            park_for(remaining);
        }
    }
}

/// Something that eventually reaches a terminal state.
pub trait Awaitable {
    /// The event set once the terminal state is reached.
    fn completion(&self) -> &Event;
}

impl Awaitable for Event {
    fn completion(&self) -> &Event {
        self
    }
}

/// Wait for every item to complete.
///
/// Returns false if `timeout` elapsed first. With no items this returns true
/// immediately.
pub fn wait_all(items: &[&dyn Awaitable], timeout: Option<Duration>) -> bool {
    if items.iter().all(|item| item.completion().is_set()) {
        return true;
    }
    let deadline = timeout.map(|limit| Instant::now() + limit);
    items
        .iter()
        .all(|item| item.completion().wait_deadline(deadline))
}

/// Wait for the first item to complete and return its index.
///
/// Items that are already complete win by argument order. Returns `None` on
/// timeout or when `items` is empty.
pub fn wait_any(items: &[&dyn Awaitable], timeout: Option<Duration>) -> Option<usize> {
    if let Some(index) = items.iter().position(|item| item.completion().is_set()) {
        return Some(index);
    }
    if items.is_empty() {
        return None;
    }

    let waiter = Arc::new(AnyWaiter {
        first: Mutex::new(None),
        cond: Condvar::new(),
    });
    for (index, item) in items.iter().enumerate() {
        if item.completion().watch(&waiter, index) {
            waiter.fire(index);
            break;
        }
    }

    let deadline = timeout.map(|limit| Instant::now() + limit);
    block_until(
        deadline,
        || waiter.first.lock().is_some(),
        |slice| {
            let mut first = waiter.first.lock();
            if first.is_none() {
                park(&waiter.cond, &mut first, slice);
            }
        },
    );

    for item in items {
        item.completion().unwatch(&waiter);
    }
    *waiter.first.lock()
}

/// Counting limiter that queues work over its limit instead of blocking.
///
/// An admitted job holds one permit until it is released. Releasing hands the permit straight
/// to the oldest queued job, if any.
pub struct Throttle {
    limit: usize,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    active: usize,
    waiting: VecDeque<Job>,
}

impl Throttle {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            limit: limit.get(),
            state: Mutex::new(ThrottleState::default()),
        }
    }

    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Number of admitted jobs that have not been released.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Number of jobs queued behind the limit.
    pub fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Take a permit for `job`, or queue it when none is free.
    pub(crate) fn admit(&self, job: Job) -> Option<Job> {
        let mut state = self.state.lock();
        if state.active < self.limit {
            state.active += 1;
            Some(job)
        } else {
            state.waiting.push_back(job);
            None
        }
    }

    /// Return a permit. The next queued job, if any, inherits it.
    pub(crate) fn release(&self) -> Option<Job> {
        let mut state = self.state.lock();
        let next = state.waiting.pop_front();
        if next.is_none() {
            state.active = state.active.saturating_sub(1);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_sets_once() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(event.set());
        assert!(!event.set());
        assert!(event.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn event_timeout_without_set() {
        let event = Event::new();
        let started = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_all_across_threads() {
        let events: Vec<Arc<Event>> = (0..4).map(|_| Arc::new(Event::new())).collect();
        let setters: Vec<_> = events
            .iter()
            .map(|event| {
                let event = Arc::clone(event);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    event.set();
                })
            })
            .collect();

        let items: Vec<&dyn Awaitable> =
            events.iter().map(|event| &**event as &dyn Awaitable).collect();
        assert!(wait_all(&items, Some(Duration::from_secs(5))));
        for setter in setters {
            assert!(setter.join().is_ok());
        }
    }

    #[test]
    fn wait_any_prefers_lowest_completed_index() {
        let first = Event::new();
        let second = Event::new();
        let third = Event::new();
        second.set();
        third.set();
        let items: [&dyn Awaitable; 3] = [&first, &second, &third];
        assert_eq!(wait_any(&items, None), Some(1));
    }

    #[test]
    fn wait_any_wakes_on_fire() {
        let slow = Arc::new(Event::new());
        let fast = Arc::new(Event::new());
        let fast_setter = Arc::clone(&fast);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            fast_setter.set();
        });

        let items: [&dyn Awaitable; 2] = [&*slow, &*fast];
        assert_eq!(wait_any(&items, Some(Duration::from_secs(5))), Some(1));
        assert!(handle.join().is_ok());
        let pending: [&dyn Awaitable; 1] = [&*slow];
        assert!(wait_any(&pending, Some(Duration::from_millis(5))).is_none());
    }

    #[test]
    fn throttle_hands_permit_to_queued_job() {
        let throttle = Throttle::new(NonZeroUsize::MIN);
        assert!(throttle.admit(Box::new(|| {})).is_some());
        assert!(throttle.admit(Box::new(|| {})).is_none());
        assert_eq!(throttle.active(), 1);
        assert_eq!(throttle.queued(), 1);

        assert!(throttle.release().is_some());
        assert_eq!(throttle.active(), 1);
        assert!(throttle.release().is_none());
        assert_eq!(throttle.active(), 0);
    }
}
