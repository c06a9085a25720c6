use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::bail;
use parallel_engine::{
    Awaitable, CancellationSource, ContinuationPredicate, EngineError, ErrorOrigin,
    OperationCanceled, Schedule, Task, TaskStatus, WorkerPool, wait_all, wait_any,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn task_runs_to_completion() {
    init_logging();
    let task = Task::run(|| Ok(6 * 7));
    assert_eq!(task.result().unwrap(), 42);
    assert_eq!(task.status(), TaskStatus::RanToCompletion);
    assert!(task.is_completed_successfully());
    assert!(task.errors().is_none());
}

#[test]
fn faulted_task_reports_exactly_its_error() {
    init_logging();
    let task = Task::<u32>::run(|| bail!("disk on fire"));
    let error = task.result().unwrap_err();
    let errors = error.as_aggregate().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors()[0].error().to_string(), "disk on fire");
    assert!(matches!(errors.errors()[0].origin(), ErrorOrigin::Task(id) if id == task.id()));
    assert!(task.is_faulted());
    assert_eq!(task.errors().unwrap().len(), 1);
}

#[test]
fn panicking_task_faults() {
    let task = Task::<()>::run(|| panic!("task exploded"));
    task.wait();
    assert!(task.is_faulted());
    let errors = task.errors().unwrap();
    assert!(errors.errors()[0].error().to_string().contains("task exploded"));
}

#[test]
fn created_task_waits_for_start() {
    let task = Task::new(|| Ok("started"));
    assert_eq!(task.status(), TaskStatus::Created);
    assert!(!task.wait_timeout(Duration::from_millis(20)));
    task.start().unwrap();
    assert_eq!(task.result().unwrap(), "started");
    assert!(matches!(task.start(), Err(EngineError::InvalidOperation(_))));
}

#[test]
fn wait_timeout_false_then_true() {
    let task = Task::run(|| {
        thread::sleep(Duration::from_millis(300));
        Ok(())
    });
    assert!(!task.wait_timeout(Duration::from_millis(10)));
    assert!(task.wait_timeout(Duration::from_secs(10)));
    assert!(task.is_completed());
}

#[test]
fn take_result_moves_the_value_once() {
    let task = Task::run(|| Ok(vec![1, 2, 3]));
    assert_eq!(task.take_result().unwrap(), vec![1, 2, 3]);
    assert!(matches!(task.take_result(), Err(EngineError::InvalidOperation(_))));
}

#[test]
fn continuation_receives_antecedent() {
    init_logging();
    let first = Task::run(|| Ok(20));
    let second = first.continue_with(ContinuationPredicate::OnlyOnSuccess, |antecedent| {
        Ok(antecedent.result()? + 1)
    });
    let third = second.continue_with(ContinuationPredicate::Always, |antecedent| {
        Ok(antecedent.result()? * 2)
    });
    assert_eq!(third.result().unwrap(), 42);
}

#[test]
fn continuation_predicates_follow_outcomes() {
    init_logging();
    let succeeded = Task::run(|| Ok(1));
    let failed = Task::<i32>::run(|| bail!("failure"));
    let source = CancellationSource::new();
    source.cancel();
    let canceled = Task::<i32>::run_with_cancellation(|| Ok(1), source.token());

    let predicates = [
        ContinuationPredicate::Always,
        ContinuationPredicate::OnlyOnSuccess,
        ContinuationPredicate::OnlyOnFailure,
        ContinuationPredicate::OnlyOnCancellation,
    ];
    let antecedents = [
        (&succeeded, TaskStatus::RanToCompletion),
        (&failed, TaskStatus::Faulted),
        (&canceled, TaskStatus::Canceled),
    ];
    for (antecedent, outcome) in antecedents {
        antecedent.wait();
        assert_eq!(antecedent.status(), outcome);
        for predicate in predicates {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran);
            let continuation = antecedent.continue_with(predicate, move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            continuation.wait();
            let should_run = predicate.matches(outcome);
            assert_eq!(ran.load(Ordering::SeqCst), should_run, "{predicate:?} after {outcome:?}");
            let expected = if should_run {
                TaskStatus::RanToCompletion
            } else {
                TaskStatus::Canceled
            };
            assert_eq!(continuation.status(), expected, "{predicate:?} after {outcome:?}");
        }
    }
}

#[test]
fn continuation_registered_before_completion_runs_after() {
    let gate = CancellationSource::new();
    let gate_token = gate.token();
    let first = Task::run(move || {
        gate_token.wait_timeout(Duration::from_secs(10));
        Ok(5)
    });
    let second = first.continue_with(ContinuationPredicate::Always, |antecedent| {
        Ok(antecedent.result()? * 10)
    });
    assert!(!second.is_completed());
    gate.cancel();
    assert_eq!(second.result().unwrap(), 50);
}

#[test]
fn continuation_cannot_be_started_directly() {
    let first = Task::new(|| Ok(()));
    let second = first.continue_with(ContinuationPredicate::Always, |_| Ok(()));
    assert!(matches!(second.start(), Err(EngineError::InvalidOperation(_))));
    first.start().unwrap();
    second.wait();
    assert!(second.is_completed_successfully());
}

#[test]
fn canceled_before_pickup_never_runs() {
    let source = CancellationSource::new();
    source.cancel();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let task = Task::<()>::run_with_cancellation(
        move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
        source.token(),
    );
    assert!(task.result().unwrap_err().is_canceled());
    assert!(task.is_canceled());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn body_observing_its_token_ends_canceled() {
    let source = CancellationSource::new();
    let token = source.token();
    let task = Task::<()>::run_with_cancellation(
        move || loop {
            if token.is_canceled() {
                return Err(OperationCanceled.into());
            }
            thread::sleep(Duration::from_millis(1));
        },
        source.token(),
    );
    source.cancel_after(Duration::from_millis(30)).unwrap();
    task.wait();
    assert!(task.is_canceled());
}

#[test]
fn wait_any_returns_the_short_sleeper_first() {
    init_logging();
    let started = Instant::now();
    let short = Task::run(|| {
        thread::sleep(Duration::from_millis(10));
        Ok(())
    });
    let long = Task::run(|| {
        thread::sleep(Duration::from_millis(1_000));
        Ok(())
    });
    let items: [&dyn Awaitable; 2] = [&long, &short];
    let index = wait_any(&items, None);
    assert_eq!(index, Some(1));
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(wait_all(&items, Some(Duration::from_secs(10))));
}

#[test]
fn wait_all_times_out_on_unfinished_tasks() {
    let gate = CancellationSource::new();
    let gate_token = gate.token();
    let stuck = Task::run(move || {
        gate_token.wait_timeout(Duration::from_secs(10));
        Ok(())
    });
    let quick = Task::run(|| Ok(()));
    let items: [&dyn Awaitable; 2] = [&stuck, &quick];
    assert!(!wait_all(&items, Some(Duration::from_millis(20))));
    gate.cancel();
    assert!(wait_all(&items, None));
    assert_eq!(wait_any(&[], Some(Duration::from_millis(1))), None);
}

#[test]
fn tasks_run_on_a_limited_scheduler() {
    init_logging();
    let pool = Arc::new(WorkerPool::with_threads(4).unwrap());
    let limited: Arc<dyn Schedule> = Arc::new(pool.limited(NonZeroUsize::new(2).unwrap()));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Task<()>> = (0..12)
        .map(|_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Task::run_on(Arc::clone(&limited), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();
    for task in &tasks {
        task.wait();
        assert!(task.is_completed_successfully());
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn continuations_use_the_antecedent_scheduler() {
    let pool = Arc::new(WorkerPool::with_threads(2).unwrap());
    let scheduler: Arc<dyn Schedule> = Arc::clone(&pool) as Arc<dyn Schedule>;
    let first = Task::run_on(scheduler, || Ok(()));
    let observer = Arc::clone(&pool);
    let second =
        first.continue_with(ContinuationPredicate::Always, move |_| Ok(observer.is_current()));
    assert!(second.result().unwrap());
}

#[test]
fn fan_in_of_many_tasks() {
    let tasks: Vec<Task<u64>> = (0..64_u64)
        .map(|value| Task::run(move || Ok(value * value)))
        .collect();
    let total: u64 = tasks.iter().map(|task| task.result().unwrap()).sum();
    assert_eq!(total, (0..64_u64).map(|value| value * value).sum());
}
