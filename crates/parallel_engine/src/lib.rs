//! Parallel execution engine.
//!
//! This crate provides data- and task-parallel building blocks over a shared
//! work-stealing pool:
//! - Parallel loops over integer ranges and sequences, with break/stop,
//!   lane-local state and cancellation
//! - A task graph with continuations, completion waits and error aggregation
//! - Lazy query pipelines with ordered or unordered, streamed or buffered merges
//!
//! # Architecture
//!
//! ```text
//! Loops / Tasks / Queries
//!     ↓
//! Partitioner (ranges and sequences split into claimable partitions)
//!     ↓
//! Worker pool (per-worker deques, global injector, stealing)
//! ```
//!
//! Failures inside user code never unwind through the engine. They are
//! collected, tagged with where they happened, and returned as an
//! [`AggregateError`] at the call boundary.
//!
//! # Example
//!
//! ```ignore
//! use parallel_engine::{ParallelOptions, parallel_for_with_state};
//!
//! let options = ParallelOptions::new().with_max_degree_of_parallelism(4);
//! let result = parallel_for_with_state(0, 1_000, &options, |index, state| {
//!     if index == 500 {
//!         state.break_at(index);
//!     }
//!     Ok(())
//! })?;
//! assert_eq!(result.lowest_break_index(), Some(500));
//! ```

#![allow(
    clippy::module_name_repetitions,
    reason = "Types like PoolConfig and TaskStatus read better than Config and Status"
)]
#![allow(clippy::missing_errors_doc, reason = "Errors are described on EngineError")]
#![allow(clippy::missing_panics_doc, reason = "Panics in user code are captured, not raised")]

mod cancel;
mod config;
mod error;
mod loops;
mod partition;
mod pool;
mod sync;
mod task;

pub mod query;

// Re-exports
pub use cancel::{CancellationSource, CancellationToken};
pub use config::{DEFAULT_PARK_TIMEOUT_MS, DEFAULT_THREAD_NAME, PoolConfig};
pub use error::{AggregateError, EngineError, ErrorOrigin, OperationCanceled, TaggedError};
pub use loops::{
    Action, LoopResult, LoopState, ParallelOptions, parallel_for, parallel_for_local,
    parallel_for_step, parallel_for_with_state, parallel_foreach, parallel_foreach_indexed,
    parallel_foreach_local, parallel_invoke,
};
pub use partition::{
    LaneCursor, Partition, Partitioning, RangePartitioner, SequenceChunk, SequencePartitioner,
};
pub use pool::{Job, JobHandle, LimitedScheduler, PoolStats, Schedule, Scope, WorkerPool};
pub use query::{
    ExecutionMode, IntoParallelQuery, MergeMode, OrderingMode, ParallelQuery, QueryIter,
    SequentialQuery,
};
pub use sync::{Awaitable, Event, wait_all, wait_any};
pub use task::{ContinuationPredicate, Task, TaskId, TaskStatus};
