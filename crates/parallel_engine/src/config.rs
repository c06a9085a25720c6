//! Configuration settings for worker pools.
//!
//! A pool configuration can be constructed programmatically or loaded from
//! environment variables. The process-wide pool is always built from the
//! environment.

use core::time::Duration;
use std::env;

/// Default thread name prefix for pool workers.
pub const DEFAULT_THREAD_NAME: &str = "parallel-worker";

/// Default time an idle worker parks before rechecking the queues.
pub const DEFAULT_PARK_TIMEOUT_MS: u64 = 10;

/// Runtime configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads (at least 1)
    pub threads: usize,
    /// Prefix for worker thread names; the worker index is appended
    pub thread_name: String,
    /// How long an idle worker parks before polling again
    pub park_timeout: Duration,
}

impl PoolConfig {
    /// Construct a new `PoolConfig` with an explicit thread count.
    ///
    /// # Arguments
    ///
    /// * `threads` - Number of worker threads (minimum 1)
    ///
    /// # Returns
    ///
    /// A new `PoolConfig` with the default thread name and park timeout
    #[inline]
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            park_timeout: Duration::from_millis(DEFAULT_PARK_TIMEOUT_MS),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `PARALLEL_ENGINE_THREADS`: Worker thread count (default: logical processors)
    /// - `PARALLEL_ENGINE_THREAD_NAME`: Thread name prefix (default: `parallel-worker`)
    /// - `PARALLEL_ENGINE_PARK_TIMEOUT_MS`: Idle park timeout in milliseconds (default: 10)
    ///
    /// # Returns
    ///
    /// A new `PoolConfig` populated from environment variables
    #[inline]
    #[must_use]
    pub fn from_env() -> Self {
        let threads = env::var("PARALLEL_ENGINE_THREADS")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or_else(num_cpus::get)
            .max(1);
        let thread_name = env::var("PARALLEL_ENGINE_THREAD_NAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_THREAD_NAME.to_owned());
        let park_timeout_ms = env::var("PARALLEL_ENGINE_PARK_TIMEOUT_MS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PARK_TIMEOUT_MS)
            .max(1);
        Self {
            threads,
            thread_name,
            park_timeout: Duration::from_millis(park_timeout_ms),
        }
    }

    /// Replace the thread name prefix.
    #[inline]
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Replace the idle park timeout.
    #[inline]
    #[must_use]
    pub fn with_park_timeout(mut self, timeout: Duration) -> Self {
        self.park_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clamps_thread_count() {
        let config = PoolConfig::new(0);
        assert_eq!(config.threads, 1);
        assert_eq!(config.thread_name, DEFAULT_THREAD_NAME);
        assert_eq!(config.park_timeout, Duration::from_millis(10));
    }

    #[test]
    fn builders() {
        let config = PoolConfig::new(3)
            .with_thread_name("lanes")
            .with_park_timeout(Duration::ZERO);
        assert_eq!(config.threads, 3);
        assert_eq!(config.thread_name, "lanes");
        assert_eq!(config.park_timeout, Duration::from_millis(1));
    }

    #[test]
    fn default_uses_logical_processors() {
        assert_eq!(PoolConfig::default().threads, num_cpus::get().max(1));
    }
}
