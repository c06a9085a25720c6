//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the right to cancel; any number of
//! [`CancellationToken`]s observe it. Cancellation is a set-once flag that
//! loops, tasks and queries check at partition and item boundaries. Nothing is
//! ever interrupted mid-execution.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::thread;

use anyhow::Context as _;
use log::debug;

use crate::error::OperationCanceled;
use crate::sync::Event;

struct CancelState {
    canceled: Event,
}

/// Producer side of a cancellation signal.
#[derive(Clone)]
pub struct CancellationSource {
    state: Arc<CancelState>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                canceled: Event::new(),
            }),
        }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Set the signal. Later calls have no effect.
    pub fn cancel(&self) {
        if self.state.canceled.set() {
            debug!("Cancellation requested");
        }
    }

    /// Set the signal once `delay` has elapsed, from a background timer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn cancel_after(&self, delay: Duration) -> anyhow::Result<()> {
        let source = self.clone();
        thread::Builder::new()
            .name("cancel-timer".to_owned())
            .spawn(move || {
                // Wakes early if someone else cancels first.
                if !source.state.canceled.wait_timeout(delay) {
                    source.cancel();
                }
            })
            .context("Failed to spawn cancellation timer thread")?;
        Ok(())
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.is_set()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CancellationSource")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Observer side of a cancellation signal.
///
/// The default token can never be canceled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Option<Arc<CancelState>>,
}

impl CancellationToken {
    /// A token with no source; it is never canceled.
    pub const fn none() -> Self {
        Self { state: None }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.canceled.is_set())
    }

    /// Whether a source exists that could cancel this token.
    #[inline]
    pub const fn can_be_canceled(&self) -> bool {
        self.state.is_some()
    }

    /// Fail with [`OperationCanceled`] if the signal is set.
    ///
    /// Bodies use this as a checkpoint: `token.check()?`.
    ///
    /// # Errors
    ///
    /// Returns [`OperationCanceled`] once cancellation has been requested.
    #[inline]
    pub fn check(&self) -> Result<(), OperationCanceled> {
        if self.is_canceled() {
            Err(OperationCanceled)
        } else {
            Ok(())
        }
    }

    /// Sleep for up to `timeout`, waking early on cancellation.
    ///
    /// Returns true if the token was canceled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.state {
            Some(state) => state.canceled.wait_timeout(timeout),
            None => {
                thread::sleep(timeout);
                false
            }
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CancellationToken")
            .field("can_be_canceled", &self.can_be_canceled())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn token_observes_source() {
        let source = CancellationSource::new();
        let token = source.token();
        let copy = token.clone();
        assert!(token.check().is_ok());

        source.cancel();
        source.cancel();
        assert!(token.is_canceled());
        assert_eq!(copy.check(), Err(OperationCanceled));
    }

    #[test]
    fn none_token_never_cancels() {
        let token = CancellationToken::none();
        assert!(!token.can_be_canceled());
        assert!(!token.wait_timeout(Duration::from_millis(1)));
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_after_fires() {
        let source = CancellationSource::new();
        let token = source.token();
        let started = Instant::now();
        assert!(source.cancel_after(Duration::from_millis(20)).is_ok());

        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
