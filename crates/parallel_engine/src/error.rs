//! Error types reported at the boundary of every parallel operation.
//!
//! Work running on the pool never raises errors directly at the caller.
//! Failures are captured where they happen, tagged with their origin and
//! handed back as an [`AggregateError`] once the operation has finished.

use core::{fmt, slice};
use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::task::TaskId;

/// Cancellation-kind error, raised when a cancellation token is observed set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OperationCanceled;

impl fmt::Display for OperationCanceled {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "the operation was canceled")
    }
}

impl StdError for OperationCanceled {}

/// Where inside a multi-worker operation an error was captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// A loop or query lane, with the partition it was processing.
    Lane {
        /// Lane index within the operation
        lane: usize,
        /// Partition id in claim order
        partition: usize,
    },
    /// A task body or continuation body.
    Task(TaskId),
    /// One action of a parallel invoke, by argument position.
    Action(usize),
    /// The operation's cancellation signal.
    Canceled,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lane { lane, partition } => {
                write!(formatter, "lane {lane}, partition {partition}")
            }
            Self::Task(id) => write!(formatter, "task {id}"),
            Self::Action(index) => write!(formatter, "action {index}"),
            Self::Canceled => write!(formatter, "cancellation"),
        }
    }
}

/// A captured error together with its origin.
#[derive(Clone, Debug)]
pub struct TaggedError {
    /// Where the error was captured
    origin: ErrorOrigin,
    /// The user error, shared so aggregates stay cheap to clone
    error: Arc<anyhow::Error>,
}

impl TaggedError {
    /// Tag `error` with the place it came from.
    pub fn new(origin: ErrorOrigin, error: anyhow::Error) -> Self {
        Self {
            origin,
            error: Arc::new(error),
        }
    }

    /// The entry appended when an operation observed its cancellation signal.
    pub(crate) fn canceled() -> Self {
        Self::new(ErrorOrigin::Canceled, anyhow::Error::new(OperationCanceled))
    }

    #[inline]
    pub const fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    #[inline]
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Attempt to view the underlying error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether this entry is a cancellation-kind error.
    pub fn is_cancellation(&self) -> bool {
        is_cancellation(&self.error)
    }
}

impl fmt::Display for TaggedError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "[{}] {:#}", self.origin, self.error)
    }
}

/// One or more errors collected from a multi-worker operation.
///
/// Entries keep the order in which they were captured.
#[derive(Clone, Debug, Default)]
pub struct AggregateError {
    errors: Vec<TaggedError>,
}

impl AggregateError {
    pub const fn new(errors: Vec<TaggedError>) -> Self {
        Self { errors }
    }

    #[inline]
    pub fn errors(&self) -> &[TaggedError] {
        &self.errors
    }

    #[inline]
    pub fn into_errors(self) -> Vec<TaggedError> {
        self.errors
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedError> {
        self.errors.iter()
    }

    /// Whether any entry is a cancellation-kind error.
    pub fn contains_cancellation(&self) -> bool {
        self.errors.iter().any(TaggedError::is_cancellation)
    }

    /// Replace entries that wrap nested aggregates with the nested entries.
    ///
    /// Nested entries keep their own origins.
    #[must_use]
    pub fn flatten(self) -> Self {
        let mut flat = Vec::with_capacity(self.errors.len());
        for tagged in self.errors {
            if let Some(nested) = nested_aggregate(&tagged.error) {
                flat.extend(nested.clone().flatten().errors);
            } else {
                flat.push(tagged);
            }
        }
        Self { errors: flat }
    }

    /// Drop every entry for which `filter` returns true.
    ///
    /// # Errors
    ///
    /// Returns the unhandled subset when at least one entry was not handled.
    pub fn handle<F>(self, mut filter: F) -> Result<(), Self>
    where
        F: FnMut(&anyhow::Error) -> bool,
    {
        let unhandled: Vec<TaggedError> = self
            .flatten()
            .errors
            .into_iter()
            .filter(|tagged| !filter(&tagged.error))
            .collect();

        if unhandled.is_empty() {
            Ok(())
        } else {
            Err(Self { errors: unhandled })
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} error(s) occurred", self.errors.len())?;
        for tagged in &self.errors {
            write!(formatter, "; {tagged}")?;
        }
        Ok(())
    }
}

impl StdError for AggregateError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors
            .first()
            .map(|tagged| &**tagged.error as &(dyn StdError + 'static))
    }
}

impl<'agg> IntoIterator for &'agg AggregateError {
    type Item = &'agg TaggedError;
    type IntoIter = slice::Iter<'agg, TaggedError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

/// Errors returned by loops, tasks and queries.
#[derive(Clone, Debug)]
pub enum EngineError {
    /// The operation observed its cancellation signal and nothing else failed.
    Canceled(OperationCanceled),
    /// One or more callables failed.
    Aggregate(AggregateError),
    /// An argument was rejected before any work ran.
    InvalidArgument(String),
    /// The call is not valid in the current state.
    InvalidOperation(String),
}

impl EngineError {
    #[inline]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    pub const fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            Self::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }

    /// Suppress matched errors and keep the rest.
    ///
    /// A bare cancellation is offered to `filter` as an [`OperationCanceled`]
    /// error. Argument and state errors are never filtered.
    ///
    /// # Errors
    ///
    /// Returns the remaining error when anything was left unhandled.
    pub fn handle<F>(self, mut filter: F) -> Result<(), Self>
    where
        F: FnMut(&anyhow::Error) -> bool,
    {
        match self {
            Self::Aggregate(aggregate) => aggregate.handle(filter).map_err(Self::Aggregate),
            Self::Canceled(canceled) => {
                if filter(&anyhow::Error::new(canceled)) {
                    Ok(())
                } else {
                    Err(Self::Canceled(canceled))
                }
            }
            other @ (Self::InvalidArgument(_) | Self::InvalidOperation(_)) => Err(other),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled(canceled) => write!(formatter, "{canceled}"),
            Self::Aggregate(aggregate) => write!(formatter, "{aggregate}"),
            Self::InvalidArgument(msg) => write!(formatter, "Invalid argument: {msg}"),
            Self::InvalidOperation(msg) => write!(formatter, "Invalid operation: {msg}"),
        }
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Canceled(canceled) => Some(canceled),
            Self::Aggregate(aggregate) => Some(aggregate),
            Self::InvalidArgument(_) | Self::InvalidOperation(_) => None,
        }
    }
}

impl From<AggregateError> for EngineError {
    fn from(aggregate: AggregateError) -> Self {
        Self::Aggregate(aggregate)
    }
}

impl From<OperationCanceled> for EngineError {
    fn from(canceled: OperationCanceled) -> Self {
        Self::Canceled(canceled)
    }
}

/// Whether `error` is a cancellation-kind error.
pub(crate) fn is_cancellation(error: &anyhow::Error) -> bool {
    error.downcast_ref::<OperationCanceled>().is_some()
        || matches!(error.downcast_ref::<EngineError>(), Some(EngineError::Canceled(_)))
}

fn nested_aggregate(error: &anyhow::Error) -> Option<&AggregateError> {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::Aggregate(aggregate)) => Some(aggregate),
        _ => error.downcast_ref::<AggregateError>(),
    }
}

/// Tag `error`, expanding it when it carries a nested aggregate.
pub(crate) fn tag(origin: ErrorOrigin, error: anyhow::Error) -> Vec<TaggedError> {
    match nested_aggregate(&error) {
        Some(nested) => nested.clone().flatten().into_errors(),
        None => vec![TaggedError::new(origin, error)],
    }
}

/// Convert a caught panic payload into a user error.
pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> anyhow::Error {
    anyhow::anyhow!("callable panicked: {}", panic_message(payload))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Thread-safe sink for errors captured by concurrent lanes.
#[derive(Default)]
pub(crate) struct ErrorCollector {
    errors: Mutex<Vec<TaggedError>>,
}

impl ErrorCollector {
    pub(crate) fn record(&self, origin: ErrorOrigin, error: anyhow::Error) {
        let tagged = tag(origin, error);
        self.errors.lock().extend(tagged);
    }

    pub(crate) fn into_inner(self) -> Vec<TaggedError> {
        self.errors.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_error(partition: usize, msg: &str) -> TaggedError {
        TaggedError::new(
            ErrorOrigin::Lane { lane: 0, partition },
            anyhow::anyhow!(msg.to_owned()),
        )
    }

    #[test]
    fn flatten_expands_nested_aggregates() {
        let inner = AggregateError::new(vec![lane_error(1, "first"), lane_error(2, "second")]);
        let outer = AggregateError::new(vec![
            lane_error(0, "outer"),
            TaggedError::new(
                ErrorOrigin::Action(3),
                anyhow::Error::new(EngineError::Aggregate(inner)),
            ),
        ]);

        let flat = outer.flatten();
        let messages: Vec<String> = flat.iter().map(|tagged| tagged.error().to_string()).collect();
        assert_eq!(messages, vec!["outer", "first", "second"]);
        assert_eq!(
            flat.errors()[1].origin(),
            ErrorOrigin::Lane { lane: 0, partition: 1 }
        );
    }

    #[test]
    fn handle_keeps_unmatched_subset() {
        let aggregate = AggregateError::new(vec![
            lane_error(0, "io"),
            lane_error(1, "parse"),
            lane_error(2, "io"),
        ]);

        let remaining = aggregate
            .handle(|error| error.to_string() == "io")
            .err()
            .map(AggregateError::into_errors);
        let remaining = remaining.unwrap_or_default();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].error().to_string(), "parse");
    }

    #[test]
    fn handle_all_matched_is_ok() {
        let aggregate = AggregateError::new(vec![lane_error(0, "io")]);
        assert!(aggregate.handle(|_| true).is_ok());
    }

    #[test]
    fn cancellation_detection() {
        let aggregate = AggregateError::new(vec![lane_error(0, "boom"), TaggedError::canceled()]);
        assert!(aggregate.contains_cancellation());
        assert!(is_cancellation(&anyhow::Error::new(EngineError::Canceled(
            OperationCanceled
        ))));
        assert!(!is_cancellation(&anyhow::anyhow!("boom")));
    }

    #[test]
    fn panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert!(panic_error(owned.as_ref()).to_string().contains("owned"));
    }
}
