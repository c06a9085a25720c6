//! Handing query output back to an enumerating caller.
//!
//! Streaming and chunked merges evaluate the query on the pool while the
//! caller consumes. Lanes push batches of `(position, element)` over a
//! channel; ordered merges additionally report each finished partition span
//! so the consumer can tell when every earlier position has been seen.

use core::mem;
use core::ops::Range;
use std::collections::{BTreeMap, VecDeque};
use std::vec;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, trace};

use super::{CHUNKED_BATCH_SIZE, MergeMode, OrderingMode, ParallelQuery};
use crate::error::EngineError;
use crate::loops::LoopResult;
use crate::pool;
use crate::sync::HELP_SLICE;

enum Message<T> {
    Items(Vec<(u64, T)>),
    /// Every position in the span has been processed
    Done(Range<u64>),
    Finished(Result<LoopResult, EngineError>),
}

/// One lane's outgoing buffer.
struct Outbox<T> {
    sender: Sender<Message<T>>,
    batch: Vec<(u64, T)>,
    capacity: usize,
}

impl<T> Outbox<T> {
    /// Returns false once the consumer is gone.
    fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }
        let batch = mem::replace(&mut self.batch, Vec::with_capacity(self.capacity));
        self.sender.send(Message::Items(batch)).is_ok()
    }
}

/// Iterator over the output of an enumerated [`ParallelQuery`].
///
/// Evaluation starts on the first call to `next`. A failed evaluation yields a
/// single `Err` and then ends. Dropping the iterator early stops the lanes still
/// producing.
pub struct QueryIter<T> {
    pending: Option<ParallelQuery<T>>,
    merged: Merged<T>,
}

enum Merged<T> {
    Buffered(vec::IntoIter<T>),
    Streaming(Box<StreamMerge<T>>),
    Failed(EngineError),
    Exhausted,
}

impl<T: Send + 'static> QueryIter<T> {
    pub(super) fn new(query: ParallelQuery<T>) -> Self {
        Self {
            pending: Some(query),
            merged: Merged::Exhausted,
        }
    }
}

impl<T: Send + 'static> Iterator for QueryIter<T> {
    type Item = Result<T, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(query) = self.pending.take() {
            self.merged = start(query);
        }
        match &mut self.merged {
            Merged::Buffered(items) => items.next().map(Ok),
            Merged::Streaming(stream) => stream.next_item(),
            Merged::Failed(_) => match mem::replace(&mut self.merged, Merged::Exhausted) {
                Merged::Failed(error) => Some(Err(error)),
                _ => None,
            },
            Merged::Exhausted => None,
        }
    }
}

fn start<T: Send + 'static>(query: ParallelQuery<T>) -> Merged<T> {
    let capacity = match query.settings.merge {
        MergeMode::FullyBuffered => {
            return match query.to_vec() {
                Ok(items) => Merged::Buffered(items.into_iter()),
                Err(error) => Merged::Failed(error),
            };
        }
        MergeMode::Streaming => 1,
        MergeMode::Chunked => CHUNKED_BATCH_SIZE,
    };
    let ordered = query.settings.ordering == OrderingMode::Ordered;
    let pool = query.settings.options.pool();
    let (sender, receiver) = channel::unbounded();
    debug!("Streaming query output, batch={capacity}, ordered={ordered}");

    pool.spawn(move || {
        let outcome = query.drive(
            || Outbox {
                sender: sender.clone(),
                batch: Vec::with_capacity(capacity),
                capacity,
            },
            |outbox, state, position, item| {
                outbox.batch.push((position, item));
                if outbox.batch.len() >= outbox.capacity && !outbox.flush() {
                    state.stop();
                }
                Ok(())
            },
            |outbox, state, span| {
                let delivered = outbox.flush()
                    && (!ordered
                        || span.is_empty()
                        || outbox.sender.send(Message::Done(span)).is_ok());
                if !delivered {
                    state.stop();
                }
            },
            |mut outbox| {
                outbox.flush();
            },
        );
        if sender.send(Message::Finished(outcome)).is_err() {
            trace!("Query consumer went away before the end");
        }
    });

    Merged::Streaming(Box::new(StreamMerge {
        receiver,
        ordered,
        ready: VecDeque::new(),
        held: BTreeMap::new(),
        spans: BTreeMap::new(),
        frontier: 0,
        finished: false,
    }))
}

struct StreamMerge<T> {
    receiver: Receiver<Message<T>>,
    ordered: bool,
    ready: VecDeque<T>,
    /// Ordered elements waiting for the frontier to pass them
    held: BTreeMap<u64, T>,
    /// Finished spans past the frontier, start to end
    spans: BTreeMap<u64, u64>,
    /// Every position below this has been processed
    frontier: u64,
    finished: bool,
}

impl<T> StreamMerge<T> {
    fn next_item(&mut self) -> Option<Result<T, EngineError>> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(Ok(item));
            }
            if self.finished {
                return None;
            }
            match receive(&self.receiver) {
                Some(Message::Items(batch)) => {
                    if self.ordered {
                        self.held.extend(batch);
                        self.release();
                    } else {
                        self.ready.extend(batch.into_iter().map(|(_, item)| item));
                    }
                }
                Some(Message::Done(span)) => {
                    self.spans.insert(span.start, span.end);
                    while let Some(end) = self.spans.remove(&self.frontier) {
                        self.frontier = end;
                    }
                    self.release();
                }
                Some(Message::Finished(Ok(_))) => self.finish(),
                Some(Message::Finished(Err(error))) => return Some(Err(self.abandon(error))),
                None => {
                    let error = EngineError::InvalidOperation(
                        "query producer stopped without reporting a result".to_owned(),
                    );
                    return Some(Err(self.abandon(error)));
                }
            }
        }
    }

    fn release(&mut self) {
        let later = self.held.split_off(&self.frontier);
        self.ready
            .extend(mem::replace(&mut self.held, later).into_values());
    }

    fn finish(&mut self) {
        self.finished = true;
        self.ready.extend(mem::take(&mut self.held).into_values());
    }

    fn abandon(&mut self, error: EngineError) -> EngineError {
        self.finished = true;
        self.ready.clear();
        self.held.clear();
        error
    }
}

/// Block for the next message; a worker thread runs queued jobs meanwhile.
fn receive<T>(receiver: &Receiver<T>) -> Option<T> {
    if !pool::is_worker_thread() {
        return receiver.recv().ok();
    }
    loop {
        match receiver.try_recv() {
            Ok(message) => return Some(message),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        if !pool::help_once() {
            match receiver.recv_timeout(HELP_SLICE) {
                Ok(message) => return Some(message),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}
