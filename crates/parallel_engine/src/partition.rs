//! Splitting ranges and sequences into partitions.
//!
//! Lanes pull partitions from a shared cursor until it runs dry, so a fast
//! lane simply takes more of them. Every iteration or element lands in
//! exactly one partition.

use core::iter::StepBy;
use core::num::NonZeroUsize;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

/// Upper bound on an adaptive range chunk.
const MAX_RANGE_CHUNK: u64 = 4096;

/// Upper bound on an adaptive sequence chunk. Sequence length is unknown, so
/// this stays small enough to keep lanes balanced near the end.
const MAX_SEQUENCE_CHUNK: usize = 256;

/// Adaptive chunks stop growing once a lane would take more than this share.
const PARTITIONS_PER_LANE: u64 = 4;

/// How work is cut into partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Partitioning {
    /// Chunks start at one item per lane and double up to a cap.
    #[default]
    Adaptive,
    /// Lane `k` of `L` takes iterations `k, k+L, k+2L, ...` as one partition.
    ///
    /// Sequences cannot be strided; they fall back to one-element chunks.
    Striped,
    /// Every chunk has the same size.
    Fixed(NonZeroUsize),
}

/// A claimed slice of iteration space: `start, start+stride, ...` below `end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    id: usize,
    start: u64,
    end: u64,
    stride: u64,
}

impl Partition {
    #[inline]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of iterations in the partition.
    pub const fn len(&self) -> u64 {
        if self.end <= self.start {
            0
        } else {
            (self.end - self.start).div_ceil(self.stride)
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> StepBy<Range<u64>> {
        (self.start..self.end).step_by(self.stride as usize)
    }
}

/// Per-lane partitioning state.
#[derive(Clone, Debug)]
pub struct LaneCursor {
    lane: usize,
    /// Next adaptive chunk size
    chunk: u64,
    striped_taken: bool,
}

impl LaneCursor {
    pub const fn new(lane: usize) -> Self {
        Self {
            lane,
            chunk: 1,
            striped_taken: false,
        }
    }

    #[inline]
    pub const fn lane(&self) -> usize {
        self.lane
    }

    fn grow(&mut self, cap: u64) {
        self.chunk = self.chunk.saturating_mul(2).min(cap).max(1);
    }
}

/// Hands out partitions of the iteration space `0..len`.
pub struct RangePartitioner {
    len: u64,
    lanes: u64,
    strategy: Partitioning,
    cap: u64,
    cursor: AtomicU64,
    next_id: AtomicUsize,
}

impl RangePartitioner {
    /// Partition `0..len` for `lanes` lanes.
    pub fn new(len: u64, lanes: usize, strategy: Partitioning) -> Self {
        let lanes = lanes.max(1) as u64;
        let cap = (len / lanes.saturating_mul(PARTITIONS_PER_LANE)).clamp(1, MAX_RANGE_CHUNK);
        Self {
            len,
            lanes,
            strategy,
            cap,
            cursor: AtomicU64::new(0),
            next_id: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claim the next partition for the lane behind `cursor`.
    ///
    /// Returns `None` once the lane has nothing left to take.
    pub fn next_partition(&self, cursor: &mut LaneCursor) -> Option<Partition> {
        let partition = match self.strategy {
            Partitioning::Striped => {
                let lane = cursor.lane as u64;
                if cursor.striped_taken || lane >= self.len {
                    return None;
                }
                cursor.striped_taken = true;
                Some(Partition {
                    id: cursor.lane,
                    start: lane,
                    end: self.len,
                    stride: self.lanes,
                })
            }
            Partitioning::Fixed(size) => self.claim(size.get() as u64),
            Partitioning::Adaptive => {
                let claimed = self.claim(cursor.chunk);
                cursor.grow(self.cap);
                claimed
            }
        };
        if let Some(claimed) = &partition {
            trace!(
                "Lane {} claimed partition {} [{}, {})",
                cursor.lane, claimed.id, claimed.start, claimed.end
            );
        }
        partition
    }

    fn claim(&self, size: u64) -> Option<Partition> {
        let size = size.max(1);
        let start = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.len).then(|| current + size.min(self.len - current))
            })
            .ok()?;
        Some(Partition {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            start,
            end: start + size.min(self.len - start),
            stride: 1,
        })
    }
}

/// A run of consecutive source elements claimed by one lane.
#[derive(Debug)]
pub struct SequenceChunk<T> {
    id: usize,
    start: u64,
    items: Vec<T>,
}

impl<T> SequenceChunk<T> {
    pub(crate) const fn new(id: usize, start: u64, items: Vec<T>) -> Self {
        Self { id, start, items }
    }

    #[inline]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Source position of the first element.
    #[inline]
    pub const fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Positions covered by this chunk.
    pub fn span(&self) -> Range<u64> {
        self.start..self.start + self.items.len() as u64
    }

    /// Elements paired with their source positions.
    pub fn into_positioned(self) -> impl Iterator<Item = (u64, T)> {
        (self.start..).zip(self.items)
    }
}

struct Enumerated<I> {
    iter: I,
    position: u64,
}

/// Hands out chunks of an iterator, tagging each element with its position.
pub struct SequencePartitioner<I: Iterator> {
    source: Mutex<Enumerated<I>>,
    strategy: Partitioning,
    next_id: AtomicUsize,
    exhausted: AtomicBool,
}

impl<I: Iterator> SequencePartitioner<I> {
    pub fn new(source: I, strategy: Partitioning) -> Self {
        Self {
            source: Mutex::new(Enumerated {
                iter: source,
                position: 0,
            }),
            strategy,
            next_id: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Pull the next chunk for the lane behind `cursor`.
    pub fn next_chunk(&self, cursor: &mut LaneCursor) -> Option<SequenceChunk<I::Item>> {
        if self.exhausted.load(Ordering::Acquire) {
            return None;
        }
        let size = match self.strategy {
            Partitioning::Striped => 1,
            Partitioning::Fixed(size) => size.get(),
            Partitioning::Adaptive => cursor.chunk as usize,
        };

        let (id, start, items) = {
            let mut source = self.source.lock();
            let items: Vec<I::Item> = source.iter.by_ref().take(size).collect();
            if items.len() < size {
                self.exhausted.store(true, Ordering::Release);
            }
            if items.is_empty() {
                return None;
            }
            let start = source.position;
            source.position += items.len() as u64;
            (self.next_id.fetch_add(1, Ordering::Relaxed), start, items)
        };

        cursor.grow(MAX_SEQUENCE_CHUNK as u64);
        trace!(
            "Lane {} claimed chunk {id} of {} elements at {start}",
            cursor.lane,
            items.len()
        );
        Some(SequenceChunk::new(id, start, items))
    }
}
