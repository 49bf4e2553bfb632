//! The per-handle read path.
//!
//! Every open file gets an [AdaptiveReader] that watches where reads land
//! and picks the cheapest strategy: a prefetching, block-cached reader while
//! the caller moves forward through the object, a direct ranged reader once
//! the caller starts seeking around, and back again when sequential behavior
//! resumes.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blocks::BlockCache;
use crate::bucket::Bucket;
use crate::config::Config;
use crate::{Error, Result};

mod direct;
mod prefetch;

pub use direct::DirectReader;
pub use prefetch::PrefetchReader;

/// Maximum forward gap between the end of one read and the start of the
/// next for the step to still count as sequential. Kernel readahead splits
/// and reorders requests; a strict equality check would misclassify those.
const SEQUENTIAL_ADJACENCY: u64 = 1 << 20;

/// Prefetch read failures tolerated before the handle downgrades to direct
/// reads for good.
const PREFETCH_FAILURE_LIMIT: u32 = 2;

/// The object identity a handle reads: name plus the generation pinned at
/// open, so overwrites never bleed into an open handle.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedObject {
    pub name: String,
    pub generation: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPattern {
    Unknown,
    Sequential,
    Random,
}

/// Which reader currently backs the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderFlavor {
    Prefetch,
    Direct,
}

/// Read bookkeeping for one open file handle. Updated by the thread
/// servicing the read; the handle's lock serializes access.
#[derive(Debug)]
pub struct SharedReadState {
    pub total_bytes_read: u64,
    pub random_seek_count: u64,
    /// End offset of the previous read.
    pub last_read_offset: u64,
    pub pattern: ReadPattern,
    /// Length of the current exactly-contiguous run, in reads.
    sequential_run: u64,
}

impl SharedReadState {
    /// The seek count starts at 1 so the very first read is treated as a
    /// potential seek; an initial jump into the middle of the object then
    /// counts toward the random threshold instead of resetting it.
    pub fn new() -> Self {
        Self {
            total_bytes_read: 0,
            random_seek_count: 1,
            last_read_offset: 0,
            pattern: ReadPattern::Unknown,
            sequential_run: 0,
        }
    }

    /// Classifies the step beginning at `offset` and updates the counters.
    /// Returns true for a sequential step.
    fn record_step(&mut self, offset: u64) -> bool {
        let sequential = offset >= self.last_read_offset
            && offset - self.last_read_offset <= SEQUENTIAL_ADJACENCY;

        if offset == self.last_read_offset {
            self.sequential_run += 1;
        } else {
            self.sequential_run = 1;
        }

        if sequential {
            if self.pattern == ReadPattern::Unknown {
                self.pattern = ReadPattern::Sequential;
            }
        } else {
            self.random_seek_count += 1;
        }
        sequential
    }

    /// True once enough exactly-contiguous reads have accumulated after a
    /// random phase to justify rebuilding the prefetch reader.
    fn should_restart_prefetch(&self, threshold: u64) -> bool {
        self.random_seek_count > 0 && self.sequential_run >= threshold
    }

    /// Clears the seek bookkeeping after a reader restart. The byte total is
    /// cumulative for the life of the handle and survives.
    pub fn reset(&mut self) {
        self.random_seek_count = 0;
        self.sequential_run = 0;
        self.pattern = ReadPattern::Sequential;
    }
}

impl Default for SharedReadState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-read-path tunables, lifted out of [Config] at handle creation.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub random_seek_threshold: u64,
    pub sequential_restart_threshold: u64,
    pub start_blocks_per_handle: u64,
    pub min_blocks_per_handle: u64,
    pub max_blocks_per_handle: u64,
    pub enable_buffered_read: bool,
}

impl From<&Config> for ReadOptions {
    fn from(config: &Config) -> Self {
        Self {
            random_seek_threshold: config.random_seek_threshold,
            sequential_restart_threshold: config.sequential_restart_threshold,
            start_blocks_per_handle: config.start_blocks_per_handle,
            min_blocks_per_handle: config.min_blocks_per_handle,
            max_blocks_per_handle: config.max_blocks_per_handle,
            enable_buffered_read: config.enable_buffered_read,
        }
    }
}

enum ReaderKind {
    Prefetch(PrefetchReader),
    Direct(DirectReader),
}

/// State machine over the two readers; see the module docs.
pub struct AdaptiveReader {
    object: PinnedObject,
    bucket: Arc<dyn Bucket>,
    cache: Arc<BlockCache>,
    opts: ReadOptions,
    state: SharedReadState,
    kind: ReaderKind,
    prefetch_failures: u32,
}

impl AdaptiveReader {
    pub fn new(
        object: PinnedObject,
        bucket: Arc<dyn Bucket>,
        cache: Arc<BlockCache>,
        opts: ReadOptions,
    ) -> Self {
        let kind = if opts.enable_buffered_read {
            ReaderKind::Prefetch(Self::new_prefetch(&object, &cache, &opts))
        } else {
            ReaderKind::Direct(DirectReader::new(object.clone(), bucket.clone()))
        };
        Self {
            object,
            bucket,
            cache,
            opts,
            state: SharedReadState::new(),
            kind,
            prefetch_failures: 0,
        }
    }

    fn new_prefetch(
        object: &PinnedObject,
        cache: &Arc<BlockCache>,
        opts: &ReadOptions,
    ) -> PrefetchReader {
        PrefetchReader::new(
            object.clone(),
            cache.clone(),
            opts.start_blocks_per_handle.max(opts.min_blocks_per_handle),
            opts.max_blocks_per_handle,
        )
    }

    pub fn flavor(&self) -> ReaderFlavor {
        match self.kind {
            ReaderKind::Prefetch(_) => ReaderFlavor::Prefetch,
            ReaderKind::Direct(_) => ReaderFlavor::Direct,
        }
    }

    pub fn state(&self) -> &SharedReadState {
        &self.state
    }

    pub fn object(&self) -> &PinnedObject {
        &self.object
    }

    /// Serves one read. Reads at or past the end of the object return an
    /// empty buffer; a range straddling the end returns the bytes that
    /// exist. Neither is an error.
    pub async fn read_at(
        &mut self,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if len == 0 || offset >= self.object.size {
            return Ok(Bytes::new());
        }
        let len = len.min((self.object.size - offset) as usize);

        let sequential = self.state.record_step(offset);
        self.maybe_transition();

        let result = match &mut self.kind {
            ReaderKind::Prefetch(p) => p.read_at(offset, len, sequential, cancel).await,
            ReaderKind::Direct(d) => d.read_at(offset, len, cancel).await,
        };

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) if matches!(self.kind, ReaderKind::Prefetch(_)) => {
                self.prefetch_failures += 1;
                if self.prefetch_failures < PREFETCH_FAILURE_LIMIT {
                    return Err(e);
                }
                // Prefetch keeps failing; stop insisting and serve the read
                // directly.
                warn!(object = %self.object.name, error = %e, "prefetch failing, downgrading to direct reads");
                self.kind =
                    ReaderKind::Direct(DirectReader::new(self.object.clone(), self.bucket.clone()));
                self.state.pattern = ReadPattern::Random;
                match &mut self.kind {
                    ReaderKind::Direct(d) => d.read_at(offset, len, cancel).await?,
                    ReaderKind::Prefetch(_) => unreachable!("just replaced"),
                }
            }
            Err(e) => return Err(e),
        };

        self.state.total_bytes_read += bytes.len() as u64;
        self.state.last_read_offset = offset + bytes.len() as u64;
        Ok(bytes)
    }

    /// Applies the pattern-transition rules after classification and before
    /// the read is dispatched, so the triggering read already uses the new
    /// reader.
    fn maybe_transition(&mut self) {
        match self.kind {
            ReaderKind::Prefetch(_) => {
                if self.state.random_seek_count > self.opts.random_seek_threshold {
                    debug!(
                        object = %self.object.name,
                        seeks = self.state.random_seek_count,
                        "random access detected, releasing prefetch resources"
                    );
                    self.state.pattern = ReadPattern::Random;
                    self.kind = ReaderKind::Direct(DirectReader::new(
                        self.object.clone(),
                        self.bucket.clone(),
                    ));
                }
            }
            ReaderKind::Direct(_) => {
                if self.opts.enable_buffered_read
                    && self
                        .state
                        .should_restart_prefetch(self.opts.sequential_restart_threshold)
                {
                    debug!(object = %self.object.name, "sequential access resumed, restarting prefetch");
                    self.state.reset();
                    self.kind = ReaderKind::Prefetch(Self::new_prefetch(
                        &self.object,
                        &self.cache,
                        &self.opts,
                    ));
                }
            }
        }
    }

    /// Releases held blocks and pending downloads nobody else is waiting on.
    pub fn close(&mut self) {
        if let ReaderKind::Prefetch(p) = &mut self.kind {
            p.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_read_at_zero_is_sequential() {
        let mut state = SharedReadState::new();
        assert_eq!(state.random_seek_count, 1);
        assert_eq!(state.pattern, ReadPattern::Unknown);

        assert!(state.record_step(0));
        assert_eq!(state.random_seek_count, 1);
        assert_eq!(state.pattern, ReadPattern::Sequential);
    }

    #[test]
    fn initial_jump_counts_as_seek() {
        let mut state = SharedReadState::new();
        assert!(!state.record_step(100 << 20));
        assert_eq!(state.random_seek_count, 2);
    }

    #[test]
    fn backward_step_is_random() {
        let mut state = SharedReadState::new();
        state.record_step(0);
        state.last_read_offset = 4096;
        assert!(!state.record_step(0));
        assert_eq!(state.random_seek_count, 2);
    }

    #[test]
    fn adjacency_window_tolerates_small_gaps() {
        let mut state = SharedReadState::new();
        state.record_step(0);
        state.last_read_offset = 4096;
        assert!(state.record_step(4096 + SEQUENTIAL_ADJACENCY));
        assert!(!state.record_step(2 * SEQUENTIAL_ADJACENCY + 2 * 4096 + 4096));
    }

    #[test]
    fn contiguous_run_triggers_restart() {
        let mut state = SharedReadState::new();
        // a random phase first
        state.record_step(50 << 20);
        state.last_read_offset = (50 << 20) + 4096;
        state.record_step(10 << 20);
        state.last_read_offset = (10 << 20) + 4096;
        assert!(state.random_seek_count > 0);

        let mut offset = 0u64;
        for i in 0..5 {
            state.record_step(offset);
            offset += 4096;
            state.last_read_offset = offset;
            if i < 4 {
                assert!(!state.should_restart_prefetch(5), "run {} too short", i + 1);
            }
        }
        assert!(state.should_restart_prefetch(5));

        state.reset();
        assert_eq!(state.random_seek_count, 0);
        assert_eq!(state.pattern, ReadPattern::Sequential);
        assert!(!state.should_restart_prefetch(5));
    }
}
