//! Cache configuration.

use std::io;
use std::time::Duration;

/// Hard ceiling on shard counts to keep the table allocation sane.
const MAX_SHARDS: usize = 1 << 16;

/// Configuration for a [`MetadataCache`](crate::MetadataCache).
///
/// Values are set builder-style and checked once by [`validate`](Self::validate)
/// when the cache is constructed.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard ceiling on active dirents per directory. Exceeding it fails
    /// the insert with overflow and flips the directory to bypass mode.
    pub dir_max: usize,
    /// Target dirents per chunk. 0 disables chunking entirely; lookups
    /// still use the by-name tree but readdir passes straight through.
    pub dir_chunk: usize,
    /// Chunk size at which a chunk is split in half. Must be at least
    /// twice `dir_chunk`.
    pub dir_chunk_split: usize,
    /// Cap on detached dirents kept per directory; the oldest is evicted
    /// when the cap is reached.
    pub detached_max: usize,
    /// Whether an incomplete readdir is surfaced as a retryable delay
    /// instead of success.
    pub retry_readdir: bool,
    /// How long cached attributes stay authoritative.
    pub attr_expire: Duration,
    /// Number of hash table shards; rounded up to a power of two.
    pub shards: usize,
    /// High water mark for cached entries; reclaim starts above it.
    pub entries_hiwat: usize,
    /// High water mark for directory chunks across all directories.
    pub chunks_hiwat: usize,
    /// Maximum chunks filled ahead of demand in one population pass.
    pub readahead_chunks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir_max: 65536,
            dir_chunk: 128,
            dir_chunk_split: 512,
            detached_max: 1024,
            retry_readdir: false,
            attr_expire: Duration::from_secs(60),
            shards: 256,
            entries_hiwat: 100_000,
            chunks_hiwat: 100_000,
            readahead_chunks: 4,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-directory dirent ceiling.
    pub fn dir_max(mut self, dir_max: usize) -> Self {
        self.dir_max = dir_max;
        self
    }

    /// Set the target chunk size. 0 disables chunking.
    pub fn dir_chunk(mut self, dir_chunk: usize) -> Self {
        self.dir_chunk = dir_chunk;
        self
    }

    /// Set the chunk split threshold.
    pub fn dir_chunk_split(mut self, split: usize) -> Self {
        self.dir_chunk_split = split;
        self
    }

    /// Set the detached dirent cap.
    pub fn detached_max(mut self, detached_max: usize) -> Self {
        self.detached_max = detached_max;
        self
    }

    /// Surface incomplete readdirs as retryable delays.
    pub fn retry_readdir(mut self, retry: bool) -> Self {
        self.retry_readdir = retry;
        self
    }

    /// Set the attribute freshness bound.
    pub fn attr_expire(mut self, ttl: Duration) -> Self {
        self.attr_expire = ttl;
        self
    }

    /// Set the shard count.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the entry high water mark.
    pub fn entries_hiwat(mut self, hiwat: usize) -> Self {
        self.entries_hiwat = hiwat;
        self
    }

    /// Set the chunk high water mark.
    pub fn chunks_hiwat(mut self, hiwat: usize) -> Self {
        self.chunks_hiwat = hiwat;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> io::Result<()> {
        if self.dir_chunk != 0 && self.dir_chunk_split < 2 * self.dir_chunk {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "dir_chunk_split ({}) must be at least twice dir_chunk ({})",
                    self.dir_chunk_split, self.dir_chunk
                ),
            ));
        }
        if self.dir_max == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "dir_max must be at least 1",
            ));
        }
        if self.shards == 0 || self.shards > MAX_SHARDS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("shards must be between 1 and {}", MAX_SHARDS),
            ));
        }
        if self.readahead_chunks == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "readahead_chunks must be at least 1",
            ));
        }
        Ok(())
    }

    /// Whether directory content is chunked at all.
    pub fn chunking_enabled(&self) -> bool {
        self.dir_chunk > 0
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.next_power_of_two()
    }
}
