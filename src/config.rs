use std::time::Duration;

/// Tunables for a mount. Every field has a serviceable default; a mount
/// helper can deserialize this from its own config format.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Size of one cache block, in MiB.
    pub block_size_mb: usize,

    /// Prefetch window size (in blocks) right after a reader is constructed
    /// or restarted.
    pub start_blocks_per_handle: u64,
    /// Lower bound the window never shrinks below.
    pub min_blocks_per_handle: u64,
    /// Upper bound on blocks a single handle may hold.
    pub max_blocks_per_handle: u64,

    /// Global ceiling on buffers in circulation, across all handles.
    pub global_max_blocks: usize,

    /// Number of non-adjacent reads after which a handle is treated as
    /// random-access.
    pub random_seek_threshold: u64,
    /// Number of contiguous reads after which a random-access handle goes
    /// back to prefetching.
    pub sequential_restart_threshold: u64,

    /// Master switch for the prefetch reader; when off every read is a
    /// direct ranged read.
    pub enable_buffered_read: bool,

    /// Worker threads servicing block downloads.
    pub download_workers: usize,

    /// Treat a bare prefix with objects below it as a directory, even
    /// without a placeholder object.
    pub implicit_dirs: bool,

    /// Stat cache entry count; 0 disables the cache.
    pub stat_cache_capacity: usize,
    pub stat_cache_ttl_secs: u64,
    pub dir_type_cache_ttl_secs: u64,

    /// Reject all mutating operations.
    pub read_only: bool,

    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size_mb: 16,
            start_blocks_per_handle: 2,
            min_blocks_per_handle: 2,
            max_blocks_per_handle: 20,
            global_max_blocks: 40,
            random_seek_threshold: 3,
            sequential_restart_threshold: 5,
            enable_buffered_read: true,
            download_workers: 8,
            implicit_dirs: false,
            stat_cache_capacity: 4096,
            stat_cache_ttl_secs: 60,
            dir_type_cache_ttl_secs: 60,
            read_only: false,
            uid: 0,
            gid: 0,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

impl Config {
    pub fn block_size(&self) -> usize {
        self.block_size_mb << 20
    }

    pub fn stat_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stat_cache_ttl_secs)
    }

    pub fn dir_type_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dir_type_cache_ttl_secs)
    }
}
