//! Default constants for occurrence-identity configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default data directory for the durable identity store
pub const DEFAULT_DATA_DIR: &str = "data/identity";

/// Default capacity of the identity store's LRU read cache (entries)
pub const DEFAULT_READ_CACHE_CAPACITY: usize = 100_000;

// =============================================================================
// Lock Defaults
// =============================================================================

/// Bounded wait for a single per-key lock attempt (milliseconds)
pub const DEFAULT_LOCK_WAIT_MS: u64 = 250;

/// Lock attempts before a record is failed with a lock timeout
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 5;

/// Sleep after the first failed attempt (milliseconds); doubles per retry
pub const DEFAULT_LOCK_BACKOFF_MS: u64 = 10;

/// Upper bound for the backoff sleep (milliseconds)
pub const DEFAULT_LOCK_MAX_BACKOFF_MS: u64 = 1_000;

/// Shard bits for the per-key lock table (shards = 2^bits)
pub const DEFAULT_LOCK_SHARD_BITS: u8 = 6;

// =============================================================================
// Uniqueness Defaults
// =============================================================================

/// Keys held in memory before a validator spills to disk
pub const DEFAULT_SPILL_THRESHOLD: usize = 1_000_000;

/// Keys derived and checked per step of a streaming validation scan
pub const DEFAULT_VALIDATION_CHUNK_SIZE: usize = 10_000;

/// Number of validator shards used for parallel batch scans
pub fn default_uniqueness_shards() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

// =============================================================================
// Gate Defaults
// =============================================================================

/// Root directory holding per-dataset, per-attempt reports and stage artifacts
pub const DEFAULT_REPORT_ROOT: &str = "data/reports";

// =============================================================================
// Key Defaults
// =============================================================================

/// Identity terms used when a dataset configures none explicitly
pub const DEFAULT_UNIQUE_TERMS: &[&str] = &["institutionCode", "collectionCode", "catalogNumber"];
