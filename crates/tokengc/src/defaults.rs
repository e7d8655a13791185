//! Default constants for collector configuration.
//!
//! Token encoding limits live here too so the builder and the tracer agree
//! on them.

/// Whether the reachability pass may fan out to worker threads.
pub const DEFAULT_ALLOW_PARALLEL: bool = true;

/// Minimum population share per worker before another worker is added.
pub const DEFAULT_MIN_OBJECTS_PER_WORKER: usize = 128;

/// Objects a worker keeps in its local deque per wave; further discoveries
/// are handed to the next wave at the barrier.
pub const DEFAULT_LOCAL_QUEUE_LIMIT: usize = 1024;

/// BeginDestroy/FinishDestroy calls between time budget checks.
pub const DEFAULT_DESTROY_POLL_INTERVAL: usize = 10;

/// Frees between time budget checks.
pub const DEFAULT_FREE_POLL_INTERVAL: usize = 100;

/// Skipped `try_collect_garbage` calls before a collection is forced.
pub const DEFAULT_RETRIES_BEFORE_FORCING: u32 = 10;

/// Number of types listed by the detailed purge statistics log.
pub const DEFAULT_STATS_TOP_TYPES: usize = 10;

/// Largest byte offset a token can carry (19 bits).
pub const MAX_TOKEN_OFFSET: u32 = (1 << 19) - 1;

/// Largest return count a token can carry (8 bits).
pub const MAX_RETURN_COUNT: u32 = 0xFF;

/// Largest relative skip distance (24 bits).
pub const MAX_SKIP_DISTANCE: u32 = (1 << 24) - 1;

/// Deepest nesting of array contexts a stream may describe.
pub const MAX_NESTING_DEPTH: usize = 64;
