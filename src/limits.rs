/// Hard ceiling on operations per atomic store transaction.
pub const MAX_OPS_PER_TRANSACTION: usize = 500;

pub const MAX_ROOM_ID_LEN: usize = 64;
pub const MAX_ROOM_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_CREATOR_LEN: usize = 128;

/// Longest date range a single template instantiation may cover.
pub const MAX_TEMPLATE_DAYS: i64 = 366;

/// Upper bound on entries in one write plan.
pub const MAX_PLAN_ENTRIES: usize = 100_000;

pub const DEFAULT_CHUNK_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1_000;

/// Valid range for the configured day-boundary offset (UTC±14h).
pub const MAX_DAY_OFFSET_MINUTES: i32 = 14 * 60;
