use crate::model::Ms;

/// Upper bound on a single service's duration (24h).
pub const MAX_SERVICE_DURATION_MINUTES: i64 = 24 * 60;

/// Pages fetched from the external provider before giving up.
pub const DEFAULT_MAX_EXTERNAL_PAGES: usize = 10;

/// Per-call timeout on the external provider.
pub const DEFAULT_EXTERNAL_TIMEOUT_MS: u64 = 5_000;

/// Reject timestamps before 2000-01-01 and after 2100-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_LABEL_LEN: usize = 1024;
pub const MAX_NAME_LEN: usize = 256;

/// WAL appends between automatic compactions.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;
