use crate::model::{DAY, Ms};

/// Widest window an availability or calendar query may cover.
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * DAY;

/// Most recent audit entries returned when no limit is given.
pub const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Reminder emails sent concurrently by one reminder run.
pub const REMINDER_CONCURRENCY: usize = 8;

/// Group-commit channel depth in front of the WAL writer.
pub const WAL_CHANNEL_CAPACITY: usize = 4096;

/// Buffered pub/sub messages per subscriber before lagging ones drop.
pub const HUB_CHANNEL_CAPACITY: usize = 256;
