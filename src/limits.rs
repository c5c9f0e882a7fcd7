use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SESSIONS_PER_TENANT: usize = 500_000;
pub const MAX_SERIES_PER_TENANT: usize = 10_000;
pub const MAX_SEATS_PER_SESSION: u32 = 10_000;
pub const MAX_MODALITY_LEN: usize = 128;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single class may not last longer than a day.
pub const MAX_SESSION_DURATION_MS: Ms = 86_400_000;

pub const MAX_GENERATION_WINDOW_DAYS: u32 = 366;
pub const MAX_RECURRENCE_INTERVAL: u32 = 52;
pub const MAX_RECURRENCE_COUNT: u32 = 1_000;
/// Upper bound on days walked by a single expansion, anchor included.
pub const MAX_EXPANSION_DAYS: i64 = 366 * 10;

/// Widest date range accepted by session listings (~1 year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 86_400_000;
