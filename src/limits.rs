//! Hard limits. Every externally supplied size or count is checked against one of these.

use crate::model::Ms;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// A single appointment may not run longer than a day.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;
/// Widest window accepted by range and open-slot queries (one year).
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 50_000;
pub const MAX_REFERENCES_PER_BOOKING: usize = 256;

/// How often a mutation re-locks when the booking moved to other resources
/// between the snapshot read and lock acquisition.
pub const MAX_RELOCK_ATTEMPTS: usize = 8;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
