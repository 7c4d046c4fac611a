// Hard limits enforced by the engine and the tenant manager.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_PROPERTY_ID_LEN: usize = 256;
pub const MAX_GUEST_NAME_LEN: usize = 256;
/// RFC 5321 path limit.
pub const MAX_GUEST_EMAIL_LEN: usize = 320;
pub const MAX_REASON_LEN: usize = 1024;

/// Widest allowed range, in days (about ten years).
pub const MAX_RANGE_DAYS: i64 = 3660;

/// Bookings plus blocks held for a single property, any status.
pub const MAX_ENTRIES_PER_PROPERTY: usize = 100_000;
