//! Hard caps. Nothing here is configurable — exceeding a limit is a
//! request error, not a tuning problem.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_INSTRUCTORS_PER_TENANT: usize = 10_000;
pub const MAX_SLOTS_PER_INSTRUCTOR: usize = 64;
pub const MAX_SESSIONS_PER_INSTRUCTOR: usize = 10_000;
pub const MAX_FLOATING_SESSIONS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 1024;
pub const MAX_PATTERN_LEN: usize = 64;

/// Instructors must be adults.
pub const MIN_INSTRUCTOR_AGE: u32 = 18;
