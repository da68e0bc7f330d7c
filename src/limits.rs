use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment never runs longer than a day.
pub const MAX_APPOINTMENT_DURATION_MS: Ms = DAY_MS;
pub const MAX_SEARCH_WINDOW_MS: Ms = 92 * DAY_MS;
pub const MAX_SLOT_PAGE: usize = 500;

pub const MAX_SERVICES_PER_APPOINTMENT: usize = 16;
pub const MAX_ID_LEN: usize = 128;
/// Holds and confirmed appointments; released ones are not counted.
pub const MAX_LIVE_APPOINTMENTS_PER_PROFESSIONAL: usize = 100_000;
pub const MAX_PROFESSIONALS_PER_TENANT: usize = 10_000;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
