//! Hard caps on tenant, subject, and booking counts. Every mutation checks
//! the relevant cap before touching state so a single client cannot grow a
//! tenant without bound.

/// Maximum number of tenants (engines) per process.
pub const MAX_TENANTS: usize = 256;

/// Maximum tenant name length (database name from the connection).
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Maximum subjects per tenant.
pub const MAX_SUBJECTS_PER_TENANT: usize = 100_000;

/// Maximum recorded bookings per subject.
pub const MAX_BOOKINGS_PER_SUBJECT: usize = 100_000;

/// Maximum subject name length in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum booking label length in bytes.
pub const MAX_LABEL_LEN: usize = 256;

/// Maximum bookings per batch insert.
pub const MAX_BATCH_SIZE: usize = 256;

/// Maximum value for a single limit cap.
pub const MAX_CAP_VALUE: u32 = 1_000_000;

/// Earliest accepted timestamp (1970-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;

/// Latest accepted timestamp (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;

/// Maximum duration of a single booking (365 days).
pub const MAX_SPAN_DURATION_MS: i64 = 31_536_000_000;
