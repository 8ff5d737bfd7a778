//! Fixed limits and defaults for the coordination engine.
//!
//! All bounds live here so operational limits are auditable in one place.

/// Default HTTP bind port.
pub const DEFAULT_HTTP_PORT: u16 = 8098;

/// Default HTTP bind address.
pub const DEFAULT_HTTP_BIND_ADDR: &str = "0.0.0.0";

/// Maximum CAS commit retries before a submission is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base backoff between commit retries, in milliseconds. Scaled by attempt.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 25;

/// How long a reserved slot may stay uncommitted before the reaper
/// resolves it. Sized to the transform function's worst-case runtime.
pub const DEFAULT_PENDING_SLOT_TTL_MS: u64 = 30_000;

/// Default cadence of the background reaper sweep.
pub const DEFAULT_ROOM_CLEANUP_INTERVAL_MS: u64 = 30_000;

/// Sessions whose last heartbeat is older than this are reaped.
pub const DEFAULT_STALE_SESSION_MINUTES: u64 = 2;

/// Buffer size of each per-document broadcast channel. Lagged receivers
/// drop events and recover through the catch-up read path.
pub const FANOUT_BUFFER_SIZE: usize = 256;

/// Maximum entries returned by a single prefix scan.
pub const MAX_SCAN_RESULTS: u32 = 4096;

/// Default limit for prefix scans when the caller does not specify one.
pub const DEFAULT_SCAN_LIMIT: u32 = 256;

/// Width of the zero-padded version component in slot keys. Keeps slot
/// keys in numeric order under lexicographic iteration.
pub const SLOT_KEY_WIDTH: usize = 20;
