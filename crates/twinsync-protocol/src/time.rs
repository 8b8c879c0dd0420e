pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Rounds a timeout up to whole seconds, the unit the service accepts.
#[must_use]
pub fn ceil_secs(duration: Duration) -> u64 {
    if duration.subsec_nanos() == 0 {
        duration.as_secs()
    } else {
        duration.as_secs().saturating_add(1)
    }
}
