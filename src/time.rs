use std::time::{Duration, SystemTime};

/// Builds a SystemTime from the sec/usec pair of a capture header.
pub(crate) fn build_unix_time(secs: i64, usecs: i64) -> SystemTime {
    SystemTime::UNIX_EPOCH
        + Duration::from_secs(secs.max(0) as u64)
        + Duration::from_micros(usecs.max(0) as u64)
}

/// Wall-clock seconds since the unix epoch.
pub(crate) fn wall_clock_secs() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
