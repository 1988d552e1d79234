//! Process-wide monotonic timestamps.
//!
//! Events are ordered by their `created_at`, so two events created within the same clock tick must
//! still get distinct, increasing timestamps.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

static LAST_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Returns the current time, bumped by one microsecond whenever the clock did not move forward
/// since the previous call.
pub fn next_timestamp() -> DateTime<Utc> {
    let now: i64 = Utc::now().timestamp_micros();
    let mut last: i64 = LAST_MICROS.load(Ordering::Acquire);

    loop {
        let candidate: i64 = if now > last { now } else { last + 1 };

        match LAST_MICROS.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Utc.timestamp_nanos(candidate * 1_000),
            Err(actual) => last = actual,
        }
    }
}

/// The cursor used when an entity has no snapshot yet.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_nanos(0)
}
