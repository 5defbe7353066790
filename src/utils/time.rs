use chrono::{DateTime, Utc};

/// Current wall-clock time, used to stamp record timestamps.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
