use chrono::{DateTime, Utc};

/// Time source for cooldown and TTL decisions. Stores receive `now` from the
/// coordinator rather than reading the database clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
