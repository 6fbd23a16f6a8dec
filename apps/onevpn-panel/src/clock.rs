use chrono::{DateTime, Utc};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whole days the balance pays for. Rounds down so paid days never exceed
/// the balance.
pub fn days_covered(balance: i64, daily_cost: f64) -> i64 {
    if balance <= 0 || !daily_cost.is_finite() || daily_cost <= 0.0 {
        return 0;
    }
    (balance as f64 / daily_cost).floor() as i64
}

/// Days left until `end`, rounded up so an already committed partial day
/// still counts.
pub fn days_remaining(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let ms = (end - now).num_milliseconds();
    if ms <= 0 {
        return 0;
    }
    (ms + DAY_MS - 1) / DAY_MS
}
