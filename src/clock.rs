//! Time & ID service (spec.md §4.2).
//!
//! Time is always provided by an injected clock returning ISO-8601 strings so
//! tests can pin `now()` the same way the teacher's `backtest_v2/clock.rs`
//! pins simulation time via an explicit `Nanos` cursor instead of the wall
//! clock. Callers may also supply their own `recorded_at`/`now_iso`, which
//! must round-trip through [`parse_strict_iso8601`].

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Injected wall clock. `SystemClock` is used in production; `FixedClock`
/// pins time for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_iso(&self) -> String {
        to_iso8601(self.now())
    }
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, optionally advanced by tests.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn from_iso(now_iso: &str) -> Self {
        Self::new(parse_strict_iso8601(now_iso).expect("valid iso8601"))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.now.lock();
        *guard = *guard + duration;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Render a timestamp in the canonical ISO-8601 form used throughout the
/// system: UTC, millisecond precision, `Z` suffix.
pub fn to_iso8601(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strict ISO-8601 parse. Unlike `DateTime::parse_from_rfc3339` alone, this
/// rejects anything that doesn't carry an explicit offset/`Z`, since every
/// caller-supplied timestamp in this system must be unambiguous.
pub fn parse_strict_iso8601(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid ISO-8601 timestamp '{s}': {e}"))
}

/// `true` if `a` is strictly before `b` once both are parsed (used by
/// `[from_iso, to_iso]` window validation).
pub fn strictly_before(a: &str, b: &str) -> Result<bool, String> {
    let da = parse_strict_iso8601(a)?;
    let db = parse_strict_iso8601(b)?;
    Ok(da < db)
}

/// Monotone per-entity counters, minting ids as `<prefix>_<zero-padded counter>`.
///
/// Counters live on the `Store` under the single-writer assumption (spec.md
/// §5): every call to [`IdMinter::next`] must happen while holding the
/// store's write lock.
#[derive(Default)]
pub struct IdMinter {
    counters: Mutex<HashMap<String, u64>>,
}

impl IdMinter {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Mint the next id for `prefix`, formatted as `<prefix>_<000001>`.
    pub fn next(&self, prefix: &str) -> String {
        let mut counters = self.counters.lock();
        let counter = counters.entry(prefix.to_string()).or_insert(0);
        *counter += 1;
        format!("{prefix}_{:06}", *counter)
    }

    /// Current value of `prefix`'s counter without incrementing it.
    pub fn peek(&self, prefix: &str) -> u64 {
        *self.counters.lock().get(prefix).unwrap_or(&0)
    }
}

/// Deterministic id derived from input content rather than a counter:
/// `<prefix>_<first-16-hex-of-SHA256(input)>`.
pub fn deterministic_id(prefix: &str, input: &str) -> String {
    format!("{prefix}_{}", crate::canonical::short_hex(input))
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_stable_until_advanced() {
        let clock = FixedClock::from_iso("2025-01-01T00:00:00.000Z");
        let t1 = clock.now_iso();
        let t2 = clock.now_iso();
        assert_eq!(t1, t2);
        clock.advance(chrono::Duration::seconds(1));
        assert_ne!(t1, clock.now_iso());
    }

    #[test]
    fn strict_parse_rejects_garbage() {
        assert!(parse_strict_iso8601("not-a-date").is_err());
        assert!(parse_strict_iso8601("2025-01-01T00:00:00Z").is_ok());
    }

    #[test]
    fn strictly_before_orders_correctly() {
        assert!(strictly_before("2025-01-01T00:00:00Z", "2025-01-02T00:00:00Z").unwrap());
        assert!(!strictly_before("2025-01-02T00:00:00Z", "2025-01-01T00:00:00Z").unwrap());
    }

    #[test]
    fn id_minter_is_monotone_and_prefixed() {
        let minter = IdMinter::new();
        assert_eq!(minter.next("del"), "del_000001");
        assert_eq!(minter.next("del"), "del_000002");
        assert_eq!(minter.next("lp"), "lp_000001");
    }

    #[test]
    fn deterministic_id_is_stable_for_same_input() {
        let a = deterministic_id("eval", "x=1,y=2");
        let b = deterministic_id("eval", "x=1,y=2");
        let c = deterministic_id("eval", "x=1,y=3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("eval_"));
    }
}
