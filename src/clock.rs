//! Integer-second timestamps and signed durations.
//!
//! The protocol runs entirely on whole seconds: deadlines, countdown
//! refreshes and survey delays are all second-granular, and the matcher must
//! be deterministic given its inputs. So the engine never reads the platform
//! clock; `Timestamp::now()` is called only at the driver and adapter
//! boundaries, and every transition receives its timestamp as a parameter.

use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

/// A signed span of whole seconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Duration(i64);

impl Timestamp {
    pub const fn from_secs(secs: i64) -> Self {
        Timestamp(secs)
    }

    pub const fn as_secs(self) -> i64 {
        self.0
    }

    /// Current wall-clock time. Boundary use only; see module docs.
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp())
    }
}

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_secs(secs: i64) -> Self {
        Duration(secs)
    }

    pub const fn as_secs(self) -> i64 {
        self.0
    }

    /// Conversion for sleeping; `None` when the duration is negative.
    pub fn as_std(self) -> Option<std::time::Duration> {
        u64::try_from(self.0).ok().map(std::time::Duration::from_secs)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl Neg for Duration {
    type Output = Duration;

    fn neg(self) -> Duration {
        Duration(-self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "Timestamp({})", dt.format("%Y-%m-%d %H:%M:%SZ")),
            None => write!(f, "Timestamp({})", self.0),
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({}s)", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let a = Timestamp::from_secs(100);
        let b = Timestamp::from_secs(40);
        assert_eq!(a - b, Duration::from_secs(60));
        assert_eq!(b - a, Duration::from_secs(-60));
        assert_eq!(b + Duration::from_secs(60), a);
        assert_eq!(a - Duration::from_secs(60), b);
    }

    #[test]
    fn test_duration_arithmetic() {
        let d = Duration::from_secs(19);
        assert_eq!(d + Duration::from_secs(1), Duration::from_secs(20));
        assert_eq!(-d, Duration::from_secs(-19));
    }

    #[test]
    fn test_total_order() {
        assert!(Timestamp::from_secs(1) < Timestamp::from_secs(2));
        assert!(Duration::from_secs(-1) < Duration::ZERO);
    }

    #[test]
    fn test_as_std_rejects_negative() {
        assert_eq!(Duration::from_secs(-5).as_std(), None);
        assert_eq!(
            Duration::from_secs(5).as_std(),
            Some(std::time::Duration::from_secs(5))
        );
    }

    #[test]
    fn test_serde_bare_integer() {
        let ts = Timestamp::from_secs(1234);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1234");
        let back: Timestamp = serde_json::from_str("1234").unwrap();
        assert_eq!(back, ts);
    }
}
