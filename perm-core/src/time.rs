// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Absolute point in time as UTC seconds since the UNIX epoch.
///
/// Temporary entries and memberships carry a `Timestamp` after which they are treated as absent.
/// An item expiring at `t` is considered expired as soon as `now >= t`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp `duration` later, saturating at the maximum.
    pub fn after(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    /// Returns true if an item expiring at this timestamp is no longer live at `now`.
    pub fn is_reached(&self, now: Timestamp) -> bool {
        self.0 <= now.0
    }

    /// Time left until this timestamp is reached, `None` if it already was.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_reached(now) {
            None
        } else {
            Some(Duration::from_secs(self.0 - now.0))
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Timestamp;

    #[test]
    fn expiry_is_inclusive() {
        let expires_at = Timestamp::from_secs(100);
        assert!(!expires_at.is_reached(Timestamp::from_secs(99)));
        assert!(expires_at.is_reached(Timestamp::from_secs(100)));
        assert!(expires_at.is_reached(Timestamp::from_secs(101)));

        assert_eq!(
            expires_at.remaining(Timestamp::from_secs(40)),
            Some(Duration::from_secs(60))
        );
        assert_eq!(expires_at.remaining(Timestamp::from_secs(100)), None);
    }

    #[test]
    fn after_saturates() {
        let max = Timestamp::from_secs(u64::MAX);
        assert_eq!(max.after(Duration::from_secs(10)), max);
        assert_eq!(
            Timestamp::from_secs(5).after(Duration::from_secs(10)),
            Timestamp::from_secs(15)
        );
    }
}
