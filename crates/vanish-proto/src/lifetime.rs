//! Enumerated message retention lifetimes.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

/// How long a persisted message survives before the sweep deletes it.
///
/// Peers may only agree on one of these values; free-form durations are
/// rejected at decode time. Variants are ordered from shortest to longest
/// (with [`Lifetime::DoNotPersist`] first), which the negotiation tie-break
/// relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifetime {
    /// Messages are never written to disk
    DoNotPersist,
    /// One hour
    OneHour,
    /// One day
    OneDay,
    /// Seven days
    SevenDays,
    /// Thirty days
    ThirtyDays,
}

impl Lifetime {
    /// Every lifetime, shortest first.
    pub const ALL: [Self; 5] =
        [Self::DoNotPersist, Self::OneHour, Self::OneDay, Self::SevenDays, Self::ThirtyDays];

    /// Retention window, or `None` for [`Lifetime::DoNotPersist`].
    pub fn duration(self) -> Option<Duration> {
        let secs = match self {
            Self::DoNotPersist => return None,
            Self::OneHour => HOUR_SECS,
            Self::OneDay => DAY_SECS,
            Self::SevenDays => 7 * DAY_SECS,
            Self::ThirtyDays => 30 * DAY_SECS,
        };
        Some(Duration::from_secs(secs))
    }

    /// Whether messages under this lifetime are written to storage at all.
    pub fn is_persistent(self) -> bool {
        self != Self::DoNotPersist
    }

    /// Wire name used in signaling and the per-room config record.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DoNotPersist => "do_not_persist",
            Self::OneHour => "one_hour",
            Self::OneDay => "one_day",
            Self::SevenDays => "seven_days",
            Self::ThirtyDays => "thirty_days",
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
