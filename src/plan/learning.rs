//! Learned scheduling adjustments from snooze feedback.

use chrono::{DateTime, Timelike, Utc};

use crate::types::FeedbackAction;

const MIN_SAMPLES: u32 = 4;
const SHIFT_RATE: f64 = 0.5;

/// Per-hour feedback tallies over the learning window.
#[derive(Debug, Clone, Default)]
pub struct SnoozeProfile {
    buckets: [Bucket; 24],
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    snoozed: u32,
    total: u32,
}

impl SnoozeProfile {
    /// Build from (hour of the task's original start, action) samples.
    pub fn from_samples(samples: impl IntoIterator<Item = (u32, FeedbackAction)>) -> Self {
        let mut profile = Self::default();
        for (hour, action) in samples {
            let Some(bucket) = profile.buckets.get_mut(hour as usize) else {
                continue;
            };
            bucket.total += 1;
            if action == FeedbackAction::Snoozed {
                bucket.snoozed += 1;
            }
        }
        profile
    }

    pub fn snooze_rate(&self, hour: u32) -> Option<f64> {
        let bucket = self.buckets.get(hour as usize)?;
        (bucket.total > 0).then(|| bucket.snoozed as f64 / bucket.total as f64)
    }

    /// Whether a task starting in this hour should be shifted later: the
    /// bucket needs at least 4 samples and a snooze rate of 0.5 or more.
    pub fn should_shift(&self, hour: u32) -> bool {
        let Some(bucket) = self.buckets.get(hour as usize) else {
            return false;
        };
        bucket.total >= MIN_SAMPLES
            && bucket.snoozed as f64 / bucket.total as f64 >= SHIFT_RATE
    }
}

/// Shift a start one hour later, capped so the task still begins inside the
/// working window (hours are in the user's local day, already applied to
/// the timestamp by the caller).
pub fn shift_start(
    start: DateTime<Utc>,
    profile: &SnoozeProfile,
    local_hour: u32,
    latest_hour: u32,
) -> DateTime<Utc> {
    if !profile.should_shift(local_hour) {
        return start;
    }
    let shifted = start + chrono::Duration::hours(1);
    if local_hour + 1 > latest_hour {
        return start;
    }
    shifted
}

/// Local hour of a UTC instant in the given zone.
pub fn local_hour(at: DateTime<Utc>, tz: chrono_tz::Tz) -> u32 {
    at.with_timezone(&tz).hour()
}
