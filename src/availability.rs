// Time-delayed unlocks for the post-test and the retention test.
//
// Pull model: every check recomputes from the stored anchors and the
// caller-supplied `now`. Nothing here schedules or mutates anything.

use chrono::{DateTime, SecondsFormat, Utc};
use spacetimedb::Timestamp;

use crate::{ClassSession, StudentProgress};

const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;

/// Instant at which a gate opens, or None while the anchor is missing
pub fn unlock_at(delay_minutes: u32, anchor: Option<Timestamp>) -> Option<Timestamp> {
    anchor.map(|anchor| {
        let delay_micros = i64::from(delay_minutes) * MICROS_PER_MINUTE;
        Timestamp::from_micros_since_unix_epoch(
            anchor.to_micros_since_unix_epoch().saturating_add(delay_micros),
        )
    })
}

/// `anchor != None && now >= anchor + delay`.
/// A missing anchor is "availability pending", not an error.
pub fn is_unlocked(now: Timestamp, delay_minutes: u32, anchor: Option<Timestamp>) -> bool {
    unlock_at(delay_minutes, anchor)
        .is_some_and(|at| now.to_micros_since_unix_epoch() >= at.to_micros_since_unix_epoch())
}

/// Post-test clock starts when the teacher ends the main session
pub fn post_test_anchor(session: &ClassSession) -> Option<Timestamp> {
    session.class_ended_at
}

/// Retention clock starts at the student's own post-test, falling back to
/// the end of class for students who never sat it
pub fn retention_anchor(session: &ClassSession, progress: &StudentProgress) -> Option<Timestamp> {
    progress.posttest_completed_at.or(session.class_ended_at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub post_test_unlocked: bool,
    pub retention_unlocked: bool,
    pub post_test_unlock_at: Option<Timestamp>,
    pub retention_unlock_at: Option<Timestamp>,
}

impl AvailabilityReport {
    /// Next pending unlock instant, if any gate is still locked with a known anchor
    pub fn unlock_at(&self) -> Option<Timestamp> {
        let pending = [
            (!self.post_test_unlocked).then_some(self.post_test_unlock_at).flatten(),
            (!self.retention_unlocked).then_some(self.retention_unlock_at).flatten(),
        ];
        pending
            .into_iter()
            .flatten()
            .min_by_key(|at| at.to_micros_since_unix_epoch())
    }
}

pub fn report(now: Timestamp, session: &ClassSession, progress: &StudentProgress) -> AvailabilityReport {
    let post_anchor = post_test_anchor(session);
    let retention = retention_anchor(session, progress);
    AvailabilityReport {
        post_test_unlocked: is_unlocked(now, session.post_test_delay_minutes, post_anchor),
        retention_unlocked: is_unlocked(now, session.retention_test_delay_minutes, retention),
        post_test_unlock_at: unlock_at(session.post_test_delay_minutes, post_anchor),
        retention_unlock_at: unlock_at(session.retention_test_delay_minutes, retention),
    }
}

/// RFC 3339 rendering for logs and collaborator payloads
pub fn format_instant(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_micros(ts.to_micros_since_unix_epoch())
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("{}us", ts.to_micros_since_unix_epoch()))
}
