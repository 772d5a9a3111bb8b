// Boundary to the external narrative service that explains a grouping run.
//
// Reducers cannot call out to the service inside a transaction, so a run is
// always created with the templated explanation and a structured request is
// queued for the narrative worker. Whatever the worker sends back goes
// through `explain_with_fallback` again; narration problems never surface
// as grouping errors.

use serde::{Deserialize, Serialize};
use spacetimedb::{SpacetimeType, Timestamp};
use thiserror::Error;

use crate::availability::format_instant;
use crate::grouping::{GroupBalance, GroupingMode, GroupingPlan};

/// Narratives longer than this are rejected in favour of the template
pub const MAX_NARRATIVE_CHARS: usize = 4000;

/// Delivery attempts before a request is given up on
pub const MAX_NARRATION_ATTEMPTS: u8 = 5;

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RationaleSource {
    Template,
    Narrative,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RationaleError {
    #[error("narration deferred to the narrative worker")]
    Deferred,
    #[error("narrative service failed: {0}")]
    Service(String),
    #[error("narrative was empty")]
    Empty,
    #[error("narrative exceeds {limit} characters")]
    TooLong { limit: usize },
}

/// Structured input handed to the narrative service. Never free text.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RationaleInput {
    pub class_id: u64,
    pub run_id: u64,
    pub mode: GroupingMode,
    pub group_count: u32,
    pub roster_size: u32,
    pub balance_score: u32,
    pub created_at: String,
    pub groups: Vec<GroupBalance>,
}

impl RationaleInput {
    pub fn new(class_id: u64, run_id: u64, plan: &GroupingPlan, created_at: Timestamp) -> Self {
        Self {
            class_id,
            run_id,
            mode: plan.mode,
            group_count: plan.group_count(),
            roster_size: plan.roster_size() as u32,
            balance_score: plan.metrics.balance_score,
            created_at: format_instant(created_at),
            groups: plan.metrics.groups.clone(),
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// `explain(groupingRun) -> string`
pub trait RationaleGenerator {
    fn explain(&self, input: &RationaleInput) -> Result<String, RationaleError>;
}

/// Used at run creation: the worker has not seen the run yet
pub struct Deferred;

impl RationaleGenerator for Deferred {
    fn explain(&self, _input: &RationaleInput) -> Result<String, RationaleError> {
        Err(RationaleError::Deferred)
    }
}

/// What the narrative worker reported back for one request
pub struct SubmittedNarrative<'a> {
    pub narrative: Option<&'a str>,
    pub error: Option<&'a str>,
}

impl RationaleGenerator for SubmittedNarrative<'_> {
    fn explain(&self, _input: &RationaleInput) -> Result<String, RationaleError> {
        if let Some(error) = self.error {
            return Err(RationaleError::Service(error.to_string()));
        }
        self.narrative
            .map(str::to_string)
            .ok_or(RationaleError::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rationale {
    pub text: String,
    pub source: RationaleSource,
}

/// Ask the generator, keep its text only if usable, else the template
pub fn explain_with_fallback(generator: &dyn RationaleGenerator, input: &RationaleInput) -> Rationale {
    match generator.explain(input).and_then(validate_narrative) {
        Ok(text) => Rationale { text, source: RationaleSource::Narrative },
        Err(RationaleError::Deferred) => Rationale {
            text: template_rationale(input),
            source: RationaleSource::Template,
        },
        Err(e) => {
            log::warn!("[RATIONALE] run:{} falling back to template: {}", input.run_id, e);
            Rationale {
                text: template_rationale(input),
                source: RationaleSource::Template,
            }
        }
    }
}

fn validate_narrative(text: String) -> Result<String, RationaleError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RationaleError::Empty);
    }
    if trimmed.chars().count() > MAX_NARRATIVE_CHARS {
        return Err(RationaleError::TooLong { limit: MAX_NARRATIVE_CHARS });
    }
    Ok(trimmed.to_string())
}

/// Deterministic explanation enumerating tier and gender counts per group
pub fn template_rationale(input: &RationaleInput) -> String {
    let mode = match input.mode {
        GroupingMode::Ai => "Balanced automatically",
        GroupingMode::Manual => "Arranged by the teacher",
    };
    let mut text = format!(
        "{}: {} students in {} groups (gender spread {}).",
        mode, input.roster_size, input.group_count, input.balance_score
    );
    for group in &input.groups {
        let genders: Vec<String> = group
            .genders
            .iter()
            .map(|g| format!("{} {}", g.count, g.gender.as_str()))
            .collect();
        text.push_str(&format!(
            "\nGroup {}: {} students; ability high {}, mid {}, low {}; {}{}.",
            group.group_number,
            group.size,
            group.tiers.high,
            group.tiers.mid,
            group.tiers.low,
            genders.join(", "),
            if group.balanced { "" } else { " (gender uneven)" }
        ));
    }
    text
}

/// Exponential backoff after a failed delivery: 1, 2, 4, 8, 16 minutes
pub fn retry_backoff_minutes(attempts: u8) -> u64 {
    1u64 << attempts.saturating_sub(1).min(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::{compute_groups, Gender, RosterEntry};

    fn input() -> RationaleInput {
        let roster: Vec<RosterEntry> = (0..9)
            .map(|i| RosterEntry {
                student_id: format!("s{}", i + 1),
                gender: if i % 2 == 0 { Gender::Female } else { Gender::Male },
                pretest_score: 90.0 - 10.0 * i as f32,
            })
            .collect();
        let plan = compute_groups(&roster, GroupingMode::Ai, Some(3)).unwrap();
        RationaleInput::new(4, 11, &plan, Timestamp::from_micros_since_unix_epoch(0))
    }

    struct Offline;

    impl RationaleGenerator for Offline {
        fn explain(&self, _input: &RationaleInput) -> Result<String, RationaleError> {
            Err(RationaleError::Service("connection refused".to_string()))
        }
    }

    #[test]
    fn test_template_lists_every_group() {
        let text = template_rationale(&input());
        assert!(text.starts_with("Balanced automatically: 9 students in 3 groups (gender spread 1)."));
        assert!(text.contains("Group 1: 3 students; ability high 1, mid 1, low 1; 2 female, 1 male."));
        assert!(text.contains("Group 3:"));
    }

    #[test]
    fn test_template_is_deterministic() {
        assert_eq!(template_rationale(&input()), template_rationale(&input()));
    }

    #[test]
    fn test_service_failure_uses_template() {
        let input = input();
        let rationale = explain_with_fallback(&Offline, &input);
        assert_eq!(rationale.source, RationaleSource::Template);
        assert_eq!(rationale.text, template_rationale(&input));
    }

    #[test]
    fn test_submitted_narrative_accepted_and_trimmed() {
        let submitted = SubmittedNarrative { narrative: Some("  Mixed ability in every group.  "), error: None };
        let rationale = explain_with_fallback(&submitted, &input());
        assert_eq!(rationale.source, RationaleSource::Narrative);
        assert_eq!(rationale.text, "Mixed ability in every group.");
    }

    #[test]
    fn test_blank_or_oversized_narrative_rejected() {
        let blank = SubmittedNarrative { narrative: Some("   "), error: None };
        assert_eq!(explain_with_fallback(&blank, &input()).source, RationaleSource::Template);

        let long = "x".repeat(MAX_NARRATIVE_CHARS + 1);
        let oversized = SubmittedNarrative { narrative: Some(&long), error: None };
        assert_eq!(explain_with_fallback(&oversized, &input()).source, RationaleSource::Template);
    }

    #[test]
    fn test_payload_round_trips_through_worker() {
        let input = input();
        let payload = input.to_payload().unwrap();
        assert!(payload.contains("\"balanceScore\":1"));
        assert_eq!(RationaleInput::from_payload(&payload).unwrap(), input);
    }

    #[test]
    fn test_retry_backoff() {
        let delays: Vec<u64> = (1..=6).map(retry_backoff_minutes).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16]);
    }
}
