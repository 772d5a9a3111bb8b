// End-to-end scenarios through the public module API: phase graph,
// per-student resolution, availability gates and grouping.

use classroom_session_module::availability;
use classroom_session_module::grouping::{compute_groups, Gender, GroupingError, GroupingMode, RosterEntry};
use classroom_session_module::phase::{self, EffectivePhase, Phase};
use classroom_session_module::rationale::{self, Deferred, RationaleInput, RationaleSource};
use classroom_session_module::{ClassSession, StudentProgress};
use spacetimedb::Timestamp;

const MINUTE: i64 = 60 * 1_000_000;

fn at_minute(m: i64) -> Timestamp {
    Timestamp::from_micros_since_unix_epoch(1_700_000_000_000_000 + m * MINUTE)
}

fn class(phase: Phase, ended_at: Option<Timestamp>, post_delay: u32, retention_delay: u32) -> ClassSession {
    ClassSession {
        id: 1,
        teacher_id: "teacher".to_string(),
        title: "Fractions".to_string(),
        phase,
        class_ended_at: ended_at,
        post_test_delay_minutes: post_delay,
        retention_test_delay_minutes: retention_delay,
        revision: 0,
        created_at: at_minute(0),
        updated_at: at_minute(0),
    }
}

fn student(pretest_at: Option<Timestamp>, posttest_at: Option<Timestamp>) -> StudentProgress {
    StudentProgress {
        id: 1,
        class_id: 1,
        student_id: "s1".to_string(),
        gender: Gender::Undisclosed,
        pretest_score: pretest_at.map(|_| 50.0),
        posttest_score: posttest_at.map(|_| 60.0),
        retention_score: None,
        pretest_completed_at: pretest_at,
        posttest_completed_at: posttest_at,
        group_number: None,
        enrolled_at: at_minute(0),
    }
}

#[test]
fn phase_graph_cases() {
    // (from, to, allowed, description)
    let cases = [
        (Phase::WaitingRoom, Phase::MainSession, true, "class starts"),
        (Phase::WaitingRoom, Phase::GroupSession, false, "cannot skip the main session"),
        (Phase::WaitingRoom, Phase::Posttest, false, "cannot end before starting"),
        (Phase::MainSession, Phase::GroupSession, true, "break into groups"),
        (Phase::MainSession, Phase::Posttest, true, "end class"),
        (Phase::GroupSession, Phase::MainSession, true, "regroup"),
        (Phase::GroupSession, Phase::Posttest, false, "must regroup before ending"),
        (Phase::Posttest, Phase::MainSession, false, "post-test is terminal"),
        (Phase::MainSession, Phase::MainSession, false, "no self transition"),
    ];
    for (from, to, allowed, description) in cases {
        assert_eq!(from.can_transition_to(to), allowed, "{}: {} -> {}", description, from, to);
    }
}

#[test]
fn effective_phase_cases() {
    let cases = [
        (Phase::MainSession, None, None, EffectivePhase::PretestGate, "no pre-assessment yet"),
        (Phase::Posttest, None, None, EffectivePhase::PretestGate, "gate overrides post-test"),
        (Phase::GroupSession, Some(at_minute(1)), None, EffectivePhase::GroupSession, "follows the class"),
        (Phase::Posttest, Some(at_minute(1)), None, EffectivePhase::Posttest, "post-test pending"),
        (Phase::Posttest, Some(at_minute(1)), Some(at_minute(90)), EffectivePhase::Ended, "post-test done"),
    ];
    for (class_phase, pretest_at, posttest_at, expected, description) in cases {
        let resolved = phase::resolve(class_phase, &student(pretest_at, posttest_at));
        assert_eq!(resolved, expected, "{}", description);
    }
}

#[test]
fn post_test_unlocks_exactly_at_delay() {
    // Class ended at T with a 60 minute delay
    let session = class(Phase::Posttest, Some(at_minute(0)), 60, 7 * 24 * 60);
    let progress = student(Some(at_minute(-30)), None);

    let early = availability::report(at_minute(59), &session, &progress);
    assert!(!early.post_test_unlocked);
    assert_eq!(early.post_test_unlock_at, Some(at_minute(60)));
    assert_eq!(early.unlock_at(), Some(at_minute(60)));

    let on_time = availability::report(at_minute(60), &session, &progress);
    assert!(on_time.post_test_unlocked);
    assert!(!on_time.retention_unlocked);
}

#[test]
fn retention_anchors_on_own_posttest() {
    let week = 7 * 24 * 60;
    let session = class(Phase::Posttest, Some(at_minute(0)), 0, week as u32);
    let progress = student(Some(at_minute(-30)), Some(at_minute(120)));

    let report = availability::report(at_minute(week), &session, &progress);
    assert!(report.post_test_unlocked);
    assert!(!report.retention_unlocked, "a week after class end is not a week after the post-test");
    assert_eq!(report.retention_unlock_at, Some(at_minute(week + 120)));

    let later = availability::report(at_minute(week + 120), &session, &progress);
    assert!(later.retention_unlocked);
}

#[test]
fn nothing_unlocks_before_class_ends() {
    let session = class(Phase::MainSession, None, 0, 0);
    let report = availability::report(at_minute(10_000), &session, &student(Some(at_minute(0)), None));
    assert!(!report.post_test_unlocked);
    assert!(!report.retention_unlocked);
    assert_eq!(report.unlock_at(), None);
}

fn roster(size: usize) -> Vec<RosterEntry> {
    (0..size)
        .map(|i| RosterEntry {
            student_id: format!("s{}", i + 1),
            gender: if i % 2 == 0 { Gender::Female } else { Gender::Male },
            pretest_score: 90.0 - 10.0 * i as f32,
        })
        .collect()
}

#[test]
fn nine_students_grouped_and_explained() {
    let plan = compute_groups(&roster(9), GroupingMode::Ai, Some(3)).unwrap();
    assert_eq!(plan.group_count(), 3);
    assert!(plan.metrics.all_balanced());
    assert_eq!(plan.group_of("s5"), Some(2));

    let input = RationaleInput::new(1, 1, &plan, at_minute(0));
    let rationale = rationale::explain_with_fallback(&Deferred, &input);
    assert_eq!(rationale.source, RationaleSource::Template);
    assert_eq!(rationale.text.lines().count(), 4);
}

#[test]
fn manual_mode_refuses_eight_students() {
    let err = compute_groups(&roster(8), GroupingMode::Manual, None).unwrap_err();
    assert_eq!(err, GroupingError::RosterTooLargeForManual { limit: 7, actual: 8 });
    assert!(err.to_string().contains("use AI grouping"));
}

#[test]
fn even_split_rosters_stay_within_one_per_group() {
    // (roster size, female seats by score rank, group count, description)
    let cases: [(usize, &[usize], Option<u32>, &str); 4] = [
        (10, &[0, 1, 2, 3, 7], None, "boys clustered in the lower half"),
        (10, &[0, 1, 2, 3, 7], Some(4), "small trailing groups"),
        (16, &[0, 1, 2, 3, 4, 5, 6, 7], Some(2), "girls all on top"),
        (14, &[1, 3, 5, 8, 10, 12, 13], None, "irregular mix"),
    ];
    for (n, female, groups, description) in cases {
        let roster: Vec<RosterEntry> = (0..n)
            .map(|i| RosterEntry {
                student_id: format!("s{:02}", i),
                gender: if female.contains(&i) { Gender::Female } else { Gender::Male },
                pretest_score: 100.0 - i as f32,
            })
            .collect();
        let plan = compute_groups(&roster, GroupingMode::Ai, groups).unwrap();
        for group in &plan.metrics.groups {
            let diff = group.gender_count(Gender::Female).abs_diff(group.gender_count(Gender::Male));
            assert!(diff <= 1, "{}: group {} {:?}", description, group.group_number, plan.groups);
        }
    }
}
