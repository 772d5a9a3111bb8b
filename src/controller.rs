// Teacher-issued operations on a class: phase transitions, grouping runs,
// manual overrides and delay configuration.
//
// Each operation validates everything first and only then writes, so a
// rejection never leaves partial state behind. Serialization per class comes
// from the host running one reducer transaction at a time; `revision` lets a
// caller that raced another request detect it and retry.

use spacetimedb::{SpacetimeType, Timestamp};

use crate::availability::{self, AvailabilityReport};
use crate::error::SessionError;
use crate::grouping::{self, GroupingMode, GroupingPlan, ManualAssignment, RosterEntry};
use crate::phase::Phase;
use crate::rationale::{self, RationaleInput};
use crate::store::ClassroomStore;
use crate::{ClassSession, GroupAssignment, GroupingRun, PhaseChange, RationaleRequest, RunNarrative};

/// Upper bound for either delay: 30 days
pub const MAX_DELAY_MINUTES: u32 = 30 * 24 * 60;

#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
}

/// Role of `user_id` in this class, as resolved from stored state only
pub fn resolve_role<S: ClassroomStore>(store: &S, session: &ClassSession, user_id: &str) -> Option<Role> {
    if session.teacher_id == user_id {
        Some(Role::Teacher)
    } else if store.student_progress(session.id, user_id).is_some() {
        Some(Role::Student)
    } else {
        None
    }
}

fn load_session<S: ClassroomStore>(store: &S, class_id: u64) -> Result<ClassSession, SessionError> {
    store.class_session(class_id).ok_or(SessionError::ClassNotFound(class_id))
}

fn require_teacher<S: ClassroomStore>(
    store: &S,
    session: &ClassSession,
    user_id: &str,
    action: &'static str,
) -> Result<(), SessionError> {
    match resolve_role(store, session, user_id) {
        Some(Role::Teacher) => Ok(()),
        _ => Err(SessionError::Unauthorized { action, required: "the class teacher" }),
    }
}

fn check_revision(session: &ClassSession, expected: Option<u64>) -> Result<(), SessionError> {
    match expected {
        Some(expected) if expected != session.revision => Err(SessionError::ConcurrentModification {
            expected,
            actual: session.revision,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub from: Phase,
    pub to: Phase,
    pub revision: u64,
    /// Set when entering the group phase ran the first grouping of the class
    pub auto_run: Option<GroupingRun>,
}

/// `applyTransition(classId, requestedPhase, actingUserRole)`
pub fn apply_transition<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    target: Phase,
    actor_id: &str,
    expected_revision: Option<u64>,
    now: Timestamp,
) -> Result<TransitionOutcome, SessionError> {
    let mut session = load_session(store, class_id)?;
    require_teacher(store, &session, actor_id, "changing the class phase")?;
    check_revision(&session, expected_revision)?;

    let from = session.phase;
    if !from.can_transition_to(target) {
        return Err(SessionError::InvalidTransition { from, to: target });
    }

    session.phase = target;
    if target == Phase::Posttest {
        session.class_ended_at = Some(now);
    }

    // First entry into groups runs AI grouping once; re-entry keeps the
    // existing assignment so students are never silently reshuffled.
    let auto_run = if target == Phase::GroupSession && !store.has_grouping_run(class_id) {
        let roster = eligible_roster(store, class_id);
        match grouping::compute_groups(&roster, GroupingMode::Ai, None) {
            Ok(plan) => Some(persist_plan(store, &session, &plan, now)),
            Err(e) => {
                log::info!("[GROUPS] class:{} auto grouping skipped: {}", class_id, e);
                None
            }
        }
    } else {
        None
    };

    session.revision += 1;
    session.updated_at = now;
    let revision = session.revision;
    store.update_session(session);
    store.insert_phase_change(PhaseChange {
        id: 0,
        class_id,
        from_phase: from,
        phase: target,
        revision,
        changed_at: now,
        changed_by: actor_id.to_string(),
    });

    log::info!("[PHASE] class:{} {}→{} rev:{}", class_id, from, target, revision);
    Ok(TransitionOutcome { from, to: target, revision, auto_run })
}

/// Students who finished the pre-assessment, as an immutable snapshot
pub fn eligible_roster<S: ClassroomStore>(store: &S, class_id: u64) -> Vec<RosterEntry> {
    store
        .class_roster(class_id)
        .into_iter()
        .filter(|p| p.pretest_completed_at.is_some())
        .map(|p| RosterEntry {
            student_id: p.student_id,
            gender: p.gender,
            pretest_score: p.pretest_score.unwrap_or(0.0),
        })
        .collect()
}

/// `computeGroups` for a class, persisted as a new run
pub fn request_grouping<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    actor_id: &str,
    mode: GroupingMode,
    requested_group_count: Option<u32>,
    expected_revision: Option<u64>,
    now: Timestamp,
) -> Result<GroupingRun, SessionError> {
    let mut session = load_session(store, class_id)?;
    require_teacher(store, &session, actor_id, "grouping students")?;
    check_revision(&session, expected_revision)?;
    if !session.phase.allows_grouping() {
        return Err(SessionError::GroupingNotAllowed { phase: session.phase });
    }

    let roster = eligible_roster(store, class_id);
    let plan = grouping::compute_groups(&roster, mode, requested_group_count)?;
    let run = persist_plan(store, &session, &plan, now);

    session.revision += 1;
    session.updated_at = now;
    store.update_session(session);
    Ok(run)
}

/// `saveManualGroupAssignments`: the teacher's own layout becomes a MANUAL run
pub fn save_manual_assignments<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    actor_id: &str,
    assignments: &[ManualAssignment],
    expected_revision: Option<u64>,
    now: Timestamp,
) -> Result<GroupingRun, SessionError> {
    let mut session = load_session(store, class_id)?;
    require_teacher(store, &session, actor_id, "assigning groups")?;
    check_revision(&session, expected_revision)?;
    if !session.phase.allows_grouping() {
        return Err(SessionError::GroupingNotAllowed { phase: session.phase });
    }

    let roster = eligible_roster(store, class_id);
    let plan = grouping::manual_plan(&roster, assignments)?;
    let run = persist_plan(store, &session, &plan, now);

    session.revision += 1;
    session.updated_at = now;
    store.update_session(session);
    Ok(run)
}

/// Write a plan as the class's current run. Supersedes, never merges:
/// every enrolled student's group number is rewritten, and students outside
/// the plan are cleared.
fn persist_plan<S: ClassroomStore>(store: &S, session: &ClassSession, plan: &GroupingPlan, now: Timestamp) -> GroupingRun {
    let class_id = session.id;
    let metrics_json = serde_json::to_string(&plan.metrics).unwrap_or_else(|e| {
        log::error!("[GROUPS] class:{} metrics serialization failed: {}", class_id, e);
        String::from("{}")
    });

    // Template first; the run id is filled in once the row exists
    let provisional = RationaleInput::new(class_id, 0, plan, now);
    let template = rationale::explain_with_fallback(&rationale::Deferred, &provisional);

    let run = store.insert_run(GroupingRun {
        id: 0,
        class_id,
        mode: plan.mode,
        group_count: plan.group_count(),
        balance_score: plan.metrics.balance_score,
        balance_metrics: metrics_json,
        rationale_text: template.text.clone(),
        created_at: now,
    });

    for mut progress in store.class_roster(class_id) {
        let group = plan.group_of(&progress.student_id);
        if progress.group_number != group {
            progress.group_number = group;
            store.update_progress(progress);
        }
    }
    for (student_id, group_number) in plan.assignments() {
        store.insert_assignment(GroupAssignment {
            id: 0,
            run_id: run.id,
            class_id,
            student_id: student_id.to_string(),
            group_number,
        });
    }

    store.insert_narrative(RunNarrative {
        run_id: run.id,
        class_id,
        text: template.text,
        source: template.source,
        updated_at: now,
    });

    let input = RationaleInput { run_id: run.id, ..provisional };
    match input.to_payload() {
        Ok(payload) => store.insert_rationale_request(RationaleRequest {
            id: 0,
            run_id: run.id,
            class_id,
            payload,
            created_at: now,
            resolved: false,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            resolved_at: None,
        }),
        Err(e) => log::error!("[RATIONALE] run:{} payload serialization failed: {}", run.id, e),
    }

    log::info!(
        "[GROUPS] class:{} run:{} mode:{} students:{} groups:{} score:{} balanced:{}",
        class_id,
        run.id,
        plan.mode.as_str(),
        plan.roster_size(),
        plan.group_count(),
        plan.metrics.balance_score,
        plan.metrics.all_balanced()
    );
    run
}

/// Teacher-configured delays. Leaves `class_ended_at` untouched.
pub fn configure_delays<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    actor_id: &str,
    post_test_delay_minutes: u32,
    retention_test_delay_minutes: u32,
    expected_revision: Option<u64>,
    now: Timestamp,
) -> Result<ClassSession, SessionError> {
    let mut session = load_session(store, class_id)?;
    require_teacher(store, &session, actor_id, "configuring delays")?;
    check_revision(&session, expected_revision)?;
    validate_delays(post_test_delay_minutes, retention_test_delay_minutes)?;

    session.post_test_delay_minutes = post_test_delay_minutes;
    session.retention_test_delay_minutes = retention_test_delay_minutes;
    session.revision += 1;
    session.updated_at = now;
    store.update_session(session.clone());

    log::info!(
        "[CONFIG] class:{} post_delay_min:{} retention_delay_min:{}",
        class_id,
        post_test_delay_minutes,
        retention_test_delay_minutes
    );
    Ok(session)
}

pub fn validate_delays(post_test: u32, retention: u32) -> Result<(), SessionError> {
    if post_test > MAX_DELAY_MINUTES || retention > MAX_DELAY_MINUTES {
        return Err(SessionError::InvalidConfiguration(format!(
            "delays must be at most {} minutes, got post-test {} and retention {}",
            MAX_DELAY_MINUTES, post_test, retention
        )));
    }
    Ok(())
}

/// `getAvailability(classId, studentId)` at server time `now`.
/// Students ask about themselves; the class teacher names any enrolled student.
pub fn availability_for<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    viewer_id: &str,
    student_id: Option<&str>,
    now: Timestamp,
) -> Result<AvailabilityReport, SessionError> {
    let session = load_session(store, class_id)?;
    let target = match (resolve_role(store, &session, viewer_id), student_id) {
        (Some(Role::Teacher), Some(student)) => student,
        (Some(Role::Teacher), None) => {
            return Err(SessionError::InvalidConfiguration(
                "the teacher must name the student to check".to_string(),
            ))
        }
        (Some(Role::Student), Some(student)) if student != viewer_id => {
            return Err(SessionError::Unauthorized {
                action: "checking another student's availability",
                required: "the class teacher",
            })
        }
        (Some(Role::Student), _) => viewer_id,
        (None, _) => return Err(SessionError::NotEnrolled { class_id }),
    };
    let progress = store
        .student_progress(class_id, target)
        .ok_or(SessionError::NotEnrolled { class_id })?;
    Ok(availability::report(now, &session, &progress))
}

/// Presence check for `join-session`. Students may only enter their own
/// group; the teacher may drop into any of them.
pub fn validate_join<S: ClassroomStore>(
    store: &S,
    class_id: u64,
    user_id: &str,
    group_number: Option<u32>,
) -> Result<Role, SessionError> {
    let session = load_session(store, class_id)?;
    let role = resolve_role(store, &session, user_id).ok_or(SessionError::NotEnrolled { class_id })?;

    if let (Role::Student, Some(requested)) = (role, group_number) {
        let assigned = store
            .student_progress(class_id, user_id)
            .and_then(|p| p.group_number);
        match assigned {
            Some(own) if own == requested => {}
            Some(_) => {
                return Err(SessionError::InvalidGroupJoin { requested, reason: "students may only join their assigned group" })
            }
            None => return Err(SessionError::InvalidGroupJoin { requested, reason: "no group assigned yet" }),
        }
    }
    Ok(role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::Gender;
    use crate::rationale::RationaleSource;
    use crate::store::memory::MemoryStore;
    use crate::StudentProgress;

    const TEACHER: &str = "teacher-1";
    const CLASS: u64 = 1;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::from_micros_since_unix_epoch(1_700_000_000_000_000 + seconds * 1_000_000)
    }

    fn store_with_students(count: usize, phase: Phase) -> MemoryStore {
        let store = MemoryStore::default();
        store.sessions.borrow_mut().push(ClassSession {
            id: CLASS,
            teacher_id: TEACHER.to_string(),
            title: "Photosynthesis".to_string(),
            phase,
            class_ended_at: None,
            post_test_delay_minutes: 60,
            retention_test_delay_minutes: 7 * 24 * 60,
            revision: 0,
            created_at: at(0),
            updated_at: at(0),
        });
        for i in 0..count {
            store.progress.borrow_mut().push(StudentProgress {
                id: i as u64 + 1,
                class_id: CLASS,
                student_id: format!("s{:02}", i),
                gender: if i % 2 == 0 { Gender::Female } else { Gender::Male },
                pretest_score: Some(100.0 - i as f32 * 5.0),
                posttest_score: None,
                retention_score: None,
                pretest_completed_at: Some(at(10)),
                posttest_completed_at: None,
                group_number: None,
                enrolled_at: at(1),
            });
        }
        store
    }

    fn phase_of(store: &MemoryStore) -> Phase {
        store.class_session(CLASS).unwrap().phase
    }

    #[test]
    fn test_skipping_main_session_is_rejected() {
        let store = store_with_students(3, Phase::WaitingRoom);
        let err = apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, None, at(20)).unwrap_err();
        assert_eq!(err, SessionError::InvalidTransition { from: Phase::WaitingRoom, to: Phase::GroupSession });
        assert_eq!(phase_of(&store), Phase::WaitingRoom);
        assert!(store.phase_changes.borrow().is_empty());
    }

    #[test]
    fn test_student_cannot_transition() {
        let store = store_with_students(3, Phase::WaitingRoom);
        let err = apply_transition(&store, CLASS, Phase::MainSession, "s00", None, at(20)).unwrap_err();
        assert!(matches!(err, SessionError::Unauthorized { .. }));
        assert_eq!(store.class_session(CLASS).unwrap().revision, 0);
    }

    #[test]
    fn test_full_walk_stamps_class_end() {
        let store = store_with_students(3, Phase::WaitingRoom);
        apply_transition(&store, CLASS, Phase::MainSession, TEACHER, None, at(20)).unwrap();
        apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, None, at(30)).unwrap();
        apply_transition(&store, CLASS, Phase::MainSession, TEACHER, None, at(40)).unwrap();
        // Returning from groups does not touch the class end
        assert_eq!(store.class_session(CLASS).unwrap().class_ended_at, None);

        let outcome = apply_transition(&store, CLASS, Phase::Posttest, TEACHER, None, at(50)).unwrap();
        assert_eq!(outcome.revision, 4);
        let session = store.class_session(CLASS).unwrap();
        assert_eq!(session.class_ended_at, Some(at(50)));

        let walk: Vec<(Phase, Phase)> = store
            .phase_changes
            .borrow()
            .iter()
            .map(|c| (c.from_phase, c.phase))
            .collect();
        assert_eq!(
            walk,
            vec![
                (Phase::WaitingRoom, Phase::MainSession),
                (Phase::MainSession, Phase::GroupSession),
                (Phase::GroupSession, Phase::MainSession),
                (Phase::MainSession, Phase::Posttest),
            ]
        );
    }

    #[test]
    fn test_racing_successors_only_one_wins() {
        let store = store_with_students(3, Phase::MainSession);
        // Both requests observed revision 0
        apply_transition(&store, CLASS, Phase::Posttest, TEACHER, Some(0), at(20)).unwrap();
        let err = apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, Some(0), at(20)).unwrap_err();
        assert_eq!(err, SessionError::ConcurrentModification { expected: 0, actual: 1 });
        assert_eq!(phase_of(&store), Phase::Posttest);
    }

    #[test]
    fn test_first_group_entry_runs_ai_grouping_once() {
        let store = store_with_students(9, Phase::MainSession);
        let outcome = apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, None, at(20)).unwrap();
        let run = outcome.auto_run.expect("auto grouping should run");
        assert_eq!(run.mode, GroupingMode::Ai);
        assert!(store.progress.borrow().iter().all(|p| p.group_number.is_some()));
        let first_layout: Vec<Option<u32>> = store.progress.borrow().iter().map(|p| p.group_number).collect();

        apply_transition(&store, CLASS, Phase::MainSession, TEACHER, None, at(30)).unwrap();
        let again = apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, None, at(40)).unwrap();
        assert!(again.auto_run.is_none());
        assert_eq!(store.runs.borrow().len(), 1);
        let second_layout: Vec<Option<u32>> = store.progress.borrow().iter().map(|p| p.group_number).collect();
        assert_eq!(first_layout, second_layout);
    }

    #[test]
    fn test_small_class_enters_groups_without_auto_run() {
        let store = store_with_students(5, Phase::MainSession);
        let outcome = apply_transition(&store, CLASS, Phase::GroupSession, TEACHER, None, at(20)).unwrap();
        assert!(outcome.auto_run.is_none());
        assert_eq!(phase_of(&store), Phase::GroupSession);
    }

    #[test]
    fn test_request_grouping_persists_run() {
        let store = store_with_students(9, Phase::GroupSession);
        let run = request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, Some(3), None, at(20)).unwrap();
        assert_eq!(run.group_count, 3);
        assert_eq!(store.assignments.borrow().len(), 9);
        for p in store.progress.borrow().iter() {
            let group = p.group_number.unwrap();
            assert!((1..=3).contains(&group));
        }

        let narratives = store.narratives.borrow();
        assert_eq!(narratives[0].run_id, run.id);
        assert_eq!(narratives[0].source, RationaleSource::Template);
        assert_eq!(narratives[0].text, run.rationale_text);

        let requests = store.rationale_requests.borrow();
        let input = RationaleInput::from_payload(&requests[0].payload).unwrap();
        assert_eq!(input.run_id, run.id);
        assert_eq!(store.class_session(CLASS).unwrap().revision, 1);
    }

    #[test]
    fn test_regrouping_supersedes_and_is_reproducible() {
        let store = store_with_students(10, Phase::GroupSession);
        request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, Some(2), None, at(20)).unwrap();
        let first: Vec<Option<u32>> = store.progress.borrow().iter().map(|p| p.group_number).collect();
        request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, Some(2), None, at(30)).unwrap();
        let second: Vec<Option<u32>> = store.progress.borrow().iter().map(|p| p.group_number).collect();
        assert_eq!(first, second);
        assert_eq!(store.runs.borrow().len(), 2);
    }

    #[test]
    fn test_manual_mode_rejects_eight() {
        let store = store_with_students(8, Phase::GroupSession);
        let err = request_grouping(&store, CLASS, TEACHER, GroupingMode::Manual, None, None, at(20)).unwrap_err();
        assert_eq!(err.to_string(), "manual grouping supports at most 7 students, found 8; use AI grouping");
        assert!(store.runs.borrow().is_empty());
        assert_eq!(store.class_session(CLASS).unwrap().revision, 0);
    }

    #[test]
    fn test_grouping_not_allowed_in_waiting_room() {
        let store = store_with_students(9, Phase::WaitingRoom);
        let err = request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, None, None, at(20)).unwrap_err();
        assert_eq!(err, SessionError::GroupingNotAllowed { phase: Phase::WaitingRoom });
    }

    #[test]
    fn test_pretest_incomplete_students_are_excluded_and_cleared() {
        let store = store_with_students(9, Phase::GroupSession);
        {
            let mut rows = store.progress.borrow_mut();
            rows[8].pretest_completed_at = None;
            rows[8].group_number = Some(2);
        }
        request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, None, None, at(20)).unwrap();
        let rows = store.progress.borrow();
        assert_eq!(rows[8].group_number, None);
        assert!(rows[..8].iter().all(|p| p.group_number.is_some()));
    }

    #[test]
    fn test_manual_override_creates_manual_run() {
        let store = store_with_students(4, Phase::GroupSession);
        let assignments = vec![
            ManualAssignment { student_id: "s00".to_string(), group_number: 1 },
            ManualAssignment { student_id: "s01".to_string(), group_number: 1 },
            ManualAssignment { student_id: "s02".to_string(), group_number: 2 },
            ManualAssignment { student_id: "s03".to_string(), group_number: 2 },
        ];
        let run = save_manual_assignments(&store, CLASS, TEACHER, &assignments, Some(0), at(20)).unwrap();
        assert_eq!(run.mode, GroupingMode::Manual);
        assert_eq!(run.group_count, 2);
        assert_eq!(store.student_progress(CLASS, "s02").unwrap().group_number, Some(2));
    }

    #[test]
    fn test_configure_delays_bounds() {
        let store = store_with_students(0, Phase::WaitingRoom);
        let err = configure_delays(&store, CLASS, TEACHER, MAX_DELAY_MINUTES + 1, 0, None, at(5)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));
        let session = configure_delays(&store, CLASS, TEACHER, 15, 60, None, at(5)).unwrap();
        assert_eq!(session.post_test_delay_minutes, 15);
        assert_eq!(session.revision, 1);
    }

    #[test]
    fn test_availability_after_posttest_transition() {
        let store = store_with_students(3, Phase::MainSession);
        apply_transition(&store, CLASS, Phase::Posttest, TEACHER, None, at(0)).unwrap();
        let locked = availability_for(&store, CLASS, "s00", None, at(59 * 60)).unwrap();
        assert!(!locked.post_test_unlocked);
        let open = availability_for(&store, CLASS, "s00", Some("s00"), at(60 * 60)).unwrap();
        assert!(open.post_test_unlocked);
        assert_eq!(
            availability_for(&store, CLASS, "nobody", None, at(0)).unwrap_err(),
            SessionError::NotEnrolled { class_id: CLASS }
        );
    }

    #[test]
    fn test_teacher_checks_a_students_gates() {
        let store = store_with_students(3, Phase::MainSession);
        apply_transition(&store, CLASS, Phase::Posttest, TEACHER, None, at(0)).unwrap();

        let report = availability_for(&store, CLASS, TEACHER, Some("s01"), at(60 * 60)).unwrap();
        assert!(report.post_test_unlocked);
        assert_eq!(report.retention_unlock_at, Some(at(7 * 24 * 60 * 60)));

        assert!(matches!(
            availability_for(&store, CLASS, TEACHER, None, at(0)),
            Err(SessionError::InvalidConfiguration(_))
        ));
        assert_eq!(
            availability_for(&store, CLASS, TEACHER, Some("ghost"), at(0)).unwrap_err(),
            SessionError::NotEnrolled { class_id: CLASS }
        );
        // Students cannot peek at classmates
        assert!(matches!(
            availability_for(&store, CLASS, "s00", Some("s01"), at(0)),
            Err(SessionError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_join_rules() {
        let store = store_with_students(9, Phase::GroupSession);
        request_grouping(&store, CLASS, TEACHER, GroupingMode::Ai, Some(3), None, at(20)).unwrap();
        let own = store.student_progress(CLASS, "s00").unwrap().group_number.unwrap();
        let other = if own == 1 { 2 } else { 1 };

        assert_eq!(validate_join(&store, CLASS, "s00", Some(own)).unwrap(), Role::Student);
        assert!(validate_join(&store, CLASS, "s00", Some(other)).is_err());
        assert_eq!(validate_join(&store, CLASS, TEACHER, Some(other)).unwrap(), Role::Teacher);
        assert!(validate_join(&store, CLASS, "stranger", None).is_err());
    }
}
