use spacetimedb::{
    client_visibility_filter, reducer, table, view, Filter, Identity, ReducerContext, ScheduleAt,
    SpacetimeType, Table, Timestamp,
};

pub mod availability;
pub mod controller;
pub mod error;
pub mod grouping;
pub mod phase;
pub mod rationale;
pub mod store;

// Roster import reducers for the roster-sync worker
mod roster_import;

use controller::Role;
use error::SessionError;
use grouping::{Gender, GroupingMode, ManualAssignment};
use phase::{EffectivePhase, Phase};
use rationale::{RationaleInput, RationaleSource, SubmittedNarrative};
use store::DbStore;

// ==================== CONSTANTS ====================

/// Post-test opens as soon as the teacher ends the class unless configured otherwise
const DEFAULT_POST_TEST_DELAY_MINUTES: u32 = 0;

/// Delayed retention assessment: one week after the student's post-test
const DEFAULT_RETENTION_TEST_DELAY_MINUTES: u32 = 7 * 24 * 60;

/// Cleanup task cadence
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Resolved rationale requests, superseded group assignments and old phase
/// changes are kept this long for auditing. Grouping runs are kept for good.
const RECORD_RETENTION_DAYS: i64 = 7;

const MAX_TITLE_CHARS: usize = 120;

const MICROS_PER_DAY: i64 = 24 * 60 * 60 * 1_000_000;

// ==================== HELPER FUNCTIONS ====================

/// First 8 characters of an id for log lines
fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map(|(i, _)| &id[..i]).unwrap_or(id)
}

/// Stable user id for the calling connection, from the gateway-verified session
fn caller_user_id(ctx: &ReducerContext) -> Result<String, SessionError> {
    ctx.db
        .session()
        .connection_id()
        .find(&ctx.sender)
        .map(|s| s.user_id)
        .ok_or(SessionError::NoSession)
}

fn is_authorized_worker(ctx: &ReducerContext) -> bool {
    ctx.db.authorized_worker().identity().find(&ctx.sender).is_some()
}

fn require_worker(ctx: &ReducerContext, action: &'static str) -> Result<(), SessionError> {
    if is_authorized_worker(ctx) {
        Ok(())
    } else {
        Err(SessionError::Unauthorized { action, required: "an authorized worker" })
    }
}

/// Log a rejection once and hand the reason back as the reducer error
fn reject(action: &str, who: &str, err: SessionError) -> String {
    log::warn!("[REJECT] action:{} user:{} reason:{}", action, short_id(who), err);
    err.to_string()
}

fn find_progress(ctx: &ReducerContext, class_id: u64, student_id: &str) -> Option<StudentProgress> {
    ctx.db
        .student_progress()
        .class_id()
        .filter(&class_id)
        .find(|p| p.student_id == student_id)
}

/// Runs whose assignment rows can go: superseded by a later run of the same
/// class and created before `cutoff_micros`. The latest run of a class is
/// never returned, however old.
fn superseded_runs_before(runs: &[GroupingRun], cutoff_micros: i64) -> Vec<u64> {
    let mut latest: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    for run in runs {
        let entry = latest.entry(run.class_id).or_insert(run.id);
        *entry = (*entry).max(run.id);
    }
    runs.iter()
        .filter(|run| latest.get(&run.class_id) != Some(&run.id))
        .filter(|run| run.created_at.to_micros_since_unix_epoch() < cutoff_micros)
        .map(|run| run.id)
        .collect()
}

/// Phase changes older than `cutoff_micros`, except each class's most recent one
fn expired_phase_changes(changes: &[PhaseChange], cutoff_micros: i64) -> Vec<u64> {
    let mut latest: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    for change in changes {
        let entry = latest.entry(change.class_id).or_insert(change.id);
        *entry = (*entry).max(change.id);
    }
    changes
        .iter()
        .filter(|change| latest.get(&change.class_id) != Some(&change.id))
        .filter(|change| change.changed_at.to_micros_since_unix_epoch() < cutoff_micros)
        .map(|change| change.id)
        .collect()
}

/// Create or refresh one enrollment. Returns true when a new row was created.
/// Re-enrolling only updates gender; assessment data is never touched here.
pub(crate) fn upsert_enrollment(ctx: &ReducerContext, class_id: u64, student_id: &str, gender: Gender) -> bool {
    if let Some(mut existing) = find_progress(ctx, class_id, student_id) {
        if existing.gender != gender {
            existing.gender = gender;
            ctx.db.student_progress().id().update(existing);
        }
        return false;
    }
    ctx.db.student_progress().insert(StudentProgress {
        id: 0,
        class_id,
        student_id: student_id.to_string(),
        gender,
        pretest_score: None,
        posttest_score: None,
        retention_score: None,
        pretest_completed_at: None,
        posttest_completed_at: None,
        group_number: None,
        enrolled_at: ctx.timestamp,
    });
    true
}

// ==================== TABLES ====================

/// Session links ephemeral connection to stable user
/// PRIVATE: created only by the gateway after it verified the user's token
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable user id - verified by gateway
    #[index(btree)]
    pub user_id: String,

    pub connected_at: Timestamp,
}

/// Authorized identities for worker-only reducers and RLS
/// (gateway, assessment service, roster sync, narrative worker)
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

/// SessionRecord: one per class, mutated only through the controller
#[table(name = class_session, public)]
#[derive(Clone, Debug)]
pub struct ClassSession {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// User who created the class; the only one allowed to drive it
    #[index(btree)]
    pub teacher_id: String,

    pub title: String,

    /// Stored class phase (PretestGate/Ended are per-student and never stored)
    pub phase: Phase,

    /// Set when the teacher moves the class into the post-test
    pub class_ended_at: Option<Timestamp>,

    pub post_test_delay_minutes: u32,

    pub retention_test_delay_minutes: u32,

    /// Bumped by every successful mutation; clients echo it back as
    /// `expected_revision` to detect racing requests
    pub revision: u64,

    pub created_at: Timestamp,

    pub updated_at: Timestamp,
}

/// Per (class, student) progress
/// PRIVATE: scores are visible to the student through the my_progress view
#[table(name = student_progress)]
#[derive(Clone, Debug)]
pub struct StudentProgress {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub class_id: u64,

    #[index(btree)]
    pub student_id: String,

    pub gender: Gender,

    /// Percentages 0-100, written once by the assessment service
    pub pretest_score: Option<f32>,
    pub posttest_score: Option<f32>,
    pub retention_score: Option<f32>,

    pub pretest_completed_at: Option<Timestamp>,
    pub posttest_completed_at: Option<Timestamp>,

    /// 1-based group in the class's latest grouping run (None = not grouped)
    pub group_number: Option<u32>,

    pub enrolled_at: Timestamp,
}

/// Audit record of one grouping computation. Never updated; a later run
/// supersedes it.
#[table(name = grouping_run, public)]
#[derive(Clone, Debug, PartialEq)]
pub struct GroupingRun {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub class_id: u64,

    pub mode: GroupingMode,

    pub group_count: u32,

    /// Max gender-count spread across groups (lower is better)
    pub balance_score: u32,

    /// JSON: {groups: [{groupNumber, size, tiers, genders, balanced}], balanceScore}
    pub balance_metrics: String,

    /// Templated explanation captured at creation
    pub rationale_text: String,

    pub created_at: Timestamp,
}

/// groups-assigned broadcast: one row per student per run
#[table(name = group_assignment, public)]
pub struct GroupAssignment {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub run_id: u64,

    #[index(btree)]
    pub class_id: u64,

    pub student_id: String,

    pub group_number: u32,
}

/// phase-changed broadcast: append-only log of applied transitions
#[table(name = phase_change, public)]
pub struct PhaseChange {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub class_id: u64,

    pub from_phase: Phase,

    pub phase: Phase,

    pub revision: u64,

    pub changed_at: Timestamp,

    /// User id of the teacher, or "admin" for resets
    pub changed_by: String,
}

/// Explanation shown next to a run: the template until the narrative
/// worker delivers something better
#[table(name = run_narrative, public)]
pub struct RunNarrative {
    #[primary_key]
    pub run_id: u64,

    #[index(btree)]
    pub class_id: u64,

    pub text: String,

    pub source: RationaleSource,

    pub updated_at: Timestamp,
}

/// Narration queue for the external narrative worker
/// SECURITY: Public table with RLS protection - only authorized workers can see rows
#[table(name = rationale_request, public)]
pub struct RationaleRequest {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub run_id: u64,

    pub class_id: u64,

    /// JSON RationaleInput: structured balance metrics, no free text
    pub payload: String,

    /// Created timestamp for FIFO processing
    #[index(btree)]
    pub created_at: Timestamp,

    /// Delivered, or given up after MAX_NARRATION_ATTEMPTS
    #[index(btree)]
    pub resolved: bool,

    pub attempts: u8,

    /// When to retry (None = now)
    pub next_retry_at: Option<Timestamp>,

    pub last_error: Option<String>,

    pub resolved_at: Option<Timestamp>,
}

/// Presence of a connection in a class (and optionally one of its groups).
/// Chat and video collaborators scope their rooms by these rows.
#[table(name = participant, public)]
pub struct Participant {
    #[primary_key]
    pub connection_id: Identity,

    #[index(btree)]
    pub class_id: u64,

    pub user_id: String,

    pub role: Role,

    pub group_number: Option<u32>,

    pub joined_at: Timestamp,
}

/// Result of the caller's last availability check
/// SECURITY: RLS limits rows to the connection that asked
#[table(name = availability_snapshot, public)]
pub struct AvailabilitySnapshot {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub connection_id: Identity,

    pub class_id: u64,

    pub student_id: String,

    pub post_test_unlocked: bool,

    pub retention_unlocked: bool,

    pub post_test_unlock_at: Option<Timestamp>,

    pub retention_unlock_at: Option<Timestamp>,

    /// Next pending unlock for client countdowns (None = nothing pending)
    pub unlock_at: Option<Timestamp>,

    pub checked_at: Timestamp,
}

/// Schedule table for the periodic cleanup task
#[table(name = cleanup_schedule, scheduled(cleanup_stale_records))]
pub struct CleanupSchedule {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub scheduled_at: ScheduleAt,
}

/// Assessment kinds written by the assessment service
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentKind {
    Pretest,
    Posttest,
    Retention,
}

impl AssessmentKind {
    fn as_str(self) -> &'static str {
        match self {
            AssessmentKind::Pretest => "pretest",
            AssessmentKind::Posttest => "posttest",
            AssessmentKind::Retention => "retention",
        }
    }
}

/// Row returned by the my_phases view
#[derive(SpacetimeType, Debug, Clone)]
pub struct StudentPhaseView {
    pub class_id: u64,
    pub class_phase: Phase,
    pub effective_phase: EffectivePhase,
    pub group_number: Option<u32>,
    pub revision: u64,
}

// ==================== VIEWS ====================

/// View: effective phase for every class the caller is enrolled in.
/// Recomputed by the host whenever the class or the caller's progress
/// changes, and on reconnect.
#[view(name = my_phases, public)]
fn my_phases(ctx: &spacetimedb::ViewContext) -> Vec<StudentPhaseView> {
    let Some(session) = ctx.db.session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db
        .student_progress()
        .student_id()
        .filter(&session.user_id)
        .filter_map(|progress| {
            let class = ctx.db.class_session().id().find(&progress.class_id)?;
            Some(StudentPhaseView {
                class_id: class.id,
                class_phase: class.phase,
                effective_phase: phase::resolve(class.phase, &progress),
                group_number: progress.group_number,
                revision: class.revision,
            })
        })
        .collect()
}

/// View: the caller's own progress rows (scores included)
#[view(name = my_progress, public)]
fn my_progress(ctx: &spacetimedb::ViewContext) -> Vec<StudentProgress> {
    let Some(session) = ctx.db.session().connection_id().find(ctx.sender) else {
        return Vec::new();
    };
    ctx.db
        .student_progress()
        .student_id()
        .filter(&session.user_id)
        .collect()
}

// ==================== ROW LEVEL SECURITY ====================

/// RLS Filter: only authorized workers (narrative worker) see the narration queue
#[client_visibility_filter]
const RATIONALE_QUEUE_VISIBILITY: Filter = Filter::Sql(
    "SELECT rq.* FROM rationale_request rq
     JOIN authorized_worker aw WHERE aw.identity = :sender"
);

/// RLS Filter: a connection only sees its own availability checks
#[client_visibility_filter]
const AVAILABILITY_VISIBILITY: Filter = Filter::Sql(
    "SELECT * FROM availability_snapshot WHERE connection_id = :sender"
);

// ==================== REDUCERS ====================

/// Initialize module - authorize the owner and schedule cleanup
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker { identity: ctx.sender });
    }

    // Avoid duplicate schedulers on hot-reload
    if ctx.db.cleanup_schedule().iter().count() == 0 {
        ctx.db.cleanup_schedule().insert(CleanupSchedule {
            id: 0,
            scheduled_at: ScheduleAt::Interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS).into()),
        });
    }

    log::info!("Classroom session module initialized");
}

/// Create a verified session for a client identity.
/// Called by the gateway AFTER verifying the user's token; clients can never
/// assert their own user id.
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, user_id: String) -> Result<(), String> {
    require_worker(ctx, "create_session").map_err(|e| reject("create_session", "-", e))?;

    let identity = Identity::from_hex(&client_identity)
        .map_err(|e| format!("Invalid identity hex string: {}", e))?;

    // Stale sessions: same user (unclean reconnect) OR same connection (PK conflict)
    let stale: Vec<_> = ctx
        .db
        .session()
        .iter()
        .filter(|s| s.user_id == user_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        user_id: user_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created user:{} ws:{}", short_id(&user_id), short_id(&client_identity));
    Ok(())
}

/// Drop presence and session state for the disconnecting connection.
/// Class state is untouched: reconnecting clients re-read it and re-resolve.
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    let was_present = ctx.db.participant().connection_id().delete(&ctx.sender);

    let snapshots: Vec<u64> = ctx
        .db
        .availability_snapshot()
        .connection_id()
        .filter(&ctx.sender)
        .map(|s| s.id)
        .collect();
    for id in snapshots {
        ctx.db.availability_snapshot().id().delete(&id);
    }

    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        let minutes = ctx
            .timestamp
            .duration_since(session.connected_at)
            .map(|d| d.as_secs())
            .unwrap_or(0) as f32
            / 60.0;
        log::info!(
            "[DISCONNECT] user:{} session_min:{:.1} was_present:{}",
            short_id(&session.user_id),
            minutes,
            was_present
        );
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}

/// Create a class; the caller becomes its teacher
#[reducer]
pub fn create_class(
    ctx: &ReducerContext,
    title: String,
    post_test_delay_minutes: Option<u32>,
    retention_test_delay_minutes: Option<u32>,
) -> Result<(), String> {
    let teacher_id = caller_user_id(ctx).map_err(|e| reject("create_class", "-", e))?;

    let title = title.trim().to_string();
    if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
        return Err(reject(
            "create_class",
            &teacher_id,
            SessionError::InvalidConfiguration(format!("title must be 1-{} characters", MAX_TITLE_CHARS)),
        ));
    }

    let post = post_test_delay_minutes.unwrap_or(DEFAULT_POST_TEST_DELAY_MINUTES);
    let retention = retention_test_delay_minutes.unwrap_or(DEFAULT_RETENTION_TEST_DELAY_MINUTES);
    controller::validate_delays(post, retention).map_err(|e| reject("create_class", &teacher_id, e))?;

    let class = ctx.db.class_session().insert(ClassSession {
        id: 0,
        teacher_id: teacher_id.clone(),
        title,
        phase: Phase::INITIAL,
        class_ended_at: None,
        post_test_delay_minutes: post,
        retention_test_delay_minutes: retention,
        revision: 0,
        created_at: ctx.timestamp,
        updated_at: ctx.timestamp,
    });

    log::info!(
        "[CLASS] created class:{} teacher:{} post_delay_min:{} retention_delay_min:{}",
        class.id,
        short_id(&teacher_id),
        post,
        retention
    );
    Ok(())
}

/// Teacher changes the post-test / retention delays
#[reducer]
pub fn configure_delays(
    ctx: &ReducerContext,
    class_id: u64,
    post_test_delay_minutes: u32,
    retention_test_delay_minutes: u32,
    expected_revision: Option<u64>,
) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("configure_delays", "-", e))?;
    controller::configure_delays(
        &DbStore::new(ctx),
        class_id,
        &user_id,
        post_test_delay_minutes,
        retention_test_delay_minutes,
        expected_revision,
        ctx.timestamp,
    )
    .map(|_| ())
    .map_err(|e| reject("configure_delays", &user_id, e))
}

/// Enroll a student. Allowed for the class teacher and for the roster-sync worker.
#[reducer]
pub fn enroll_student(ctx: &ReducerContext, class_id: u64, student_id: String, gender: Gender) -> Result<(), String> {
    let class = ctx
        .db
        .class_session()
        .id()
        .find(&class_id)
        .ok_or_else(|| reject("enroll_student", "-", SessionError::ClassNotFound(class_id)))?;

    if !is_authorized_worker(ctx) {
        let user_id = caller_user_id(ctx).map_err(|e| reject("enroll_student", "-", e))?;
        if user_id != class.teacher_id {
            return Err(reject(
                "enroll_student",
                &user_id,
                SessionError::Unauthorized { action: "enrolling students", required: "the class teacher" },
            ));
        }
    }

    let student_id = student_id.trim().to_string();
    if student_id.is_empty() || student_id == class.teacher_id {
        return Err(reject(
            "enroll_student",
            &student_id,
            SessionError::InvalidConfiguration("student id must be non-empty and differ from the teacher".to_string()),
        ));
    }

    let created = upsert_enrollment(ctx, class_id, &student_id, gender);
    log::info!(
        "[ENROLL] class:{} student:{} gender:{} new:{}",
        class_id,
        short_id(&student_id),
        gender.as_str(),
        created
    );
    Ok(())
}

/// Assessment service writes a score once. This module only reads them.
#[reducer]
pub fn record_assessment(
    ctx: &ReducerContext,
    class_id: u64,
    student_id: String,
    kind: AssessmentKind,
    score: f32,
) -> Result<(), String> {
    require_worker(ctx, "record_assessment").map_err(|e| reject("record_assessment", "-", e))?;

    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(reject(
            "record_assessment",
            &student_id,
            SessionError::InvalidConfiguration(format!("score must be a percentage 0-100, got {}", score)),
        ));
    }

    let mut progress = find_progress(ctx, class_id, &student_id)
        .ok_or_else(|| reject("record_assessment", &student_id, SessionError::NotEnrolled { class_id }))?;

    let already = match kind {
        AssessmentKind::Pretest => progress.pretest_completed_at.is_some(),
        AssessmentKind::Posttest => progress.posttest_completed_at.is_some(),
        AssessmentKind::Retention => progress.retention_score.is_some(),
    };
    if already {
        return Err(reject(
            "record_assessment",
            &student_id,
            SessionError::AlreadyRecorded { kind: kind.as_str(), student_id: student_id.clone() },
        ));
    }

    match kind {
        AssessmentKind::Pretest => {
            progress.pretest_score = Some(score);
            progress.pretest_completed_at = Some(ctx.timestamp);
        }
        AssessmentKind::Posttest => {
            progress.posttest_score = Some(score);
            progress.posttest_completed_at = Some(ctx.timestamp);
        }
        AssessmentKind::Retention => {
            progress.retention_score = Some(score);
        }
    }
    ctx.db.student_progress().id().update(progress);

    log::info!(
        "[ASSESSMENT] class:{} student:{} kind:{} score:{:.1}",
        class_id,
        short_id(&student_id),
        kind.as_str(),
        score
    );
    Ok(())
}

/// request-transition: teacher moves the class along the phase graph
#[reducer]
pub fn request_transition(
    ctx: &ReducerContext,
    class_id: u64,
    target_phase: Phase,
    expected_revision: Option<u64>,
) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("request_transition", "-", e))?;
    controller::apply_transition(&DbStore::new(ctx), class_id, target_phase, &user_id, expected_revision, ctx.timestamp)
        .map(|_| ())
        .map_err(|e| reject("request_transition", &user_id, e))
}

/// request-grouping: compute and persist a new grouping run
#[reducer]
pub fn request_grouping(
    ctx: &ReducerContext,
    class_id: u64,
    mode: GroupingMode,
    group_count: Option<u32>,
    expected_revision: Option<u64>,
) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("request_grouping", "-", e))?;
    controller::request_grouping(
        &DbStore::new(ctx),
        class_id,
        &user_id,
        mode,
        group_count,
        expected_revision,
        ctx.timestamp,
    )
    .map(|_| ())
    .map_err(|e| reject("request_grouping", &user_id, e))
}

/// Teacher override of group membership
#[reducer]
pub fn save_manual_group_assignments(
    ctx: &ReducerContext,
    class_id: u64,
    assignments: Vec<ManualAssignment>,
    expected_revision: Option<u64>,
) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("save_manual_group_assignments", "-", e))?;
    controller::save_manual_assignments(
        &DbStore::new(ctx),
        class_id,
        &user_id,
        &assignments,
        expected_revision,
        ctx.timestamp,
    )
    .map(|_| ())
    .map_err(|e| reject("save_manual_group_assignments", &user_id, e))
}

/// getAvailability: evaluate both gates at server time and publish the
/// result to the calling connection only. Students omit `student_id`; the
/// class teacher names the student to check.
#[reducer]
pub fn check_availability(ctx: &ReducerContext, class_id: u64, student_id: Option<String>) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("check_availability", "-", e))?;
    let report = controller::availability_for(
        &DbStore::new(ctx),
        class_id,
        &user_id,
        student_id.as_deref(),
        ctx.timestamp,
    )
    .map_err(|e| reject("check_availability", &user_id, e))?;
    let student_id = student_id.unwrap_or_else(|| user_id.clone());

    let snapshot = AvailabilitySnapshot {
        id: 0,
        connection_id: ctx.sender,
        class_id,
        student_id: student_id.clone(),
        post_test_unlocked: report.post_test_unlocked,
        retention_unlocked: report.retention_unlocked,
        post_test_unlock_at: report.post_test_unlock_at,
        retention_unlock_at: report.retention_unlock_at,
        unlock_at: report.unlock_at(),
        checked_at: ctx.timestamp,
    };
    let existing = ctx
        .db
        .availability_snapshot()
        .connection_id()
        .filter(&ctx.sender)
        .find(|s| s.class_id == class_id && s.student_id == student_id);
    match existing {
        Some(row) => {
            ctx.db.availability_snapshot().id().update(AvailabilitySnapshot { id: row.id, ..snapshot });
        }
        None => {
            ctx.db.availability_snapshot().insert(snapshot);
        }
    }

    log::debug!(
        "[AVAILABILITY] class:{} student:{} by:{} post:{} retention:{} next:{}",
        class_id,
        short_id(&student_id),
        short_id(&user_id),
        report.post_test_unlocked,
        report.retention_unlocked,
        report.unlock_at().map(availability::format_instant).unwrap_or_else(|| "-".to_string())
    );
    Ok(())
}

/// join-session: register presence in a class, optionally in a group
#[reducer]
pub fn join_session(ctx: &ReducerContext, class_id: u64, group_number: Option<u32>) -> Result<(), String> {
    let user_id = caller_user_id(ctx).map_err(|e| reject("join_session", "-", e))?;
    let role = controller::validate_join(&DbStore::new(ctx), class_id, &user_id, group_number)
        .map_err(|e| reject("join_session", &user_id, e))?;

    let row = Participant {
        connection_id: ctx.sender,
        class_id,
        user_id: user_id.clone(),
        role,
        group_number,
        joined_at: ctx.timestamp,
    };
    if ctx.db.participant().connection_id().find(&ctx.sender).is_some() {
        ctx.db.participant().connection_id().update(row);
    } else {
        ctx.db.participant().insert(row);
    }

    log::info!(
        "[JOIN] class:{} user:{} role:{:?} group:{:?}",
        class_id,
        short_id(&user_id),
        role,
        group_number
    );
    Ok(())
}

/// Narrative worker delivers (or fails to deliver) an explanation for a run.
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn submit_rationale(
    ctx: &ReducerContext,
    request_id: u64,
    narrative: Option<String>,
    error: Option<String>,
) -> Result<(), String> {
    require_worker(ctx, "submit_rationale").map_err(|e| reject("submit_rationale", "-", e))?;

    let mut request = ctx
        .db
        .rationale_request()
        .id()
        .find(&request_id)
        .ok_or_else(|| format!("Rationale request {} not found", request_id))?;

    if request.resolved {
        log::debug!("[RATIONALE] request:{} already resolved, ignoring", request_id);
        return Ok(());
    }

    let input = match RationaleInput::from_payload(&request.payload) {
        Ok(input) => input,
        Err(e) => {
            log::error!("[RATIONALE] request:{} unreadable payload, dropping: {}", request_id, e);
            request.resolved = true;
            request.resolved_at = Some(ctx.timestamp);
            request.last_error = Some(format!("unreadable payload: {}", e));
            ctx.db.rationale_request().id().update(request);
            return Ok(());
        }
    };

    let submitted = SubmittedNarrative { narrative: narrative.as_deref(), error: error.as_deref() };
    let rationale = rationale::explain_with_fallback(&submitted, &input);

    if rationale.source == RationaleSource::Narrative {
        if let Some(mut shown) = ctx.db.run_narrative().run_id().find(&request.run_id) {
            shown.text = rationale.text;
            shown.source = RationaleSource::Narrative;
            shown.updated_at = ctx.timestamp;
            ctx.db.run_narrative().run_id().update(shown);
        }
        request.resolved = true;
        request.resolved_at = Some(ctx.timestamp);
        request.last_error = None;
        log::info!("[RATIONALE] run:{} narrative delivered", request.run_id);
    } else {
        // Template stays in place; retry with backoff
        request.attempts = request.attempts.saturating_add(1);
        request.last_error = Some(error.unwrap_or_else(|| "narrative rejected".to_string()));
        if request.attempts >= rationale::MAX_NARRATION_ATTEMPTS {
            request.resolved = true;
            request.resolved_at = Some(ctx.timestamp);
            log::error!(
                "[RATIONALE] run:{} gave up after {} attempts, keeping template",
                request.run_id,
                request.attempts
            );
        } else {
            let backoff_micros = rationale::retry_backoff_minutes(request.attempts) as i64 * 60 * 1_000_000;
            request.next_retry_at = Some(Timestamp::from_micros_since_unix_epoch(
                ctx.timestamp.to_micros_since_unix_epoch() + backoff_micros,
            ));
            log::warn!(
                "[RATIONALE] run:{} attempt {} failed: {:?}",
                request.run_id,
                request.attempts,
                request.last_error
            );
        }
    }
    ctx.db.rationale_request().id().update(request);
    Ok(())
}

/// Administrative reset: class back to the waiting room, groups cleared.
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn admin_reset_class(ctx: &ReducerContext, class_id: u64) -> Result<(), String> {
    require_worker(ctx, "admin_reset_class").map_err(|e| reject("admin_reset_class", "-", e))?;

    let mut class = ctx
        .db
        .class_session()
        .id()
        .find(&class_id)
        .ok_or_else(|| reject("admin_reset_class", "admin", SessionError::ClassNotFound(class_id)))?;

    let from = class.phase;
    class.phase = Phase::INITIAL;
    class.class_ended_at = None;
    class.revision += 1;
    class.updated_at = ctx.timestamp;
    let revision = class.revision;
    ctx.db.class_session().id().update(class);

    let grouped: Vec<StudentProgress> = ctx
        .db
        .student_progress()
        .class_id()
        .filter(&class_id)
        .filter(|p| p.group_number.is_some())
        .collect();
    let cleared = grouped.len();
    for mut progress in grouped {
        progress.group_number = None;
        ctx.db.student_progress().id().update(progress);
    }

    ctx.db.phase_change().insert(PhaseChange {
        id: 0,
        class_id,
        from_phase: from,
        phase: Phase::INITIAL,
        revision,
        changed_at: ctx.timestamp,
        changed_by: "admin".to_string(),
    });

    log::info!("[ADMIN] reset class:{} from:{} groups_cleared:{}", class_id, from, cleared);
    Ok(())
}

/// Scheduled cleanup (every CLEANUP_INTERVAL_SECS):
/// 1. Resolved rationale requests older than the audit window
/// 2. Assignment rows of superseded runs older than the audit window
/// 3. Phase changes older than the audit window (latest per class kept)
/// 4. Presence and availability rows whose connection has no session
#[reducer]
pub fn cleanup_stale_records(ctx: &ReducerContext, _schedule: CleanupSchedule) {
    // Only allow scheduler to call this, not clients
    if ctx.sender != ctx.identity() {
        log::warn!("Client {} attempted to call cleanup_stale_records", ctx.sender);
        return;
    }

    let cutoff = ctx.timestamp.to_micros_since_unix_epoch() - RECORD_RETENTION_DAYS * MICROS_PER_DAY;
    let expired: Vec<u64> = ctx
        .db
        .rationale_request()
        .resolved()
        .filter(&true)
        .filter(|r| {
            r.resolved_at
                .map(|at| at.to_micros_since_unix_epoch() < cutoff)
                .unwrap_or(false)
        })
        .map(|r| r.id)
        .collect();
    for id in &expired {
        ctx.db.rationale_request().id().delete(id);
    }

    let runs: Vec<GroupingRun> = ctx.db.grouping_run().iter().collect();
    let mut stale_assignments = 0;
    for run_id in superseded_runs_before(&runs, cutoff) {
        let ids: Vec<u64> = ctx.db.group_assignment().run_id().filter(&run_id).map(|a| a.id).collect();
        stale_assignments += ids.len();
        for id in &ids {
            ctx.db.group_assignment().id().delete(id);
        }
    }

    let changes: Vec<PhaseChange> = ctx.db.phase_change().iter().collect();
    let old_changes = expired_phase_changes(&changes, cutoff);
    for id in &old_changes {
        ctx.db.phase_change().id().delete(id);
    }

    let orphaned_participants: Vec<Identity> = ctx
        .db
        .participant()
        .iter()
        .filter(|p| ctx.db.session().connection_id().find(&p.connection_id).is_none())
        .map(|p| p.connection_id)
        .collect();
    for conn_id in &orphaned_participants {
        ctx.db.participant().connection_id().delete(conn_id);
    }

    let orphaned_snapshots: Vec<u64> = ctx
        .db
        .availability_snapshot()
        .iter()
        .filter(|s| ctx.db.session().connection_id().find(&s.connection_id).is_none())
        .map(|s| s.id)
        .collect();
    for id in &orphaned_snapshots {
        ctx.db.availability_snapshot().id().delete(id);
    }

    if !expired.is_empty()
        || stale_assignments > 0
        || !old_changes.is_empty()
        || !orphaned_participants.is_empty()
        || !orphaned_snapshots.is_empty()
    {
        log::info!(
            "[CLEANUP] rationale_requests:{} assignments:{} phase_changes:{} participants:{} snapshots:{}",
            expired.len(),
            stale_assignments,
            old_changes.len(),
            orphaned_participants.len(),
            orphaned_snapshots.len()
        );
    }
}
