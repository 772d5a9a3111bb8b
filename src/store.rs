// Repository-style access to class state.
//
// The controller only talks to this trait, so transitions and grouping can
// be exercised against an in-memory store. Inside the module the store is
// the reducer's transaction; every write lands or rolls back together.

use spacetimedb::{ReducerContext, Table};

use crate::{
    class_session, group_assignment, grouping_run, phase_change, rationale_request, run_narrative,
    student_progress,
};
use crate::{
    ClassSession, GroupAssignment, GroupingRun, PhaseChange, RationaleRequest, RunNarrative,
    StudentProgress,
};

pub trait ClassroomStore {
    fn class_session(&self, class_id: u64) -> Option<ClassSession>;

    fn student_progress(&self, class_id: u64, student_id: &str) -> Option<StudentProgress>;

    /// Every enrolled student of a class, completed pre-assessment or not
    fn class_roster(&self, class_id: u64) -> Vec<StudentProgress>;

    fn has_grouping_run(&self, class_id: u64) -> bool;

    fn update_session(&self, session: ClassSession);

    fn update_progress(&self, progress: StudentProgress);

    /// Insert with a fresh id and return the stored row
    fn insert_run(&self, run: GroupingRun) -> GroupingRun;

    fn insert_assignment(&self, assignment: GroupAssignment);

    fn insert_phase_change(&self, change: PhaseChange);

    fn insert_narrative(&self, narrative: RunNarrative);

    fn insert_rationale_request(&self, request: RationaleRequest);
}

/// Store backed by the module database for the current reducer call
pub struct DbStore<'a> {
    ctx: &'a ReducerContext,
}

impl<'a> DbStore<'a> {
    pub fn new(ctx: &'a ReducerContext) -> Self {
        Self { ctx }
    }
}

impl ClassroomStore for DbStore<'_> {
    fn class_session(&self, class_id: u64) -> Option<ClassSession> {
        self.ctx.db.class_session().id().find(&class_id)
    }

    fn student_progress(&self, class_id: u64, student_id: &str) -> Option<StudentProgress> {
        self.ctx
            .db
            .student_progress()
            .class_id()
            .filter(&class_id)
            .find(|p| p.student_id == student_id)
    }

    fn class_roster(&self, class_id: u64) -> Vec<StudentProgress> {
        self.ctx.db.student_progress().class_id().filter(&class_id).collect()
    }

    fn has_grouping_run(&self, class_id: u64) -> bool {
        self.ctx.db.grouping_run().class_id().filter(&class_id).next().is_some()
    }

    fn update_session(&self, session: ClassSession) {
        self.ctx.db.class_session().id().update(session);
    }

    fn update_progress(&self, progress: StudentProgress) {
        self.ctx.db.student_progress().id().update(progress);
    }

    fn insert_run(&self, run: GroupingRun) -> GroupingRun {
        self.ctx.db.grouping_run().insert(run)
    }

    fn insert_assignment(&self, assignment: GroupAssignment) {
        self.ctx.db.group_assignment().insert(assignment);
    }

    fn insert_phase_change(&self, change: PhaseChange) {
        self.ctx.db.phase_change().insert(change);
    }

    fn insert_narrative(&self, narrative: RunNarrative) {
        self.ctx.db.run_narrative().insert(narrative);
    }

    fn insert_rationale_request(&self, request: RationaleRequest) {
        self.ctx.db.rationale_request().insert(request);
    }
}
