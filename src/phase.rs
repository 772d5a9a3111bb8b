// Class phase graph and the per-student phase resolver.
//
// The stored machine only knows four phases. PretestGate and Ended are
// never stored: they are derived per student from their own progress.

use std::fmt;

use spacetimedb::SpacetimeType;

use crate::StudentProgress;

/// Class-wide lifecycle stage stored on `ClassSession`
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    WaitingRoom,
    MainSession,
    GroupSession,
    Posttest,
}

impl Phase {
    /// Phase every class starts in
    pub const INITIAL: Phase = Phase::WaitingRoom;

    pub const ALL: [Phase; 4] = [
        Phase::WaitingRoom,
        Phase::MainSession,
        Phase::GroupSession,
        Phase::Posttest,
    ];

    /// Direct successors a teacher may move the class to.
    /// Posttest is terminal; only an admin reset leaves it.
    pub fn successors(self) -> &'static [Phase] {
        match self {
            Phase::WaitingRoom => &[Phase::MainSession],
            Phase::MainSession => &[Phase::GroupSession, Phase::Posttest],
            Phase::GroupSession => &[Phase::MainSession],
            Phase::Posttest => &[],
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        self.successors().contains(&next)
    }

    /// Grouping (computed or manual) is only meaningful around the group phase
    pub fn allows_grouping(self) -> bool {
        matches!(self, Phase::MainSession | Phase::GroupSession)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::WaitingRoom => "waiting_room",
            Phase::MainSession => "main_session",
            Phase::GroupSession => "group_session",
            Phase::Posttest => "posttest",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase a specific student should observe after per-student overrides
#[derive(SpacetimeType, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectivePhase {
    PretestGate,
    WaitingRoom,
    MainSession,
    GroupSession,
    Posttest,
    Ended,
}

impl From<Phase> for EffectivePhase {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::WaitingRoom => EffectivePhase::WaitingRoom,
            Phase::MainSession => EffectivePhase::MainSession,
            Phase::GroupSession => EffectivePhase::GroupSession,
            Phase::Posttest => EffectivePhase::Posttest,
        }
    }
}

impl EffectivePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectivePhase::PretestGate => "pretest_gate",
            EffectivePhase::WaitingRoom => "waiting_room",
            EffectivePhase::MainSession => "main_session",
            EffectivePhase::GroupSession => "group_session",
            EffectivePhase::Posttest => "posttest",
            EffectivePhase::Ended => "ended",
        }
    }
}

/// Resolve the phase a student sees.
///
/// 1. No completed pre-assessment: `PretestGate`, whatever the class is doing.
/// 2. Class in post-test and this student already took it: `Ended`.
/// 3. Otherwise the class phase unchanged.
///
/// Pure function of stored state; callers re-run it on every phase change
/// and on reconnect instead of caching the result.
pub fn resolve(session_phase: Phase, progress: &StudentProgress) -> EffectivePhase {
    if progress.pretest_completed_at.is_none() {
        return EffectivePhase::PretestGate;
    }
    if session_phase == Phase::Posttest && progress.posttest_completed_at.is_some() {
        return EffectivePhase::Ended;
    }
    session_phase.into()
}
