// Balanced grouping engine.
//
// Pure batch algorithm: an immutable roster snapshot in, a plan out.
// Identical input always yields identical membership; every tie is broken
// by lowest group index, and score ties by student id.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use spacetimedb::SpacetimeType;
use thiserror::Error;

// ==================== CONSTANTS ====================

/// AI grouping needs enough students for three tiers across several groups
pub const AI_MIN_ROSTER: usize = 8;

/// Small classes are grouped by the teacher (MANUAL mode)
pub const MANUAL_MIN_ROSTER: usize = 3;
pub const MANUAL_MAX_ROSTER: usize = 7;

/// Derived group counts aim for 3-5 members per group
const TARGET_MEMBERS_PER_GROUP: usize = 4;

// ==================== TYPES ====================

#[derive(SpacetimeType, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
    Undisclosed,
}

impl Gender {
    /// Declaration order doubles as the deterministic tie-break order
    pub const ALL: [Gender; 4] = [Gender::Female, Gender::Male, Gender::NonBinary, Gender::Undisclosed];

    fn index(self) -> usize {
        match self {
            Gender::Female => 0,
            Gender::Male => 1,
            Gender::NonBinary => 2,
            Gender::Undisclosed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Female => "female",
            Gender::Male => "male",
            Gender::NonBinary => "non_binary",
            Gender::Undisclosed => "undisclosed",
        }
    }

    pub fn parse(value: &str) -> Option<Gender> {
        match value.trim().to_ascii_lowercase().as_str() {
            "female" | "f" => Some(Gender::Female),
            "male" | "m" => Some(Gender::Male),
            "non_binary" | "nonbinary" | "non-binary" | "nb" => Some(Gender::NonBinary),
            "undisclosed" | "unknown" | "" => Some(Gender::Undisclosed),
            _ => None,
        }
    }
}

#[derive(SpacetimeType, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    Ai,
    Manual,
}

impl GroupingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupingMode::Ai => "ai",
            GroupingMode::Manual => "manual",
        }
    }
}

/// Ability bucket from pre-assessment ranking
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Mid,
    Low,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::High, Tier::Mid, Tier::Low];

    fn index(self) -> usize {
        match self {
            Tier::High => 0,
            Tier::Mid => 1,
            Tier::Low => 2,
        }
    }
}

/// One student in the roster snapshot handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub student_id: String,
    pub gender: Gender,
    /// Percentage 0-100
    pub pretest_score: f32,
}

/// Teacher-chosen placement for one student
#[derive(SpacetimeType, Debug, Clone, PartialEq, Eq)]
pub struct ManualAssignment {
    pub student_id: String,
    pub group_number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    pub high: u32,
    pub mid: u32,
    pub low: u32,
}

impl TierCounts {
    fn bump(&mut self, tier: Tier) {
        match tier {
            Tier::High => self.high += 1,
            Tier::Mid => self.mid += 1,
            Tier::Low => self.low += 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenderCount {
    pub gender: Gender,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupBalance {
    pub group_number: u32,
    pub size: u32,
    pub tiers: TierCounts,
    /// One entry per gender present in the roster, declaration order
    pub genders: Vec<GenderCount>,
    /// Difference between the two largest roster genders is at most 1
    pub balanced: bool,
}

impl GroupBalance {
    pub fn gender_count(&self, gender: Gender) -> u32 {
        self.genders
            .iter()
            .find(|g| g.gender == gender)
            .map(|g| g.count)
            .unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceMetrics {
    pub groups: Vec<GroupBalance>,
    /// Max over genders of (max - min) count across groups. Lower is better.
    pub balance_score: u32,
}

impl BalanceMetrics {
    pub fn all_balanced(&self) -> bool {
        self.groups.iter().all(|g| g.balanced)
    }
}

/// Result of one grouping computation, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingPlan {
    pub mode: GroupingMode,
    /// `groups[k]` holds the student ids of group number `k + 1`
    pub groups: Vec<Vec<String>>,
    pub metrics: BalanceMetrics,
}

impl GroupingPlan {
    pub fn group_count(&self) -> u32 {
        self.groups.len() as u32
    }

    pub fn roster_size(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// (student_id, 1-based group number) pairs in group order
    pub fn assignments(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.groups.iter().enumerate().flat_map(|(k, members)| {
            members.iter().map(move |id| (id.as_str(), k as u32 + 1))
        })
    }

    pub fn group_of(&self, student_id: &str) -> Option<u32> {
        self.assignments()
            .find(|(id, _)| *id == student_id)
            .map(|(_, group)| group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupingError {
    #[error("AI grouping needs at least {required} students who finished the pre-assessment, found {actual}")]
    InsufficientRosterForAi { required: usize, actual: usize },
    #[error("manual grouping needs at least {required} students who finished the pre-assessment, found {actual}")]
    InsufficientRosterForManual { required: usize, actual: usize },
    #[error("manual grouping supports at most {limit} students, found {actual}; use AI grouping")]
    RosterTooLargeForManual { limit: usize, actual: usize },
    #[error("group count must be between 1 and {roster}, got {requested}")]
    InvalidGroupCount { requested: u32, roster: usize },
    #[error("invalid manual assignment: {0}")]
    InvalidManualAssignment(String),
}

// ==================== ENGINE ====================

/// `computeGroups`: validate mode preconditions, tier the roster, plan
/// slots, distribute greedily, then even out gender where the greedy pass
/// left a group lopsided.
pub fn compute_groups(
    roster: &[RosterEntry],
    mode: GroupingMode,
    requested_group_count: Option<u32>,
) -> Result<GroupingPlan, GroupingError> {
    let n = roster.len();
    let group_count = match mode {
        GroupingMode::Ai => {
            if n < AI_MIN_ROSTER {
                return Err(GroupingError::InsufficientRosterForAi { required: AI_MIN_ROSTER, actual: n });
            }
            match requested_group_count {
                Some(requested) if requested == 0 || requested as usize > n => {
                    return Err(GroupingError::InvalidGroupCount { requested, roster: n });
                }
                Some(requested) => requested as usize,
                None => derived_group_count(n),
            }
        }
        GroupingMode::Manual => {
            if n < MANUAL_MIN_ROSTER {
                return Err(GroupingError::InsufficientRosterForManual { required: MANUAL_MIN_ROSTER, actual: n });
            }
            if n > MANUAL_MAX_ROSTER {
                return Err(GroupingError::RosterTooLargeForManual { limit: MANUAL_MAX_ROSTER, actual: n });
            }
            if let Some(requested) = requested_group_count {
                log::debug!("[GROUPS] manual suggestion ignores requested count:{}", requested);
            }
            derived_group_count(n)
        }
    };

    let ranked = rank_roster(roster);
    let tiers = assign_tiers(&ranked, n);
    let capacities = group_capacities(n, group_count);
    let mut members = distribute(roster, &ranked, &tiers, &capacities);
    repair_gender_balance(roster, &tiers, &mut members);

    Ok(build_plan(roster, &tiers, mode, members))
}

/// Validate a teacher's placement and measure it like a computed plan.
///
/// Every assigned student must be in the roster exactly once, and group
/// numbers must cover 1..=max without gaps.
pub fn manual_plan(roster: &[RosterEntry], assignments: &[ManualAssignment]) -> Result<GroupingPlan, GroupingError> {
    if assignments.is_empty() {
        return Err(GroupingError::InvalidManualAssignment("no students assigned".to_string()));
    }

    let position: HashMap<&str, usize> = roster
        .iter()
        .enumerate()
        .map(|(i, entry)| (entry.student_id.as_str(), i))
        .collect();

    let mut seen = HashSet::new();
    let mut group_count = 0u32;
    for assignment in assignments {
        if !position.contains_key(assignment.student_id.as_str()) {
            return Err(GroupingError::InvalidManualAssignment(format!(
                "student {} is not enrolled or has not finished the pre-assessment",
                assignment.student_id
            )));
        }
        if !seen.insert(assignment.student_id.as_str()) {
            return Err(GroupingError::InvalidManualAssignment(format!(
                "student {} is assigned more than once",
                assignment.student_id
            )));
        }
        if assignment.group_number == 0 {
            return Err(GroupingError::InvalidManualAssignment(format!(
                "student {} has group number 0; groups start at 1",
                assignment.student_id
            )));
        }
        group_count = group_count.max(assignment.group_number);
    }

    let ranked = rank_roster(roster);
    let tiers = assign_tiers(&ranked, roster.len());
    let rank_of: HashMap<usize, usize> = ranked.iter().enumerate().map(|(rank, &i)| (i, rank)).collect();

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); group_count as usize];
    for assignment in assignments {
        let i = position[assignment.student_id.as_str()];
        members[assignment.group_number as usize - 1].push(i);
    }
    if let Some(empty) = members.iter().position(Vec::is_empty) {
        return Err(GroupingError::InvalidManualAssignment(format!("group {} has no students", empty + 1)));
    }
    // Stable member order regardless of how the client listed them
    for group in &mut members {
        group.sort_by_key(|i| rank_of[i]);
    }

    Ok(build_plan(roster, &tiers, GroupingMode::Manual, members))
}

/// Group count targeting 3-5 members: round(n / 4), at least 1
pub fn derived_group_count(roster_size: usize) -> usize {
    ((roster_size + TARGET_MEMBERS_PER_GROUP / 2) / TARGET_MEMBERS_PER_GROUP).max(1)
}

/// Even slot plan: every group holds floor(n/g) or ceil(n/g) students,
/// the larger groups first.
pub fn group_capacities(roster_size: usize, group_count: usize) -> Vec<usize> {
    if group_count == 0 {
        return Vec::new();
    }
    let base = roster_size / group_count;
    let extra = roster_size % group_count;
    (0..group_count).map(|k| base + usize::from(k < extra)).collect()
}

/// Roster indices by pretest score descending, student id ascending on ties
fn rank_roster(roster: &[RosterEntry]) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..roster.len()).collect();
    ranked.sort_by(|&a, &b| {
        roster[b]
            .pretest_score
            .total_cmp(&roster[a].pretest_score)
            .then_with(|| roster[a].student_id.cmp(&roster[b].student_id))
    });
    ranked
}

/// Top third High, bottom third Low, remainder Mid so small rosters never
/// leave the outer tiers lopsided. Indexed by roster position.
fn assign_tiers(ranked: &[usize], n: usize) -> Vec<Tier> {
    let third = n / 3;
    let mut tiers = vec![Tier::Mid; n];
    for (rank, &i) in ranked.iter().enumerate() {
        tiers[i] = if rank < third {
            Tier::High
        } else if rank >= n - third {
            Tier::Low
        } else {
            Tier::Mid
        };
    }
    tiers
}

/// Round-robin across gender buckets, largest bucket first. With two
/// genders this alternates them; rank order is kept inside each bucket.
fn interleave_by_gender(roster: &[RosterEntry], members: &[usize]) -> Vec<usize> {
    let mut buckets: Vec<VecDeque<usize>> = Gender::ALL
        .iter()
        .map(|&gender| members.iter().copied().filter(|&i| roster[i].gender == gender).collect())
        .collect();
    buckets.retain(|bucket| !bucket.is_empty());
    // Stable sort keeps declaration order between equal-sized buckets
    buckets.sort_by(|a, b| b.len().cmp(&a.len()));

    let mut order = Vec::with_capacity(members.len());
    while order.len() < members.len() {
        for bucket in &mut buckets {
            if let Some(i) = bucket.pop_front() {
                order.push(i);
            }
        }
    }
    order
}

/// Greedy placement: High, then Mid, then Low. Each student goes to the
/// open group with the fewest of their tier, then fewest of their gender,
/// then lowest index.
fn distribute(roster: &[RosterEntry], ranked: &[usize], tiers: &[Tier], capacities: &[usize]) -> Vec<Vec<usize>> {
    let group_count = capacities.len();
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); group_count];
    let mut tier_counts = vec![[0usize; 3]; group_count];
    let mut gender_counts = vec![[0usize; 4]; group_count];

    for tier in Tier::ALL {
        let tier_members: Vec<usize> = ranked.iter().copied().filter(|&i| tiers[i] == tier).collect();
        for i in interleave_by_gender(roster, &tier_members) {
            let gender = roster[i].gender.index();
            let target = (0..group_count)
                .filter(|&k| members[k].len() < capacities[k])
                .min_by_key(|&k| (tier_counts[k][tier.index()], gender_counts[k][gender], k));
            // Capacities sum to the roster size, so an open group always exists
            if let Some(k) = target {
                members[k].push(i);
                tier_counts[k][tier.index()] += 1;
                gender_counts[k][gender] += 1;
            }
        }
    }
    members
}

/// Swap students between groups until no group's count of the two largest
/// roster genders differs by more than one, as far as the roster allows.
///
/// The lowest-index lopsided group trades a student of its surplus gender
/// for one of the other gender from the partner group leaning furthest the
/// other way. Same-tier trades are preferred so tier counts stay put; a
/// cross-tier trade is made only when no partner has a same-tier candidate.
/// Every trade lowers the summed imbalance by at least two, so the loop terminates.
fn repair_gender_balance(roster: &[RosterEntry], tiers: &[Tier], members: &mut [Vec<usize>]) {
    let Some((first, second)) = primary_gender_pair(roster) else {
        return;
    };
    let lean = |group: &[usize]| -> i64 {
        group
            .iter()
            .map(|&i| match roster[i].gender {
                g if g == first => 1,
                g if g == second => -1,
                _ => 0,
            })
            .sum()
    };

    loop {
        let leans: Vec<i64> = members.iter().map(|group| lean(group.as_slice())).collect();
        let Some(lopsided) = (0..members.len()).find(|&k| leans[k].abs() >= 2) else {
            break;
        };
        let direction = leans[lopsided].signum();
        let (surplus, deficit) = if direction > 0 { (first, second) } else { (second, first) };

        let mut partners: Vec<usize> = (0..members.len()).filter(|&k| leans[k] * direction < 0).collect();
        partners.sort_by_key(|&k| (leans[k] * direction, k));

        let Some((partner, x, y)) = find_trade(roster, tiers, members, lopsided, &partners, surplus, deficit) else {
            // Nothing leans the other way: the roster itself is uneven
            break;
        };
        let moved = members[lopsided][x];
        members[lopsided][x] = members[partner][y];
        members[partner][y] = moved;
    }
}

/// (partner group, slot in the lopsided group, slot in the partner group)
fn find_trade(
    roster: &[RosterEntry],
    tiers: &[Tier],
    members: &[Vec<usize>],
    lopsided: usize,
    partners: &[usize],
    surplus: Gender,
    deficit: Gender,
) -> Option<(usize, usize, usize)> {
    let mut fallback = None;
    for &partner in partners {
        for (x, &i) in members[lopsided].iter().enumerate() {
            if roster[i].gender != surplus {
                continue;
            }
            for (y, &j) in members[partner].iter().enumerate() {
                if roster[j].gender != deficit {
                    continue;
                }
                if tiers[i] == tiers[j] {
                    return Some((partner, x, y));
                }
                if fallback.is_none() {
                    fallback = Some((partner, x, y));
                }
            }
        }
    }
    fallback
}

/// The two most common genders in the roster, declaration order on ties
fn primary_gender_pair(roster: &[RosterEntry]) -> Option<(Gender, Gender)> {
    let mut counts = [0usize; 4];
    for entry in roster {
        counts[entry.gender.index()] += 1;
    }
    let mut present: Vec<Gender> = Gender::ALL.iter().copied().filter(|g| counts[g.index()] > 0).collect();
    // Stable sort keeps declaration order between equal counts
    present.sort_by(|a, b| counts[b.index()].cmp(&counts[a.index()]));
    match present.as_slice() {
        [first, second, ..] => Some((*first, *second)),
        _ => None,
    }
}

fn build_plan(roster: &[RosterEntry], tiers: &[Tier], mode: GroupingMode, members: Vec<Vec<usize>>) -> GroupingPlan {
    let metrics = measure(roster, tiers, &members);
    let groups = members
        .into_iter()
        .map(|group| group.into_iter().map(|i| roster[i].student_id.clone()).collect())
        .collect();
    GroupingPlan { mode, groups, metrics }
}

/// Per-group tier and gender counts plus the overall balance score
fn measure(roster: &[RosterEntry], tiers: &[Tier], members: &[Vec<usize>]) -> BalanceMetrics {
    let mut roster_genders = [0usize; 4];
    for entry in roster {
        roster_genders[entry.gender.index()] += 1;
    }
    let present: Vec<Gender> = Gender::ALL
        .iter()
        .copied()
        .filter(|g| roster_genders[g.index()] > 0)
        .collect();

    // The two largest roster genders decide per-group balance
    let primary_pair = primary_gender_pair(roster);

    let groups: Vec<GroupBalance> = members
        .iter()
        .enumerate()
        .map(|(k, group)| {
            let mut tier_counts = TierCounts::default();
            let mut counts = [0u32; 4];
            for &i in group {
                tier_counts.bump(tiers[i]);
                counts[roster[i].gender.index()] += 1;
            }
            let balanced = match primary_pair {
                Some((a, b)) => counts[a.index()].abs_diff(counts[b.index()]) <= 1,
                None => true,
            };
            GroupBalance {
                group_number: k as u32 + 1,
                size: group.len() as u32,
                tiers: tier_counts,
                genders: present
                    .iter()
                    .map(|&gender| GenderCount { gender, count: counts[gender.index()] })
                    .collect(),
                balanced,
            }
        })
        .collect();

    let balance_score = present
        .iter()
        .map(|&gender| {
            let counts = groups.iter().map(|g| g.gender_count(gender));
            let max = counts.clone().max().unwrap_or(0);
            let min = counts.min().unwrap_or(0);
            max - min
        })
        .max()
        .unwrap_or(0);

    BalanceMetrics { groups, balance_score }
}
