// Bulk roster import for the roster-sync worker
// Accepts JSON arrays exported by the school's roster system

use serde_json::Value;
use spacetimedb::{reducer, ReducerContext, Table, Timestamp};

use crate::grouping::Gender;
use crate::{class_session, student_progress};
use crate::{find_progress, is_authorized_worker, upsert_enrollment};

/// One roster row: {"studentId": "...", "gender": "f", "pretestScore": 72.5,
/// "pretestCompletedAt": {"__timestamp_micros_since_unix_epoch__": "..."}}
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RosterRow {
    pub student_id: String,
    pub gender: Gender,
    pub pretest: Option<(f32, Option<Timestamp>)>,
}

/// Parse Timestamp from SDK JSON format: {"__timestamp_micros_since_unix_epoch__": "123456"}
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    let micros: i64 = match val.get("__timestamp_micros_since_unix_epoch__") {
        Some(Value::String(s)) => s.parse().map_err(|e| format!("Invalid timestamp micros: {}", e))?,
        Some(Value::Number(n)) => n.as_i64().ok_or("Invalid timestamp micros")?,
        _ => return Err("Missing or invalid timestamp field".to_string()),
    };
    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

fn parse_row(i: usize, val: &Value) -> Result<RosterRow, String> {
    let student_id = val
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(format!("Row {}: missing studentId", i))?
        .to_string();

    let gender_raw = val.get("gender").and_then(|v| v.as_str()).unwrap_or("");
    let gender = Gender::parse(gender_raw).ok_or(format!("Row {}: unknown gender '{}'", i, gender_raw))?;

    let pretest = match val.get("pretestScore") {
        None | Some(Value::Null) => None,
        Some(score) => {
            let score = score.as_f64().ok_or(format!("Row {}: pretestScore must be a number", i))? as f32;
            if !score.is_finite() || !(0.0..=100.0).contains(&score) {
                return Err(format!("Row {}: pretestScore must be 0-100", i));
            }
            let completed_at = val
                .get("pretestCompletedAt")
                .filter(|v| !v.is_null())
                .map(parse_timestamp_json)
                .transpose()
                .map_err(|e| format!("Row {}: {}", i, e))?;
            Some((score, completed_at))
        }
    };

    Ok(RosterRow { student_id, gender, pretest })
}

/// Parse the whole document before touching any table
pub(crate) fn parse_roster(json_data: &str) -> Result<Vec<RosterRow>, String> {
    let data: Value = serde_json::from_str(json_data).map_err(|e| format!("Invalid JSON: {}", e))?;
    let rows = data.as_array().ok_or("Expected JSON array of students")?;

    let parsed = rows
        .iter()
        .enumerate()
        .map(|(i, row)| parse_row(i, row))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = parsed.iter().find(|r| !seen.insert(r.student_id.as_str())) {
        return Err(format!("Duplicate studentId '{}'", dup.student_id));
    }
    Ok(parsed)
}

/// Bulk enroll students (and optionally their pre-assessment results)
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_enroll_students(ctx: &ReducerContext, class_id: u64, json_data: String) -> Result<(), String> {
    if !is_authorized_worker(ctx) {
        log::warn!("Unauthorized bulk_enroll_students attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let class = ctx
        .db
        .class_session()
        .id()
        .find(&class_id)
        .ok_or(format!("Class {} not found", class_id))?;

    let rows = parse_roster(&json_data)?;
    if let Some(row) = rows.iter().find(|r| r.student_id == class.teacher_id) {
        return Err(format!("Student '{}' is the class teacher", row.student_id));
    }

    let mut created = 0;
    let mut pretests = 0;
    for row in &rows {
        if upsert_enrollment(ctx, class_id, &row.student_id, row.gender) {
            created += 1;
        }

        // Scores already recorded by the assessment service win
        let Some((score, completed_at)) = row.pretest else { continue };
        if let Some(mut progress) = find_progress(ctx, class_id, &row.student_id) {
            if progress.pretest_completed_at.is_none() {
                progress.pretest_score = Some(score);
                progress.pretest_completed_at = Some(completed_at.unwrap_or(ctx.timestamp));
                ctx.db.student_progress().id().update(progress);
                pretests += 1;
            }
        }
    }

    log::info!(
        "[ENROLL] bulk class:{} rows:{} new:{} pretests:{}",
        class_id,
        rows.len(),
        created,
        pretests
    );
    Ok(())
}
