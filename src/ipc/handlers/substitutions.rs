use crate::calendar::{self, WorkingDay};
use crate::engine::{self, Criteria, LessonPlan, RankedCandidate, ScheduleIndex, ScheduleRow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>, details: Option<serde_json::Value>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details,
    }
}

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: impl ToString) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(format!("missing {}", key), None))
}

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        bad_params(
            format!("{} must be YYYY-MM-DD", field),
            Some(json!({ "value": raw })),
        )
    })
}

fn parse_criteria(params: &serde_json::Value) -> Result<Criteria, HandlerErr> {
    let mut criteria = Criteria::default();
    let Some(names) = params.get("criteria") else {
        return Ok(criteria);
    };
    let Some(names) = names.as_array() else {
        return Err(bad_params("criteria must be an array of strings", None));
    };
    for v in names {
        let Some(name) = v.as_str() else {
            return Err(bad_params("criteria must be an array of strings", None));
        };
        if !criteria.enable(name) {
            return Err(bad_params(
                "unknown criterion",
                Some(json!({ "criterion": name })),
            ));
        }
    }
    Ok(criteria)
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Lazy expiry: any active substitution that ended before today is
/// flipped inactive on the next read. No background job exists.
fn expire_stale(conn: &Connection, today: NaiveDate) -> Result<usize, HandlerErr> {
    conn.execute(
        "UPDATE substitutions SET is_active = 0 WHERE is_active = 1 AND end_date < ?",
        [today.to_string()],
    )
    .map_err(|e| db_err("db_update_failed", e))
}

fn timetable_exists(conn: &Connection, timetable_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM timetables WHERE id = ?",
        [timetable_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

/// Bulk read of the whole timetable, in day/period display order. The
/// engine runs on this snapshot; no further reads happen inside the
/// scoring loop.
fn load_schedule_rows(
    conn: &Connection,
    timetable_id: &str,
) -> Result<Vec<ScheduleRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.class_name, e.subject, e.teacher_key,
                    e.day_id, d.name, d.weekday,
                    e.period_id, p.number
             FROM schedule_entries e
             JOIN timetable_days d ON d.id = e.day_id
             JOIN timetable_periods p ON p.id = e.period_id
             WHERE e.timetable_id = ?
             ORDER BY d.sort_order, p.number, e.class_name, e.id",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    stmt.query_map([timetable_id], |r| {
        Ok(ScheduleRow {
            teacher_key: r.get(3)?,
            lesson: engine::Lesson {
                entry_id: r.get(0)?,
                class_name: r.get(1)?,
                subject: r.get(2)?,
                day_id: r.get(4)?,
                day_name: r.get(5)?,
                weekday: r.get::<_, Option<i64>>(6)?.map(|w| w as u32),
                period_id: r.get(7)?,
                period_number: r.get(8)?,
            },
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_err("db_query_failed", e))
}

fn load_mappings(
    conn: &Connection,
    timetable_id: &str,
) -> Result<HashMap<String, Option<String>>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT teacher_key, teacher_id FROM teacher_mappings WHERE timetable_id = ?")
        .map_err(|e| db_err("db_query_failed", e))?;
    stmt.query_map([timetable_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
    })
    .and_then(|it| it.collect())
    .map_err(|e| db_err("db_query_failed", e))
}

#[derive(Debug, Default, Clone)]
struct WorkloadFacts {
    count: i64,
    busy_slots: HashSet<(String, String)>,
}

/// Current substitution load per concrete teacher, recomputed on every
/// request. A dated assignment counts when its date falls inside the
/// window; an undated one counts when its substitution's range overlaps
/// it. Without a usable window every active non-expired assignment
/// counts.
fn load_workloads(
    conn: &Connection,
    window: Option<(NaiveDate, NaiveDate)>,
    today: NaiveDate,
) -> Result<HashMap<String, WorkloadFacts>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT a.substitute_teacher_id, a.day_id, a.period_id, a.date,
                    s.start_date, s.end_date
             FROM substitution_assignments a
             JOIN substitutions s ON s.id = a.substitution_id
             WHERE s.is_active = 1 AND s.end_date >= ?",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([today.to_string()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut out: HashMap<String, WorkloadFacts> = HashMap::new();
    for (teacher_id, day_id, period_id, date, sub_start, sub_end) in rows {
        // Stored dates are written by us; unparsable rows are skipped
        // rather than poisoning the whole calculation.
        let Ok(sub_start) = NaiveDate::parse_from_str(&sub_start, "%Y-%m-%d") else {
            continue;
        };
        let Ok(sub_end) = NaiveDate::parse_from_str(&sub_end, "%Y-%m-%d") else {
            continue;
        };
        let overlaps = window
            .map(|(ws, we)| sub_start <= we && sub_end >= ws)
            .unwrap_or(true);
        let counts = match (window, date.as_str()) {
            (None, _) => true,
            (Some((ws, we)), d) if !d.is_empty() => NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map(|d| ws <= d && d <= we)
                .unwrap_or(false),
            (Some(_), _) => overlaps,
        };

        let facts = out.entry(teacher_id).or_default();
        if counts {
            facts.count += 1;
        }
        if overlaps {
            facts.busy_slots.insert((day_id, period_id));
        }
    }
    Ok(out)
}

/// Builds the schedule index for one absence and attaches mappings plus
/// persisted workload facts to each candidate.
fn build_index(
    conn: &Connection,
    timetable_id: &str,
    absent_teacher_key: &str,
    window: Option<(NaiveDate, NaiveDate)>,
) -> Result<ScheduleIndex, HandlerErr> {
    let rows = load_schedule_rows(conn, timetable_id)?;
    let mut index = ScheduleIndex::build(&rows, absent_teacher_key);
    let mappings = load_mappings(conn, timetable_id)?;
    let workloads = load_workloads(conn, window, today())?;
    for (key, stats) in index.candidates.iter_mut() {
        let Some(Some(teacher_id)) = mappings.get(key) else {
            continue;
        };
        stats.teacher_id = Some(teacher_id.clone());
        if let Some(facts) = workloads.get(teacher_id) {
            stats.substitution_count = facts.count;
            stats.busy_slots = facts.busy_slots.clone();
        }
    }
    Ok(index)
}

fn candidate_json(c: &RankedCandidate) -> serde_json::Value {
    json!({
        "teacherKey": c.teacher_key,
        "teacherId": c.teacher_id,
        "score": c.breakdown.total(),
        "breakdown": {
            "sameSubject": c.breakdown.same_subject,
            "fewestClasses": c.breakdown.fewest_classes,
            "fewestSubstitutions": c.breakdown.fewest_substitutions,
        },
        "weeklyLessonCount": c.weekly_lessons,
        "substitutionCount": c.substitution_count,
    })
}

fn lesson_json(plan: &LessonPlan) -> serde_json::Value {
    let lesson = &plan.lesson;
    json!({
        "scheduleEntry": {
            "id": lesson.entry_id,
            "className": lesson.class_name,
            "subject": lesson.subject,
            "dayId": lesson.day_id,
            "dayName": lesson.day_name,
            "periodId": lesson.period_id,
            "periodNumber": lesson.period_number,
        },
        "primary": plan.primary.as_ref().map(candidate_json),
        "alternates": plan.alternates.iter().map(candidate_json).collect::<Vec<_>>(),
    })
}

fn working_day_json(day: &WorkingDay) -> serde_json::Value {
    json!({
        "date": day.date.to_string(),
        "weekday": day.weekday,
        "name": day.name,
    })
}

fn substitutions_calculate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let absent_teacher_key = get_required_str(params, "absentTeacherKey")?;
    let criteria = parse_criteria(params)?;

    let start_raw = params.get("startDate").and_then(|v| v.as_str());
    let end_raw = params.get("endDate").and_then(|v| v.as_str());
    let window = match (start_raw, end_raw) {
        (None, None) => None,
        (Some(s), Some(e)) => Some((parse_date(s, "startDate")?, parse_date(e, "endDate")?)),
        _ => {
            return Err(bad_params(
                "startDate and endDate must be given together",
                None,
            ))
        }
    };

    if !timetable_exists(conn, &timetable_id)? {
        return Err(not_found("timetable not found"));
    }

    let index = build_index(conn, &timetable_id, &absent_teacher_key, window)?;
    let plans = engine::plan_lessons(&index, criteria);
    let lessons: Vec<serde_json::Value> = plans.iter().map(lesson_json).collect();

    let Some((start, end)) = window else {
        return Ok(json!({ "lessons": lessons }));
    };

    let working_days = calendar::resolve_working_days(start, end).map_err(|e| HandlerErr {
        code: "invalid_range",
        message: e.to_string(),
        details: None,
    })?;
    let expansion = engine::expand_plans(&plans, &working_days);

    let by_entry: HashMap<&str, &LessonPlan> = plans
        .iter()
        .map(|p| (p.lesson.entry_id.as_str(), p))
        .collect();
    let expanded: Vec<serde_json::Value> = expansion
        .dated
        .iter()
        .filter_map(|dated| by_entry.get(dated.entry_id.as_str()).map(|p| (dated, p)))
        .map(|(dated, plan)| {
            let mut entry = lesson_json(plan);
            entry["date"] = json!(dated.date.to_string());
            entry
        })
        .collect();

    Ok(json!({
        "lessons": lessons,
        "workingDays": working_days.iter().map(working_day_json).collect::<Vec<_>>(),
        "expanded": expanded,
        "diagnostics": expansion.skipped,
    }))
}

struct AssignmentInput {
    schedule_entry_id: String,
    substitute_teacher_id: String,
    day_id: String,
    period_id: String,
    date: String,
}

fn parse_assignments(params: &serde_json::Value) -> Result<Vec<AssignmentInput>, HandlerErr> {
    let Some(list) = params.get("assignments").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing assignments", None));
    };
    let mut out = Vec::new();
    for (i, a) in list.iter().enumerate() {
        let field = |key: &str| -> Result<String, HandlerErr> {
            a.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    bad_params(
                        format!("assignment missing {}", key),
                        Some(json!({ "index": i })),
                    )
                })
        };
        let date = match a.get("date") {
            None => String::new(),
            Some(v) if v.is_null() => String::new(),
            Some(v) => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| bad_params("assignment date must be string or null", None))?;
                parse_date(raw, "assignment date")?.to_string()
            }
        };
        out.push(AssignmentInput {
            schedule_entry_id: field("scheduleEntryId")?,
            substitute_teacher_id: field("substituteTeacherId")?,
            day_id: field("dayId")?,
            period_id: field("periodId")?,
            date,
        });
    }
    Ok(out)
}

fn substitutions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let absent_teacher_key = get_required_str(params, "absentTeacherKey")?;
    let absent_teacher_name = get_required_str(params, "absentTeacherName")?;
    let start = parse_date(&get_required_str(params, "startDate")?, "startDate")?;
    let end = parse_date(&get_required_str(params, "endDate")?, "endDate")?;
    if start > end {
        return Err(bad_params(
            "startDate must not be after endDate",
            Some(json!({ "startDate": start.to_string(), "endDate": end.to_string() })),
        ));
    }
    let criteria = parse_criteria(params)?;
    let assignments = parse_assignments(params)?;

    if !timetable_exists(conn, &timetable_id)? {
        return Err(not_found("timetable not found"));
    }

    // Every submitted assignment must name a known substitute teacher and
    // a lesson of this timetable; an unmapped candidate cannot be
    // persisted.
    for a in &assignments {
        if !teacher_exists(conn, &a.substitute_teacher_id)? {
            return Err(bad_params(
                "substituteTeacherId references no teacher",
                Some(json!({ "substituteTeacherId": a.substitute_teacher_id })),
            ));
        }
        let entry_ok = conn
            .query_row(
                "SELECT 1 FROM schedule_entries WHERE id = ? AND timetable_id = ?",
                (&a.schedule_entry_id, &timetable_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?
            .is_some();
        if !entry_ok {
            return Err(bad_params(
                "scheduleEntryId references no lesson of this timetable",
                Some(json!({ "scheduleEntryId": a.schedule_entry_id })),
            ));
        }
    }

    // Resolve the absent teacher's concrete identity; may be unmapped.
    let absent_teacher_id: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM teacher_mappings WHERE timetable_id = ? AND teacher_key = ?",
            (&timetable_id, &absent_teacher_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .flatten();

    // Dedup by the booking key; the first occurrence wins, later
    // duplicates are silently dropped.
    let mut seen: HashSet<(String, String, String, String)> = HashSet::new();
    let mut unique = Vec::new();
    let submitted = assignments.len();
    for a in assignments {
        let key = (
            a.substitute_teacher_id.clone(),
            a.day_id.clone(),
            a.period_id.clone(),
            a.date.clone(),
        );
        if seen.insert(key) {
            unique.push(a);
        }
    }

    let substitution_id = Uuid::new_v4().to_string();
    let criteria_json =
        serde_json::to_string(&criteria.names()).map_err(|e| db_err("db_insert_failed", e))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO substitutions(
            id, timetable_id, absent_teacher_key, absent_teacher_name,
            absent_teacher_id, start_date, end_date, criteria, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &substitution_id,
            &timetable_id,
            &absent_teacher_key,
            &absent_teacher_name,
            &absent_teacher_id,
            start.to_string(),
            end.to_string(),
            &criteria_json,
        ),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;

    let mut inserted = Vec::new();
    for a in &unique {
        let assignment_id = Uuid::new_v4().to_string();
        let result = tx.execute(
            "INSERT INTO substitution_assignments(
                id, substitution_id, schedule_entry_id, substitute_teacher_id,
                day_id, period_id, date)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &assignment_id,
                &substitution_id,
                &a.schedule_entry_id,
                &a.substitute_teacher_id,
                &a.day_id,
                &a.period_id,
                &a.date,
            ),
        );
        if let Err(e) = result {
            // The unique index is the commit-time backstop behind the
            // dedup above; a violation aborts the whole create.
            let _ = tx.rollback();
            let code = match &e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    "duplicate_assignment"
                }
                _ => "db_insert_failed",
            };
            return Err(db_err(code, e));
        }
        inserted.push((assignment_id, a));
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    // Payload for the external notification dispatcher.
    let mut notification_entries = Vec::new();
    for (_, a) in &inserted {
        let summary: Option<(String, String, String, i64)> = conn
            .query_row(
                "SELECT e.class_name, e.subject, d.name, p.number
                 FROM schedule_entries e
                 JOIN timetable_days d ON d.id = e.day_id
                 JOIN timetable_periods p ON p.id = e.period_id
                 WHERE e.id = ?",
                [&a.schedule_entry_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?;
        let mut entry = json!({ "substituteTeacherId": a.substitute_teacher_id });
        if let Some((class_name, subject, day_name, period_number)) = summary {
            entry["className"] = json!(class_name);
            entry["subject"] = json!(subject);
            entry["dayName"] = json!(day_name);
            entry["periodNumber"] = json!(period_number);
        }
        if !a.date.is_empty() {
            entry["date"] = json!(a.date);
        }
        notification_entries.push(entry);
    }

    Ok(json!({
        "substitutionId": substitution_id,
        "assignmentCount": inserted.len(),
        "duplicatesDropped": submitted - inserted.len(),
        "assignmentIds": inserted.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(),
        "notification": {
            "absentTeacherKey": absent_teacher_key,
            "absentTeacherId": absent_teacher_id,
            "entries": notification_entries,
        },
    }))
}

fn substitution_json(conn: &Connection, row: SubstitutionRow) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, schedule_entry_id, substitute_teacher_id, day_id, period_id, date
             FROM substitution_assignments
             WHERE substitution_id = ?
             ORDER BY day_id, period_id, date, id",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let assignments = stmt
        .query_map([&row.id], |r| {
            let date: String = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "scheduleEntryId": r.get::<_, String>(1)?,
                "substituteTeacherId": r.get::<_, String>(2)?,
                "dayId": r.get::<_, String>(3)?,
                "periodId": r.get::<_, String>(4)?,
                "date": if date.is_empty() { serde_json::Value::Null } else { json!(date) },
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let criteria: serde_json::Value =
        serde_json::from_str(&row.criteria).unwrap_or_else(|_| json!([]));
    Ok(json!({
        "id": row.id,
        "timetableId": row.timetable_id,
        "absentTeacherKey": row.absent_teacher_key,
        "absentTeacherName": row.absent_teacher_name,
        "absentTeacherId": row.absent_teacher_id,
        "startDate": row.start_date,
        "endDate": row.end_date,
        "criteria": criteria,
        "isActive": row.is_active,
        "assignments": assignments,
    }))
}

struct SubstitutionRow {
    id: String,
    timetable_id: String,
    absent_teacher_key: String,
    absent_teacher_name: String,
    absent_teacher_id: Option<String>,
    start_date: String,
    end_date: String,
    criteria: String,
    is_active: bool,
}

fn read_substitution_row(r: &rusqlite::Row) -> rusqlite::Result<SubstitutionRow> {
    Ok(SubstitutionRow {
        id: r.get(0)?,
        timetable_id: r.get(1)?,
        absent_teacher_key: r.get(2)?,
        absent_teacher_name: r.get(3)?,
        absent_teacher_id: r.get(4)?,
        start_date: r.get(5)?,
        end_date: r.get(6)?,
        criteria: r.get(7)?,
        is_active: r.get::<_, i64>(8)? != 0,
    })
}

const SUBSTITUTION_COLUMNS: &str = "id, timetable_id, absent_teacher_key, absent_teacher_name,
     absent_teacher_id, start_date, end_date, criteria, is_active";

fn substitutions_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let substitution_id = get_required_str(params, "substitutionId")?;
    expire_stale(conn, today())?;
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM substitutions WHERE id = ?",
                SUBSTITUTION_COLUMNS
            ),
            [&substitution_id],
            read_substitution_row,
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .ok_or_else(|| not_found("substitution not found"))?;
    let body = substitution_json(conn, row)?;
    Ok(json!({ "substitution": body }))
}

fn substitutions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    expire_stale(conn, today())?;
    let timetable_id = params
        .get("timetableId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = format!(
        "SELECT {} FROM substitutions WHERE 1=1",
        SUBSTITUTION_COLUMNS
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(tid) = &timetable_id {
        sql.push_str(" AND timetable_id = ?");
        args.push(tid.clone());
    }
    if active_only {
        sql.push_str(" AND is_active = 1");
    }
    sql.push_str(" ORDER BY start_date DESC, id");

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), read_substitution_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    drop(stmt);

    let mut out = Vec::new();
    for row in rows {
        out.push(substitution_json(conn, row)?);
    }
    Ok(json!({ "substitutions": out }))
}

fn substitutions_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let substitution_id = get_required_str(params, "substitutionId")?;
    let Some(list) = params.get("assignments").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing assignments", None));
    };

    let exists = conn
        .query_row(
            "SELECT 1 FROM substitutions WHERE id = ?",
            [&substitution_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(not_found("substitution not found"));
    }

    struct Patch {
        assignment_id: String,
        substitute_teacher_id: String,
    }
    let mut patches = Vec::new();
    for (i, a) in list.iter().enumerate() {
        let field = |key: &str| -> Result<String, HandlerErr> {
            a.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    bad_params(
                        format!("assignment missing {}", key),
                        Some(json!({ "index": i })),
                    )
                })
        };
        let patch = Patch {
            assignment_id: field("assignmentId")?,
            substitute_teacher_id: field("substituteTeacherId")?,
        };
        if !teacher_exists(conn, &patch.substitute_teacher_id)? {
            return Err(bad_params(
                "substituteTeacherId references no teacher",
                Some(json!({ "substituteTeacherId": patch.substitute_teacher_id })),
            ));
        }
        patches.push(patch);
    }

    // Only the substitute-teacher field changes; schedule linkage is
    // untouched. All patches apply or none.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for patch in &patches {
        let changed = tx
            .execute(
                "UPDATE substitution_assignments
                 SET substitute_teacher_id = ?
                 WHERE id = ? AND substitution_id = ?",
                (
                    &patch.substitute_teacher_id,
                    &patch.assignment_id,
                    &substitution_id,
                ),
            )
            .map_err(|e| db_err("db_update_failed", e))?;
        if changed == 0 {
            let _ = tx.rollback();
            return Err(not_found(format!(
                "assignment {} not found in substitution",
                patch.assignment_id
            )));
        }
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "updated": patches.len() }))
}

fn substitutions_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let substitution_id = get_required_str(params, "substitutionId")?;
    let changed = conn
        .execute(
            "UPDATE substitutions SET is_active = 0 WHERE id = ?",
            [&substitution_id],
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    if changed == 0 {
        return Err(not_found("substitution not found"));
    }
    Ok(json!({ "deactivated": true }))
}

fn substitutions_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let substitution_id = get_required_str(params, "substitutionId")?;
    let exists = conn
        .query_row(
            "SELECT 1 FROM substitutions WHERE id = ?",
            [&substitution_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?
        .is_some();
    if !exists {
        return Err(not_found("substitution not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM substitution_assignments WHERE substitution_id = ?",
        [&substitution_id],
    )
    .map_err(|e| db_err("db_delete_failed", e))?;
    tx.execute("DELETE FROM substitutions WHERE id = ?", [&substitution_id])
        .map_err(|e| db_err("db_delete_failed", e))?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "deleted": true }))
}

fn substitutions_list_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let now = today();
    expire_stale(conn, now)?;

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.schedule_entry_id, a.day_id, a.period_id, a.date,
                    s.id, s.start_date, s.end_date,
                    s.absent_teacher_key, s.absent_teacher_name, s.absent_teacher_id,
                    e.class_name, e.subject, d.name, p.number
             FROM substitution_assignments a
             JOIN substitutions s ON s.id = a.substitution_id
             LEFT JOIN schedule_entries e ON e.id = a.schedule_entry_id
             LEFT JOIN timetable_days d ON d.id = a.day_id
             LEFT JOIN timetable_periods p ON p.id = a.period_id
             WHERE a.substitute_teacher_id = ?
               AND s.is_active = 1 AND s.end_date >= ?
             ORDER BY s.start_date, a.date, a.id",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map((&teacher_id, now.to_string()), |r| {
            let date: String = r.get(4)?;
            Ok(json!({
                "assignmentId": r.get::<_, String>(0)?,
                "scheduleEntryId": r.get::<_, String>(1)?,
                "dayId": r.get::<_, String>(2)?,
                "periodId": r.get::<_, String>(3)?,
                "date": if date.is_empty() { serde_json::Value::Null } else { json!(date) },
                "substitutionId": r.get::<_, String>(5)?,
                "startDate": r.get::<_, String>(6)?,
                "endDate": r.get::<_, String>(7)?,
                "absentTeacherKey": r.get::<_, String>(8)?,
                "absentTeacherName": r.get::<_, String>(9)?,
                "absentTeacherId": r.get::<_, Option<String>>(10)?,
                "className": r.get::<_, Option<String>>(11)?,
                "subject": r.get::<_, Option<String>>(12)?,
                "dayName": r.get::<_, Option<String>>(13)?,
                "periodNumber": r.get::<_, Option<i64>>(14)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "assignments": rows }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "substitutions.calculate" => Some(with_db(state, req, substitutions_calculate)),
        "substitutions.create" => Some(with_db(state, req, substitutions_create)),
        "substitutions.get" => Some(with_db(state, req, substitutions_get)),
        "substitutions.list" => Some(with_db(state, req, substitutions_list)),
        "substitutions.update" => Some(with_db(state, req, substitutions_update)),
        "substitutions.deactivate" => Some(with_db(state, req, substitutions_deactivate)),
        "substitutions.delete" => Some(with_db(state, req, substitutions_delete)),
        "substitutions.listByTeacher" => Some(with_db(state, req, substitutions_list_by_teacher)),
        _ => None,
    }
}
