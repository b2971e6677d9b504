use crate::calendar;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

struct DayInput {
    key: String,
    name: String,
}

struct PeriodInput {
    number: i64,
    start_time: String,
    end_time: String,
}

struct EntryInput {
    class_name: String,
    subject: String,
    teacher_key: String,
    day_key: String,
    period_number: i64,
}

struct TimetablePayload {
    name: String,
    days: Vec<DayInput>,
    periods: Vec<PeriodInput>,
    entries: Vec<EntryInput>,
}

/// Import payloads arrive loosely typed; every cross-reference is checked
/// here at ingestion rather than trusted downstream.
fn parse_timetable_payload(params: &serde_json::Value) -> Result<TimetablePayload, HandlerErr> {
    let name = get_required_str(params, "name")?;

    let days_json = params
        .get("days")
        .and_then(|v| v.as_array())
        .ok_or_else(|| bad_params("missing days", None))?;
    let mut days = Vec::new();
    let mut day_keys = HashSet::new();
    for (i, d) in days_json.iter().enumerate() {
        let key = d
            .get("key")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_params("day missing key", Some(json!({ "index": i }))))?;
        let day_name = d
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_params("day missing name", Some(json!({ "key": key }))))?;
        if !day_keys.insert(key.clone()) {
            return Err(bad_params("duplicate day key", Some(json!({ "key": key }))));
        }
        days.push(DayInput { key, name: day_name });
    }
    if days.is_empty() {
        return Err(bad_params("days must not be empty", None));
    }

    let periods_json = params
        .get("periods")
        .and_then(|v| v.as_array())
        .ok_or_else(|| bad_params("missing periods", None))?;
    let mut periods = Vec::new();
    let mut period_numbers = HashSet::new();
    for (i, p) in periods_json.iter().enumerate() {
        let number = p
            .get("number")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| bad_params("period missing number", Some(json!({ "index": i }))))?;
        if !period_numbers.insert(number) {
            return Err(bad_params(
                "duplicate period number",
                Some(json!({ "number": number })),
            ));
        }
        periods.push(PeriodInput {
            number,
            start_time: p
                .get("startTime")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            end_time: p
                .get("endTime")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        });
    }
    if periods.is_empty() {
        return Err(bad_params("periods must not be empty", None));
    }

    let entries_json = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| bad_params("missing entries", None))?;
    let mut entries = Vec::new();
    for (i, e) in entries_json.iter().enumerate() {
        let detail = json!({ "index": i });
        let field = |key: &str| -> Result<String, HandlerErr> {
            e.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| bad_params(format!("entry missing {}", key), Some(detail.clone())))
        };
        let day_key = field("dayKey")?;
        if !day_keys.contains(&day_key) {
            return Err(bad_params(
                "entry references unknown dayKey",
                Some(json!({ "index": i, "dayKey": day_key })),
            ));
        }
        let period_number = e
            .get("periodNumber")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| bad_params("entry missing periodNumber", Some(detail.clone())))?;
        if !period_numbers.contains(&period_number) {
            return Err(bad_params(
                "entry references unknown periodNumber",
                Some(json!({ "index": i, "periodNumber": period_number })),
            ));
        }
        entries.push(EntryInput {
            class_name: field("className")?,
            subject: field("subject")?,
            teacher_key: field("teacherKey")?,
            day_key,
            period_number,
        });
    }

    Ok(TimetablePayload {
        name,
        days,
        periods,
        entries,
    })
}

struct ImportCounts {
    day_count: usize,
    period_count: usize,
    entry_count: usize,
    unresolved_days: Vec<String>,
}

/// Inserts the aggregate contents of one timetable. `preserved_mappings`
/// carries teacher ids from a previous revision so a wholesale replace
/// keeps mappings for teacher keys that survive it.
fn insert_timetable_contents(
    tx: &rusqlite::Transaction,
    timetable_id: &str,
    payload: &TimetablePayload,
    preserved_mappings: &HashMap<String, Option<String>>,
) -> Result<ImportCounts, HandlerErr> {
    let mut day_ids = HashMap::new();
    let mut unresolved_days = Vec::new();
    for (sort_order, day) in payload.days.iter().enumerate() {
        let day_id = Uuid::new_v4().to_string();
        let weekday = calendar::weekday_from_name(&day.name);
        if weekday.is_none() {
            unresolved_days.push(day.name.clone());
        }
        tx.execute(
            "INSERT INTO timetable_days(id, timetable_id, source_key, name, weekday, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &day_id,
                timetable_id,
                &day.key,
                &day.name,
                weekday.map(|w| w as i64),
                sort_order as i64,
            ),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
        day_ids.insert(day.key.clone(), day_id);
    }

    let mut period_ids = HashMap::new();
    for period in &payload.periods {
        let period_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO timetable_periods(id, timetable_id, number, start_time, end_time)
             VALUES(?, ?, ?, ?, ?)",
            (
                &period_id,
                timetable_id,
                period.number,
                &period.start_time,
                &period.end_time,
            ),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
        period_ids.insert(period.number, period_id);
    }

    let mut teacher_keys = HashSet::new();
    for entry in &payload.entries {
        // References were validated against the payload at parse time.
        let day_id = &day_ids[&entry.day_key];
        let period_id = &period_ids[&entry.period_number];
        tx.execute(
            "INSERT INTO schedule_entries(id, timetable_id, class_name, subject, teacher_key, day_id, period_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                timetable_id,
                &entry.class_name,
                &entry.subject,
                &entry.teacher_key,
                day_id,
                period_id,
            ),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
        teacher_keys.insert(entry.teacher_key.clone());
    }

    for key in &teacher_keys {
        let teacher_id = preserved_mappings.get(key).cloned().flatten();
        tx.execute(
            "INSERT INTO teacher_mappings(timetable_id, teacher_key, teacher_id)
             VALUES(?, ?, ?)",
            (timetable_id, key, teacher_id),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
    }

    Ok(ImportCounts {
        day_count: payload.days.len(),
        period_count: payload.periods.len(),
        entry_count: payload.entries.len(),
        unresolved_days,
    })
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

fn timetables_import(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let payload = parse_timetable_payload(params)?;
    let timetable_id = Uuid::new_v4().to_string();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO timetables(id, name, created_at) VALUES(?, ?, ?)",
        (
            &timetable_id,
            &payload.name,
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        ),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;
    let counts = insert_timetable_contents(&tx, &timetable_id, &payload, &HashMap::new())?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({
        "timetableId": timetable_id,
        "dayCount": counts.day_count,
        "periodCount": counts.period_count,
        "entryCount": counts.entry_count,
        "unresolvedDays": counts.unresolved_days,
    }))
}

fn timetables_replace(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let payload = parse_timetable_payload(params)?;
    if !timetable_exists(conn, &timetable_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: None,
        });
    }

    // Keep teacher mappings for keys that survive the replace.
    let mut stmt = conn
        .prepare("SELECT teacher_key, teacher_id FROM teacher_mappings WHERE timetable_id = ?")
        .map_err(|e| db_err("db_query_failed", e))?;
    let preserved: HashMap<String, Option<String>> = stmt
        .query_map([&timetable_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })
        .and_then(|it| it.collect())
        .map_err(|e| db_err("db_query_failed", e))?;
    drop(stmt);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for sql in [
        "DELETE FROM schedule_entries WHERE timetable_id = ?",
        "DELETE FROM timetable_periods WHERE timetable_id = ?",
        "DELETE FROM timetable_days WHERE timetable_id = ?",
        "DELETE FROM teacher_mappings WHERE timetable_id = ?",
    ] {
        tx.execute(sql, [&timetable_id])
            .map_err(|e| db_err("db_delete_failed", e))?;
    }
    tx.execute(
        "UPDATE timetables SET name = ? WHERE id = ?",
        (&payload.name, &timetable_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    let counts = insert_timetable_contents(&tx, &timetable_id, &payload, &preserved)?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({
        "timetableId": timetable_id,
        "dayCount": counts.day_count,
        "periodCount": counts.period_count,
        "entryCount": counts.entry_count,
        "unresolvedDays": counts.unresolved_days,
    }))
}

fn timetables_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               t.id,
               t.name,
               t.created_at,
               (SELECT COUNT(*) FROM timetable_days d WHERE d.timetable_id = t.id) AS day_count,
               (SELECT COUNT(*) FROM timetable_periods p WHERE p.timetable_id = t.id) AS period_count,
               (SELECT COUNT(*) FROM schedule_entries e WHERE e.timetable_id = t.id) AS entry_count
             FROM timetables t
             ORDER BY t.name",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, Option<String>>(2)?,
                "dayCount": r.get::<_, i64>(3)?,
                "periodCount": r.get::<_, i64>(4)?,
                "entryCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "timetables": rows }))
}

fn timetables_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    if !timetable_exists(conn, &timetable_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: None,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    // Explicit delete in dependency order (no ON DELETE CASCADE). The
    // timetable's substitutions go with it; their assignments reference
    // schedule entries that are about to disappear.
    for sql in [
        "DELETE FROM substitution_assignments
         WHERE substitution_id IN (SELECT id FROM substitutions WHERE timetable_id = ?)",
        "DELETE FROM substitutions WHERE timetable_id = ?",
        "DELETE FROM schedule_entries WHERE timetable_id = ?",
        "DELETE FROM timetable_periods WHERE timetable_id = ?",
        "DELETE FROM timetable_days WHERE timetable_id = ?",
        "DELETE FROM teacher_mappings WHERE timetable_id = ?",
        "DELETE FROM timetables WHERE id = ?",
    ] {
        tx.execute(sql, [&timetable_id])
            .map_err(|e| db_err("db_delete_failed", e))?;
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "deleted": true }))
}

fn teachers_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let teacher_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, name) VALUES(?, ?)",
        (&teacher_id, &name),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;
    Ok(json!({ "teacherId": teacher_id, "name": name }))
}

fn teachers_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM teachers ORDER BY name, id")
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "teachers": rows }))
}

fn set_teacher_mapping(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let teacher_key = get_required_str(params, "teacherKey")?;
    let teacher_id = match params.get("teacherId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| bad_params("teacherId must be string or null", None))?,
        ),
    };

    if !timetable_exists(conn, &timetable_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: None,
        });
    }
    if let Some(tid) = &teacher_id {
        let exists = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?
            .is_some();
        if !exists {
            return Err(bad_params(
                "teacherId references no teacher",
                Some(json!({ "teacherId": tid })),
            ));
        }
    }

    conn.execute(
        "INSERT INTO teacher_mappings(timetable_id, teacher_key, teacher_id)
         VALUES(?, ?, ?)
         ON CONFLICT(timetable_id, teacher_key) DO UPDATE SET
           teacher_id = excluded.teacher_id",
        (&timetable_id, &teacher_key, &teacher_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;

    Ok(json!({ "timetableId": timetable_id, "teacherKey": teacher_key, "teacherId": teacher_id }))
}

fn list_teacher_mappings(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    if !timetable_exists(conn, &timetable_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: None,
        });
    }
    let mut stmt = conn
        .prepare(
            "SELECT m.teacher_key, m.teacher_id, t.name
             FROM teacher_mappings m
             LEFT JOIN teachers t ON t.id = m.teacher_id
             WHERE m.timetable_id = ?
             ORDER BY m.teacher_key",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([&timetable_id], |r| {
            Ok(json!({
                "teacherKey": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, Option<String>>(1)?,
                "teacherName": r.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({ "mappings": rows }))
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
        "timetables.import" => Some(with_db(state, req, |c, p| timetables_import(c, p))),
        "timetables.replace" => Some(with_db(state, req, |c, p| timetables_replace(c, p))),
        "timetables.list" => Some(with_db(state, req, |c, _| timetables_list(c))),
        "timetables.delete" => Some(with_db(state, req, |c, p| timetables_delete(c, p))),
        "timetables.setTeacherMapping" => Some(with_db(state, req, |c, p| set_teacher_mapping(c, p))),
        "timetables.listTeacherMappings" => {
            Some(with_db(state, req, |c, p| list_teacher_mappings(c, p)))
        }
        "teachers.create" => Some(with_db(state, req, |c, p| teachers_create(c, p))),
        "teachers.list" => Some(with_db(state, req, |c, _| teachers_list(c))),
        _ => None,
    }
}
