
use serde_json::json;
use test_support::{
    date_from_today, numbered_periods, request_err, request_ok, spawn_sidecar, temp_dir,
    turkish_days,
};

struct Fixture {
    timetable_id: String,
    teacher_id: String,
    entry_id: String,
    day_id: String,
    period_id: String,
}

fn seed(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    workspace: &std::path::Path,
) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let imported = request_ok(
        stdin,
        reader,
        "s2",
        "timetables.import",
        json!({
            "name": "Lifecycle",
            "days": turkish_days(),
            "periods": numbered_periods(2),
            "entries": [
                { "className": "5A", "subject": "Math", "teacherKey": "T-A", "dayKey": "d2", "periodNumber": 1 },
                { "className": "6A", "subject": "Math", "teacherKey": "T-B", "dayKey": "d3", "periodNumber": 2 },
            ],
        }),
    );
    let timetable_id = imported
        .get("timetableId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let teacher = request_ok(
        stdin,
        reader,
        "s3",
        "teachers.create",
        json!({ "name": "Banu Yilmaz" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let calculated = request_ok(
        stdin,
        reader,
        "s4",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "criteria": [],
        }),
    );
    let entry = calculated
        .pointer("/lessons/0/scheduleEntry")
        .cloned()
        .expect("scheduleEntry");
    Fixture {
        timetable_id,
        teacher_id,
        entry_id: entry.get("id").and_then(|v| v.as_str()).unwrap().to_string(),
        day_id: entry.get("dayId").and_then(|v| v.as_str()).unwrap().to_string(),
        period_id: entry
            .get("periodId")
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string(),
    }
}

fn create_substitution(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    f: &Fixture,
    start: String,
    end: String,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "substitutions.create",
        json!({
            "timetableId": f.timetable_id,
            "absentTeacherKey": "T-A",
            "absentTeacherName": "Ali Demir",
            "startDate": start,
            "endDate": end,
            "criteria": [],
            "assignments": [{
                "scheduleEntryId": f.entry_id,
                "substituteTeacherId": f.teacher_id,
                "dayId": f.day_id,
                "periodId": f.period_id,
            }],
        }),
    );
    created
        .get("substitutionId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string()
}

#[test]
fn substitutions_past_their_end_date_expire_on_read() {
    let workspace = temp_dir("subplan-expiry");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, &workspace);

    let stale_id = create_substitution(
        &mut stdin,
        &mut reader,
        "1",
        &f,
        date_from_today(-14),
        date_from_today(-7),
    );
    let live_id = create_substitution(
        &mut stdin,
        &mut reader,
        "2",
        &f,
        date_from_today(1),
        date_from_today(7),
    );

    let listed = request_ok(&mut stdin, &mut reader, "3", "substitutions.list", json!({}));
    let substitutions = listed
        .get("substitutions")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(substitutions.len(), 2);
    for s in substitutions {
        let id = s.get("id").and_then(|v| v.as_str()).unwrap();
        let active = s.get("isActive").and_then(|v| v.as_bool()).unwrap();
        if id == stale_id {
            assert!(!active, "ended substitution flips inactive on read");
        } else {
            assert_eq!(id, live_id);
            assert!(active);
        }
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "substitutions.list",
        json!({ "activeOnly": true }),
    );
    let substitutions = listed
        .get("substitutions")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(substitutions.len(), 1);
    assert_eq!(
        substitutions[0].get("id").and_then(|v| v.as_str()),
        Some(live_id.as_str())
    );

    // The expired one no longer appears on the teacher's plate either.
    let by_teacher = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "substitutions.listByTeacher",
        json!({ "teacherId": f.teacher_id }),
    );
    let assignments = by_teacher
        .get("assignments")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(
        assignments[0].get("substitutionId").and_then(|v| v.as_str()),
        Some(live_id.as_str())
    );
    assert_eq!(
        assignments[0].get("absentTeacherName").and_then(|v| v.as_str()),
        Some("Ali Demir")
    );
    assert_eq!(
        assignments[0].get("className").and_then(|v| v.as_str()),
        Some("5A")
    );
    assert_eq!(
        assignments[0].get("dayName").and_then(|v| v.as_str()),
        Some("Salı")
    );
    assert_eq!(
        assignments[0].get("periodNumber").and_then(|v| v.as_i64()),
        Some(1)
    );
}

#[test]
fn update_patches_only_named_assignments() {
    let workspace = temp_dir("subplan-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, &workspace);

    let substitution_id = create_substitution(
        &mut stdin,
        &mut reader,
        "1",
        &f,
        date_from_today(1),
        date_from_today(7),
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "substitutions.get",
        json!({ "substitutionId": substitution_id }),
    );
    let assignment_id = fetched
        .pointer("/substitution/assignments/0/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "name": "Cem Arslan" }),
    );
    let other_id = other
        .get("teacherId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "substitutions.update",
        json!({
            "substitutionId": substitution_id,
            "assignments": [{ "assignmentId": assignment_id, "substituteTeacherId": other_id }],
        }),
    );
    assert_eq!(updated.get("updated").and_then(|v| v.as_u64()), Some(1));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "substitutions.get",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(
        fetched
            .pointer("/substitution/assignments/0/substituteTeacherId")
            .and_then(|v| v.as_str()),
        Some(other_id.as_str())
    );

    // A patch naming a foreign assignment rolls back entirely.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "substitutions.update",
        json!({
            "substitutionId": substitution_id,
            "assignments": [
                { "assignmentId": assignment_id, "substituteTeacherId": f.teacher_id },
                { "assignmentId": "no-such-assignment", "substituteTeacherId": f.teacher_id },
            ],
        }),
    );
    assert_eq!(code, "not_found");
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "substitutions.get",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(
        fetched
            .pointer("/substitution/assignments/0/substituteTeacherId")
            .and_then(|v| v.as_str()),
        Some(other_id.as_str()),
        "failed batch applied none of its patches"
    );
}

#[test]
fn deactivate_and_delete_lifecycle() {
    let workspace = temp_dir("subplan-lifecycle-end");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, &workspace);

    let substitution_id = create_substitution(
        &mut stdin,
        &mut reader,
        "1",
        &f,
        date_from_today(1),
        date_from_today(7),
    );

    let deactivated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "substitutions.deactivate",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(
        deactivated.get("deactivated").and_then(|v| v.as_bool()),
        Some(true)
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "substitutions.list",
        json!({ "activeOnly": true }),
    );
    assert_eq!(
        listed
            .get("substitutions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // Deactivated bookings stop counting against the teacher.
    let by_teacher = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "substitutions.listByTeacher",
        json!({ "teacherId": f.teacher_id }),
    );
    assert_eq!(
        by_teacher
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "substitutions.delete",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "substitutions.get",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "substitutions.deactivate",
        json!({ "substitutionId": substitution_id }),
    );
    assert_eq!(code, "not_found");
}
