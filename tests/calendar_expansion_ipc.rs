
use serde_json::json;
use test_support::{numbered_periods, request_err, request_ok, spawn_sidecar, temp_dir, turkish_days};

fn entry(class: &str, subject: &str, teacher: &str, day: &str, period: i64) -> serde_json::Value {
    json!({
        "className": class,
        "subject": subject,
        "teacherKey": teacher,
        "dayKey": day,
        "periodNumber": period,
    })
}

#[test]
fn dated_calculation_expands_onto_working_days_only() {
    let workspace = temp_dir("subplan-expand");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetables.import",
        json!({
            "name": "Expansion",
            "days": turkish_days(),
            "periods": numbered_periods(2),
            "entries": [
                // Salı recurs every Tuesday.
                entry("5A", "Math", "T-A", "d2", 1),
                entry("6A", "Math", "T-B", "d1", 1),
            ],
        }),
    );
    let timetable_id = imported
        .get("timetableId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // 2026-02-01 is a Sunday; the window holds Mon 02 .. Thu 05.
    let calculated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "criteria": ["same_subject"],
            "startDate": "2026-02-01",
            "endDate": "2026-02-05",
        }),
    );

    let working_days = calculated
        .get("workingDays")
        .and_then(|v| v.as_array())
        .unwrap();
    let dates: Vec<&str> = working_days
        .iter()
        .map(|d| d.get("date").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert_eq!(dates, vec!["2026-02-02", "2026-02-03", "2026-02-04", "2026-02-05"]);
    assert_eq!(
        working_days[0].get("name").and_then(|v| v.as_str()),
        Some("Monday")
    );

    let expanded = calculated.get("expanded").and_then(|v| v.as_array()).unwrap();
    assert_eq!(expanded.len(), 1, "the Tuesday lesson lands exactly once");
    assert_eq!(
        expanded[0].get("date").and_then(|v| v.as_str()),
        Some("2026-02-03")
    );
    assert_eq!(
        expanded[0]
            .pointer("/scheduleEntry/className")
            .and_then(|v| v.as_str()),
        Some("5A")
    );
    assert_eq!(
        expanded[0]
            .pointer("/primary/teacherKey")
            .and_then(|v| v.as_str()),
        Some("T-B")
    );
    assert_eq!(
        calculated
            .get("diagnostics")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn unresolvable_day_names_surface_as_diagnostics_not_errors() {
    let workspace = temp_dir("subplan-expand-diag");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetables.import",
        json!({
            "name": "Diagnostics",
            "days": [
                { "key": "d1", "name": "Pazartesi" },
                { "key": "dx", "name": "Bayram" },
            ],
            "periods": numbered_periods(1),
            "entries": [
                entry("5A", "Math", "T-A", "dx", 1),
                entry("6A", "Math", "T-B", "d1", 1),
            ],
        }),
    );
    let timetable_id = imported
        .get("timetableId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let calculated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "criteria": [],
            "startDate": "2026-02-02",
            "endDate": "2026-02-06",
        }),
    );
    assert_eq!(
        calculated.get("expanded").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let diagnostics = calculated
        .get("diagnostics")
        .and_then(|v| v.as_array())
        .unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].as_str().unwrap().contains("Bayram"));
}

#[test]
fn date_window_validation() {
    let workspace = temp_dir("subplan-expand-invalid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetables.import",
        json!({
            "name": "Windows",
            "days": turkish_days(),
            "periods": numbered_periods(1),
            "entries": [entry("5A", "Math", "T-A", "d1", 1)],
        }),
    );
    let timetable_id = imported
        .get("timetableId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "startDate": "2026-02-10",
            "endDate": "2026-02-01",
        }),
    );
    assert_eq!(code, "invalid_range");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "startDate": "2026-02-10",
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "substitutions.calculate",
        json!({
            "timetableId": timetable_id,
            "absentTeacherKey": "T-A",
            "startDate": "10.02.2026",
            "endDate": "2026-02-12",
        }),
    );
    assert_eq!(code, "bad_params");
}
