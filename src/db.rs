use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("subplan.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_days(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            source_key TEXT NOT NULL,
            name TEXT NOT NULL,
            weekday INTEGER,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            UNIQUE(timetable_id, source_key)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_days_timetable ON timetable_days(timetable_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_periods(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            UNIQUE(timetable_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_periods_timetable ON timetable_periods(timetable_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_entries(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            class_name TEXT NOT NULL,
            subject TEXT NOT NULL,
            teacher_key TEXT NOT NULL,
            day_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            FOREIGN KEY(day_id) REFERENCES timetable_days(id),
            FOREIGN KEY(period_id) REFERENCES timetable_periods(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_entries_timetable ON schedule_entries(timetable_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_entries_teacher ON schedule_entries(timetable_id, teacher_key)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_mappings(
            timetable_id TEXT NOT NULL,
            teacher_key TEXT NOT NULL,
            teacher_id TEXT,
            PRIMARY KEY(timetable_id, teacher_key),
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_mappings_teacher ON teacher_mappings(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            absent_teacher_key TEXT NOT NULL,
            absent_teacher_name TEXT NOT NULL,
            absent_teacher_id TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            criteria TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_timetable ON substitutions(timetable_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_active ON substitutions(is_active, end_date)",
        [],
    )?;

    // date is '' for weekly (unpinned) assignments so it can participate in
    // the uniqueness key; SQLite treats NULLs as distinct in UNIQUE indexes.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitution_assignments(
            id TEXT PRIMARY KEY,
            substitution_id TEXT NOT NULL,
            schedule_entry_id TEXT NOT NULL,
            substitute_teacher_id TEXT NOT NULL,
            day_id TEXT NOT NULL,
            period_id TEXT NOT NULL,
            date TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(substitution_id) REFERENCES substitutions(id),
            UNIQUE(substitution_id, substitute_teacher_id, day_id, period_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitution_assignments_sub ON substitution_assignments(substitution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitution_assignments_teacher ON substitution_assignments(substitute_teacher_id)",
        [],
    )?;

    // Early workspaces stored day rows before the canonical weekday column
    // existed. Add and backfill from the localized name if needed.
    ensure_days_weekday(&conn)?;

    Ok(conn)
}

fn ensure_days_weekday(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "timetable_days", "weekday")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE timetable_days ADD COLUMN weekday INTEGER", [])?;

    let mut stmt = conn.prepare("SELECT id, name FROM timetable_days")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (id, name) in rows {
        if let Some(weekday) = crate::calendar::weekday_from_name(&name) {
            conn.execute(
                "UPDATE timetable_days SET weekday = ? WHERE id = ?",
                (weekday as i64, &id),
            )?;
        }
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
