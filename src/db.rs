use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "skillpass.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    apply_schema(&conn)?;
    Ok(conn)
}

/// Same schema as a workspace, but nothing touches disk. Used for the
/// fallback dataset and for unit tests.
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_schema(&conn)?;
    Ok(conn)
}

pub fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            require_walas_review INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    // Workspaces created before the homeroom stage existed lack the flag.
    ensure_departments_walas_flag(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nis TEXT NOT NULL UNIQUE,
            nisn TEXT NOT NULL,
            name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            jurusan_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(jurusan_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_jurusan ON students(jurusan_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            jurusan_id TEXT NOT NULL,
            class_name TEXT,
            FOREIGN KEY(jurusan_id) REFERENCES departments(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS levels(
            id TEXT PRIMARY KEY,
            rank INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            min_score REAL NOT NULL,
            max_score REAL NOT NULL,
            badge_color TEXT NOT NULL DEFAULT '',
            badge_icon TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_criteria(
            id TEXT PRIMARY KEY,
            level_id TEXT NOT NULL,
            jurusan_id TEXT,
            sort_order INTEGER NOT NULL,
            text TEXT NOT NULL,
            FOREIGN KEY(level_id) REFERENCES levels(id),
            FOREIGN KEY(jurusan_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_level_criteria_level ON level_criteria(level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skill_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL UNIQUE,
            score REAL NOT NULL DEFAULT 0,
            points INTEGER NOT NULL DEFAULT 0,
            level_rank INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS competency_history(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            krs_id TEXT,
            unit_name TEXT NOT NULL,
            unit_description TEXT NOT NULL DEFAULT '',
            level_rank INTEGER NOT NULL,
            assessor_id TEXT NOT NULL,
            assessor_name TEXT NOT NULL,
            hasil TEXT NOT NULL,
            assessed_on TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            evidence_photos TEXT NOT NULL DEFAULT '[]',
            evidence_videos TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(krs_id) REFERENCES krs_requests(id),
            UNIQUE(krs_id, unit_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competency_history_student ON competency_history(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS discipline_records(
            student_id TEXT PRIMARY KEY,
            hadir INTEGER NOT NULL DEFAULT 0,
            izin INTEGER NOT NULL DEFAULT 0,
            sakit INTEGER NOT NULL DEFAULT 0,
            alpa INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attitude_scores(
            student_id TEXT NOT NULL,
            aspect TEXT NOT NULL,
            score REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(student_id, aspect),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS krs_requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_name TEXT NOT NULL,
            jurusan_id TEXT NOT NULL,
            items TEXT NOT NULL,
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            exam_date TEXT,
            final_score REAL,
            evidence_urls TEXT NOT NULL DEFAULT '[]',
            notes TEXT,
            produktif_approved_at TEXT,
            produktif_approved_by TEXT,
            walas_approved_at TEXT,
            walas_approved_by TEXT,
            hod_approved_at TEXT,
            hod_approved_by TEXT,
            scheduled_by TEXT,
            completed_at TEXT,
            assessor_id TEXT,
            rejected_at TEXT,
            rejected_by TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(jurusan_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_krs_requests_jurusan_status ON krs_requests(jurusan_id, status)",
        [],
    )?;
    // At most one non-terminal request per student, enforced by the store as well.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_krs_requests_one_active
         ON krs_requests(student_id)
         WHERE status NOT IN ('completed', 'rejected')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            recipient_kind TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            krs_id TEXT,
            created_at TEXT NOT NULL,
            read_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_kind, recipient_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_departments_walas_flag(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "departments", "require_walas_review")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE departments ADD COLUMN require_walas_review INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
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

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Setting value as a string, or `default` when unset or not a string.
pub fn settings_get_string(conn: &Connection, key: &str, default: &str) -> String {
    settings_get_json(conn, key)
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| default.to_string())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}
