use crate::db;
use crate::error::{DomainError, DomainResult};
use crate::levels::{self, Level};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: String,
    pub code: String,
    pub name: String,
    pub require_walas_review: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub nis: String,
    #[serde(skip_serializing)]
    pub nisn: String,
    pub name: String,
    pub class_name: String,
    pub jurusan_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub jurusan_id: String,
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillRecord {
    pub score: f64,
    pub points: i64,
    pub level_rank: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttitudeScore {
    pub aspect: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplineRecord {
    pub hadir: i64,
    pub izin: i64,
    pub sakit: i64,
    pub alpa: i64,
    pub percentage: f64,
    pub attitude: Vec<AttitudeScore>,
}

impl DisciplineRecord {
    pub fn attitude_average(&self) -> Option<f64> {
        if self.attitude.is_empty() {
            return None;
        }
        let sum: f64 = self.attitude.iter().map(|a| a.score).sum();
        Some(round_1(sum / self.attitude.len() as f64))
    }
}

pub fn round_1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Present days over all recorded days, as a percentage with one decimal.
pub fn attendance_percentage(hadir: i64, izin: i64, sakit: i64, alpa: i64) -> f64 {
    let total = hadir + izin + sakit + alpa;
    if total <= 0 {
        return 0.0;
    }
    round_1(100.0 * hadir as f64 / total as f64)
}

pub fn list_departments(conn: &Connection) -> DomainResult<Vec<Department>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, name, require_walas_review FROM departments ORDER BY code",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Department {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                require_walas_review: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_department(conn: &Connection, jurusan_id: &str) -> DomainResult<Department> {
    conn.query_row(
        "SELECT id, code, name, require_walas_review FROM departments WHERE id = ?",
        [jurusan_id],
        |r| {
            Ok(Department {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
                require_walas_review: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()?
    .ok_or_else(|| DomainError::NotFound(format!("department {jurusan_id}")))
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        nis: r.get(1)?,
        nisn: r.get(2)?,
        name: r.get(3)?,
        class_name: r.get(4)?,
        jurusan_id: r.get(5)?,
    })
}

const STUDENT_COLUMNS: &str = "id, nis, nisn, name, class_name, jurusan_id";

pub fn get_student(conn: &Connection, student_id: &str) -> DomainResult<Student> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?"),
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| DomainError::NotFound(format!("student {student_id}")))
}

pub fn find_student_by_nis(conn: &Connection, nis: &str) -> DomainResult<Option<Student>> {
    Ok(conn
        .query_row(
            &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE nis = ?"),
            [nis.trim()],
            student_from_row,
        )
        .optional()?)
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub jurusan_id: Option<String>,
    pub class_name: Option<String>,
}

pub fn list_students(conn: &Connection, filter: &StudentFilter) -> DomainResult<Vec<Student>> {
    let mut sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE 1 = 1");
    let mut bind: Vec<Value> = Vec::new();
    if let Some(j) = &filter.jurusan_id {
        sql.push_str(" AND jurusan_id = ?");
        bind.push(Value::Text(j.clone()));
    }
    if let Some(c) = &filter.class_name {
        sql.push_str(" AND class_name = ?");
        bind.push(Value::Text(c.clone()));
    }
    sql.push_str(" ORDER BY class_name, name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_staff_by_username(conn: &Connection, username: &str) -> DomainResult<Option<StaffUser>> {
    Ok(conn
        .query_row(
            "SELECT id, username, display_name, role, jurusan_id, class_name
             FROM users
             WHERE lower(username) = lower(?)",
            [username.trim()],
            staff_from_row,
        )
        .optional()?)
}

pub fn get_staff(conn: &Connection, user_id: &str) -> DomainResult<StaffUser> {
    conn.query_row(
        "SELECT id, username, display_name, role, jurusan_id, class_name
         FROM users
         WHERE id = ?",
        [user_id],
        staff_from_row,
    )
    .optional()?
    .ok_or_else(|| DomainError::NotFound(format!("user {user_id}")))
}

/// Staff holding `role` in a department; used for notification fan-out and
/// certificate signatures.
pub fn staff_with_role(
    conn: &Connection,
    role: &str,
    jurusan_id: &str,
    class_name: Option<&str>,
) -> DomainResult<Vec<StaffUser>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, display_name, role, jurusan_id, class_name
         FROM users
         WHERE role = ? AND jurusan_id = ? AND (? IS NULL OR class_name = ?)
         ORDER BY username",
    )?;
    let rows = stmt
        .query_map((role, jurusan_id, class_name, class_name), staff_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn staff_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StaffUser> {
    Ok(StaffUser {
        id: r.get(0)?,
        username: r.get(1)?,
        display_name: r.get(2)?,
        role: r.get(3)?,
        jurusan_id: r.get(4)?,
        class_name: r.get(5)?,
    })
}

/// Skill record for a student; an absent row reads as zero score at rank 1.
pub fn skill_record(conn: &Connection, student_id: &str) -> DomainResult<SkillRecord> {
    let rec = conn
        .query_row(
            "SELECT score, points, level_rank FROM skill_records WHERE student_id = ?",
            [student_id],
            |r| {
                Ok(SkillRecord {
                    score: r.get(0)?,
                    points: r.get(1)?,
                    level_rank: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(rec.unwrap_or(SkillRecord {
        score: 0.0,
        points: 0,
        level_rank: 1,
    }))
}

#[derive(Debug, Clone)]
pub struct SkillAdjustment {
    pub score: Option<f64>,
    pub points_delta: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillChange {
    pub before: SkillRecord,
    pub after: SkillRecord,
    pub level: Level,
}

impl SkillChange {
    pub fn level_changed(&self) -> bool {
        self.before.level_rank != self.after.level_rank
    }
}

/// Applies a manual teacher adjustment and stores the re-resolved level rank.
pub fn adjust_skill(
    conn: &Connection,
    student: &Student,
    adj: &SkillAdjustment,
) -> DomainResult<SkillChange> {
    if let Some(score) = adj.score {
        if !score.is_finite() || !(0.0..=100.0).contains(&score) {
            return Err(DomainError::bad_params("score must be between 0 and 100"));
        }
    }
    let before = skill_record(conn, &student.id)?;
    let score = adj.score.unwrap_or(before.score);
    let points = before.points.saturating_add(adj.points_delta);
    if points < 0 {
        return Err(DomainError::bad_params("points cannot go below zero"));
    }
    let level = levels::resolve_for_score(conn, Some(student.jurusan_id.as_str()), score);
    conn.execute(
        "INSERT INTO skill_records(id, student_id, score, points, level_rank, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           score = excluded.score,
           points = excluded.points,
           level_rank = excluded.level_rank,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student.id,
            score,
            points,
            level.rank,
            db::now_rfc3339(),
        ),
    )?;
    Ok(SkillChange {
        before,
        after: SkillRecord {
            score,
            points,
            level_rank: level.rank,
        },
        level,
    })
}

#[derive(Debug, Clone, Default)]
pub struct StudentPatch {
    pub class_name: Option<String>,
    pub points: Option<i64>,
}

pub fn update_student(conn: &Connection, student: &Student, patch: &StudentPatch) -> DomainResult<Student> {
    if let Some(class_name) = &patch.class_name {
        let t = class_name.trim();
        if t.is_empty() {
            return Err(DomainError::bad_params("className must not be empty"));
        }
        conn.execute(
            "UPDATE students SET class_name = ?, updated_at = ? WHERE id = ?",
            (t, db::now_rfc3339(), &student.id),
        )?;
    }
    if let Some(points) = patch.points {
        if points < 0 {
            return Err(DomainError::bad_params("points must not be negative"));
        }
        let current = skill_record(conn, &student.id)?;
        adjust_skill(
            conn,
            student,
            &SkillAdjustment {
                score: None,
                points_delta: points - current.points,
            },
        )?;
    }
    get_student(conn, &student.id)
}

/// Discipline record; students without one read as an all-zero record.
pub fn discipline(conn: &Connection, student_id: &str) -> DomainResult<DisciplineRecord> {
    let counts: Option<(i64, i64, i64, i64)> = conn
        .query_row(
            "SELECT hadir, izin, sakit, alpa FROM discipline_records WHERE student_id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let (hadir, izin, sakit, alpa) = counts.unwrap_or_default();

    let mut stmt = conn.prepare(
        "SELECT aspect, score FROM attitude_scores WHERE student_id = ? ORDER BY sort_order",
    )?;
    let attitude = stmt
        .query_map([student_id], |r| {
            Ok(AttitudeScore {
                aspect: r.get(0)?,
                score: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DisciplineRecord {
        hadir,
        izin,
        sakit,
        alpa,
        percentage: attendance_percentage(hadir, izin, sakit, alpa),
        attitude,
    })
}

pub fn save_discipline(
    conn: &Connection,
    student_id: &str,
    counts: (i64, i64, i64, i64),
    attitude: &[AttitudeScore],
) -> DomainResult<DisciplineRecord> {
    let (hadir, izin, sakit, alpa) = counts;
    if [hadir, izin, sakit, alpa].iter().any(|v| *v < 0) {
        return Err(DomainError::bad_params("attendance counts must not be negative"));
    }
    for a in attitude {
        if a.aspect.trim().is_empty() {
            return Err(DomainError::bad_params("attitude aspect must not be empty"));
        }
        if !a.score.is_finite() || !(0.0..=100.0).contains(&a.score) {
            return Err(DomainError::bad_params(format!(
                "attitude score for {} must be between 0 and 100",
                a.aspect
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO discipline_records(student_id, hadir, izin, sakit, alpa, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           hadir = excluded.hadir,
           izin = excluded.izin,
           sakit = excluded.sakit,
           alpa = excluded.alpa,
           updated_at = excluded.updated_at",
        (student_id, hadir, izin, sakit, alpa, db::now_rfc3339()),
    )?;
    tx.execute("DELETE FROM attitude_scores WHERE student_id = ?", [student_id])?;
    for (i, a) in attitude.iter().enumerate() {
        tx.execute(
            "INSERT INTO attitude_scores(student_id, aspect, score, sort_order) VALUES(?, ?, ?, ?)",
            (student_id, a.aspect.trim(), a.score, i as i64),
        )?;
    }
    tx.commit()?;
    discipline(conn, student_id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelBadge {
    pub rank: i64,
    pub name: String,
    pub badge_color: String,
    pub badge_icon: String,
}

impl From<&Level> for LevelBadge {
    fn from(l: &Level) -> Self {
        LevelBadge {
            rank: l.rank,
            name: l.name.clone(),
            badge_color: l.badge_color.clone(),
            badge_icon: l.badge_icon.clone(),
        }
    }
}

/// A student joined with everything the dashboards and exports show.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOverview {
    pub student: Student,
    pub jurusan_name: String,
    pub skill: SkillRecord,
    pub level: LevelBadge,
    pub discipline: DisciplineRecord,
    pub attitude_average: Option<f64>,
    pub history_count: i64,
    pub passed_count: i64,
    pub latest_krs_status: Option<String>,
}

/// Builds overviews for the filtered students. Each joined piece is read
/// independently; a failing or missing piece degrades to its default.
pub fn overview(conn: &Connection, filter: &StudentFilter) -> DomainResult<Vec<StudentOverview>> {
    let students = list_students(conn, filter)?;
    let departments = list_departments(conn).unwrap_or_default();
    let mut out = Vec::with_capacity(students.len());
    for student in students {
        out.push(overview_for(conn, student, &departments));
    }
    Ok(out)
}

pub fn overview_for(conn: &Connection, student: Student, departments: &[Department]) -> StudentOverview {
    let jurusan_name = departments
        .iter()
        .find(|d| d.id == student.jurusan_id)
        .map(|d| d.name.clone())
        .unwrap_or_default();
    let skill = skill_record(conn, &student.id).unwrap_or_default();
    let level = levels::resolve_for_score(conn, Some(student.jurusan_id.as_str()), skill.score);
    let discipline = discipline(conn, &student.id).unwrap_or_else(|e| {
        tracing::warn!(student = %student.id, error = %e, "discipline unavailable");
        DisciplineRecord::default()
    });
    let (history_count, passed_count) = history_counts(conn, &student.id).unwrap_or((0, 0));
    let latest_krs_status: Option<String> = conn
        .query_row(
            "SELECT status FROM krs_requests WHERE student_id = ? ORDER BY submitted_at DESC, rowid DESC LIMIT 1",
            [&student.id],
            |r| r.get(0),
        )
        .optional()
        .unwrap_or(None);

    StudentOverview {
        attitude_average: discipline.attitude_average(),
        jurusan_name,
        skill: SkillRecord {
            level_rank: level.rank,
            ..skill
        },
        level: LevelBadge::from(&level),
        discipline,
        history_count,
        passed_count,
        latest_krs_status,
        student,
    }
}

fn history_counts(conn: &Connection, student_id: &str) -> rusqlite::Result<(i64, i64)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN lower(trim(hasil)) = 'lulus' THEN 1 ELSE 0 END), 0)
         FROM competency_history
         WHERE student_id = ?",
        [student_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
}
