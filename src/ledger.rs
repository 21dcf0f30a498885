use crate::auth::Actor;
use crate::db;
use crate::error::{DomainError, DomainResult};
use crate::levels;
use crate::roster::{self, Student};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

/// Canonical pass literal.
pub const PASS: &str = "Lulus";

/// Outcomes accepted on a competency assessment, matched case-insensitively.
pub const ACCEPTED_OUTCOMES: &[&str] = &["Lulus", "Tidak Lulus", "Remedial"];

/// Normalizes an outcome to its canonical spelling, or rejects it.
pub fn parse_outcome(raw: &str) -> DomainResult<&'static str> {
    let t = raw.trim();
    ACCEPTED_OUTCOMES
        .iter()
        .find(|o| o.eq_ignore_ascii_case(t))
        .copied()
        .ok_or_else(|| {
            DomainError::InvalidOutcome(format!(
                "{:?} is not one of {}",
                raw,
                ACCEPTED_OUTCOMES.join(", ")
            ))
        })
}

pub fn is_passed(hasil: &str) -> bool {
    hasil.trim().eq_ignore_ascii_case(PASS)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub student_id: String,
    pub krs_id: Option<String>,
    pub unit_name: String,
    pub unit_description: String,
    pub level_rank: i64,
    pub assessor_id: String,
    pub assessor_name: String,
    pub hasil: String,
    pub assessed_on: String,
    pub notes: String,
    pub evidence_photos: Vec<String>,
    pub evidence_videos: Vec<String>,
    pub created_at: String,
}

impl HistoryEntry {
    pub fn passed(&self) -> bool {
        is_passed(&self.hasil)
    }

    /// Certificates exist only for passed entries.
    pub fn certificate_eligible(&self) -> bool {
        self.passed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub unit_name: String,
    pub unit_description: String,
    pub level_rank: Option<i64>,
    pub hasil: String,
    pub assessed_on: Option<String>,
    pub notes: String,
    pub evidence_photos: Vec<String>,
    pub evidence_videos: Vec<String>,
}

/// Validates an entry and fills defaults: canonical outcome, level rank from
/// the student's current level, assessment date today.
fn prepare(conn: &Connection, student: &Student, entry: &NewEntry) -> DomainResult<NewEntry> {
    let unit_name = entry.unit_name.trim();
    if unit_name.is_empty() {
        return Err(DomainError::bad_params("unitName must not be empty"));
    }
    let hasil = parse_outcome(&entry.hasil)?;

    let catalog = levels::catalog_for_department(conn, Some(student.jurusan_id.as_str()))?;
    let level_rank = match entry.level_rank {
        Some(rank) => {
            if !catalog.is_empty() && !catalog.iter().any(|l| l.rank == rank) {
                return Err(DomainError::bad_params(format!("unknown level rank {rank}")));
            }
            rank
        }
        None => {
            let skill = roster::skill_record(conn, &student.id)?;
            levels::resolve_level(&catalog, skill.score).rank
        }
    };

    let assessed_on = match entry.assessed_on.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => {
            chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|_| DomainError::bad_params("assessedOn must be YYYY-MM-DD"))?;
            d.to_string()
        }
        _ => db::today().format("%Y-%m-%d").to_string(),
    };

    for url in entry.evidence_photos.iter().chain(entry.evidence_videos.iter()) {
        if url.trim().is_empty() {
            return Err(DomainError::bad_params("evidence URLs must not be empty"));
        }
    }

    Ok(NewEntry {
        unit_name: unit_name.to_string(),
        unit_description: entry.unit_description.trim().to_string(),
        level_rank: Some(level_rank),
        hasil: hasil.to_string(),
        assessed_on: Some(assessed_on),
        notes: entry.notes.trim().to_string(),
        evidence_photos: entry.evidence_photos.clone(),
        evidence_videos: entry.evidence_videos.clone(),
    })
}

/// Appends an assessor-issued entry for a student.
pub fn record(
    conn: &Connection,
    assessor: &Actor,
    student: &Student,
    entry: &NewEntry,
) -> DomainResult<HistoryEntry> {
    if !assessor.can_assess(student) {
        return Err(DomainError::forbidden(
            "only subject teachers or the department head of the student's department may assess",
        ));
    }
    let prepared = prepare(conn, student, entry)?;
    let id = Uuid::new_v4().to_string();
    insert(conn, &id, assessor, student, None, &prepared)?;
    get(conn, &id)
}

/// Insert keyed by `(krs_id, unit_name)`: a retried KRS completion leaves the
/// existing entry alone. Returns whether a row was written.
pub(crate) fn record_for_krs(
    conn: &Connection,
    assessor: &Actor,
    student: &Student,
    krs_id: &str,
    entry: &NewEntry,
) -> DomainResult<bool> {
    let prepared = prepare(conn, student, entry)?;
    let id = Uuid::new_v4().to_string();
    insert(conn, &id, assessor, student, Some(krs_id), &prepared)
}

fn insert(
    conn: &Connection,
    id: &str,
    assessor: &Actor,
    student: &Student,
    krs_id: Option<&str>,
    e: &NewEntry,
) -> DomainResult<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO competency_history(
           id, student_id, krs_id, unit_name, unit_description, level_rank,
           assessor_id, assessor_name, hasil, assessed_on, notes,
           evidence_photos, evidence_videos, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            &student.id,
            krs_id,
            &e.unit_name,
            &e.unit_description,
            e.level_rank.unwrap_or(1),
            assessor.id(),
            assessor.name(),
            &e.hasil,
            e.assessed_on.as_deref().unwrap_or_default(),
            &e.notes,
            serde_json::to_string(&e.evidence_photos).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&e.evidence_videos).unwrap_or_else(|_| "[]".into()),
            db::now_rfc3339(),
        ],
    )?;
    Ok(changed == 1)
}

const ENTRY_COLUMNS: &str = "id, student_id, krs_id, unit_name, unit_description, level_rank,
    assessor_id, assessor_name, hasil, assessed_on, notes, evidence_photos, evidence_videos, created_at";

fn entry_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let photos: String = r.get(11)?;
    let videos: String = r.get(12)?;
    Ok(HistoryEntry {
        id: r.get(0)?,
        student_id: r.get(1)?,
        krs_id: r.get(2)?,
        unit_name: r.get(3)?,
        unit_description: r.get(4)?,
        level_rank: r.get(5)?,
        assessor_id: r.get(6)?,
        assessor_name: r.get(7)?,
        hasil: r.get(8)?,
        assessed_on: r.get(9)?,
        notes: r.get(10)?,
        evidence_photos: serde_json::from_str(&photos).unwrap_or_default(),
        evidence_videos: serde_json::from_str(&videos).unwrap_or_default(),
        created_at: r.get(13)?,
    })
}

pub fn get(conn: &Connection, history_id: &str) -> DomainResult<HistoryEntry> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM competency_history WHERE id = ?"),
        [history_id],
        entry_from_row,
    )
    .optional()?
    .ok_or_else(|| DomainError::NotFound(format!("history entry {history_id}")))
}

/// Newest first.
pub fn list_for_student(conn: &Connection, student_id: &str) -> DomainResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS}
         FROM competency_history
         WHERE student_id = ?
         ORDER BY assessed_on DESC, created_at DESC, rowid DESC"
    ))?;
    let rows = stmt
        .query_map([student_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_for_krs(conn: &Connection, krs_id: &str) -> DomainResult<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM competency_history WHERE krs_id = ? ORDER BY rowid"
    ))?;
    let rows = stmt
        .query_map([krs_id], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
