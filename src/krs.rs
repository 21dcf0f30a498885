//! KRS (competency exam request) workflow.
//!
//! A request moves forward through the review stages and never backwards:
//!
//! ```text
//! pending_produktif -> [pending_walas] -> pending_hod -> approved -> scheduled -> completed
//!         \                  \                \
//!          +------------------+----------------+--> rejected
//! ```
//!
//! `pending_walas` is only visited for departments that require homeroom
//! review. Every write is a compare-and-swap on the stored status, so of two
//! reviewers acting on the same stage exactly one succeeds.

use crate::auth::Actor;
use crate::db;
use crate::error::{DomainError, DomainResult};
use crate::ledger::{self, HistoryEntry, NewEntry};
use crate::levels::{self, Level};
use crate::roster::{self, Student};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KrsStatus {
    PendingProduktif,
    PendingWalas,
    PendingHod,
    Approved,
    Scheduled,
    Completed,
    Rejected,
}

impl KrsStatus {
    pub const ALL: [KrsStatus; 7] = [
        KrsStatus::PendingProduktif,
        KrsStatus::PendingWalas,
        KrsStatus::PendingHod,
        KrsStatus::Approved,
        KrsStatus::Scheduled,
        KrsStatus::Completed,
        KrsStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KrsStatus::PendingProduktif => "pending_produktif",
            KrsStatus::PendingWalas => "pending_walas",
            KrsStatus::PendingHod => "pending_hod",
            KrsStatus::Approved => "approved",
            KrsStatus::Scheduled => "scheduled",
            KrsStatus::Completed => "completed",
            KrsStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<KrsStatus> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw.trim())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, KrsStatus::Completed | KrsStatus::Rejected)
    }

    /// Review stage a request in this status is waiting on, if any.
    pub fn review_stage(self) -> Option<Stage> {
        match self {
            KrsStatus::PendingProduktif => Some(Stage::Produktif),
            KrsStatus::PendingWalas => Some(Stage::Walas),
            KrsStatus::PendingHod => Some(Stage::Hod),
            _ => None,
        }
    }

    /// Position along the pipeline. Rejection sits past every other state.
    pub fn progress(self) -> u8 {
        match self {
            KrsStatus::PendingProduktif => 0,
            KrsStatus::PendingWalas => 1,
            KrsStatus::PendingHod => 2,
            KrsStatus::Approved => 3,
            KrsStatus::Scheduled => 4,
            KrsStatus::Completed => 5,
            KrsStatus::Rejected => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Produktif,
    Walas,
    Hod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    Schedule,
    Complete,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Schedule => "schedule",
            Action::Complete => "complete",
        }
    }
}

/// Pure transition table.
pub fn next_status(from: KrsStatus, action: Action, require_walas: bool) -> DomainResult<KrsStatus> {
    use KrsStatus::*;
    let next = match (from, action) {
        (PendingProduktif, Action::Approve) if require_walas => PendingWalas,
        (PendingProduktif, Action::Approve) => PendingHod,
        (PendingWalas, Action::Approve) => PendingHod,
        (PendingHod, Action::Approve) => Approved,
        (PendingProduktif | PendingWalas | PendingHod, Action::Reject) => Rejected,
        (Approved, Action::Schedule) => Scheduled,
        (Scheduled, Action::Complete) => Completed,
        _ => {
            return Err(DomainError::InvalidTransition {
                from: from.as_str().to_string(),
                action: action.as_str().to_string(),
            })
        }
    };
    debug_assert!(next.progress() > from.progress());
    Ok(next)
}

/// Role and scope check for `action` on `krs`. Department-scoped except the
/// homeroom stage, which is scoped by class name.
pub fn authorize(actor: &Actor, krs: &KrsRequest, action: Action) -> DomainResult<()> {
    let same_dept = actor.jurusan_id() == krs.jurusan_id;
    let allowed = match action {
        Action::Approve | Action::Reject => match krs.status.review_stage() {
            Some(Stage::Produktif) => matches!(actor, Actor::Produktif { .. }) && same_dept,
            Some(Stage::Walas) => {
                matches!(actor, Actor::Walas { class_name, .. } if *class_name == krs.class_name)
            }
            Some(Stage::Hod) => matches!(actor, Actor::Hod { .. }) && same_dept,
            None => false,
        },
        Action::Schedule => matches!(actor, Actor::Hod { .. }) && same_dept,
        Action::Complete => {
            matches!(actor, Actor::Produktif { .. } | Actor::Hod { .. }) && same_dept
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(DomainError::forbidden(format!(
            "{} may not {} request {} in status {}",
            actor.role().as_str(),
            action.as_str(),
            krs.id,
            krs.status.as_str()
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KrsItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_rank: Option<i64>,
}

/// Items arrive either as bare unit names or as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KrsItemInput {
    Name(String),
    Item(KrsItem),
}

impl From<KrsItemInput> for KrsItem {
    fn from(input: KrsItemInput) -> Self {
        match input {
            KrsItemInput::Name(name) => KrsItem {
                name,
                level_rank: None,
            },
            KrsItemInput::Item(item) => item,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KrsRequest {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub jurusan_id: String,
    pub items: Vec<KrsItem>,
    pub status: KrsStatus,
    pub submitted_at: String,
    pub exam_date: Option<String>,
    pub final_score: Option<f64>,
    pub evidence_urls: Vec<String>,
    pub notes: Option<String>,
    pub produktif_approved_at: Option<String>,
    pub produktif_approved_by: Option<String>,
    pub walas_approved_at: Option<String>,
    pub walas_approved_by: Option<String>,
    pub hod_approved_at: Option<String>,
    pub hod_approved_by: Option<String>,
    pub scheduled_by: Option<String>,
    pub completed_at: Option<String>,
    pub assessor_id: Option<String>,
    pub rejected_at: Option<String>,
    pub rejected_by: Option<String>,
    pub updated_at: String,
}

const KRS_COLUMNS: &str = "k.id, k.student_id, s.name, k.class_name, k.jurusan_id, k.items, k.status,
    k.submitted_at, k.exam_date, k.final_score, k.evidence_urls, k.notes,
    k.produktif_approved_at, k.produktif_approved_by, k.walas_approved_at, k.walas_approved_by,
    k.hod_approved_at, k.hod_approved_by, k.scheduled_by, k.completed_at, k.assessor_id,
    k.rejected_at, k.rejected_by, k.updated_at";

fn krs_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<KrsRequest> {
    let items_raw: String = r.get(5)?;
    let status_raw: String = r.get(6)?;
    let evidence_raw: String = r.get(10)?;
    let status = KrsStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown KRS status {status_raw:?}").into(),
        )
    })?;
    Ok(KrsRequest {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        class_name: r.get(3)?,
        jurusan_id: r.get(4)?,
        items: serde_json::from_str(&items_raw).unwrap_or_default(),
        status,
        submitted_at: r.get(7)?,
        exam_date: r.get(8)?,
        final_score: r.get(9)?,
        evidence_urls: serde_json::from_str(&evidence_raw).unwrap_or_default(),
        notes: r.get(11)?,
        produktif_approved_at: r.get(12)?,
        produktif_approved_by: r.get(13)?,
        walas_approved_at: r.get(14)?,
        walas_approved_by: r.get(15)?,
        hod_approved_at: r.get(16)?,
        hod_approved_by: r.get(17)?,
        scheduled_by: r.get(18)?,
        completed_at: r.get(19)?,
        assessor_id: r.get(20)?,
        rejected_at: r.get(21)?,
        rejected_by: r.get(22)?,
        updated_at: r.get(23)?,
    })
}

pub fn get(conn: &Connection, krs_id: &str) -> DomainResult<KrsRequest> {
    conn.query_row(
        &format!(
            "SELECT {KRS_COLUMNS}
             FROM krs_requests k
             JOIN students s ON s.id = k.student_id
             WHERE k.id = ?"
        ),
        [krs_id],
        krs_from_row,
    )
    .optional()?
    .ok_or_else(|| DomainError::NotFound(format!("KRS request {krs_id}")))
}

/// Requests visible to `actor`: students see their own, homeroom teachers
/// their class, subject teachers and department heads their department.
pub fn list(conn: &Connection, actor: &Actor, status: Option<KrsStatus>) -> DomainResult<Vec<KrsRequest>> {
    let mut sql = format!(
        "SELECT {KRS_COLUMNS}
         FROM krs_requests k
         JOIN students s ON s.id = k.student_id
         WHERE "
    );
    let mut bind: Vec<Value> = Vec::new();
    match actor {
        Actor::Student { student_id, .. } => {
            sql.push_str("k.student_id = ?");
            bind.push(Value::Text(student_id.clone()));
        }
        Actor::Walas { class_name, .. } => {
            sql.push_str("k.class_name = ?");
            bind.push(Value::Text(class_name.clone()));
        }
        Actor::Produktif { jurusan_id, .. } | Actor::Hod { jurusan_id, .. } => {
            sql.push_str("k.jurusan_id = ?");
            bind.push(Value::Text(jurusan_id.clone()));
        }
    }
    if let Some(st) = status {
        sql.push_str(" AND k.status = ?");
        bind.push(Value::Text(st.as_str().to_string()));
    }
    sql.push_str(" ORDER BY k.submitted_at DESC, k.rowid DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), krs_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn can_view(actor: &Actor, krs: &KrsRequest) -> bool {
    match actor {
        Actor::Student { student_id, .. } => *student_id == krs.student_id,
        Actor::Walas { class_name, .. } => *class_name == krs.class_name,
        Actor::Produktif { jurusan_id, .. } | Actor::Hod { jurusan_id, .. } => {
            *jurusan_id == krs.jurusan_id
        }
    }
}

fn active_request_for(conn: &Connection, student_id: &str) -> DomainResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM krs_requests
             WHERE student_id = ? AND status NOT IN ('completed', 'rejected')
             LIMIT 1",
            [student_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Trims names, refuses duplicates and checks each `level_rank` against the
/// department catalog. A bad rank would otherwise only surface at completion.
fn validate_items(items: &[KrsItem], catalog: &[Level]) -> DomainResult<Vec<KrsItem>> {
    if items.is_empty() {
        return Err(DomainError::bad_params("items must not be empty"));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = item.name.trim();
        if name.is_empty() {
            return Err(DomainError::bad_params("item name must not be empty"));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(DomainError::bad_params(format!("duplicate item {name}")));
        }
        if let Some(rank) = item.level_rank {
            if !catalog.is_empty() && !catalog.iter().any(|l| l.rank == rank) {
                return Err(DomainError::bad_params(format!(
                    "item {name}: unknown level rank {rank}"
                )));
            }
        }
        out.push(KrsItem {
            name: name.to_string(),
            level_rank: item.level_rank,
        });
    }
    Ok(out)
}

fn validate_urls(urls: &[String]) -> DomainResult<Vec<String>> {
    urls.iter()
        .map(|u| {
            let t = u.trim();
            if t.is_empty() {
                Err(DomainError::bad_params("evidence URLs must not be empty"))
            } else {
                Ok(t.to_string())
            }
        })
        .collect()
}

/// A student opens a request. Refused while another one is still active.
pub fn submit(
    conn: &Connection,
    actor: &Actor,
    items: &[KrsItem],
    evidence_urls: &[String],
) -> DomainResult<KrsRequest> {
    let Actor::Student { student_id, .. } = actor else {
        return Err(DomainError::forbidden("only students submit KRS requests"));
    };
    let student = roster::get_student(conn, student_id)?;
    let catalog = levels::catalog_for_department(conn, Some(student.jurusan_id.as_str()))?;
    let items = validate_items(items, &catalog)?;
    let evidence = validate_urls(evidence_urls)?;

    if let Some(existing) = active_request_for(conn, &student.id)? {
        return Err(DomainError::ActiveRequestExists(existing));
    }

    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO krs_requests(
           id, student_id, class_name, jurusan_id, items, status,
           submitted_at, evidence_urls, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &student.id,
            &student.class_name,
            &student.jurusan_id,
            serde_json::to_string(&items).unwrap_or_else(|_| "[]".into()),
            KrsStatus::PendingProduktif.as_str(),
            &now,
            serde_json::to_string(&evidence).unwrap_or_else(|_| "[]".into()),
            &now,
        ],
    );
    match inserted {
        Ok(_) => {}
        // The partial unique index caught a concurrent submission.
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            let existing = active_request_for(conn, &student.id)?.unwrap_or_default();
            return Err(DomainError::ActiveRequestExists(existing));
        }
        Err(e) => return Err(e.into()),
    }
    get(conn, &id)
}

/// `UPDATE … WHERE id = ? AND status = ?`; zero rows means someone else moved
/// the request first.
fn cas_update(
    conn: &Connection,
    krs_id: &str,
    expected: KrsStatus,
    assignments: &[(&'static str, Value)],
) -> DomainResult<()> {
    let sets: Vec<String> = assignments.iter().map(|(col, _)| format!("{col} = ?")).collect();
    let sql = format!(
        "UPDATE krs_requests SET {} WHERE id = ? AND status = ?",
        sets.join(", ")
    );
    let mut bind: Vec<Value> = assignments.iter().map(|(_, v)| v.clone()).collect();
    bind.push(Value::Text(krs_id.to_string()));
    bind.push(Value::Text(expected.as_str().to_string()));
    let changed = conn.execute(&sql, params_from_iter(bind))?;
    if changed != 1 {
        return Err(DomainError::Conflict(krs_id.to_string()));
    }
    Ok(())
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn approve(conn: &Connection, actor: &Actor, krs_id: &str) -> DomainResult<KrsRequest> {
    let loaded = get(conn, krs_id)?;
    approve_loaded(conn, actor, &loaded)
}

/// Approves against a previously read snapshot; the write only lands if the
/// stored status still matches the snapshot.
pub fn approve_loaded(conn: &Connection, actor: &Actor, loaded: &KrsRequest) -> DomainResult<KrsRequest> {
    let dept = roster::get_department(conn, &loaded.jurusan_id)?;
    let next = next_status(loaded.status, Action::Approve, dept.require_walas_review)?;
    authorize(actor, loaded, Action::Approve)?;

    let now = db::now_rfc3339();
    let (at_col, by_col) = match loaded.status.review_stage() {
        Some(Stage::Produktif) => ("produktif_approved_at", "produktif_approved_by"),
        Some(Stage::Walas) => ("walas_approved_at", "walas_approved_by"),
        Some(Stage::Hod) => ("hod_approved_at", "hod_approved_by"),
        None => {
            return Err(DomainError::InvalidTransition {
                from: loaded.status.as_str().to_string(),
                action: Action::Approve.as_str().to_string(),
            })
        }
    };
    cas_update(
        conn,
        &loaded.id,
        loaded.status,
        &[
            ("status", text(next.as_str())),
            (at_col, text(&now)),
            (by_col, text(actor.id())),
            ("updated_at", text(&now)),
        ],
    )?;
    tracing::info!(krs = %loaded.id, from = loaded.status.as_str(), to = next.as_str(), by = actor.id(), "krs approved");
    get(conn, &loaded.id)
}

pub fn reject(conn: &Connection, actor: &Actor, krs_id: &str, reason: &str) -> DomainResult<KrsRequest> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(DomainError::bad_params("reason must not be empty"));
    }
    let loaded = get(conn, krs_id)?;
    let next = next_status(loaded.status, Action::Reject, false)?;
    authorize(actor, &loaded, Action::Reject)?;

    let now = db::now_rfc3339();
    cas_update(
        conn,
        &loaded.id,
        loaded.status,
        &[
            ("status", text(next.as_str())),
            ("notes", text(reason)),
            ("rejected_at", text(&now)),
            ("rejected_by", text(actor.id())),
            ("updated_at", text(&now)),
        ],
    )?;
    tracing::info!(krs = %loaded.id, from = loaded.status.as_str(), by = actor.id(), "krs rejected");
    get(conn, &loaded.id)
}

pub fn parse_date(raw: &str, field: &str) -> DomainResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| DomainError::bad_params(format!("{field} must be YYYY-MM-DD")))
}

/// Department head fixes the exam date of an approved request. The date may
/// not lie in the past.
pub fn schedule(
    conn: &Connection,
    actor: &Actor,
    krs_id: &str,
    exam_date: NaiveDate,
    today: NaiveDate,
) -> DomainResult<KrsRequest> {
    let loaded = get(conn, krs_id)?;
    let next = next_status(loaded.status, Action::Schedule, false)?;
    authorize(actor, &loaded, Action::Schedule)?;
    if exam_date < today {
        return Err(DomainError::bad_params("examDate must not be in the past"));
    }

    let now = db::now_rfc3339();
    cas_update(
        conn,
        &loaded.id,
        loaded.status,
        &[
            ("status", text(next.as_str())),
            ("exam_date", text(&exam_date.format("%Y-%m-%d").to_string())),
            ("scheduled_by", text(actor.id())),
            ("updated_at", text(&now)),
        ],
    )?;
    tracing::info!(krs = %loaded.id, exam_date = %exam_date, "krs scheduled");
    get(conn, &loaded.id)
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub final_score: f64,
    pub evidence_urls: Vec<String>,
    /// Outcome for items without an explicit entry in `results`.
    pub hasil: Option<String>,
    /// Item name to outcome.
    pub results: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub request: KrsRequest,
    pub entries: Vec<HistoryEntry>,
    /// Entries written by this call; zero on a retried completion.
    pub created: usize,
}

/// Closes a scheduled request once its exam date has come, writing one
/// history entry per item. Status change and inserts share a transaction.
pub fn complete(
    conn: &Connection,
    actor: &Actor,
    krs_id: &str,
    completion: &Completion,
    today: NaiveDate,
) -> DomainResult<CompletionOutcome> {
    let loaded = get(conn, krs_id)?;
    let next = next_status(loaded.status, Action::Complete, false)?;
    authorize(actor, &loaded, Action::Complete)?;

    let exam_date = loaded
        .exam_date
        .as_deref()
        .ok_or_else(|| DomainError::bad_params("request has no exam date"))
        .and_then(|d| parse_date(d, "examDate"))?;
    if exam_date > today {
        return Err(DomainError::bad_params(format!(
            "exam on {exam_date} has not taken place yet"
        )));
    }
    let score = completion.final_score;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(DomainError::bad_params("finalScore must be between 0 and 100"));
    }
    let evidence = validate_urls(&completion.evidence_urls)?;
    let outcomes = item_outcomes(&loaded.items, completion)?;
    let student: Student = roster::get_student(conn, &loaded.student_id)?;

    let tx = conn.unchecked_transaction()?;
    let now = db::now_rfc3339();
    cas_update(
        &tx,
        &loaded.id,
        loaded.status,
        &[
            ("status", text(next.as_str())),
            ("final_score", Value::Real(score)),
            (
                "evidence_urls",
                text(&serde_json::to_string(&evidence).unwrap_or_else(|_| "[]".into())),
            ),
            ("completed_at", text(&now)),
            ("assessor_id", text(actor.id())),
            ("updated_at", text(&now)),
        ],
    )?;
    let mut created = 0;
    for (item, hasil) in loaded.items.iter().zip(outcomes) {
        let entry = NewEntry {
            unit_name: item.name.clone(),
            level_rank: item.level_rank,
            hasil: hasil.to_string(),
            assessed_on: Some(today.format("%Y-%m-%d").to_string()),
            notes: format!("Uji kompetensi KRS, nilai akhir {score}"),
            evidence_photos: evidence.clone(),
            ..NewEntry::default()
        };
        if ledger::record_for_krs(&tx, actor, &student, &loaded.id, &entry)? {
            created += 1;
        }
    }
    tx.commit()?;
    tracing::info!(krs = %loaded.id, final_score = score, created, "krs completed");

    Ok(CompletionOutcome {
        request: get(conn, &loaded.id)?,
        entries: ledger::list_for_krs(conn, &loaded.id)?,
        created,
    })
}

/// Canonical outcome per item, in item order.
fn item_outcomes(items: &[KrsItem], completion: &Completion) -> DomainResult<Vec<&'static str>> {
    let mut by_item: HashMap<String, &str> = HashMap::with_capacity(completion.results.len());
    for (key, hasil) in &completion.results {
        if by_item.insert(key.trim().to_lowercase(), hasil.as_str()).is_some() {
            return Err(DomainError::bad_params(format!(
                "duplicate result for item {}",
                key.trim()
            )));
        }
    }
    let known: HashSet<String> = items.iter().map(|i| i.name.to_lowercase()).collect();
    if let Some(unknown) = by_item.keys().find(|k| !known.contains(*k)) {
        return Err(DomainError::bad_params(format!(
            "result for unknown item {unknown}"
        )));
    }
    items
        .iter()
        .map(|item| {
            let raw = by_item
                .get(&item.name.to_lowercase())
                .copied()
                .or(completion.hasil.as_deref())
                .ok_or_else(|| {
                    DomainError::bad_params(format!("missing outcome for item {}", item.name))
                })?;
            ledger::parse_outcome(raw)
        })
        .collect()
}
