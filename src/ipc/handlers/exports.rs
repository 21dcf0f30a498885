use crate::error::DomainError;
use crate::export;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, history_json, read_conn, require_actor, require_staff,
    respond, scoped_filter, with_source, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::levels;
use crate::roster;
use serde_json::json;
use std::path::PathBuf;

fn certificate_model(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let history_id = get_required_str(params, "historyId")?;
    let (conn, source) = read_conn(state)?;
    let entry = ledger::get(conn, &history_id)?;
    let student = roster::get_student(conn, &entry.student_id)?;
    if !actor.can_view_student(&student) {
        return Err(DomainError::forbidden("student is out of scope").into());
    }
    let model = export::certificate_model(conn, &entry)?;
    Ok(with_source(json!({ "certificate": model }), source))
}

fn export_spreadsheet(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let out_path = get_required_str(params, "outPath").map(PathBuf::from)?;
    let filter = scoped_filter(&actor, params)?;
    let (conn, source) = read_conn(state)?;
    let summary = export::export_spreadsheet(conn, &filter, &out_path)
        .map_err(|e| HandlerErr::new("export_failed", format!("{e:#}")))?;
    tracing::info!(
        path = %summary.path,
        students = summary.sheets.first().map(|s| s.rows).unwrap_or(0),
        "spreadsheet exported"
    );
    Ok(with_source(json!({ "export": summary }), source))
}

/// Public verification view. No session needed; identity fields limited to
/// what a printed passport already shows.
fn passport_verify(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_optional_str(params, "studentId");
    let nis = get_optional_str(params, "nis");
    let (conn, source) = read_conn(state)?;
    let student = match (student_id, nis) {
        (Some(id), _) => roster::get_student(conn, &id)?,
        (None, Some(nis)) => roster::find_student_by_nis(conn, &nis)?
            .ok_or_else(|| DomainError::NotFound(format!("student with NIS {nis}")))?,
        (None, None) => return Err(HandlerErr::bad_params("missing studentId or nis")),
    };
    let department = roster::get_department(conn, &student.jurusan_id)?;
    let skill = roster::skill_record(conn, &student.id).unwrap_or_default();
    let level = levels::resolve_for_score(conn, Some(student.jurusan_id.as_str()), skill.score);
    let history: Vec<serde_json::Value> = ledger::list_for_student(conn, &student.id)?
        .iter()
        .map(history_json)
        .collect();
    let certified = history
        .iter()
        .filter(|h| h["certificateEligible"].as_bool() == Some(true))
        .count();
    Ok(with_source(
        json!({
            "student": {
                "id": student.id,
                "nis": student.nis,
                "name": student.name,
                "className": student.class_name,
            },
            "department": {
                "code": department.code,
                "name": department.name,
            },
            "level": roster::LevelBadge::from(&level),
            "history": history,
            "certifiedUnits": certified,
            "verifiedAt": crate::db::now_rfc3339(),
        }),
        source,
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "certificates.model" => certificate_model(state, &req.params),
        "export.spreadsheet" => export_spreadsheet(state, &req.params),
        "passport.verify" => passport_verify(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
