use crate::error::DomainError;
use crate::ipc::helpers::{
    get_optional_i64, get_optional_str, get_required_str, get_string_list, history_json,
    read_conn, require_actor, require_staff, respond, with_source, write_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, NewEntry};
use crate::roster;
use serde_json::json;

fn history_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let (conn, source) = read_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    if !actor.can_view_student(&student) {
        return Err(DomainError::forbidden("student is out of scope").into());
    }
    let entries: Vec<serde_json::Value> = ledger::list_for_student(conn, &student.id)?
        .iter()
        .map(history_json)
        .collect();
    Ok(with_source(
        json!({ "studentId": student.id, "entries": entries }),
        source,
    ))
}

fn history_record(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_staff(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let entry = NewEntry {
        unit_name: get_required_str(params, "unitName")?,
        unit_description: get_optional_str(params, "unitDescription").unwrap_or_default(),
        level_rank: get_optional_i64(params, "levelRank")?,
        hasil: get_required_str(params, "hasil")?,
        assessed_on: get_optional_str(params, "assessedOn"),
        notes: get_optional_str(params, "notes").unwrap_or_default(),
        evidence_photos: get_string_list(params, "evidencePhotos")?,
        evidence_videos: get_string_list(params, "evidenceVideos")?,
    };

    let conn = write_conn(state)?;
    let student = roster::get_student(conn, &student_id)?;
    let recorded = ledger::record(conn, &actor, &student, &entry)?;
    tracing::info!(
        student = %student.id,
        entry = %recorded.id,
        hasil = %recorded.hasil,
        "competency recorded"
    );
    Ok(json!({ "entry": history_json(&recorded) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "history.list" => history_list(state, &req.params),
        "history.record" => history_record(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
