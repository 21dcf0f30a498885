use crate::db;
use crate::error::DomainError;
use crate::events::WorkflowEvent;
use crate::ipc::helpers::{
    get_optional_str, get_required_f64, get_required_str, get_string_list, history_json,
    read_conn, require_actor, respond, with_source, write_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::krs::{self, Completion, KrsItem, KrsItemInput, KrsRequest, KrsStatus};
use crate::ledger;
use serde_json::json;
use std::collections::HashMap;

fn krs_json(request: &KrsRequest) -> serde_json::Value {
    let mut v = serde_json::to_value(request).unwrap_or_default();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("progress".into(), json!(request.status.progress()));
        obj.insert("terminal".into(), json!(request.status.is_terminal()));
    }
    v
}

fn parse_items(params: &serde_json::Value) -> Result<Vec<KrsItem>, HandlerErr> {
    let Some(raw) = params.get("items") else {
        return Err(HandlerErr::bad_params("missing items"));
    };
    let inputs: Vec<KrsItemInput> = serde_json::from_value(raw.clone()).map_err(|_| {
        HandlerErr::bad_params("items must be unit names or {name, levelRank} objects")
    })?;
    Ok(inputs.into_iter().map(KrsItem::from).collect())
}

/// Per-item outcomes, either `[{item, hasil}]` or `{item: hasil}`.
fn parse_results(params: &serde_json::Value) -> Result<HashMap<String, String>, HandlerErr> {
    let mut out = HashMap::new();
    match params.get("results") {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Array(rows)) => {
            for row in rows {
                let item = get_required_str(row, "item")?;
                let hasil = get_required_str(row, "hasil")?;
                if out.contains_key(&item) {
                    return Err(HandlerErr::bad_params(format!(
                        "duplicate result for item {item}"
                    )));
                }
                out.insert(item, hasil);
            }
        }
        Some(serde_json::Value::Object(map)) => {
            for (item, hasil) in map {
                let Some(h) = hasil.as_str() else {
                    return Err(HandlerErr::bad_params("results values must be strings"));
                };
                out.insert(item.clone(), h.to_string());
            }
        }
        Some(_) => return Err(HandlerErr::bad_params("results must be a list or an object")),
    }
    Ok(out)
}

fn krs_submit(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let items = parse_items(params)?;
    let evidence = get_string_list(params, "evidenceUrls")?;

    let conn = write_conn(state)?;
    let request = krs::submit(conn, &actor, &items, &evidence)?;
    state.events.publish(
        conn,
        &WorkflowEvent::KrsSubmitted {
            krs_id: request.id.clone(),
            student_id: request.student_id.clone(),
            student_name: request.student_name.clone(),
            jurusan_id: request.jurusan_id.clone(),
        },
    );
    Ok(json!({ "request": krs_json(&request) }))
}

fn krs_approve(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let krs_id = get_required_str(params, "krsId")?;

    let conn = write_conn(state)?;
    let request = krs::approve(conn, &actor, &krs_id)?;
    state.events.publish(
        conn,
        &WorkflowEvent::KrsAdvanced {
            krs_id: request.id.clone(),
            student_id: request.student_id.clone(),
            jurusan_id: request.jurusan_id.clone(),
            class_name: request.class_name.clone(),
            new_status: request.status.as_str().to_string(),
        },
    );
    Ok(json!({ "request": krs_json(&request) }))
}

fn krs_reject(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let krs_id = get_required_str(params, "krsId")?;
    let reason = get_required_str(params, "reason")?;

    let conn = write_conn(state)?;
    let request = krs::reject(conn, &actor, &krs_id, &reason)?;
    state.events.publish(
        conn,
        &WorkflowEvent::KrsRejected {
            krs_id: request.id.clone(),
            student_id: request.student_id.clone(),
            reason,
        },
    );
    Ok(json!({ "request": krs_json(&request) }))
}

fn krs_schedule(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let krs_id = get_required_str(params, "krsId")?;
    let exam_date = krs::parse_date(&get_required_str(params, "examDate")?, "examDate")?;

    let conn = write_conn(state)?;
    let request = krs::schedule(conn, &actor, &krs_id, exam_date, db::today())?;
    state.events.publish(
        conn,
        &WorkflowEvent::KrsScheduled {
            krs_id: request.id.clone(),
            student_id: request.student_id.clone(),
            exam_date: request.exam_date.clone().unwrap_or_default(),
        },
    );
    Ok(json!({ "request": krs_json(&request) }))
}

fn krs_complete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let krs_id = get_required_str(params, "krsId")?;
    let completion = Completion {
        final_score: get_required_f64(params, "finalScore")?,
        evidence_urls: get_string_list(params, "evidenceUrls")?,
        hasil: get_optional_str(params, "hasil"),
        results: parse_results(params)?,
    };

    let conn = write_conn(state)?;
    let outcome = krs::complete(conn, &actor, &krs_id, &completion, db::today())?;
    let passed_items = outcome
        .entries
        .iter()
        .filter(|e| ledger::is_passed(&e.hasil))
        .count();
    state.events.publish(
        conn,
        &WorkflowEvent::KrsCompleted {
            krs_id: outcome.request.id.clone(),
            student_id: outcome.request.student_id.clone(),
            final_score: completion.final_score,
            passed_items,
            total_items: outcome.entries.len(),
        },
    );
    let entries: Vec<serde_json::Value> = outcome.entries.iter().map(history_json).collect();
    Ok(json!({
        "request": krs_json(&outcome.request),
        "entries": entries,
        "created": outcome.created,
    }))
}

fn krs_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let status = match get_optional_str(params, "status") {
        Some(raw) => Some(
            KrsStatus::parse(&raw)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let (conn, source) = read_conn(state)?;
    let requests: Vec<serde_json::Value> = krs::list(conn, &actor, status)?
        .iter()
        .map(krs_json)
        .collect();
    Ok(with_source(json!({ "requests": requests }), source))
}

fn krs_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let krs_id = get_required_str(params, "krsId")?;
    let (conn, source) = read_conn(state)?;
    let request = krs::get(conn, &krs_id)?;
    if !krs::can_view(&actor, &request) {
        return Err(DomainError::forbidden("request is out of scope").into());
    }
    let entries: Vec<serde_json::Value> = ledger::list_for_krs(conn, &request.id)?
        .iter()
        .map(history_json)
        .collect();
    Ok(with_source(
        json!({ "request": krs_json(&request), "entries": entries }),
        source,
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "krs.submit" => krs_submit(state, &req.params),
        "krs.approve" => krs_approve(state, &req.params),
        "krs.reject" => krs_reject(state, &req.params),
        "krs.schedule" => krs_schedule(state, &req.params),
        "krs.complete" => krs_complete(state, &req.params),
        "krs.list" => krs_list(state, &req.params),
        "krs.get" => krs_get(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
