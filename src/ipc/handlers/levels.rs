use crate::ipc::helpers::{get_optional_str, get_required_f64, read_conn, respond, with_source, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::levels;
use serde_json::json;

fn levels_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let jurusan_id = get_optional_str(params, "jurusanId");
    let (conn, source) = read_conn(state)?;
    let catalog = levels::catalog_for_department(conn, jurusan_id.as_deref())?;
    Ok(with_source(json!({ "levels": catalog }), source))
}

fn levels_resolve(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let score = get_required_f64(params, "score")?;
    let jurusan_id = get_optional_str(params, "jurusanId");
    let (conn, source) = read_conn(state)?;
    let catalog = levels::catalog_for_department(conn, jurusan_id.as_deref())?;
    let level = levels::resolve_level(&catalog, score);
    Ok(with_source(json!({ "score": score, "level": level }), source))
}

fn levels_validate(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let jurusan_id = get_optional_str(params, "jurusanId");
    let (conn, source) = read_conn(state)?;
    let catalog = levels::catalog_for_department(conn, jurusan_id.as_deref())?;
    levels::validate_catalog(&catalog)?;
    Ok(with_source(json!({ "valid": true, "levels": catalog.len() }), source))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "levels.list" => levels_list(state, &req.params),
        "levels.resolve" => levels_resolve(state, &req.params),
        "levels.validate" => levels_validate(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
