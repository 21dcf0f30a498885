use crate::auth::{self, Actor};
use crate::db;
use crate::ipc::helpers::{
    get_required_str, read_conn, require_actor, respond, with_source, write_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::seed;
use serde_json::json;
use std::path::PathBuf;

fn health(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "fallbackEnabled": state.fallback_enabled,
        "fallbackActive": state.db.is_none() && state.fallback.is_some(),
        "authenticated": state.session.is_some(),
    }))
}

/// Opens (or creates) the workspace database. Switching workspaces keeps the
/// session only if its account also exists in the new store.
pub fn select_workspace(state: &mut AppState, path: PathBuf) -> Result<serde_json::Value, HandlerErr> {
    let conn = db::open_db(&path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    if let Some(session) = state.session.take() {
        match auth::resume(&conn, &session) {
            Ok(s) => state.session = Some(s),
            Err(e) => tracing::info!(error = %e, "session dropped on workspace switch"),
        }
    }
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.fallback = None;
    tracing::info!(path = %path.to_string_lossy(), "workspace opened");
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "dbFile": path.join(db::DB_FILE_NAME).to_string_lossy(),
    }))
}

fn workspace_select(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let path = get_required_str(params, "path").map(PathBuf::from)?;
    select_workspace(state, path)
}

fn workspace_seed_demo(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = write_conn(state)?;
    let seeded = seed::seed_demo(conn)
        .map_err(|e| HandlerErr::new("db_insert_failed", format!("{e:#}")))?;
    Ok(json!({ "seeded": seeded }))
}

fn settings_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = get_required_str(params, "key")?;
    let (conn, source) = read_conn(state)?;
    let value = db::settings_get_json(conn, &key)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(with_source(json!({ "key": key, "value": value }), source))
}

fn settings_set(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    if !matches!(actor, Actor::Hod { .. }) {
        return Err(HandlerErr::new("forbidden", "only department heads may change settings"));
    }
    let key = get_required_str(params, "key")?;
    let Some(value) = params.get("value") else {
        return Err(HandlerErr::bad_params("missing value"));
    };
    let conn = write_conn(state)?;
    db::settings_set_json(conn, &key, value)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tracing::info!(key = %key, by = actor.id(), "setting updated");
    Ok(json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => health(state),
        "workspace.select" => workspace_select(state, &req.params),
        "workspace.seedDemo" => workspace_seed_demo(state),
        "settings.get" => settings_get(state, &req.params),
        "settings.set" => settings_set(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
