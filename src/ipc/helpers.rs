use crate::auth::Actor;
use crate::error::DomainError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::ledger::HistoryEntry;
use crate::roster::StudentFilter;
use crate::seed;
use rusqlite::Connection;
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<DomainError> for HandlerErr {
    fn from(e: DomainError) -> Self {
        let details = match &e {
            DomainError::InvalidTransition { from, action } => {
                Some(json!({ "status": from, "action": action }))
            }
            DomainError::ActiveRequestExists(krs_id) => Some(json!({ "krsId": krs_id })),
            _ => None,
        };
        HandlerErr {
            code: e.code(),
            message: e.to_string(),
            details,
        }
    }
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn no_workspace() -> HandlerErr {
    HandlerErr::new("no_workspace", "select a workspace first")
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Trimmed string param; blank counts as absent.
pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    match params.get(key) {
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
        None => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn get_optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a list of strings", key)))
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a list of strings", key))),
    }
}

/// Connection for read operations: the workspace when one is open, otherwise
/// the demo fallback (built on first use). The second value names the source.
pub fn read_conn(state: &mut AppState) -> Result<(&Connection, &'static str), HandlerErr> {
    if state.db.is_none() && state.fallback.is_none() {
        if !state.fallback_enabled {
            return Err(no_workspace());
        }
        let conn = seed::open_fallback()
            .map_err(|e| HandlerErr::new("db_open_failed", format!("fallback dataset: {e:#}")))?;
        tracing::info!("no workspace open, serving reads from the demo dataset");
        state.fallback = Some(conn);
    }
    match (state.db.as_ref(), state.fallback.as_ref()) {
        (Some(conn), _) => Ok((conn, "workspace")),
        (None, Some(conn)) => Ok((conn, "fallback")),
        (None, None) => Err(no_workspace()),
    }
}

/// Mutations only ever run against the workspace.
pub fn write_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(no_workspace)
}

pub fn require_actor(state: &AppState) -> Result<Actor, HandlerErr> {
    state
        .session
        .as_ref()
        .map(|s| s.actor.clone())
        .ok_or_else(|| HandlerErr::from(DomainError::Unauthenticated))
}

pub fn require_staff(state: &AppState) -> Result<Actor, HandlerErr> {
    let actor = require_actor(state)?;
    actor.require_staff()?;
    Ok(actor)
}

/// Adds `"source"` to an object result.
pub fn with_source(mut value: serde_json::Value, source: &str) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        obj.insert("source".into(), json!(source));
    }
    value
}

/// Student filter from params, narrowed to what the staff actor may see.
/// Asking for another department (or another class, for a homeroom teacher)
/// is refused rather than silently rewritten.
pub fn scoped_filter(actor: &Actor, params: &serde_json::Value) -> Result<StudentFilter, HandlerErr> {
    let jurusan_id = get_optional_str(params, "jurusanId");
    let class_name = get_optional_str(params, "className");
    if let Some(j) = &jurusan_id {
        if j != actor.jurusan_id() && !matches!(actor, Actor::Walas { .. }) {
            return Err(DomainError::forbidden("other departments are out of scope").into());
        }
    }
    match actor {
        Actor::Student { .. } => Err(DomainError::forbidden("staff only").into()),
        Actor::Walas {
            class_name: own, ..
        } => {
            if class_name.as_deref().is_some_and(|c| c != own.as_str()) {
                return Err(DomainError::forbidden("other classes are out of scope").into());
            }
            Ok(StudentFilter {
                jurusan_id,
                class_name: Some(own.clone()),
            })
        }
        Actor::Produktif { jurusan_id: own, .. } | Actor::Hod { jurusan_id: own, .. } => {
            Ok(StudentFilter {
                jurusan_id: Some(own.clone()),
                class_name,
            })
        }
    }
}

pub fn history_json(entry: &HistoryEntry) -> serde_json::Value {
    let mut v = serde_json::to_value(entry).unwrap_or_default();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("passed".into(), json!(entry.passed()));
        obj.insert(
            "certificateEligible".into(),
            json!(entry.certificate_eligible()),
        );
    }
    v
}
