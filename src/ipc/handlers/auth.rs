use crate::auth::{self, Credentials, Role, Session};
use crate::ipc::helpers::{get_required_str, read_conn, respond, with_source, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn session_json(session: &Session) -> serde_json::Value {
    json!({
        "actor": session.actor,
        "username": session.username,
        "loggedInAt": session.logged_in_at,
        "sessionBlob": session.to_blob(),
    })
}

fn login(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let role_raw = get_required_str(params, "role")?;
    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerErr::bad_params(format!("unknown role {role_raw:?}")));
    };
    // Not trimmed: the staff password is compared exactly.
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?
        .to_string();
    let staff_password = state.staff_password.clone();

    let (conn, source) = read_conn(state)?;
    let creds = Credentials {
        username: &username,
        role,
        password: &password,
    };
    let session = match auth::login(conn, &creds, &staff_password) {
        Ok(s) => s,
        Err(e) => {
            tracing::info!(role = role.as_str(), "login refused");
            return Err(e.into());
        }
    };
    tracing::info!(role = role.as_str(), actor = session.actor.id(), "login");
    let body = with_source(session_json(&session), source);
    state.session = Some(session);
    Ok(body)
}

fn resume(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let blob = get_required_str(params, "sessionBlob")?;
    let stored = Session::from_blob(&blob)?;
    let (conn, source) = read_conn(state)?;
    let session = auth::resume(conn, &stored)?;
    let body = with_source(session_json(&session), source);
    state.session = Some(session);
    Ok(body)
}

fn current(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(match &state.session {
        Some(s) => {
            let mut v = session_json(s);
            v["authenticated"] = json!(true);
            v
        }
        None => json!({ "authenticated": false }),
    })
}

fn logout(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    if let Some(s) = &state.session {
        tracing::info!(actor = s.actor.id(), "logout");
    }
    state.reset_session();
    Ok(json!({ "authenticated": false }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.login" => login(state, &req.params),
        "auth.resume" => resume(state, &req.params),
        "auth.session" => current(state),
        "auth.logout" => logout(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
