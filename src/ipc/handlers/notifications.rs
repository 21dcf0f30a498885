use crate::events;
use crate::ipc::helpers::{get_optional_str, read_conn, require_actor, respond, with_source, write_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn notifications_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let unread_only = params
        .get("unreadOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let (conn, source) = read_conn(state)?;
    let items = events::list_notifications(conn, actor.recipient(), unread_only)?;
    let unread = items.iter().filter(|n| !n.read).count();
    Ok(with_source(
        json!({ "notifications": items, "unread": unread }),
        source,
    ))
}

fn notifications_mark_read(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = require_actor(state)?;
    let notification_id = get_optional_str(params, "notificationId");
    let conn = write_conn(state)?;
    let updated = events::mark_read(conn, actor.recipient(), notification_id.as_deref())?;
    Ok(json!({ "updated": updated }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "notifications.list" => notifications_list(state, &req.params),
        "notifications.markRead" => notifications_mark_read(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
