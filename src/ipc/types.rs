use std::path::PathBuf;

use crate::auth::Session;
use crate::config::Config;
use crate::events::EventBus;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Demo dataset served to reads while no workspace is open. Built on
    /// first use, dropped at logout.
    pub fallback: Option<Connection>,
    pub fallback_enabled: bool,
    pub staff_password: String,
    pub session: Option<Session>,
    pub events: EventBus,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        AppState {
            workspace: None,
            db: None,
            fallback: None,
            fallback_enabled: !config.no_fallback,
            staff_password: config.staff_password.clone(),
            session: None,
            events: EventBus::with_notifications(),
        }
    }

    pub fn reset_session(&mut self) {
        self.session = None;
        self.fallback = None;
    }
}
