use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of the stdin protocol. `params` defaults to null so bare
/// `{id, method}` calls still parse.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Session state: both fields stay None until workspace.select succeeds.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
        }
    }
}
