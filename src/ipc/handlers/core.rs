use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "app": "formagestd",
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens (or creates) the workspace database and runs the column migrations
/// before any other method can touch it.
fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            let db_path = path.join(db::DB_FILE_NAME);
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "dbPath": db_path.to_string_lossy()
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
