use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = req.params.get("outPath").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    match backup::export_workspace_bundle(&workspace, &PathBuf::from(out_path)) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "outPath": out_path,
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256
            }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(in_path) = req.params.get("inPath").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };

    // Close the live handle before swapping the file underneath it.
    state.db = None;
    match backup::import_workspace_bundle(&PathBuf::from(in_path), &workspace) {
        Ok(summary) => {
            state.workspace = None;
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "requiresWorkspaceSelect": true
                }),
            )
        }
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
