use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

use crate::finance;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_f64(req: &Request, key: &str) -> Option<f64> {
    req.params.get(key).and_then(|v| v.as_f64())
}

pub fn opt_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub fn opt_bool(req: &Request, key: &str) -> Option<bool> {
    req.params.get(key).and_then(|v| v.as_bool())
}

/// Accepts an ISO `YYYY-MM-DD` string, rejecting anything chrono can't parse.
pub fn opt_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    match opt_str(req, key) {
        None => Ok(None),
        Some(s) => finance::parse_date(&s).map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a YYYY-MM-DD date", key),
                Some(json!({ key: s })),
            )
        }),
    }
}

pub fn required_date(req: &Request, key: &str) -> Result<NaiveDate, serde_json::Value> {
    let s = required_str(req, key)?;
    finance::parse_date(&s).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            Some(json!({ key: s })),
        )
    })
}

/// Pagination bounds; limit is clamped to 1..=1000.
pub fn limit_offset(req: &Request, default_limit: i64) -> (i64, i64) {
    let limit = opt_i64(req, "limit").unwrap_or(default_limit).clamp(1, 1000);
    let offset = opt_i64(req, "offset").unwrap_or(0).max(0);
    (limit, offset)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn today_string() -> String {
    finance::today().format("%Y-%m-%d").to_string()
}
