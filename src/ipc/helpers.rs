use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

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

/// Marks and band bounds live on the 0..=100 scale.
pub fn required_mark(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    let Some(v) = req.params.get(key).and_then(|v| v.as_f64()) else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a number", key),
            None,
        ));
    };
    if !(0.0..=100.0).contains(&v) {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be between 0 and 100", key),
            Some(serde_json::json!({ key: v })),
        ));
    }
    Ok(v)
}
