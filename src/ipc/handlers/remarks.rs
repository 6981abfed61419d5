use crate::calc::{self, decimal_from_mark, RemarkBand};
use crate::ipc::error::{err, marks_err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BandInput {
    min_mark: f64,
    max_mark: f64,
    grade: String,
    #[serde(default)]
    remark: String,
}

fn parse_bands(req: &Request) -> Result<Vec<RemarkBand>, serde_json::Value> {
    let Some(raw) = req.params.get("bands") else {
        return Err(err(&req.id, "bad_params", "missing bands", None));
    };
    let inputs: Vec<BandInput> = serde_json::from_value(raw.clone()).map_err(|e| {
        err(
            &req.id,
            "bad_params",
            format!("bands must be a list of {{minMark, maxMark, grade, remark}}: {}", e),
            None,
        )
    })?;

    let mut bands = Vec::with_capacity(inputs.len());
    for (i, b) in inputs.into_iter().enumerate() {
        let bad = |message: &str| {
            err(
                &req.id,
                "bad_params",
                format!("bands[{}]: {}", i, message),
                Some(json!({ "index": i })),
            )
        };
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(b.min_mark) || !in_range(b.max_mark) {
            return Err(bad("bounds must be between 0 and 100"));
        }
        if b.min_mark > b.max_mark {
            return Err(bad("minMark must not exceed maxMark"));
        }
        let grade = b.grade.trim().to_string();
        if grade.is_empty() {
            return Err(bad("grade must not be empty"));
        }
        let (Some(min_mark), Some(max_mark)) =
            (decimal_from_mark(b.min_mark), decimal_from_mark(b.max_mark))
        else {
            return Err(bad("bounds must be numbers"));
        };
        bands.push(RemarkBand {
            min_mark,
            max_mark,
            grade,
            remark: b.remark.trim().to_string(),
        });
    }
    Ok(bands)
}

fn handle_remarks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::load_remark_bands(conn) {
        Ok(bands) => ok(&req.id, json!({ "bands": bands })),
        Err(e) => marks_err(&req.id, e),
    }
}

fn handle_remarks_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bands = match parse_bands(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = store::replace_remark_bands(conn, &bands) {
        return marks_err(&req.id, e);
    }

    // Overlaps and gaps are stored as given; the caller gets them back to review.
    let coverage = calc::band_coverage(&bands);
    info!(
        bands = bands.len(),
        gaps = coverage.gaps.len(),
        overlaps = coverage.overlaps.len(),
        "remark bands replaced"
    );
    ok(
        &req.id,
        json!({ "count": bands.len(), "coverage": coverage }),
    )
}

fn handle_remarks_coverage(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::load_remark_bands(conn) {
        Ok(bands) => ok(&req.id, json!(calc::band_coverage(&bands))),
        Err(e) => marks_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "remarks.list" => Some(handle_remarks_list(state, req)),
        "remarks.replace" => Some(handle_remarks_replace(state, req)),
        "remarks.coverage" => Some(handle_remarks_coverage(state, req)),
        _ => None,
    }
}
