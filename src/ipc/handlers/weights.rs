use crate::calc::WeightConfig;
use crate::ipc::error::{err, marks_err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;
use tracing::info;

fn weight_param(req: &Request, key: &str) -> Result<u32, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be a non-negative integer", key),
                Some(json!({ "value": req.params.get(key) })),
            )
        })
}

fn weights_result(weights: &WeightConfig, is_default: bool) -> serde_json::Value {
    json!({
        "midWeight": weights.mid_weight,
        "classWeight": weights.class_weight,
        "examWeight": weights.exam_weight,
        "isDefault": is_default,
        "sum": weights.sum(),
        "sumIs100": weights.sum() == 100,
    })
}

fn handle_weights_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match store::load_weights(conn) {
        Ok(resolved) => ok(
            &req.id,
            weights_result(&resolved.weights, resolved.is_default),
        ),
        Err(e) => marks_err(&req.id, e),
    }
}

fn handle_weights_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weights = match (
        weight_param(req, "midWeight"),
        weight_param(req, "classWeight"),
        weight_param(req, "examWeight"),
    ) {
        (Ok(mid_weight), Ok(class_weight), Ok(exam_weight)) => WeightConfig {
            mid_weight,
            class_weight,
            exam_weight,
        },
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return e,
    };

    if let Err(e) = store::save_weights(conn, &weights) {
        return marks_err(&req.id, e);
    }
    info!(
        mid = weights.mid_weight,
        class = weights.class_weight,
        exam = weights.exam_weight,
        "weights updated"
    );
    ok(&req.id, weights_result(&weights, false))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "weights.get" => Some(handle_weights_get(state, req)),
        "weights.update" => Some(handle_weights_update(state, req)),
        _ => None,
    }
}
