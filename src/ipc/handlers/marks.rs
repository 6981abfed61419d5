use crate::calc::{self, MarkKey, MarkSource};
use crate::ipc::error::{err, marks_err, ok};
use crate::ipc::helpers::{db_conn, required_mark, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use serde_json::json;

fn source_param(req: &Request) -> Result<MarkSource, serde_json::Value> {
    let raw = required_str(req, "source")?;
    MarkSource::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "source must be one of: midterm, classScore, examScore",
            Some(json!({ "source": raw })),
        )
    })
}

fn key_params(req: &Request) -> Result<MarkKey, serde_json::Value> {
    Ok(MarkKey {
        student_id: required_str(req, "studentId")?,
        subject_id: required_str(req, "subjectId")?,
        term_id: required_str(req, "termId")?,
        academic_year_id: required_str(req, "academicYearId")?,
    })
}

fn handle_marks_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let source = match source_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match key_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total = match required_mark(req, "totalMarks") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match store::record_mark(conn, source, &key, total) {
        Ok(()) => ok(
            &req.id,
            json!({ "source": source.as_str(), "totalMarks": total }),
        ),
        Err(e) => marks_err(&req.id, e),
    }
}

fn handle_marks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let source = match source_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match key_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match store::delete_mark(conn, source, &key) {
        Ok(true) => ok(&req.id, json!({ "deleted": true })),
        Ok(false) => err(&req.id, "not_found", "mark not found", None),
        Err(e) => marks_err(&req.id, e),
    }
}

fn handle_marks_master(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = match calc::parse_master_filters(req.params.get("filters")) {
        Ok(v) => v,
        Err(e) => return marks_err(&req.id, e),
    };

    match calc::compute_master_marks(conn, &filters) {
        Ok(report) => ok(&req.id, json!(report)),
        Err(e) => marks_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.record" => Some(handle_marks_record(state, req)),
        "marks.delete" => Some(handle_marks_delete(state, req)),
        "marks.master" => Some(handle_marks_master(state, req)),
        _ => None,
    }
}
