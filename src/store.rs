use crate::calc::{
    decimal_from_mark, Directory, MarkKey, MarkSource, MarksError, MasterFilters, RemarkBand,
    ResolvedWeights, SourceMark, StudentRef, WeightConfig,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

fn retrieval(what: &'static str) -> impl Fn(rusqlite::Error) -> MarksError {
    move |source| MarksError::Retrieval { what, source }
}

fn write(what: &'static str) -> impl Fn(rusqlite::Error) -> MarksError {
    move |source| MarksError::Write { what, source }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Real(f) => Some(*f),
        _ => None,
    }
}

/// A stored total or band bound on the 0..=100 scale. Writes enforce the
/// same range, so anything outside it was put there behind our back.
fn stored_mark(value: &Value) -> Option<Decimal> {
    numeric(value)
        .and_then(decimal_from_mark)
        .filter(|m| (Decimal::ZERO..=Decimal::ONE_HUNDRED).contains(m))
}

pub fn load_source_marks(
    conn: &Connection,
    source: MarkSource,
    filters: &MasterFilters,
) -> Result<Vec<SourceMark>, MarksError> {
    let what = source.table();

    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(year) = &filters.academic_year_id {
        clauses.push("academic_year_id = ?");
        bind_values.push(Value::Text(year.clone()));
    }
    if let Some(term) = &filters.term_id {
        clauses.push("term_id = ?");
        bind_values.push(Value::Text(term.clone()));
    }
    if let Some(subject) = &filters.subject_id {
        clauses.push("subject_id = ?");
        bind_values.push(Value::Text(subject.clone()));
    }
    if let Some(class_id) = &filters.class_id {
        clauses.push("student_id IN (SELECT id FROM students WHERE class_id = ?)");
        bind_values.push(Value::Text(class_id.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT student_id, subject_id, term_id, academic_year_id, total_marks
         FROM {}
         {}
         ORDER BY student_id, subject_id, term_id, academic_year_id",
        what, where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(retrieval(what))?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok((
                MarkKey {
                    student_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    term_id: r.get(2)?,
                    academic_year_id: r.get(3)?,
                },
                r.get::<_, Value>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(retrieval(what))?;

    rows.into_iter()
        .map(|(key, raw)| {
            match stored_mark(&raw) {
                Some(total) => Ok(SourceMark { key, total }),
                None => {
                    warn!(table = what, student_id = %key.student_id, "unusable total");
                    Err(MarksError::InvalidMark {
                        what,
                        student_id: key.student_id,
                    })
                }
            }
        })
        .collect()
}

/// The singleton weight row, or the defaults when it is absent or any
/// column is not a non-negative integer.
pub fn load_weights(conn: &Connection) -> Result<ResolvedWeights, MarksError> {
    let row: Option<(Value, Value, Value)> = conn
        .query_row(
            "SELECT mid_weight, class_weight, exam_weight FROM weights ORDER BY id LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(retrieval("weights"))?;

    let Some((mid, class, exam)) = row else {
        return Ok(ResolvedWeights {
            weights: WeightConfig::default(),
            is_default: true,
        });
    };

    match (weight_value(&mid), weight_value(&class), weight_value(&exam)) {
        (Some(mid_weight), Some(class_weight), Some(exam_weight)) => Ok(ResolvedWeights {
            weights: WeightConfig {
                mid_weight,
                class_weight,
                exam_weight,
            },
            is_default: false,
        }),
        _ => {
            warn!("malformed weights row; using defaults");
            Ok(ResolvedWeights {
                weights: WeightConfig::default(),
                is_default: true,
            })
        }
    }
}

fn weight_value(value: &Value) -> Option<u32> {
    match value {
        Value::Integer(n) => u32::try_from(*n).ok(),
        Value::Real(f) if f.is_finite() && f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64 => {
            Some(*f as u32)
        }
        _ => None,
    }
}

pub fn save_weights(conn: &Connection, weights: &WeightConfig) -> Result<(), MarksError> {
    conn.execute(
        "INSERT INTO weights(id, mid_weight, class_weight, exam_weight, updated_at)
         VALUES(1, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           mid_weight = excluded.mid_weight,
           class_weight = excluded.class_weight,
           exam_weight = excluded.exam_weight,
           updated_at = excluded.updated_at",
        (
            weights.mid_weight,
            weights.class_weight,
            weights.exam_weight,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(write("weights"))?;
    Ok(())
}

pub fn load_remark_bands(conn: &Connection) -> Result<Vec<RemarkBand>, MarksError> {
    let mut stmt = conn
        .prepare(
            "SELECT min_mark, max_mark, grade, remark
             FROM remarks
             ORDER BY sort_order, rowid",
        )
        .map_err(retrieval("remarks"))?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, Value>(0)?,
                r.get::<_, Value>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(retrieval("remarks"))?;

    let mut bands = Vec::with_capacity(rows.len());
    for (min, max, grade, remark) in rows {
        let bounds = stored_mark(&min).zip(stored_mark(&max));
        // A band with unreadable bounds can never match.
        let Some((min_mark, max_mark)) = bounds else {
            warn!(grade = %grade, "skipping remark band with unusable bounds");
            continue;
        };
        bands.push(RemarkBand {
            min_mark,
            max_mark,
            grade,
            remark,
        });
    }
    Ok(bands)
}

/// Replace the whole ordered band set; list order becomes stored order.
pub fn replace_remark_bands(conn: &Connection, bands: &[RemarkBand]) -> Result<(), MarksError> {
    let tx = conn.unchecked_transaction().map_err(write("remarks"))?;
    tx.execute("DELETE FROM remarks", []).map_err(write("remarks"))?;
    for (i, band) in bands.iter().enumerate() {
        tx.execute(
            "INSERT INTO remarks(id, min_mark, max_mark, grade, remark, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                band.min_mark.to_string(),
                band.max_mark.to_string(),
                &band.grade,
                &band.remark,
                i as i64,
            ),
        )
        .map_err(write("remarks"))?;
    }
    tx.commit().map_err(write("remarks"))?;
    Ok(())
}

pub fn record_mark(
    conn: &Connection,
    source: MarkSource,
    key: &MarkKey,
    total_marks: f64,
) -> Result<(), MarksError> {
    let sql = format!(
        "INSERT INTO {}(student_id, subject_id, term_id, academic_year_id, total_marks, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term_id, academic_year_id) DO UPDATE SET
           total_marks = excluded.total_marks,
           updated_at = excluded.updated_at",
        source.table()
    );
    conn.execute(
        &sql,
        (
            &key.student_id,
            &key.subject_id,
            &key.term_id,
            &key.academic_year_id,
            total_marks,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(write(source.table()))?;
    Ok(())
}

pub fn delete_mark(conn: &Connection, source: MarkSource, key: &MarkKey) -> Result<bool, MarksError> {
    let sql = format!(
        "DELETE FROM {}
         WHERE student_id = ? AND subject_id = ? AND term_id = ? AND academic_year_id = ?",
        source.table()
    );
    let changed = conn
        .execute(
            &sql,
            (
                &key.student_id,
                &key.subject_id,
                &key.term_id,
                &key.academic_year_id,
            ),
        )
        .map_err(write(source.table()))?;
    Ok(changed > 0)
}

fn load_names(conn: &Connection, table: &'static str) -> Result<HashMap<String, String>, MarksError> {
    let sql = format!("SELECT id, name FROM {}", table);
    let mut stmt = conn.prepare(&sql).map_err(retrieval(table))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(retrieval(table))?;
    Ok(rows)
}

pub fn load_directory(conn: &Connection) -> Result<Directory, MarksError> {
    let mut stmt = conn
        .prepare("SELECT id, last_name, first_name, class_id FROM students")
        .map_err(retrieval("students"))?;
    let students = stmt
        .query_map([], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                StudentRef {
                    display_name: format!("{}, {}", last, first),
                    class_id: r.get(3)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(retrieval("students"))?;

    Ok(Directory {
        students,
        classes: load_names(conn, "classes")?,
        subjects: load_names(conn, "subjects")?,
        terms: load_names(conn, "terms")?,
        academic_years: load_names(conn, "academic_years")?,
    })
}
