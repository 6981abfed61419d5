use crate::store;
use rusqlite::Connection;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MarksError {
    /// The store could not be read; the whole computation is abandoned.
    #[error("failed to read {what}: {source}")]
    Retrieval {
        what: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// A stored total that is not a number on the 0..=100 scale.
    #[error("{what} holds an unusable total for student {student_id}")]
    InvalidMark {
        what: &'static str,
        student_id: String,
    },

    #[error("failed to write {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{0}")]
    BadParams(String),
}

impl MarksError {
    pub fn code(&self) -> &'static str {
        match self {
            MarksError::Retrieval { .. } => "retrieval_failed",
            MarksError::InvalidMark { .. } => "invalid_mark",
            MarksError::Write { .. } => "db_write_failed",
            MarksError::BadParams(_) => "bad_params",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            MarksError::Retrieval { what, .. } | MarksError::Write { what, .. } => {
                Some(serde_json::json!({ "table": what }))
            }
            MarksError::InvalidMark { what, student_id } => {
                Some(serde_json::json!({ "table": what, "studentId": student_id }))
            }
            MarksError::BadParams(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkSource {
    Midterm,
    ClassScore,
    ExamScore,
}

impl MarkSource {
    pub const ALL: [MarkSource; 3] = [
        MarkSource::Midterm,
        MarkSource::ClassScore,
        MarkSource::ExamScore,
    ];

    pub fn table(self) -> &'static str {
        match self {
            MarkSource::Midterm => "midterm_marks",
            MarkSource::ClassScore => "class_score_marks",
            MarkSource::ExamScore => "exam_score_marks",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarkSource::Midterm => "midterm",
            MarkSource::ClassScore => "classScore",
            MarkSource::ExamScore => "examScore",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "midterm" | "mid" => Some(MarkSource::Midterm),
            "classscore" | "class_score" | "class" => Some(MarkSource::ClassScore),
            "examscore" | "exam_score" | "exam" => Some(MarkSource::ExamScore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkKey {
    pub student_id: String,
    pub subject_id: String,
    pub term_id: String,
    pub academic_year_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceMark {
    pub key: MarkKey,
    pub total: Decimal,
}

/// Raw rows of all three sources for one computation.
#[derive(Debug, Clone, Default)]
pub struct MarkInputs {
    pub midterm: Vec<SourceMark>,
    pub class_score: Vec<SourceMark>,
    pub exam_score: Vec<SourceMark>,
}

impl MarkInputs {
    pub fn source_mut(&mut self, source: MarkSource) -> &mut Vec<SourceMark> {
        match source {
            MarkSource::Midterm => &mut self.midterm,
            MarkSource::ClassScore => &mut self.class_score,
            MarkSource::ExamScore => &mut self.exam_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightConfig {
    pub mid_weight: u32,
    pub class_weight: u32,
    pub exam_weight: u32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            mid_weight: 10,
            class_weight: 20,
            exam_weight: 70,
        }
    }
}

impl WeightConfig {
    pub fn sum(&self) -> u64 {
        self.mid_weight as u64 + self.class_weight as u64 + self.exam_weight as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWeights {
    #[serde(flatten)]
    pub weights: WeightConfig,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemarkBand {
    #[serde(serialize_with = "decimal_number")]
    pub min_mark: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub max_mark: Decimal,
    pub grade: String,
    pub remark: String,
}

impl RemarkBand {
    pub fn contains(&self, mark: Decimal) -> bool {
        self.min_mark <= mark && mark <= self.max_mark
    }
}

#[derive(Debug, Clone, Default)]
pub struct StudentRef {
    pub display_name: String,
    pub class_id: Option<String>,
}

/// Display names joined onto result rows. Unknown ids render as "".
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub students: HashMap<String, StudentRef>,
    pub classes: HashMap<String, String>,
    pub subjects: HashMap<String, String>,
    pub terms: HashMap<String, String>,
    pub academic_years: HashMap<String, String>,
}

fn name_of(map: &HashMap<String, String>, id: &str) -> String {
    map.get(id).cloned().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedMarkRow {
    pub student_id: String,
    pub student_name: String,
    pub class_id: Option<String>,
    pub class_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub term_id: String,
    pub term_name: String,
    pub academic_year_id: String,
    pub academic_year_name: String,
    #[serde(serialize_with = "decimal_number")]
    pub midterm_total: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub midterm_weighted: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub class_score_total: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub class_score_weighted: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub exam_score_total: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub exam_score_weighted: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub final_grade: Decimal,
    pub grade: String,
    pub remark: String,
    pub rank: u32,
    pub rank_label: String,
}

impl CombinedMarkRow {
    fn same_group(&self, other: &CombinedMarkRow) -> bool {
        self.class_name == other.class_name
            && self.term_name == other.term_name
            && self.subject_name == other.subject_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub class_name: String,
    pub term_name: String,
    pub subject_name: String,
    pub student_count: usize,
    #[serde(serialize_with = "decimal_number")]
    pub average: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub highest: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub lowest: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterReport {
    pub weights: ResolvedWeights,
    pub filters: MasterFilters,
    pub rows: Vec<CombinedMarkRow>,
    pub groups: Vec<GroupSummary>,
    pub unclassified_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterFilters {
    pub academic_year_id: Option<String>,
    pub class_id: Option<String>,
    pub term_id: Option<String>,
    pub subject_id: Option<String>,
}

pub fn parse_master_filters(raw: Option<&serde_json::Value>) -> Result<MasterFilters, MarksError> {
    let Some(raw) = raw else {
        return Ok(MasterFilters::default());
    };
    if raw.is_null() {
        return Ok(MasterFilters::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err(MarksError::BadParams("filters must be an object".into()));
    };

    let field = |key: &str| -> Result<Option<String>, MarksError> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => {
                let Some(s) = v.as_str() else {
                    return Err(MarksError::BadParams(format!(
                        "filters.{} must be string or null",
                        key
                    )));
                };
                let t = s.trim();
                if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                    Ok(None)
                } else {
                    Ok(Some(t.to_string()))
                }
            }
        }
    };

    Ok(MasterFilters {
        academic_year_id: field("academicYearId")?,
        class_id: field("classId")?,
        term_id: field("termId")?,
        subject_id: field("subjectId")?,
    })
}

/// Exact decimal form of a stored total; `None` for NaN, infinities and
/// magnitudes a `Decimal` cannot hold.
pub fn decimal_from_mark(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_str(&value.to_string()).ok()
}

/// Emit a decimal as the JSON number nearest its text form.
fn decimal_number<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let n = f64::from_str(&value.to_string()).map_err(serde::ser::Error::custom)?;
    serializer.serialize_f64(n)
}

/// Half-up rounding to two places. Totals and bounds are range-checked to
/// 0..=100 on read, so midpoints away from zero are midpoints up.
pub fn round_half_up_2(x: Decimal) -> Decimal {
    x.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn weighted_component(total: Decimal, weight: u32) -> Decimal {
    round_half_up_2(total * Decimal::from(weight) / Decimal::ONE_HUNDRED)
}

/// First band in stored order containing `mark`.
pub fn classify(bands: &[RemarkBand], mark: Decimal) -> Option<&RemarkBand> {
    bands.iter().find(|b| b.contains(mark))
}

/// Competition ranks for scores already sorted in descending order:
/// ties share a rank and the next distinct score skips past them.
pub fn competition_ranks<I>(sorted_desc: I) -> Vec<u32>
where
    I: IntoIterator<Item = Decimal>,
{
    let mut ranks: Vec<u32> = Vec::new();
    let mut prev: Option<Decimal> = None;
    for (i, score) in sorted_desc.into_iter().enumerate() {
        let rank = match (prev, ranks.last()) {
            (Some(p), Some(&r)) if p == score => r,
            _ => i as u32 + 1,
        };
        ranks.push(rank);
        prev = Some(score);
    }
    ranks
}

pub fn ordinal_label(rank: u32) -> String {
    let suffix = match (rank % 10, rank % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", rank, suffix)
}

/// Combine, classify, group and rank. Pure: everything it depends on is
/// passed in, and the output order is fully determined by the inputs.
pub fn aggregate(
    inputs: &MarkInputs,
    directory: &Directory,
    weights: &WeightConfig,
    bands: &[RemarkBand],
) -> Vec<CombinedMarkRow> {
    // [midterm, class score, exam score]; absent sources stay zero.
    let mut totals: BTreeMap<&MarkKey, [Decimal; 3]> = BTreeMap::new();
    let sources = [&inputs.midterm, &inputs.class_score, &inputs.exam_score];
    for (slot, marks) in sources.into_iter().enumerate() {
        for m in marks {
            totals.entry(&m.key).or_insert([Decimal::ZERO; 3])[slot] = m.total;
        }
    }

    let mut rows: Vec<CombinedMarkRow> = totals
        .into_iter()
        .map(|(key, [mid, class_score, exam])| {
            let midterm_weighted = weighted_component(mid, weights.mid_weight);
            let class_score_weighted = weighted_component(class_score, weights.class_weight);
            let exam_score_weighted = weighted_component(exam, weights.exam_weight);
            let final_grade =
                round_half_up_2(midterm_weighted + class_score_weighted + exam_score_weighted);

            let (grade, remark) = classify(bands, final_grade)
                .map(|b| (b.grade.clone(), b.remark.clone()))
                .unwrap_or_default();

            let student = directory.students.get(&key.student_id);
            let class_id = student.and_then(|s| s.class_id.clone());
            let class_name = class_id
                .as_deref()
                .map(|id| name_of(&directory.classes, id))
                .unwrap_or_default();

            CombinedMarkRow {
                student_id: key.student_id.clone(),
                student_name: student.map(|s| s.display_name.clone()).unwrap_or_default(),
                class_id,
                class_name,
                subject_id: key.subject_id.clone(),
                subject_name: name_of(&directory.subjects, &key.subject_id),
                term_id: key.term_id.clone(),
                term_name: name_of(&directory.terms, &key.term_id),
                academic_year_id: key.academic_year_id.clone(),
                academic_year_name: name_of(&directory.academic_years, &key.academic_year_id),
                midterm_total: mid,
                midterm_weighted,
                class_score_total: class_score,
                class_score_weighted,
                exam_score_total: exam,
                exam_score_weighted,
                final_grade,
                grade,
                remark,
                rank: 0,
                rank_label: String::new(),
            }
        })
        .collect();

    // Stable: exact ties keep key order.
    rows.sort_by(|a, b| {
        a.class_name
            .cmp(&b.class_name)
            .then_with(|| a.term_name.cmp(&b.term_name))
            .then_with(|| a.subject_name.cmp(&b.subject_name))
            .then_with(|| b.final_grade.cmp(&a.final_grade))
    });

    for group in rows.chunk_by_mut(|a, b| a.same_group(b)) {
        let ranks = competition_ranks(group.iter().map(|r| r.final_grade));
        for (row, rank) in group.iter_mut().zip(ranks) {
            row.rank = rank;
            row.rank_label = ordinal_label(rank);
        }
    }

    rows
}

pub fn summarize_groups(rows: &[CombinedMarkRow]) -> Vec<GroupSummary> {
    rows.chunk_by(|a, b| a.same_group(b))
        .map(|group| {
            let first = &group[0];
            let sum: Decimal = group.iter().map(|r| r.final_grade).sum();
            let highest = group
                .iter()
                .map(|r| r.final_grade)
                .max()
                .unwrap_or_default();
            let lowest = group
                .iter()
                .map(|r| r.final_grade)
                .min()
                .unwrap_or_default();
            GroupSummary {
                class_name: first.class_name.clone(),
                term_name: first.term_name.clone(),
                subject_name: first.subject_name.clone(),
                student_count: group.len(),
                average: round_half_up_2(sum / Decimal::from(group.len())),
                highest,
                lowest,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRange {
    #[serde(serialize_with = "decimal_number")]
    pub from: Decimal,
    #[serde(serialize_with = "decimal_number")]
    pub to: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandOverlap {
    /// Position of the band that wins the overlap (earlier in stored order).
    pub winner: usize,
    pub shadowed: usize,
    pub range: MarkRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandCoverage {
    pub gaps: Vec<MarkRange>,
    pub overlaps: Vec<BandOverlap>,
}

/// Gaps and overlaps of the band set over the final grades it can see
/// (0.00..=100.00 in steps of 0.01). Reported, never corrected.
pub fn band_coverage(bands: &[RemarkBand]) -> BandCoverage {
    let step = Decimal::new(1, 2);
    let floor = Decimal::ZERO;
    let ceiling = Decimal::ONE_HUNDRED;

    // Snap each band onto the 0.01 grid final grades live on.
    let snapped: Vec<Option<(Decimal, Decimal)>> = bands
        .iter()
        .map(|b| {
            let lo = b
                .min_mark
                .round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
                .max(floor);
            let hi = b
                .max_mark
                .round_dp_with_strategy(2, RoundingStrategy::ToNegativeInfinity)
                .min(ceiling);
            (lo <= hi).then_some((lo, hi))
        })
        .collect();

    let mut overlaps = Vec::new();
    for (i, a) in snapped.iter().enumerate() {
        let Some((a_lo, a_hi)) = a else { continue };
        for (j, b) in snapped.iter().enumerate().skip(i + 1) {
            let Some((b_lo, b_hi)) = b else { continue };
            let from = (*a_lo).max(*b_lo);
            let to = (*a_hi).min(*b_hi);
            if from <= to {
                overlaps.push(BandOverlap {
                    winner: i,
                    shadowed: j,
                    range: MarkRange { from, to },
                });
            }
        }
    }

    let mut intervals: Vec<(Decimal, Decimal)> = snapped.into_iter().flatten().collect();
    intervals.sort();
    let mut gaps = Vec::new();
    let mut cursor = floor;
    for (lo, hi) in intervals {
        if lo > cursor {
            gaps.push(MarkRange {
                from: cursor,
                to: lo - step,
            });
        }
        cursor = cursor.max(hi + step);
    }
    if cursor <= ceiling {
        gaps.push(MarkRange {
            from: cursor,
            to: ceiling,
        });
    }

    BandCoverage { gaps, overlaps }
}

/// One read pass over the store followed by the pure aggregation.
pub fn compute_master_marks(
    conn: &Connection,
    filters: &MasterFilters,
) -> Result<MasterReport, MarksError> {
    let weights = store::load_weights(conn)?;
    let bands = store::load_remark_bands(conn)?;

    let mut inputs = MarkInputs::default();
    for source in MarkSource::ALL {
        let marks = store::load_source_marks(conn, source, filters)?;
        debug!(source = source.as_str(), rows = marks.len(), "loaded mark source");
        *inputs.source_mut(source) = marks;
    }
    let directory = store::load_directory(conn)?;

    let rows = aggregate(&inputs, &directory, &weights.weights, &bands);
    let groups = summarize_groups(&rows);
    let unclassified_count = rows.iter().filter(|r| r.grade.is_empty()).count();

    info!(
        rows = rows.len(),
        groups = groups.len(),
        unclassified = unclassified_count,
        default_weights = weights.is_default,
        "computed master marks"
    );

    Ok(MasterReport {
        weights,
        filters: filters.clone(),
        rows,
        groups,
        unclassified_count,
    })
}
