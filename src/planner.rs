//! Turns input rows into archive queries.
//!
//! Every row either yields exactly one [`QuerySpec`] carrying its input
//! index, or a [`PlanningFailure`] for the same index. Accession-number
//! queries are deliberately wider than the user asked for (`*value*`) and
//! register an [`ExpectedMatch`] so the reconciler can restore precision.

use crate::error::{DateWindowError, PlanningError};
use crate::filter::{FilterExpr, Predicate, Term};
use anyhow::Context;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MAX_DATE_WINDOW_DAYS: i64 = 10;

pub const ACCESSION_TAG: &str = "AccessionNumber";
pub const PATIENT_ID_TAG: &str = "PatientID";
pub const STUDY_DATE_TAG: &str = "StudyDate";
pub const STUDY_UID_TAG: &str = "StudyInstanceUID";

pub const DEFAULT_RETURN_TAGS: [&str; 2] = [STUDY_UID_TAG, STUDY_DATE_TAG];

const DICOM_DATE_FORMAT: &str = "%Y%m%d";
const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    MrnDate,
    AccessionNumber,
    DateRange,
}

/// One parsed spreadsheet row. Which fields are required depends on the mode.
///
/// Fields hold the cell text as read. Numeric cells are accepted and kept as
/// their decimal text; dates are only parsed when a row is planned, so one bad
/// cell fails its own row instead of the whole file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    #[serde(default, alias = "accession", deserialize_with = "cell_text")]
    pub accession_number: Option<String>,
    #[serde(default, alias = "mrn", deserialize_with = "cell_text")]
    pub patient_id: Option<String>,
    #[serde(default, deserialize_with = "cell_text")]
    pub study_date: Option<String>,
    #[serde(default, deserialize_with = "cell_text")]
    pub start_date: Option<String>,
    #[serde(default, deserialize_with = "cell_text")]
    pub end_date: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Cell {
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
}

fn cell_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Cell>::deserialize(deserializer)?.map(|cell| match cell {
        Cell::Text(text) => text,
        Cell::Integer(n) => n.to_string(),
        Cell::Unsigned(n) => n.to_string(),
        // Whole floats print without a fraction, so 123.0 reads as "123".
        Cell::Float(n) => n.to_string(),
    }))
}

/// Accepts `YYYY-MM-DD` or DICOM `YYYYMMDD`, ignoring any time of day.
fn parse_cell_date(field: &'static str, value: Option<&str>) -> Result<NaiveDate, PlanningError> {
    let text = non_blank(value).ok_or(PlanningError::MissingField(field))?;
    let day = text.split(['T', ' ']).next().unwrap_or(text);
    NaiveDate::parse_from_str(day, ISO_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(day, DICOM_DATE_FORMAT))
        .map_err(|_| PlanningError::InvalidDate {
            field,
            value: text.to_string(),
        })
}

impl InputRow {
    pub fn accession(accession_number: &str) -> Self {
        Self {
            accession_number: Some(accession_number.to_string()),
            ..Default::default()
        }
    }

    pub fn mrn_date(patient_id: &str, study_date: NaiveDate) -> Self {
        Self {
            patient_id: Some(patient_id.to_string()),
            study_date: Some(study_date.format(ISO_DATE_FORMAT).to_string()),
            ..Default::default()
        }
    }

    pub fn date_range(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date: Some(start_date.format(ISO_DATE_FORMAT).to_string()),
            end_date: Some(end_date.format(ISO_DATE_FORMAT).to_string()),
            ..Default::default()
        }
    }

    /// Reads already-parsed rows from a JSON or YAML list.
    pub fn load_all<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<InputRow>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read input rows: {}", path.display()))?;
        let rows: Vec<InputRow> = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON input rows: {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML input rows: {}", path.display()))?
        };
        log::info!("Loaded {} input rows from {}", rows.len(), path.display());
        Ok(rows)
    }

    fn trimmed_accession(&self) -> Option<&str> {
        non_blank(self.accession_number.as_deref())
    }

    fn trimmed_patient_id(&self) -> Option<&str> {
        non_blank(self.patient_id.as_deref())
    }

    fn has_fallback_data(&self) -> bool {
        self.trimmed_patient_id().is_some() && non_blank(self.study_date.as_deref()).is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Matching applied to one query key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum QueryValue {
    Exact { value: String },
    Contains { value: String },
    DateRange { start: NaiveDate, end: NaiveDate },
}

impl QueryValue {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, QueryValue::Contains { .. })
    }

    /// The value as written into a C-FIND identifier.
    pub fn render(&self) -> String {
        match self {
            QueryValue::Exact { value } => value.clone(),
            QueryValue::Contains { value } => format!("*{value}*"),
            QueryValue::DateRange { start, end } => format!(
                "{}-{}",
                start.format(DICOM_DATE_FORMAT),
                end.format(DICOM_DATE_FORMAT)
            ),
        }
    }

    fn selection_terms(&self, tag: &str) -> Vec<FilterExpr> {
        match self {
            QueryValue::Exact { value } | QueryValue::Contains { value } => {
                vec![FilterExpr::Term(Term::new(tag, Predicate::Contains, value))]
            }
            QueryValue::DateRange { start, end } => {
                let before = start.pred_opt().unwrap_or(*start);
                let after = end.succ_opt().unwrap_or(*end);
                vec![
                    FilterExpr::Term(Term::new(
                        tag,
                        Predicate::IsGreaterThan,
                        &before.format(DICOM_DATE_FORMAT).to_string(),
                    )),
                    FilterExpr::Term(Term::new(
                        tag,
                        Predicate::IsLessThan,
                        &after.format(DICOM_DATE_FORMAT).to_string(),
                    )),
                ]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub row_index: usize,
    pub constraints: BTreeMap<String, QueryValue>,
    pub return_tags: Vec<String>,
}

impl QuerySpec {
    pub fn constraint(&self, tag: &str) -> Option<&QueryValue> {
        self.constraints.get(tag)
    }

    /// Constraint keys with their rendered C-FIND values, in key order.
    pub fn rendered_constraints(&self) -> Vec<(String, String)> {
        self.constraints
            .iter()
            .map(|(tag, value)| (tag.clone(), value.render()))
            .collect()
    }

    /// Filter term pinning instances to what this query selected.
    pub fn selection_filter(&self) -> FilterExpr {
        let terms = self
            .constraints
            .iter()
            .flat_map(|(tag, value)| value.selection_terms(tag))
            .collect();
        FilterExpr::and(terms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedMatch {
    pub row_index: usize,
    pub tag: String,
    pub value: String,
}

pub type ExpectedMatches = BTreeMap<usize, ExpectedMatch>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningFailure {
    pub row_index: usize,
    pub error: PlanningError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub mode: QueryMode,
    pub specs: Vec<QuerySpec>,
    pub expected: ExpectedMatches,
    pub failures: Vec<PlanningFailure>,
}

impl Plan {
    /// OR of every spec's selection filter; `None` when nothing was planned.
    pub fn selection_filter(&self) -> Option<FilterExpr> {
        selection_filter(&self.specs)
    }
}

pub fn selection_filter<'a>(specs: impl IntoIterator<Item = &'a QuerySpec>) -> Option<FilterExpr> {
    let branches: Vec<FilterExpr> = specs.into_iter().map(QuerySpec::selection_filter).collect();
    (!branches.is_empty()).then(|| FilterExpr::or(branches))
}

pub fn validate_date_window_days(days: i64) -> Result<(), DateWindowError> {
    if (0..=MAX_DATE_WINDOW_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(DateWindowError {
            got: days,
            max: MAX_DATE_WINDOW_DAYS,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlanner {
    mode: QueryMode,
    date_window_days: u64,
    return_tags: Vec<String>,
}

impl QueryPlanner {
    pub fn new(mode: QueryMode, date_window_days: i64) -> Result<Self, DateWindowError> {
        validate_date_window_days(date_window_days)?;
        Ok(Self {
            mode,
            date_window_days: date_window_days as u64,
            return_tags: DEFAULT_RETURN_TAGS.iter().map(|t| t.to_string()).collect(),
        })
    }

    /// Extra tags to request on top of the defaults.
    pub fn with_return_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            push_unique(&mut self.return_tags, tag.into());
        }
        self
    }

    pub fn plan(&self, rows: &[InputRow]) -> Plan {
        let mut plan = Plan {
            mode: self.mode,
            specs: Vec::new(),
            expected: ExpectedMatches::new(),
            failures: Vec::new(),
        };

        for (row_index, row) in rows.iter().enumerate() {
            let planned = match self.mode {
                QueryMode::AccessionNumber => self.accession_spec(row_index, row),
                QueryMode::MrnDate => self.mrn_date_spec(row_index, row),
                QueryMode::DateRange => self.date_range_spec(row_index, row),
            };

            match planned {
                Ok((spec, expected)) => {
                    log::debug!(
                        "Row {}: query {:?}",
                        row_index + 1,
                        spec.rendered_constraints()
                    );
                    if let Some(expected) = expected {
                        plan.expected.insert(row_index, expected);
                    }
                    plan.specs.push(spec);
                }
                Err(error) => {
                    log::warn!("Row {}: not queried, {}", row_index + 1, error);
                    plan.failures.push(PlanningFailure { row_index, error });
                }
            }
        }

        log::info!(
            "Planned {} queries from {} rows ({} skipped)",
            plan.specs.len(),
            rows.len(),
            plan.failures.len()
        );
        plan
    }

    /// MRN+date queries for accession rows that found nothing. Rows keep
    /// their original index; rows without MRN and study date are reported
    /// as planning failures of the fallback plan.
    pub fn fallback_plan(&self, rows: &[InputRow], failed_rows: &[usize]) -> Plan {
        let mut plan = Plan {
            mode: QueryMode::MrnDate,
            specs: Vec::new(),
            expected: ExpectedMatches::new(),
            failures: Vec::new(),
        };

        for &row_index in failed_rows {
            let Some(row) = rows.get(row_index) else {
                log::warn!("Fallback: row {} is out of range, skipping", row_index + 1);
                continue;
            };
            if !row.has_fallback_data() {
                log::debug!("Fallback: row {} has no MRN and study date", row_index + 1);
                plan.failures.push(PlanningFailure {
                    row_index,
                    error: PlanningError::MissingField("fallback MRN and study date"),
                });
                continue;
            }
            match self.mrn_date_spec(row_index, row) {
                Ok((spec, _)) => plan.specs.push(spec),
                Err(error) => plan.failures.push(PlanningFailure { row_index, error }),
            }
        }

        log::info!(
            "Fallback: planned {} MRN+date queries for {} failed rows",
            plan.specs.len(),
            failed_rows.len()
        );
        plan
    }

    fn spec(&self, row_index: usize, constraints: BTreeMap<String, QueryValue>) -> QuerySpec {
        QuerySpec {
            row_index,
            constraints,
            return_tags: self.return_tags.clone(),
        }
    }

    fn accession_spec(
        &self,
        row_index: usize,
        row: &InputRow,
    ) -> Result<(QuerySpec, Option<ExpectedMatch>), PlanningError> {
        let accession = row
            .trimmed_accession()
            .ok_or(PlanningError::MissingField("accession number"))?;

        let mut spec = self.spec(
            row_index,
            BTreeMap::from([(
                ACCESSION_TAG.to_string(),
                QueryValue::Contains {
                    value: accession.to_string(),
                },
            )]),
        );
        push_unique(&mut spec.return_tags, ACCESSION_TAG.to_string());

        let expected = ExpectedMatch {
            row_index,
            tag: ACCESSION_TAG.to_string(),
            value: accession.to_string(),
        };
        Ok((spec, Some(expected)))
    }

    fn mrn_date_spec(
        &self,
        row_index: usize,
        row: &InputRow,
    ) -> Result<(QuerySpec, Option<ExpectedMatch>), PlanningError> {
        let patient_id = row
            .trimmed_patient_id()
            .ok_or(PlanningError::MissingField("patient ID"))?;
        let study_date = parse_cell_date("study date", row.study_date.as_deref())?;

        let window = Days::new(self.date_window_days);
        let out_of_range = || PlanningError::DateOutOfRange(study_date.to_string());
        let start = study_date.checked_sub_days(window).ok_or_else(out_of_range)?;
        let end = study_date.checked_add_days(window).ok_or_else(out_of_range)?;

        let spec = self.spec(
            row_index,
            BTreeMap::from([
                (
                    PATIENT_ID_TAG.to_string(),
                    QueryValue::Exact {
                        value: patient_id.to_string(),
                    },
                ),
                (STUDY_DATE_TAG.to_string(), QueryValue::DateRange { start, end }),
            ]),
        );
        Ok((spec, None))
    }

    fn date_range_spec(
        &self,
        row_index: usize,
        row: &InputRow,
    ) -> Result<(QuerySpec, Option<ExpectedMatch>), PlanningError> {
        let start = parse_cell_date("start date", row.start_date.as_deref())?;
        let end = parse_cell_date("end date", row.end_date.as_deref())?;
        if start > end {
            return Err(PlanningError::InvertedDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let spec = self.spec(
            row_index,
            BTreeMap::from([(STUDY_DATE_TAG.to_string(), QueryValue::DateRange { start, end })]),
        );
        Ok((spec, None))
    }
}

fn push_unique(tags: &mut Vec<String>, tag: String) {
    if !tags.contains(&tag) {
        tags.push(tag);
    }
}

/// Plans `rows` with the default return tags.
pub fn plan(rows: &[InputRow], mode: QueryMode, date_window_days: i64) -> Result<Plan, DateWindowError> {
    Ok(QueryPlanner::new(mode, date_window_days)?.plan(rows))
}
