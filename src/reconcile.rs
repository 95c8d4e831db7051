//! Reconciliation of archive responses against per-row expectations.
//!
//! Everything here works on plain tag/value maps. Nothing touches the wire,
//! so the same inputs always give the same [`ReconciliationResult`].

use crate::error::{PlanningError, ProtocolError};
use crate::filter::TagSource;
use crate::planner::{ExpectedMatches, Plan, PlanningFailure, STUDY_UID_TAG};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// One flat tag/value record returned by the archive for a row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateRecord {
    tags: BTreeMap<String, String>,
}

impl CandidateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: &str, value: &str) -> Self {
        self.insert(tag, value);
        self
    }

    pub fn insert(&mut self, tag: &str, value: &str) {
        self.tags.insert(tag.to_string(), value.to_string());
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn study_instance_uid(&self) -> Option<&str> {
        self.get(STUDY_UID_TAG)
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
    }
}

impl TagSource for CandidateRecord {
    fn tag_value(&self, tag: &str) -> Option<&str> {
        self.get(tag)
    }
}

impl FromIterator<(String, String)> for CandidateRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

/// Archive responses keyed by row index. An `Err` is a per-row protocol failure.
pub type CandidatesByRow = BTreeMap<usize, Result<Vec<CandidateRecord>, ProtocolError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoCandidates,
    MismatchAfterTrimming,
    Planning(PlanningError),
    Protocol(ProtocolError),
    FallbackAlsoFailed,
    NoFallbackData(Box<FailureReason>),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoCandidates => write!(f, "no candidates returned"),
            FailureReason::MismatchAfterTrimming => write!(f, "mismatch after trimming"),
            FailureReason::Planning(e) => write!(f, "not queried: {e}"),
            FailureReason::Protocol(e) => write!(f, "query failed: {e}"),
            FailureReason::FallbackAlsoFailed => write!(
                f,
                "accession query failed, fallback MRN+date query also failed"
            ),
            FailureReason::NoFallbackData(inner) => {
                write!(f, "{inner} (no fallback data available)")
            }
        }
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedRecord {
    pub row_index: usize,
    pub record: CandidateRecord,
}

/// A candidate that came back from a widened query but failed the exact check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedCandidate {
    pub row_index: usize,
    pub tag: String,
    pub expected: String,
    pub found: Option<String>,
    pub record: CandidateRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRow {
    pub row_index: usize,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus<'a> {
    Accepted(usize),
    Failed(&'a FailureReason),
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub accepted: Vec<AcceptedRecord>,
    pub rejected: Vec<RejectedCandidate>,
    pub failed: Vec<FailedRow>,
}

impl ReconciliationResult {
    pub fn accepted_for_row(&self, row_index: usize) -> impl Iterator<Item = &CandidateRecord> {
        self.accepted
            .iter()
            .filter(move |a| a.row_index == row_index)
            .map(|a| &a.record)
    }

    pub fn rejected_for_row(&self, row_index: usize) -> impl Iterator<Item = &RejectedCandidate> {
        self.rejected.iter().filter(move |r| r.row_index == row_index)
    }

    pub fn failure_for_row(&self, row_index: usize) -> Option<&FailureReason> {
        self.failed
            .iter()
            .find(|f| f.row_index == row_index)
            .map(|f| &f.reason)
    }

    pub fn row_status(&self, row_index: usize) -> RowStatus<'_> {
        if let Some(reason) = self.failure_for_row(row_index) {
            return RowStatus::Failed(reason);
        }
        match self.accepted_for_row(row_index).count() {
            0 => RowStatus::Unknown,
            n => RowStatus::Accepted(n),
        }
    }

    pub fn accepted_rows(&self) -> BTreeSet<usize> {
        self.accepted.iter().map(|a| a.row_index).collect()
    }

    pub fn failed_rows(&self) -> Vec<usize> {
        self.failed.iter().map(|f| f.row_index).collect()
    }

    /// Adds rows the planner refused to query, keeping `failed` in row order.
    pub fn record_planning_failures(&mut self, failures: &[PlanningFailure]) {
        for failure in failures {
            if self.failure_for_row(failure.row_index).is_some() {
                continue;
            }
            self.failed.push(FailedRow {
                row_index: failure.row_index,
                reason: FailureReason::Planning(failure.error.clone()),
            });
        }
        self.failed.sort_by_key(|f| f.row_index);
    }

    /// Folds the outcome of the MRN+date fallback pass into this result.
    ///
    /// Rows recovered by the fallback move from `failed` to `accepted`. Rows
    /// the fallback could not plan keep their reason with a suffix, and rows
    /// it queried without success are marked as failing both passes.
    pub fn merge_fallback(mut self, fallback: &ReconciliationResult, fallback_plan: &Plan) -> Self {
        let recovered = fallback.accepted_rows();
        let unplanned: HashSet<usize> = fallback_plan.failures.iter().map(|f| f.row_index).collect();
        let attempted: HashSet<usize> = fallback_plan.specs.iter().map(|s| s.row_index).collect();

        let mut still_failed = Vec::with_capacity(self.failed.len());
        for row in self.failed.drain(..) {
            if recovered.contains(&row.row_index) {
                log::info!("Row {}: recovered by MRN+date fallback", row.row_index + 1);
                continue;
            }
            let reason = if unplanned.contains(&row.row_index) {
                FailureReason::NoFallbackData(Box::new(row.reason))
            } else if attempted.contains(&row.row_index) {
                FailureReason::FallbackAlsoFailed
            } else {
                row.reason
            };
            still_failed.push(FailedRow {
                row_index: row.row_index,
                reason,
            });
        }
        self.failed = still_failed;

        self.accepted.extend(
            fallback
                .accepted
                .iter()
                .filter(|a| recovered.contains(&a.row_index))
                .cloned(),
        );
        self.accepted.sort_by_key(|a| a.row_index);
        self.rejected.extend(fallback.rejected.iter().cloned());
        self.rejected.sort_by_key(|r| r.row_index);
        self
    }

    /// Unique study UIDs of accepted records, in first-seen order.
    pub fn retrieval_targets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for accepted in &self.accepted {
            match accepted.record.study_instance_uid() {
                Some(uid) => {
                    if seen.insert(uid.to_string()) {
                        targets.push(uid.to_string());
                    }
                }
                None => log::warn!(
                    "Row {}: accepted record has no {}, cannot retrieve",
                    accepted.row_index + 1,
                    STUDY_UID_TAG
                ),
            }
        }
        targets
    }
}

pub fn reconcile(candidates: &CandidatesByRow, expected: &ExpectedMatches) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();

    for (&row_index, outcome) in candidates {
        let records = match outcome {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Row {}: {}", row_index + 1, e);
                result.failed.push(FailedRow {
                    row_index,
                    reason: FailureReason::Protocol(e.clone()),
                });
                continue;
            }
        };

        if records.is_empty() {
            log::warn!("Row {}: no candidates returned", row_index + 1);
            result.failed.push(FailedRow {
                row_index,
                reason: FailureReason::NoCandidates,
            });
            continue;
        }

        let Some(expectation) = expected.get(&row_index) else {
            result
                .accepted
                .extend(records.iter().map(|record| AcceptedRecord {
                    row_index,
                    record: record.clone(),
                }));
            continue;
        };

        let mut accepted_any = false;
        for record in records {
            let found = record.get(&expectation.tag);
            if found.map(str::trim) == Some(expectation.value.as_str()) {
                accepted_any = true;
                result.accepted.push(AcceptedRecord {
                    row_index,
                    record: record.clone(),
                });
            } else {
                log::debug!(
                    "Row {}: rejected {} {:?}, expected {:?}",
                    row_index + 1,
                    expectation.tag,
                    found.unwrap_or(""),
                    expectation.value
                );
                result.rejected.push(RejectedCandidate {
                    row_index,
                    tag: expectation.tag.clone(),
                    expected: expectation.value.clone(),
                    found: found.map(str::to_string),
                    record: record.clone(),
                });
            }
        }

        if !accepted_any {
            log::warn!("Row {}: mismatch after trimming", row_index + 1);
            result.failed.push(FailedRow {
                row_index,
                reason: FailureReason::MismatchAfterTrimming,
            });
        }
    }

    result
}

/// Reconciles a whole plan: specs without a recorded response fail as
/// missing, and the plan's own planning failures are folded in.
pub fn reconcile_plan(plan: &Plan, candidates: &CandidatesByRow) -> ReconciliationResult {
    let mut complete = CandidatesByRow::new();
    for spec in &plan.specs {
        let outcome = candidates
            .get(&spec.row_index)
            .cloned()
            .unwrap_or(Err(ProtocolError::MissingResponse(spec.row_index)));
        complete.insert(spec.row_index, outcome);
    }

    let mut result = reconcile(&complete, &plan.expected);
    result.record_planning_failures(&plan.failures);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, InputRow, QueryMode, QueryPlanner, ACCESSION_TAG};
    use chrono::NaiveDate;

    fn accession_record(accession: &str, uid: &str) -> CandidateRecord {
        CandidateRecord::new()
            .with(ACCESSION_TAG, accession)
            .with(STUDY_UID_TAG, uid)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn accession_scenario() -> (Plan, CandidatesByRow) {
        let plan = plan(&[InputRow::accession("ABC001")], QueryMode::AccessionNumber, 0).unwrap();
        let candidates = CandidatesByRow::from([(
            0,
            Ok(vec![
                accession_record("  ABC001  ", "1.1"),
                accession_record("ABC001", "1.2"),
                accession_record("12ABC0011", "1.3"),
                accession_record("ABC001ABC", "1.4"),
            ]),
        )]);
        (plan, candidates)
    }

    #[test]
    fn test_accession_scenario() {
        let (plan, candidates) = accession_scenario();
        assert_eq!(plan.specs[0].constraint(ACCESSION_TAG).unwrap().render(), "*ABC001*");

        let result = reconcile(&candidates, &plan.expected);

        let accepted: Vec<&str> = result
            .accepted_for_row(0)
            .map(|r| r.get(ACCESSION_TAG).unwrap())
            .collect();
        assert_eq!(accepted, vec!["  ABC001  ", "ABC001"]);

        let rejected: Vec<Option<&str>> = result
            .rejected_for_row(0)
            .map(|r| r.found.as_deref())
            .collect();
        assert_eq!(rejected, vec![Some("12ABC0011"), Some("ABC001ABC")]);
        assert!(result.failed.is_empty());
        assert_eq!(result.row_status(0), RowStatus::Accepted(2));
    }

    #[test]
    fn test_comparison_is_case_sensitive() {
        let plan = plan(&[InputRow::accession("abc001")], QueryMode::AccessionNumber, 0).unwrap();
        let candidates = CandidatesByRow::from([(0, Ok(vec![accession_record("ABC001", "1.1")]))]);

        let result = reconcile(&candidates, &plan.expected);
        assert!(result.accepted.is_empty());
        assert_eq!(result.failure_for_row(0), Some(&FailureReason::MismatchAfterTrimming));
    }

    #[test]
    fn test_mrn_rows_accept_everything() {
        let rows = [InputRow::mrn_date("123", date(2024, 1, 1))];
        let plan = plan(&rows, QueryMode::MrnDate, 3).unwrap();
        assert!(plan.expected.is_empty());

        let records = vec![
            CandidateRecord::new().with(STUDY_UID_TAG, "1.1"),
            CandidateRecord::new().with(STUDY_UID_TAG, "1.2"),
            CandidateRecord::new(),
        ];
        let result = reconcile(&CandidatesByRow::from([(0, Ok(records.clone()))]), &plan.expected);

        let accepted: Vec<CandidateRecord> = result.accepted_for_row(0).cloned().collect();
        assert_eq!(accepted, records);
        assert!(result.rejected.is_empty());
        assert!(result.failed.is_empty());
    }

    #[test]
    fn test_no_candidates_reason() {
        let result = reconcile(&CandidatesByRow::from([(4, Ok(vec![]))]), &ExpectedMatches::new());
        assert_eq!(result.failure_for_row(4), Some(&FailureReason::NoCandidates));
        assert_eq!(result.failed[0].reason.to_string(), "no candidates returned");
    }

    #[test]
    fn test_mismatch_keeps_rejected_for_audit() {
        let plan = plan(&[InputRow::accession("ABC001")], QueryMode::AccessionNumber, 0).unwrap();
        let candidates = CandidatesByRow::from([(
            0,
            Ok(vec![
                accession_record("XABC001", "1.1"),
                CandidateRecord::new().with(STUDY_UID_TAG, "1.2"),
            ]),
        )]);

        let result = reconcile(&candidates, &plan.expected);
        assert_eq!(
            result.failure_for_row(0).map(ToString::to_string).as_deref(),
            Some("mismatch after trimming")
        );
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(result.rejected[1].found, None);
        assert_eq!(result.rejected[1].record.get(STUDY_UID_TAG), Some("1.2"));
    }

    #[test]
    fn test_protocol_error_fails_only_that_row() {
        let candidates = CandidatesByRow::from([
            (0, Err(ProtocolError::Timeout(30))),
            (1, Ok(vec![CandidateRecord::new().with(STUDY_UID_TAG, "1.1")])),
        ]);
        let result = reconcile(&candidates, &ExpectedMatches::new());

        assert_eq!(
            result.failure_for_row(0),
            Some(&FailureReason::Protocol(ProtocolError::Timeout(30)))
        );
        assert_eq!(result.row_status(1), RowStatus::Accepted(1));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (plan, candidates) = accession_scenario();
        let first = reconcile(&candidates, &plan.expected);
        let second = reconcile(&candidates, &plan.expected);
        assert_eq!(first, second);
    }

    #[test]
    fn test_per_row_issuance_matches_batch() {
        let rows = [
            InputRow::accession("A1"),
            InputRow::accession("B2"),
            InputRow::accession("C3"),
        ];
        let plan = plan(&rows, QueryMode::AccessionNumber, 0).unwrap();
        let batch = CandidatesByRow::from([
            (0, Ok(vec![accession_record("A1 ", "1.1"), accession_record("A10", "1.2")])),
            (1, Ok(vec![])),
            (2, Ok(vec![accession_record("C3", "1.3")])),
        ]);

        let batched = reconcile(&batch, &plan.expected);

        let mut per_row = ReconciliationResult::default();
        for (row, outcome) in &batch {
            let single = CandidatesByRow::from([(*row, outcome.clone())]);
            let partial = reconcile(&single, &plan.expected);
            per_row.accepted.extend(partial.accepted);
            per_row.rejected.extend(partial.rejected);
            per_row.failed.extend(partial.failed);
        }

        assert_eq!(batched, per_row);
    }

    #[test]
    fn test_reconcile_plan_covers_every_row() {
        let rows = [
            InputRow::accession("A1"),
            InputRow::default(),
            InputRow::accession("C3"),
        ];
        let plan = plan(&rows, QueryMode::AccessionNumber, 0).unwrap();
        let candidates = CandidatesByRow::from([(0, Ok(vec![accession_record("A1", "1.1")]))]);

        let result = reconcile_plan(&plan, &candidates);

        assert_eq!(result.row_status(0), RowStatus::Accepted(1));
        assert!(matches!(
            result.failure_for_row(1),
            Some(FailureReason::Planning(PlanningError::MissingField(_)))
        ));
        assert_eq!(
            result.failure_for_row(2),
            Some(&FailureReason::Protocol(ProtocolError::MissingResponse(2)))
        );
        assert_eq!(result.failed_rows(), vec![1, 2]);
        assert_eq!(result.row_status(9), RowStatus::Unknown);
    }

    #[test]
    fn test_merge_fallback() {
        let rows = [
            InputRow {
                accession_number: Some("A1".to_string()),
                patient_id: Some("M1".to_string()),
                study_date: Some("2024-01-01".to_string()),
                ..Default::default()
            },
            InputRow {
                accession_number: Some("B2".to_string()),
                patient_id: Some("M2".to_string()),
                study_date: Some("2024-01-02".to_string()),
                ..Default::default()
            },
            InputRow::accession("C3"),
        ];
        let planner = QueryPlanner::new(QueryMode::AccessionNumber, 0).unwrap();
        let primary_plan = planner.plan(&rows);
        let primary = reconcile_plan(
            &primary_plan,
            &CandidatesByRow::from([(0, Ok(vec![])), (1, Ok(vec![])), (2, Ok(vec![]))]),
        );
        assert_eq!(primary.failed_rows(), vec![0, 1, 2]);

        let fallback_plan = planner.fallback_plan(&rows, &primary.failed_rows());
        let fallback = reconcile_plan(
            &fallback_plan,
            &CandidatesByRow::from([
                (0, Ok(vec![CandidateRecord::new().with(STUDY_UID_TAG, "9.9")])),
                (1, Ok(vec![])),
            ]),
        );

        let merged = primary.merge_fallback(&fallback, &fallback_plan);

        assert_eq!(merged.row_status(0), RowStatus::Accepted(1));
        assert_eq!(merged.failure_for_row(1), Some(&FailureReason::FallbackAlsoFailed));
        assert_eq!(
            merged.failure_for_row(2).map(ToString::to_string).as_deref(),
            Some("no candidates returned (no fallback data available)")
        );
        assert_eq!(merged.retrieval_targets(), vec!["9.9"]);
    }

    #[test]
    fn test_retrieval_targets_are_unique_in_order() {
        let result = reconcile(
            &CandidatesByRow::from([
                (0, Ok(vec![
                    CandidateRecord::new().with(STUDY_UID_TAG, "1.2"),
                    CandidateRecord::new().with(STUDY_UID_TAG, "1.1"),
                ])),
                (1, Ok(vec![
                    CandidateRecord::new().with(STUDY_UID_TAG, " 1.2 "),
                    CandidateRecord::new().with(STUDY_UID_TAG, ""),
                ])),
            ]),
            &ExpectedMatches::new(),
        );
        assert_eq!(result.retrieval_targets(), vec!["1.2", "1.1"]);
    }

    #[test]
    fn test_candidate_records_evaluate_filters() {
        use crate::filter::{FilterExpr, Predicate, Term};

        let record = CandidateRecord::new().with("Modality", "ct");
        let expr = FilterExpr::Term(Term::new("Modality", Predicate::EqualsIgnoreCase, "CT"));
        assert!(expr.matches(&record));
    }
}
