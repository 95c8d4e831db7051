use crate::backend::QueryBackend;
use crate::config::{Config, RetryConfig};
use crate::error::{CompileError, ProtocolError};
use crate::filter::{compile, FilterScript};
use crate::ledger::{RunLedger, RunSummary};
use crate::planner::{selection_filter, InputRow, Plan, QueryMode, QueryPlanner, QuerySpec};
use crate::reconcile::{reconcile_plan, CandidateRecord, CandidatesByRow, ReconciliationResult};
use crate::rules::RuleSet;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How often a row's query is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            attempts: attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            config
                .delays_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn no_retry() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_before(&self, retry: u32) -> Duration {
        let index = retry.saturating_sub(1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

fn is_retryable(error: &ProtocolError) -> bool {
    !matches!(
        error,
        ProtocolError::Spawn(_) | ProtocolError::MissingResponse(_)
    )
}

pub async fn query_with_retry<B: QueryBackend>(
    backend: &B,
    spec: &QuerySpec,
    policy: &RetryPolicy,
) -> Result<Vec<CandidateRecord>, ProtocolError> {
    let mut attempt = 1;
    loop {
        match backend.find(spec).await {
            Ok(records) => return Ok(records),
            Err(e) if attempt < policy.attempts() && is_retryable(&e) => {
                let delay = policy.delay_before(attempt);
                log::info!(
                    "Row {}: query failed ({}), retrying in {}s [{}/{}]",
                    spec.row_index + 1,
                    e,
                    delay.as_secs(),
                    attempt + 1,
                    policy.attempts()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Issues every spec against the backend, one row at a time.
pub async fn execute<B: QueryBackend>(
    backend: &B,
    specs: &[QuerySpec],
    policy: &RetryPolicy,
) -> CandidatesByRow {
    let mut candidates = CandidatesByRow::new();
    for (i, spec) in specs.iter().enumerate() {
        log::info!(
            "Query {}/{} via {} (row {})",
            i + 1,
            specs.len(),
            backend.name(),
            spec.row_index + 1
        );
        let outcome = query_with_retry(backend, spec, policy).await;
        if let Ok(records) = &outcome {
            log::info!("Row {}: {} candidates", spec.row_index + 1, records.len());
        }
        candidates.insert(spec.row_index, outcome);
    }
    candidates
}

#[derive(Debug, Clone)]
pub struct RunReport {
    /// Script compiled from the rule set alone.
    pub rule_script: FilterScript,
    /// Rule script AND-ed with the selection filter of every issued query.
    pub script: FilterScript,
    pub plan: Plan,
    pub fallback_plan: Option<Plan>,
    pub result: ReconciliationResult,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn input_rows(&self) -> usize {
        self.plan.specs.len() + self.plan.failures.len()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            started_at: self.started_at,
            finished_at: self.finished_at,
            mode: self.plan.mode,
            input_rows: self.input_rows(),
            queried_rows: self.plan.specs.len(),
            fallback_queries: self.fallback_plan.as_ref().map_or(0, |p| p.specs.len()),
            accepted_rows: self.result.accepted_rows().len(),
            accepted_records: self.result.accepted.len(),
            rejected_candidates: self.result.rejected.len(),
            failed_rows: self.result.failed.len(),
            retrieval_targets: self.result.retrieval_targets(),
            filter_is_identity: self.script.is_identity(),
        }
    }
}

pub struct RunOrchestrator<B: QueryBackend> {
    backend: B,
    planner: QueryPlanner,
    retry: RetryPolicy,
    use_fallback: bool,
}

impl<B: QueryBackend> RunOrchestrator<B> {
    pub fn new(config: &Config, backend: B) -> Result<Self> {
        let planner = QueryPlanner::new(config.query.mode, config.query.date_window_days)?
            .with_return_tags(config.query.return_tags.iter().cloned());
        Ok(Self {
            backend,
            planner,
            retry: RetryPolicy::from_config(&config.retry),
            use_fallback: config.query.use_fallback,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Compiles the rules, then plans, queries and reconciles every row.
    ///
    /// An invalid rule set fails before any query is issued. Every other
    /// problem is scoped to its row and ends up in the result's failed rows.
    pub async fn run(&self, rules: &RuleSet, rows: &[InputRow]) -> Result<RunReport, CompileError> {
        let started_at = Utc::now();
        let rule_script = compile(rules)?;

        let plan = self.planner.plan(rows);
        let candidates = execute(&self.backend, &plan.specs, &self.retry).await;
        let mut result = reconcile_plan(&plan, &candidates);

        let mut fallback_plan = None;
        if self.use_fallback
            && plan.mode == QueryMode::AccessionNumber
            && !result.failed.is_empty()
        {
            let fallback = self.planner.fallback_plan(rows, &result.failed_rows());
            let fallback_candidates = execute(&self.backend, &fallback.specs, &self.retry).await;
            let fallback_result = reconcile_plan(&fallback, &fallback_candidates);
            result = result.merge_fallback(&fallback_result, &fallback);
            fallback_plan = Some(fallback);
        }

        let issued = plan
            .specs
            .iter()
            .chain(fallback_plan.iter().flat_map(|p| p.specs.iter()));
        let selection = selection_filter(issued);
        let script = rule_script.and_also(selection.as_ref());

        log::info!(
            "Run finished: {} rows accepted, {} rejected candidates, {} rows failed",
            result.accepted_rows().len(),
            result.rejected.len(),
            result.failed.len()
        );

        Ok(RunReport {
            rule_script,
            script,
            plan,
            fallback_plan,
            result,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// [`run`](Self::run), then writes the artifacts into `ledger`.
    pub async fn run_and_record(
        &self,
        rules: &RuleSet,
        rows: &[InputRow],
        ledger: &RunLedger,
    ) -> Result<RunReport> {
        let report = self.run(rules, rows).await?;
        ledger.record(&report, rows)?;
        Ok(report)
    }
}
