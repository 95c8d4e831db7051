pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod planner;
pub mod reconcile;
pub mod rules;
pub mod run;

pub use backend::{FindscuBackend, QueryBackend, ReplayBackend};
pub use config::Config;
pub use error::{CompileError, DateWindowError, PlanningError, ProtocolError, ValidationError};
pub use filter::{compile, FilterExpr, FilterScript};
pub use ledger::{RunLedger, RunSummary};
pub use planner::{InputRow, Plan, QueryMode, QueryPlanner, QuerySpec};
pub use reconcile::{reconcile, CandidateRecord, CandidatesByRow, ReconciliationResult};
pub use rules::{FilterAction, FilterRule, Modality, RuleSet};
pub use run::{RetryPolicy, RunOrchestrator, RunReport};
