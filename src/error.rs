//! Error taxonomy for the selection engine.
//!
//! Validation and compile errors are fatal for a run. Planning and protocol
//! errors are scoped to a single input row and end up in the failed-queries
//! table instead of aborting the batch.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("rule {position}: tag must not be empty")]
    EmptyTag { position: String },

    #[error("rule {position}: malformed tag '{tag}'")]
    MalformedTag { position: String, tag: String },

    #[error("rule {position}: unknown action '{action}'")]
    UnknownAction { position: String, action: String },

    #[error("unknown modality '{0}'")]
    UnknownModality(String),

    #[error("rule {position}: value must be a single line")]
    MultilineValue { position: String },

    #[error("malformed protocol line '{0}', expected 'tag, action, value'")]
    MalformedLine(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("invalid rule set: {0}")]
    InvalidRule(#[from] ValidationError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("start date {start} is after end date {end}")]
    InvertedDateRange { start: String, end: String },

    #[error("{field} '{value}' is not a date")]
    InvalidDate { field: &'static str, value: String },

    #[error("study date {0} cannot be widened by the date window")]
    DateOutOfRange(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("query tool could not be started: {0}")]
    Spawn(String),

    #[error("query tool exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("query timed out after {0}s")]
    Timeout(u64),

    #[error("no response recorded for row {0}")]
    MissingResponse(usize),

    #[error("{0}")]
    Remote(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("date window must be between 0 and {max} days, got {got}")]
pub struct DateWindowError {
    pub got: i64,
    pub max: i64,
}
