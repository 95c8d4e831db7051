use crate::error::ProtocolError;
use crate::planner::QuerySpec;
use crate::reconcile::CandidateRecord;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

pub const QUERY_LEVEL: &str = "STUDY";

/// The external protocol layer: runs one C-FIND for a planned row.
pub trait QueryBackend {
    fn name(&self) -> &str;

    fn find(
        &self,
        spec: &QuerySpec,
    ) -> impl Future<Output = Result<Vec<CandidateRecord>, ProtocolError>> + Send;
}

/// Runs DCMTK's `findscu` as a subprocess and parses its verbose dump.
#[derive(Debug, Clone)]
pub struct FindscuBackend {
    binary: PathBuf,
    host: String,
    port: u16,
    calling_aet: String,
    called_aet: String,
    dictionary_path: Option<PathBuf>,
    timeout: Duration,
}

impl FindscuBackend {
    pub fn new(binary: impl Into<PathBuf>, host: &str, port: u16) -> Self {
        Self {
            binary: binary.into(),
            host: host.to_string(),
            port,
            calling_aet: "PACS_SELECT".to_string(),
            called_aet: "ANY-SCP".to_string(),
            dictionary_path: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_ae_titles(mut self, calling: &str, called: &str) -> Self {
        self.calling_aet = calling.to_string();
        self.called_aet = called.to_string();
        self
    }

    pub fn with_dictionary(mut self, path: Option<PathBuf>) -> Self {
        self.dictionary_path = path;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_seconds);
        self
    }

    /// Arguments passed to `findscu`, without the binary itself.
    pub fn arguments(&self, spec: &QuerySpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-v".into(),
            "-S".into(),
            "-aet".into(),
            self.calling_aet.clone(),
            "-aec".into(),
            self.called_aet.clone(),
            "-k".into(),
            format!("QueryRetrieveLevel={QUERY_LEVEL}"),
        ];

        for (tag, value) in spec.rendered_constraints() {
            args.push("-k".into());
            args.push(format!("{tag}={value}"));
        }
        for tag in &spec.return_tags {
            if spec.constraint(tag).is_none() {
                args.push("-k".into());
                args.push(tag.clone());
            }
        }

        args.push(self.host.clone());
        args.push(self.port.to_string());
        args
    }
}

impl QueryBackend for FindscuBackend {
    fn name(&self) -> &str {
        "findscu"
    }

    async fn find(&self, spec: &QuerySpec) -> Result<Vec<CandidateRecord>, ProtocolError> {
        let args = self.arguments(spec);
        log::debug!("Running {} {}", self.binary.display(), args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(&args).kill_on_drop(true);
        if let Some(dictionary) = &self.dictionary_path {
            command.env("DCMDICTPATH", dictionary);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| ProtocolError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ProtocolError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        // findscu logs responses on stderr with -v; some builds use stdout.
        let records = parse_find_responses(&format!("{stdout}\n{stderr}"));
        log::debug!("Row {}: {} find responses", spec.row_index + 1, records.len());
        Ok(records)
    }
}

fn element_regex() -> &'static Regex {
    static ELEMENT: OnceLock<Regex> = OnceLock::new();
    ELEMENT.get_or_init(|| {
        Regex::new(
            r"\([0-9A-Fa-f]{4},[0-9A-Fa-f]{4}\)\s+[A-Z]{2}\s+(?P<value>.*?)\s+#\s*\d+,\s*\d+\s+(?P<keyword>[A-Za-z][A-Za-z0-9]*)\s*$",
        )
        .expect("element pattern is valid")
    })
}

fn element_value(raw: &str) -> String {
    let value = if let Some(inner) = raw.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        inner
    } else if raw.starts_with("(no value") {
        ""
    } else {
        raw.strip_prefix('=').unwrap_or(raw)
    };
    value.trim_matches('\0').to_string()
}

/// Splits a verbose findscu log into one record per "Find Response:" block.
///
/// Bracketed values keep their inner whitespace; only NUL padding is removed.
pub fn parse_find_responses(output: &str) -> Vec<CandidateRecord> {
    output
        .split("Find Response:")
        .skip(1)
        .map(|block| {
            block
                .lines()
                .filter_map(|line| element_regex().captures(line))
                .map(|caps| (caps["keyword"].to_string(), element_value(&caps["value"])))
                .collect::<CandidateRecord>()
        })
        .filter(|record| !record.is_empty())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReplayEntry {
    Records(Vec<CandidateRecord>),
    Error { error: String },
}

/// Serves responses recorded earlier, keyed by row index.
///
/// ```json
/// { "0": [{"AccessionNumber": "A1", "StudyInstanceUID": "1.2"}],
///   "1": {"error": "association rejected"} }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ReplayBackend {
    responses: BTreeMap<usize, ReplayEntry>,
}

impl ReplayBackend {
    pub fn from_json(json: &str) -> Result<Self> {
        let responses: BTreeMap<usize, ReplayEntry> =
            serde_json::from_str(json).context("Failed to parse replay responses")?;
        Ok(Self { responses })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

impl QueryBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn find(&self, spec: &QuerySpec) -> Result<Vec<CandidateRecord>, ProtocolError> {
        match self.responses.get(&spec.row_index) {
            Some(ReplayEntry::Records(records)) => Ok(records.clone()),
            Some(ReplayEntry::Error { error }) => Err(ProtocolError::Remote(error.clone())),
            None => Err(ProtocolError::MissingResponse(spec.row_index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, InputRow, QueryMode};

    const FINDSCU_DUMP: &str = "\
I: Requesting Association
I: Association Accepted (Max Send PDV: 16372)
I: Sending Find Request
I: Find Response: 1 (Pending)
I:
I: # Dicom-Data-Set
I: # Used TransferSyntax: Little Endian Explicit
I: (0008,0020) DA [20240301]                               #   8, 1 StudyDate
I: (0008,0050) SH [  ABC001  ]                             #  10, 1 AccessionNumber
I: (0008,0052) CS [STUDY ]                                 #   6, 1 QueryRetrieveLevel
I: (0020,000d) UI [1.2.840.1234.1\0]                       #  16, 1 StudyInstanceUID
I:
I: Find Response: 2 (Pending)
I:
I: (0008,0020) DA [20240302]                               #   8, 1 StudyDate
I: (0008,0050) SH (no value available)                     #   0, 0 AccessionNumber
I: (0020,000d) UI [1.2.840.1234.2]                         #  14, 1 StudyInstanceUID
I: Received Final Find Response (Success)
I: Releasing Association
";

    #[test]
    fn test_parse_find_responses() {
        let records = parse_find_responses(FINDSCU_DUMP);
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].get("StudyDate"), Some("20240301"));
        assert_eq!(records[0].get("AccessionNumber"), Some("  ABC001  "));
        assert_eq!(records[0].get("StudyInstanceUID"), Some("1.2.840.1234.1"));
        assert_eq!(records[0].get("QueryRetrieveLevel"), Some("STUDY "));

        assert_eq!(records[1].get("AccessionNumber"), Some(""));
        assert_eq!(records[1].study_instance_uid(), Some("1.2.840.1234.2"));
    }

    #[test]
    fn test_parse_without_responses() {
        assert!(parse_find_responses("I: Requesting Association\nI: Releasing Association\n").is_empty());
    }

    #[test]
    fn test_findscu_arguments() {
        let plan = plan(&[InputRow::accession(" ABC001 ")], QueryMode::AccessionNumber, 0).unwrap();
        let backend = FindscuBackend::new("/opt/dcmtk/bin/findscu", "10.0.0.5", 104)
            .with_ae_titles("SELECTOR", "PACS");

        assert_eq!(
            backend.arguments(&plan.specs[0]),
            vec![
                "-v",
                "-S",
                "-aet",
                "SELECTOR",
                "-aec",
                "PACS",
                "-k",
                "QueryRetrieveLevel=STUDY",
                "-k",
                "AccessionNumber=*ABC001*",
                "-k",
                "StudyInstanceUID",
                "-k",
                "StudyDate",
                "10.0.0.5",
                "104",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let plan = plan(&[InputRow::accession("A1")], QueryMode::AccessionNumber, 0).unwrap();
        let backend = FindscuBackend::new("/nonexistent/findscu", "127.0.0.1", 104).with_timeout(5);

        let err = backend.find(&plan.specs[0]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_replay_backend() {
        let json = r#"{
            "0": [{"AccessionNumber": "A1", "StudyInstanceUID": "1.1"}],
            "1": {"error": "association rejected"},
            "2": []
        }"#;
        let backend = ReplayBackend::from_json(json).unwrap();
        assert_eq!(backend.len(), 3);

        let rows = [
            InputRow::accession("A1"),
            InputRow::accession("B2"),
            InputRow::accession("C3"),
            InputRow::accession("D4"),
        ];
        let plan = plan(&rows, QueryMode::AccessionNumber, 0).unwrap();

        let first = backend.find(&plan.specs[0]).await.unwrap();
        assert_eq!(first[0].get("AccessionNumber"), Some("A1"));
        assert_eq!(
            backend.find(&plan.specs[1]).await.unwrap_err(),
            ProtocolError::Remote("association rejected".to_string())
        );
        assert!(backend.find(&plan.specs[2]).await.unwrap().is_empty());
        assert_eq!(
            backend.find(&plan.specs[3]).await.unwrap_err(),
            ProtocolError::MissingResponse(3)
        );
    }

    #[test]
    fn test_replay_rejects_malformed_json() {
        assert!(ReplayBackend::from_json("[1, 2]").is_err());
    }
}
