//! Filter rule model.
//!
//! A [`RuleSet`] is the validated, immutable value a run compiles into a
//! filter script. The persisted form is a [`RuleDocument`], which keeps
//! actions and modality keys as plain strings so that a hand-edited or
//! UI-produced file with a typo reaches [`RuleDocument::validate`] and
//! fails with a precise [`ValidationError`] instead of a serde message.

use crate::error::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

static TAG_REGEX: OnceLock<Regex> = OnceLock::new();

fn tag_regex() -> &'static Regex {
    TAG_REGEX.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z][A-Za-z0-9]*|\[[0-9A-Fa-f]{4},[0-9A-Fa-f]{4}\])$")
            .expect("tag pattern is valid")
    })
}

/// The closed set of string predicates a rule can apply to a tag value.
/// Every action matches case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterAction {
    Equals,
    DoesNotEqual,
    Contains,
    DoesNotContain,
    StartsWith,
    DoesNotStartWith,
    EndsWith,
    DoesNotEndWith,
}

impl FilterAction {
    pub const ALL: [FilterAction; 8] = [
        FilterAction::Equals,
        FilterAction::DoesNotEqual,
        FilterAction::Contains,
        FilterAction::DoesNotContain,
        FilterAction::StartsWith,
        FilterAction::DoesNotStartWith,
        FilterAction::EndsWith,
        FilterAction::DoesNotEndWith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterAction::Equals => "Equals",
            FilterAction::DoesNotEqual => "DoesNotEqual",
            FilterAction::Contains => "Contains",
            FilterAction::DoesNotContain => "DoesNotContain",
            FilterAction::StartsWith => "StartsWith",
            FilterAction::DoesNotStartWith => "DoesNotStartWith",
            FilterAction::EndsWith => "EndsWith",
            FilterAction::DoesNotEndWith => "DoesNotEndWith",
        }
    }

    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            FilterAction::DoesNotEqual
                | FilterAction::DoesNotContain
                | FilterAction::DoesNotStartWith
                | FilterAction::DoesNotEndWith
        )
    }

    /// The action with the opposite truth value for every input.
    pub fn negation(&self) -> FilterAction {
        match self {
            FilterAction::Equals => FilterAction::DoesNotEqual,
            FilterAction::DoesNotEqual => FilterAction::Equals,
            FilterAction::Contains => FilterAction::DoesNotContain,
            FilterAction::DoesNotContain => FilterAction::Contains,
            FilterAction::StartsWith => FilterAction::DoesNotStartWith,
            FilterAction::DoesNotStartWith => FilterAction::StartsWith,
            FilterAction::EndsWith => FilterAction::DoesNotEndWith,
            FilterAction::DoesNotEndWith => FilterAction::EndsWith,
        }
    }

    /// Parses the UI name (`DoesNotContain`, any case) or the legacy
    /// predicate spelling stored by older settings files
    /// (`containsIgnoreCase`, `not_containsIgnoreCase`).
    pub fn parse(input: &str) -> Option<FilterAction> {
        let lowered = input.trim().to_ascii_lowercase();
        let (negated, stem) = match lowered.strip_prefix("not_") {
            Some(rest) => (true, rest),
            None => (false, lowered.as_str()),
        };
        let stem = stem.strip_suffix("ignorecase").unwrap_or(stem);

        let action = match stem {
            "equals" => FilterAction::Equals,
            "doesnotequal" => FilterAction::DoesNotEqual,
            "contains" => FilterAction::Contains,
            "doesnotcontain" => FilterAction::DoesNotContain,
            "startswith" => FilterAction::StartsWith,
            "doesnotstartwith" => FilterAction::DoesNotStartWith,
            "endswith" => FilterAction::EndsWith,
            "doesnotendwith" => FilterAction::DoesNotEndWith,
            _ => return None,
        };

        match (negated, action.is_negated()) {
            (false, _) => Some(action),
            (true, false) => Some(action.negation()),
            (true, true) => None,
        }
    }
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for FilterAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FilterAction::parse(&value).ok_or_else(|| format!("unknown filter action '{value}'"))
    }
}

impl From<FilterAction> for String {
    fn from(action: FilterAction) -> Self {
        action.as_str().to_string()
    }
}

/// Modality codes a rule bucket can be keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Modality {
    MR,
    CT,
    US,
    DX,
    MG,
    PT,
    NM,
    XA,
    RF,
    CR,
}

impl Modality {
    pub const ALL: [Modality; 10] = [
        Modality::MR,
        Modality::CT,
        Modality::US,
        Modality::DX,
        Modality::MG,
        Modality::PT,
        Modality::NM,
        Modality::XA,
        Modality::RF,
        Modality::CR,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::MR => "MR",
            Modality::CT => "CT",
            Modality::US => "US",
            Modality::DX => "DX",
            Modality::MG => "MG",
            Modality::PT => "PT",
            Modality::NM => "NM",
            Modality::XA => "XA",
            Modality::RF => "RF",
            Modality::CR => "CR",
        }
    }

    pub fn parse(input: &str) -> Option<Modality> {
        let code = input.trim();
        Modality::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Modality {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Modality::parse(&value).ok_or_else(|| format!("unknown modality '{value}'"))
    }
}

impl From<Modality> for String {
    fn from(modality: Modality) -> Self {
        modality.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub tag: String,
    pub action: FilterAction,
    pub value: String,
}

impl FilterRule {
    /// Builds a rule; surrounding whitespace is stripped from the tag.
    pub fn new(tag: &str, action: FilterAction, value: &str) -> Self {
        Self {
            tag: tag.trim().to_string(),
            action,
            value: value.to_string(),
        }
    }

    fn check(&self, position: String) -> Result<(), ValidationError> {
        if self.tag.trim().is_empty() {
            return Err(ValidationError::EmptyTag { position });
        }
        // The tag must already be trimmed.
        if !tag_regex().is_match(&self.tag) {
            return Err(ValidationError::MalformedTag {
                position,
                tag: self.tag.clone(),
            });
        }
        if self.value.contains(['\n', '\r']) {
            return Err(ValidationError::MultilineValue { position });
        }
        Ok(())
    }
}

fn default_modality_filtering() -> bool {
    true
}

/// A complete filter configuration. Loaded once per run and never mutated
/// while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub general: Vec<FilterRule>,
    pub modality_filters: BTreeMap<Modality, Vec<FilterRule>>,
    pub modality_filtering: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            general: Vec::new(),
            modality_filters: BTreeMap::new(),
            modality_filtering: default_modality_filtering(),
        }
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.modality_filters.is_empty()
    }

    pub fn add_general(&mut self, rule: FilterRule) {
        self.general.push(rule);
    }

    pub fn remove_general(&mut self, index: usize) -> Option<FilterRule> {
        (index < self.general.len()).then(|| self.general.remove(index))
    }

    /// Appends a rule to a modality bucket, creating the bucket if needed.
    pub fn add_modality_rule(&mut self, modality: Modality, rule: FilterRule) {
        self.modality_filters.entry(modality).or_default().push(rule);
    }

    /// Selects a modality without any extra rules.
    pub fn add_modality(&mut self, modality: Modality) {
        self.modality_filters.entry(modality).or_default();
    }

    pub fn remove_modality_rule(&mut self, modality: Modality, index: usize) -> Option<FilterRule> {
        let bucket = self.modality_filters.get_mut(&modality)?;
        (index < bucket.len()).then(|| bucket.remove(index))
    }

    pub fn remove_modality(&mut self, modality: Modality) -> Option<Vec<FilterRule>> {
        self.modality_filters.remove(&modality)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (i, rule) in self.general.iter().enumerate() {
            rule.check(format!("general[{i}]"))?;
        }
        for (modality, rules) in &self.modality_filters {
            for (i, rule) in rules.iter().enumerate() {
                rule.check(format!("{modality}[{i}]"))?;
            }
        }
        Ok(())
    }

    pub fn to_document(&self) -> RuleDocument {
        RuleDocument {
            general_filters: self.general.iter().map(RuleEntry::from).collect(),
            modality_filters: self
                .modality_filters
                .iter()
                .map(|(m, rules)| {
                    (
                        m.as_str().to_string(),
                        rules.iter().map(RuleEntry::from).collect(),
                    )
                })
                .collect(),
            modality_filtering: self.modality_filtering,
        }
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&self.to_document())?)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let document: RuleDocument = serde_yaml::from_str(content)?;
        Ok(document.validate()?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let document: RuleDocument = serde_json::from_str(content)?;
        Ok(document.validate()?)
    }

    /// Loads a rule file; `.json` files are read as JSON, anything else as YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule file: {}", path.display()))?;
        let rules = if is_json(path) {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        };
        rules.with_context(|| format!("Invalid rule file: {}", path.display()))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            self.to_json()?
        } else {
            self.to_yaml()?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Imports the protocol spreadsheet layout: a `General Filters` column
    /// and one `<MODALITY> Filters` column per modality, each holding one
    /// `tag, action, value` rule per line. Other columns are ignored.
    pub fn from_protocol_row(columns: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let mut document = RuleDocument::default();

        for (column, cell) in columns {
            let Some(prefix) = column.trim().strip_suffix(" Filters") else {
                continue;
            };
            let entries = parse_protocol_lines(cell)?;
            if prefix.eq_ignore_ascii_case("General") {
                document.general_filters.extend(entries);
            } else if !entries.is_empty() {
                document.modality_filters.insert(prefix.to_string(), entries);
            }
        }

        document.validate()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn parse_protocol_lines(cell: &str) -> Result<Vec<RuleEntry>, ValidationError> {
    let mut entries = Vec::new();
    for line in cell.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.splitn(3, ',').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(action), Some(value)) => entries.push(RuleEntry {
                tag: tag.to_string(),
                action: action.to_string(),
                value: value.to_string(),
            }),
            _ => return Err(ValidationError::MalformedLine(line.to_string())),
        }
    }
    Ok(entries)
}

/// A rule as persisted, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    pub tag: String,
    pub action: String,
    pub value: String,
}

impl From<&FilterRule> for RuleEntry {
    fn from(rule: &FilterRule) -> Self {
        Self {
            tag: rule.tag.clone(),
            action: rule.action.as_str().to_string(),
            value: rule.value.clone(),
        }
    }
}

/// Persisted representation of a [`RuleSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub general_filters: Vec<RuleEntry>,
    #[serde(default)]
    pub modality_filters: BTreeMap<String, Vec<RuleEntry>>,
    #[serde(default = "default_modality_filtering")]
    pub modality_filtering: bool,
}

impl Default for RuleDocument {
    fn default() -> Self {
        Self {
            general_filters: Vec::new(),
            modality_filters: BTreeMap::new(),
            modality_filtering: default_modality_filtering(),
        }
    }
}

impl RuleDocument {
    pub fn validate(&self) -> Result<RuleSet, ValidationError> {
        let mut rules = RuleSet {
            modality_filtering: self.modality_filtering,
            ..RuleSet::default()
        };

        for (i, entry) in self.general_filters.iter().enumerate() {
            rules.general.push(entry.to_rule(format!("general[{i}]"))?);
        }

        for (key, entries) in &self.modality_filters {
            let modality = Modality::parse(key)
                .ok_or_else(|| ValidationError::UnknownModality(key.clone()))?;
            let bucket = rules.modality_filters.entry(modality).or_default();
            for (i, entry) in entries.iter().enumerate() {
                bucket.push(entry.to_rule(format!("{modality}[{i}]"))?);
            }
        }

        rules.validate()?;
        Ok(rules)
    }
}

impl RuleEntry {
    fn to_rule(&self, position: String) -> Result<FilterRule, ValidationError> {
        if self.tag.trim().is_empty() {
            return Err(ValidationError::EmptyTag { position });
        }
        let action = FilterAction::parse(&self.action).ok_or_else(|| {
            ValidationError::UnknownAction {
                position: position.clone(),
                action: self.action.clone(),
            }
        })?;
        let rule = FilterRule {
            tag: self.tag.trim().to_string(),
            action,
            value: self.value.clone(),
        };
        rule.check(position)?;
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rules() -> RuleSet {
        let mut rules = RuleSet::new();
        rules.add_general(FilterRule::new(
            "SeriesDescription",
            FilterAction::DoesNotContain,
            "scout",
        ));
        rules.add_general(FilterRule::new("Manufacturer", FilterAction::StartsWith, "GE"));
        rules.add_modality_rule(
            Modality::CT,
            FilterRule::new("ImageType", FilterAction::Contains, "AXIAL"),
        );
        rules.add_modality(Modality::MR);
        rules
    }

    #[test]
    fn test_action_parse_accepts_ui_and_legacy_spellings() {
        assert_eq!(FilterAction::parse("DoesNotContain"), Some(FilterAction::DoesNotContain));
        assert_eq!(FilterAction::parse("startswith"), Some(FilterAction::StartsWith));
        assert_eq!(
            FilterAction::parse("not_endsWithIgnoreCase"),
            Some(FilterAction::DoesNotEndWith)
        );
        assert_eq!(FilterAction::parse("equalsIgnoreCase"), Some(FilterAction::Equals));
        assert_eq!(FilterAction::parse("matches"), None);
        assert_eq!(FilterAction::parse("not_DoesNotEqual"), None);
    }

    #[test]
    fn test_every_action_has_an_opposite() {
        for action in FilterAction::ALL {
            assert_ne!(action.is_negated(), action.negation().is_negated());
            assert_eq!(action.negation().negation(), action);
            assert_eq!(FilterAction::parse(action.as_str()), Some(action));
        }
    }

    #[test]
    fn test_add_and_remove_rules() {
        let mut rules = sample_rules();
        assert_eq!(rules.general.len(), 2);

        let removed = rules.remove_general(0).unwrap();
        assert_eq!(removed.tag, "SeriesDescription");
        assert!(rules.remove_general(5).is_none());

        let removed = rules.remove_modality_rule(Modality::CT, 0).unwrap();
        assert_eq!(removed.value, "AXIAL");
        assert!(rules.modality_filters[&Modality::CT].is_empty());
        assert!(rules.remove_modality_rule(Modality::US, 0).is_none());

        rules.remove_modality(Modality::CT);
        rules.remove_modality(Modality::MR);
        rules.remove_general(0);
        assert!(rules.is_empty());
    }

    #[test]
    fn test_yaml_round_trip() {
        let rules = sample_rules();
        let yaml = rules.to_yaml().unwrap();
        assert_eq!(RuleSet::from_yaml(&yaml).unwrap(), rules);
    }

    #[test]
    fn test_padded_tag_round_trips() {
        let mut rules = RuleSet::new();
        rules.add_general(FilterRule::new(" Modality ", FilterAction::Equals, "CT"));
        rules.add_modality_rule(
            Modality::MR,
            FilterRule::new("\tSeriesDescription", FilterAction::Contains, " T1 "),
        );
        assert!(rules.validate().is_ok());
        assert_eq!(rules.general[0].tag, "Modality");

        let loaded = RuleSet::from_yaml(&rules.to_yaml().unwrap()).unwrap();
        assert_eq!(loaded, rules);
        assert_eq!(loaded.modality_filters[&Modality::MR][0].value, " T1 ");
    }

    #[test]
    fn test_validate_rejects_padded_tag_set_directly() {
        let mut rules = RuleSet::new();
        rules.general.push(FilterRule {
            tag: " Modality ".to_string(),
            action: FilterAction::Equals,
            value: "CT".to_string(),
        });
        assert!(matches!(
            rules.validate(),
            Err(ValidationError::MalformedTag { .. })
        ));
    }

    #[test]
    fn test_json_round_trip_keeps_disabled_modality_filtering() {
        let mut rules = sample_rules();
        rules.modality_filtering = false;
        let json = rules.to_json().unwrap();
        assert_eq!(RuleSet::from_json(&json).unwrap(), rules);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let rules = sample_rules();
        for name in ["rules.yaml", "rules.json"] {
            let path = dir.path().join(name);
            rules.to_file(&path).unwrap();
            assert_eq!(RuleSet::from_file(&path).unwrap(), rules);
        }
    }

    #[test]
    fn test_validate_rejects_empty_tag() {
        let document = RuleDocument {
            general_filters: vec![RuleEntry {
                tag: "  ".to_string(),
                action: "Equals".to_string(),
                value: "x".to_string(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            document.validate(),
            Err(ValidationError::EmptyTag { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_action() {
        let yaml = r#"
general_filters:
  - tag: Modality
    action: LooksLike
    value: CT
"#;
        let document: RuleDocument = serde_yaml::from_str(yaml).unwrap();
        match document.validate() {
            Err(ValidationError::UnknownAction { position, action }) => {
                assert_eq!(position, "general[0]");
                assert_eq!(action, "LooksLike");
            }
            other => panic!("Expected unknown action error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_modality() {
        let yaml = r#"
modality_filters:
  XR:
    - tag: BodyPartExamined
      action: Equals
      value: CHEST
"#;
        let document: RuleDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            document.validate(),
            Err(ValidationError::UnknownModality("XR".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_multiline_value_and_bad_tag() {
        let mut rules = RuleSet::new();
        rules.add_general(FilterRule::new("PatientName", FilterAction::Equals, "a\nb"));
        assert!(matches!(
            rules.validate(),
            Err(ValidationError::MultilineValue { .. })
        ));

        let mut rules = RuleSet::new();
        rules.add_general(FilterRule::new("Patient Name", FilterAction::Equals, "x"));
        assert!(matches!(
            rules.validate(),
            Err(ValidationError::MalformedTag { .. })
        ));

        let mut rules = RuleSet::new();
        rules.add_general(FilterRule::new("[0008,0050]", FilterAction::Equals, "x"));
        assert!(rules.validate().is_ok());
    }

    #[test]
    fn test_from_protocol_row() {
        let mut columns = BTreeMap::new();
        columns.insert(
            "General Filters".to_string(),
            "SeriesDescription, DoesNotContain, scout\n\nManufacturer, StartsWith, GE".to_string(),
        );
        columns.insert(
            "CT Filters".to_string(),
            "ImageType, Contains, ORIGINAL, PRIMARY".to_string(),
        );
        columns.insert("MR Filters".to_string(), String::new());
        columns.insert("Protocol Name".to_string(), "Chest CT".to_string());

        let rules = RuleSet::from_protocol_row(&columns).unwrap();
        assert_eq!(rules.general.len(), 2);
        assert_eq!(rules.general[0].action, FilterAction::DoesNotContain);
        assert_eq!(rules.modality_filters.len(), 1);
        assert_eq!(rules.modality_filters[&Modality::CT][0].value, "ORIGINAL, PRIMARY");
    }

    #[test]
    fn test_from_protocol_row_rejects_short_line() {
        let mut columns = BTreeMap::new();
        columns.insert("General Filters".to_string(), "Modality, Equals".to_string());
        assert_eq!(
            RuleSet::from_protocol_row(&columns),
            Err(ValidationError::MalformedLine("Modality, Equals".to_string()))
        );
    }
}
