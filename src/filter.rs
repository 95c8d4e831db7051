use crate::error::CompileError;
use crate::rules::{FilterAction, FilterRule, Modality, RuleSet};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Text of the filter that accepts every instance.
pub const IDENTITY_SCRIPT: &str = "true.";

const AND_CONTINUATION: &str = "\n* ";
const OR_CONTINUATION: &str = "\n+ ";

/// Predicates understood by the anonymizer's filter language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    EqualsIgnoreCase,
    ContainsIgnoreCase,
    StartsWithIgnoreCase,
    EndsWithIgnoreCase,
    Equals,
    Contains,
    IsGreaterThan,
    IsLessThan,
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::EqualsIgnoreCase => "equalsIgnoreCase",
            Predicate::ContainsIgnoreCase => "containsIgnoreCase",
            Predicate::StartsWithIgnoreCase => "startsWithIgnoreCase",
            Predicate::EndsWithIgnoreCase => "endsWithIgnoreCase",
            Predicate::Equals => "equals",
            Predicate::Contains => "contains",
            Predicate::IsGreaterThan => "isGreaterThan",
            Predicate::IsLessThan => "isLessThan",
        }
    }

    fn test(&self, actual: &str, operand: &str) -> bool {
        match self {
            Predicate::EqualsIgnoreCase => actual.to_lowercase() == operand.to_lowercase(),
            Predicate::ContainsIgnoreCase => actual.to_lowercase().contains(&operand.to_lowercase()),
            Predicate::StartsWithIgnoreCase => {
                actual.to_lowercase().starts_with(&operand.to_lowercase())
            }
            Predicate::EndsWithIgnoreCase => actual.to_lowercase().ends_with(&operand.to_lowercase()),
            Predicate::Equals => actual == operand,
            Predicate::Contains => actual.contains(operand),
            Predicate::IsGreaterThan => compare_numbers(actual, operand, |a, b| a > b),
            Predicate::IsLessThan => compare_numbers(actual, operand, |a, b| a < b),
        }
    }
}

fn compare_numbers(actual: &str, operand: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.trim().parse::<f64>(), operand.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

/// Anything a filter can be evaluated against.
pub trait TagSource {
    fn tag_value(&self, tag: &str) -> Option<&str>;
}

impl TagSource for BTreeMap<String, String> {
    fn tag_value(&self, tag: &str) -> Option<&str> {
        self.get(tag).map(String::as_str)
    }
}

impl TagSource for HashMap<String, String> {
    fn tag_value(&self, tag: &str) -> Option<&str> {
        self.get(tag).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub tag: String,
    pub predicate: Predicate,
    pub value: String,
    pub negated: bool,
}

impl Term {
    pub fn new(tag: &str, predicate: Predicate, value: &str) -> Self {
        Self {
            tag: tag.to_string(),
            predicate,
            value: value.to_string(),
            negated: false,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// String predicates see the element value exactly as stored, padding
    /// included; only the numeric comparisons ignore surrounding whitespace.
    fn matches<S: TagSource + ?Sized>(&self, record: &S) -> bool {
        // A missing element reads as an empty string.
        let actual = record.tag_value(&self.tag).unwrap_or("");
        self.predicate.test(actual, &self.value) != self.negated
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        write!(
            f,
            "{}.{}(\"{}\")",
            self.tag,
            self.predicate.name(),
            escape_literal(&self.value)
        )
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Boolean expression over tag predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Identity,
    Term(Term),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    /// Conjunction that drops identity operands and collapses singletons.
    pub fn and(children: Vec<FilterExpr>) -> FilterExpr {
        let mut children: Vec<FilterExpr> = children
            .into_iter()
            .filter(|c| *c != FilterExpr::Identity)
            .collect();
        match children.len() {
            0 => FilterExpr::Identity,
            1 => children.remove(0),
            _ => FilterExpr::And(children),
        }
    }

    /// Disjunction; any identity operand makes the whole thing identity.
    pub fn or(mut children: Vec<FilterExpr>) -> FilterExpr {
        if children.is_empty() || children.contains(&FilterExpr::Identity) {
            return FilterExpr::Identity;
        }
        if children.len() == 1 {
            return children.remove(0);
        }
        FilterExpr::Or(children)
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, FilterExpr::Identity)
    }

    pub fn matches<S: TagSource + ?Sized>(&self, record: &S) -> bool {
        match self {
            FilterExpr::Identity => true,
            FilterExpr::Term(term) => term.matches(record),
            FilterExpr::And(children) => children.iter().all(|c| c.matches(record)),
            FilterExpr::Or(children) => children.iter().any(|c| c.matches(record)),
        }
    }

    /// Script text in the anonymizer's line-oriented grammar.
    pub fn to_script(&self) -> String {
        let mut out = String::new();
        self.write_script(&mut out);
        out
    }

    fn write_script(&self, out: &mut String) {
        match self {
            FilterExpr::Identity => out.push_str(IDENTITY_SCRIPT),
            FilterExpr::Term(term) => out.push_str(&term.to_string()),
            FilterExpr::And(children) => Self::write_joined(children, AND_CONTINUATION, out),
            FilterExpr::Or(children) => Self::write_joined(children, OR_CONTINUATION, out),
        }
    }

    fn write_joined(children: &[FilterExpr], separator: &str, out: &mut String) {
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            match child {
                FilterExpr::Term(_) => child.write_script(out),
                _ => {
                    out.push('(');
                    child.write_script(out);
                    out.push(')');
                }
            }
        }
    }

    /// Single-line rendering with AND/OR for run logs.
    pub fn readable(&self) -> String {
        match self {
            FilterExpr::Identity => "(all instances)".to_string(),
            FilterExpr::Term(term) => term.to_string(),
            FilterExpr::And(children) => Self::readable_joined(children, " AND "),
            FilterExpr::Or(children) => Self::readable_joined(children, " OR "),
        }
    }

    fn readable_joined(children: &[FilterExpr], separator: &str) -> String {
        children
            .iter()
            .map(|c| match c {
                FilterExpr::Term(_) => c.readable(),
                _ => format!("({})", c.readable()),
            })
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// A compiled filter: the expression plus its rendered script text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterScript {
    expr: FilterExpr,
    text: String,
}

impl FilterScript {
    pub fn new(expr: FilterExpr) -> Self {
        let text = expr.to_script();
        Self { expr, text }
    }

    pub fn identity() -> Self {
        Self::new(FilterExpr::Identity)
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_identity(&self) -> bool {
        self.expr.is_identity()
    }

    pub fn matches<S: TagSource + ?Sized>(&self, record: &S) -> bool {
        self.expr.matches(record)
    }

    pub fn readable(&self) -> String {
        self.expr.readable()
    }

    /// ANDs this filter with another, e.g. the planner's selection filter.
    pub fn and_also(&self, other: Option<&FilterExpr>) -> FilterScript {
        combine(Some(&self.expr), other)
    }
}

impl fmt::Display for FilterScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Fixed mapping from rule action to predicate term.
pub fn term_for_rule(rule: &FilterRule) -> Term {
    let predicate = match rule.action {
        FilterAction::Equals | FilterAction::DoesNotEqual => Predicate::EqualsIgnoreCase,
        FilterAction::Contains | FilterAction::DoesNotContain => Predicate::ContainsIgnoreCase,
        FilterAction::StartsWith | FilterAction::DoesNotStartWith => {
            Predicate::StartsWithIgnoreCase
        }
        FilterAction::EndsWith | FilterAction::DoesNotEndWith => Predicate::EndsWithIgnoreCase,
    };
    Term {
        tag: rule.tag.clone(),
        predicate,
        value: rule.value.clone(),
        negated: rule.action.is_negated(),
    }
}

fn modality_term(modality: Modality) -> Term {
    Term::new("Modality", Predicate::EqualsIgnoreCase, modality.as_str())
}

/// Compiles a rule set into the anonymizer's filter script.
///
/// General rules are ANDed; each modality bucket becomes
/// `Modality == key AND bucket rules`; the buckets are ORed and the result
/// ANDed onto the general rules. An empty rule set compiles to the identity
/// filter. Nothing is emitted if any rule is invalid.
pub fn compile(rules: &RuleSet) -> Result<FilterScript, CompileError> {
    rules.validate()?;

    let mut conjuncts: Vec<FilterExpr> = rules
        .general
        .iter()
        .map(|rule| FilterExpr::Term(term_for_rule(rule)))
        .collect();

    if rules.modality_filtering {
        let branches: Vec<FilterExpr> = rules
            .modality_filters
            .iter()
            .map(|(modality, bucket)| {
                let mut terms = vec![FilterExpr::Term(modality_term(*modality))];
                terms.extend(bucket.iter().map(|r| FilterExpr::Term(term_for_rule(r))));
                FilterExpr::and(terms)
            })
            .collect();
        if !branches.is_empty() {
            conjuncts.push(FilterExpr::or(branches));
        }
    } else if !rules.modality_filters.is_empty() {
        log::debug!(
            "Modality filtering disabled, ignoring {} modality bucket(s)",
            rules.modality_filters.len()
        );
    }

    let script = FilterScript::new(FilterExpr::and(conjuncts));
    log::debug!("Compiled filter script: {}", script.readable());
    Ok(script)
}

/// `(user) * (generated)`, or whichever side is present.
pub fn combine(user: Option<&FilterExpr>, generated: Option<&FilterExpr>) -> FilterScript {
    let parts = [user, generated].into_iter().flatten().cloned().collect();
    FilterScript::new(FilterExpr::and(parts))
}
