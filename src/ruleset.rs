//! JSON rule documents and their compiled sessions.
//!
//! This is the bundled [`RuleCompiler`]. A document lists named rules, each
//! with `when` conditions over fact fields and `then` actions writing output
//! fields:
//!
//! ```json
//! { "rules": [
//!     { "name": "gold-discount", "salience": 10,
//!       "when": [ { "type": "equals", "field": "customer.tier", "value": "gold" },
//!                 { "type": "range", "field": "total", "min": 100 } ],
//!       "then": [ { "type": "set", "field": "discount", "value": 0.1 } ] }
//! ] }
//! ```
//!
//! Rules fire in descending salience (declaration order breaks ties). Each rule
//! sees the facts plus every output written by rules that fired before it.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::compiler::{CompileError, RuleCompiler};

/// Conditions a rule can test against working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Field must equal the given JSON value.
    Equals {
        /// Dotted field path.
        field: String,
        /// Expected value.
        value: Value,
    },

    /// Numeric field must be within bounds (inclusive).
    Range {
        /// Dotted field path.
        field: String,
        /// Minimum value (inclusive).
        #[serde(default)]
        min: Option<f64>,
        /// Maximum value (inclusive).
        #[serde(default)]
        max: Option<f64>,
    },

    /// Field must equal one of the allowed values.
    OneOf {
        /// Dotted field path.
        field: String,
        /// Allowed values.
        allowed: Vec<Value>,
    },

    /// String field must match a regex.
    Regex {
        /// Dotted field path.
        field: String,
        /// Regex pattern.
        pattern: String,
    },

    /// Field must be present and non-null.
    Exists {
        /// Dotted field path.
        field: String,
    },

    /// Field must be absent or null.
    Missing {
        /// Dotted field path.
        field: String,
    },
}

impl Condition {
    fn field(&self) -> &str {
        match self {
            Self::Equals { field, .. }
            | Self::Range { field, .. }
            | Self::OneOf { field, .. }
            | Self::Regex { field, .. }
            | Self::Exists { field }
            | Self::Missing { field } => field,
        }
    }
}

/// Actions applied when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Write a value to an output field.
    Set {
        /// Output field name.
        field: String,
        /// Value to write.
        value: Value,
    },

    /// Add to a numeric output field, starting from the fact value or zero.
    Add {
        /// Output field name.
        field: String,
        /// Amount to add.
        by: f64,
    },
}

/// One rule as written in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique rule name.
    pub name: String,
    /// Firing priority; higher fires first.
    #[serde(default)]
    pub salience: i32,
    /// Conditions that must all hold.
    #[serde(default)]
    pub when: Vec<Condition>,
    /// Actions applied on firing.
    pub then: Vec<Action>,
}

/// A rule document as stored in the configuration source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDocument {
    /// Rules in declaration order.
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug)]
enum Check {
    Equals(Value),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<Value>),
    Regex(Regex),
    Exists,
    Missing,
}

#[derive(Debug)]
struct CompiledCondition {
    path: Vec<String>,
    check: Check,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    conditions: Vec<CompiledCondition>,
    actions: Vec<Action>,
}

/// Result of executing a rule set against facts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Names of the rules that fired, in firing order.
    pub fired: Vec<String>,
    /// Output fields written by fired rules.
    pub output: Map<String, Value>,
}

impl Outcome {
    /// Returns true if the named rule fired.
    #[must_use]
    pub fn has_fired(&self, rule: &str) -> bool {
        self.fired.iter().any(|r| r == rule)
    }
}

/// A compiled, immutable rule session.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Rule names in firing order.
    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }

    /// Number of rules in the session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the session has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule once against `facts`.
    #[must_use]
    pub fn execute(&self, facts: &Value) -> Outcome {
        let mut outcome = Outcome::default();
        for rule in &self.rules {
            let holds = rule
                .conditions
                .iter()
                .all(|c| evaluate(c, facts, &outcome.output));
            if !holds {
                continue;
            }
            for action in &rule.actions {
                apply(action, facts, &mut outcome.output);
            }
            outcome.fired.push(rule.name.clone());
        }
        outcome
    }
}

/// Compiles [`RuleDocument`] JSON into [`RuleSet`] sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRuleCompiler;

impl RuleCompiler for JsonRuleCompiler {
    type Session = RuleSet;

    fn compile(&self, source: &str) -> Result<RuleSet, CompileError> {
        let doc: RuleDocument = serde_json::from_str(source)
            .map_err(|e| CompileError::at_line(e.to_string(), e.line()))?;
        compile_document(doc)
    }
}

/// Validate and compile a parsed document.
pub fn compile_document(doc: RuleDocument) -> Result<RuleSet, CompileError> {
    if doc.rules.is_empty() {
        return Err(CompileError::new("rule document defines no rules"));
    }

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(doc.rules.len());
    for (idx, def) in doc.rules.into_iter().enumerate() {
        let name = def.name.trim().to_string();
        if name.is_empty() {
            return Err(CompileError::new(format!("rule #{} has an empty name", idx + 1)));
        }
        if !seen.insert(name.clone()) {
            return Err(CompileError::new(format!("duplicate rule name '{name}'")));
        }
        if def.then.is_empty() {
            return Err(CompileError::new(format!("rule '{name}' has no actions")));
        }

        let mut conditions = Vec::with_capacity(def.when.len());
        for cond in def.when {
            conditions.push(compile_condition(&name, cond)?);
        }
        for action in &def.then {
            let (Action::Set { field, .. } | Action::Add { field, .. }) = action;
            if field.trim().is_empty() {
                return Err(CompileError::new(format!("rule '{name}' writes to an empty field")));
            }
        }

        rules.push((
            def.salience,
            CompiledRule {
                name,
                conditions,
                actions: def.then,
            },
        ));
    }

    // Stable: equal salience keeps declaration order.
    rules.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(RuleSet {
        rules: rules.into_iter().map(|(_, r)| r).collect(),
    })
}

fn compile_condition(rule: &str, cond: Condition) -> Result<CompiledCondition, CompileError> {
    let path = parse_path(cond.field())
        .ok_or_else(|| CompileError::new(format!("rule '{rule}' has an invalid field path '{}'", cond.field())))?;

    let check = match cond {
        Condition::Equals { value, .. } => Check::Equals(value),
        Condition::Range { min, max, .. } => {
            if min.is_none() && max.is_none() {
                return Err(CompileError::new(format!("rule '{rule}': range needs min or max")));
            }
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(CompileError::new(format!("rule '{rule}': range min {lo} exceeds max {hi}")));
                }
            }
            Check::Range { min, max }
        }
        Condition::OneOf { allowed, .. } => {
            if allowed.is_empty() {
                return Err(CompileError::new(format!("rule '{rule}': one_of needs at least one value")));
            }
            Check::OneOf(allowed)
        }
        Condition::Regex { pattern, .. } => {
            let re = Regex::new(&pattern)
                .map_err(|e| CompileError::new(format!("rule '{rule}': invalid regex: {e}")))?;
            Check::Regex(re)
        }
        Condition::Exists { .. } => Check::Exists,
        Condition::Missing { .. } => Check::Missing,
    };

    Ok(CompiledCondition { path, check })
}

fn parse_path(field: &str) -> Option<Vec<String>> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    let parts: Vec<String> = field.split('.').map(str::to_string).collect();
    if parts.iter().any(String::is_empty) {
        return None;
    }
    Some(parts)
}

fn resolve<'a>(path: &[String], facts: &'a Value, output: &'a Map<String, Value>) -> Option<&'a Value> {
    let (head, rest) = path.split_first()?;
    let root = output.get(head).or_else(|| facts.get(head))?;
    rest.iter().try_fold(root, |v, seg| v.get(seg))
}

fn evaluate(cond: &CompiledCondition, facts: &Value, output: &Map<String, Value>) -> bool {
    let value = resolve(&cond.path, facts, output).filter(|v| !v.is_null());
    match &cond.check {
        Check::Exists => value.is_some(),
        Check::Missing => value.is_none(),
        Check::Equals(expected) => value.is_some_and(|v| values_equal(v, expected)),
        Check::OneOf(allowed) => value.is_some_and(|v| allowed.iter().any(|a| values_equal(v, a))),
        Check::Range { min, max } => value.and_then(Value::as_f64).is_some_and(|x| {
            min.map_or(true, |lo| x >= lo) && max.map_or(true, |hi| x <= hi)
        }),
        Check::Regex(re) => value.and_then(Value::as_str).is_some_and(|s| re.is_match(s)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn apply(action: &Action, facts: &Value, output: &mut Map<String, Value>) {
    match action {
        Action::Set { field, value } => {
            output.insert(field.clone(), value.clone());
        }
        Action::Add { field, by } => {
            let base = output
                .get(field)
                .or_else(|| facts.get(field))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let sum = serde_json::Number::from_f64(base + by).map_or(Value::Null, Value::Number);
            output.insert(field.clone(), sum);
        }
    }
}
