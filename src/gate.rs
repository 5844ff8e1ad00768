//! Condition gates.
//!
//! Predicates over the suite's feature set decide which cases and runs are
//! included, which are skipped, and which gold reference applies. All
//! evaluation happens once, at case-construction time, before any process
//! launches; a skipped case reports as intentionally skipped, never as a
//! failure.

use crate::error::HarnessError;
use crate::schema::{CaseSpec, Condition, GoldBinding};
use std::collections::HashSet;

/// The set of features present in this environment.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    features: HashSet<String>,
}

impl FeatureSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.features.contains(name)
    }
}

/// Gate outcome for a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Include,
    Skip(String),
}

/// Check a condition tree for malformed nodes.
///
/// Empty `all`/`any` lists are rejected here so authoring mistakes surface
/// during validation, before anything launches.
pub fn validate(cond: &Condition) -> Result<(), HarnessError> {
    match cond {
        Condition::Feature(name) => {
            if name.is_empty() {
                Err(HarnessError::Condition("empty feature name".to_string()))
            } else {
                Ok(())
            }
        }
        Condition::All { all } => {
            if all.is_empty() {
                return Err(HarnessError::Condition(
                    "'all' requires at least one sub-condition".to_string(),
                ));
            }
            all.iter().try_for_each(validate)
        }
        Condition::Any { any } => {
            if any.is_empty() {
                return Err(HarnessError::Condition(
                    "'any' requires at least one sub-condition".to_string(),
                ));
            }
            any.iter().try_for_each(validate)
        }
        Condition::Not { not } => validate(not),
    }
}

/// Evaluate a condition against the feature set.
pub fn evaluate(cond: &Condition, features: &FeatureSet) -> Result<bool, HarnessError> {
    validate(cond)?;
    Ok(eval_unchecked(cond, features))
}

fn eval_unchecked(cond: &Condition, features: &FeatureSet) -> bool {
    match cond {
        Condition::Feature(name) => features.has(name),
        Condition::All { all } => all.iter().all(|c| eval_unchecked(c, features)),
        Condition::Any { any } => any.iter().any(|c| eval_unchecked(c, features)),
        Condition::Not { not } => !eval_unchecked(not, features),
    }
}

/// Validate every condition a case contains (processes, runs, gold selects).
pub fn validate_case(spec: &CaseSpec) -> Result<(), HarnessError> {
    for process in &spec.processes {
        if let Some(cond) = &process.when {
            validate(cond)?;
        }
    }
    for run in &spec.runs {
        if let Some(cond) = &run.when {
            validate(cond)?;
        }
    }
    for binding in &spec.gold {
        for select in &binding.select {
            validate(&select.when)?;
        }
    }
    Ok(())
}

/// Decide whether a case is included or skipped.
///
/// Every feature in `require_features` must be present; the skip reason
/// names the missing ones.
pub fn gate_case(spec: &CaseSpec, features: &FeatureSet) -> Gate {
    let missing: Vec<&str> = spec
        .require_features
        .iter()
        .filter(|f| !features.has(f))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        Gate::Include
    } else {
        Gate::Skip(format!("missing features: {}", missing.join(", ")))
    }
}

/// Pick the gold reference for a binding: the first `select` arm whose
/// condition holds, falling back to the default.
pub fn select_gold<'a>(
    binding: &'a GoldBinding,
    features: &FeatureSet,
) -> Result<&'a str, HarnessError> {
    for arm in &binding.select {
        if evaluate(&arm.when, features)? {
            return Ok(&arm.gold);
        }
    }
    Ok(&binding.gold)
}
