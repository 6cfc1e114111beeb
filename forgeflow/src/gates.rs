//! Quality gate evaluation.
//!
//! A gate compares one stage metric against a threshold. Blocking gates
//! decide whether the pipeline may proceed past the stage; non-blocking
//! gates only record their outcome. A missing metric is a failure, not a
//! skip: absence of evidence never lets a blocking gate pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::FlowError;

/// Comparison operator for a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateOperator {
    /// Strict, type-sensitive equality.
    #[serde(rename = "==")]
    Eq,
    /// Strict, type-sensitive inequality.
    #[serde(rename = "!=")]
    Ne,
    /// Numeric less-than.
    #[serde(rename = "<")]
    Lt,
    /// Numeric less-than-or-equal.
    #[serde(rename = "<=")]
    Le,
    /// Numeric greater-than.
    #[serde(rename = ">")]
    Gt,
    /// Numeric greater-than-or-equal.
    #[serde(rename = ">=")]
    Ge,
}

/// A single quality gate definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    /// Gate name, unique within a stage.
    pub name: String,
    /// Dot-path into the stage's reported metrics.
    pub metric: String,
    /// Comparison operator.
    pub operator: GateOperator,
    /// Threshold value compared against the resolved metric.
    pub threshold: serde_json::Value,
    /// Whether a failure halts pipeline progression past the stage.
    #[serde(default)]
    pub blocking: bool,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QualityGate {
    /// Creates a new gate.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        operator: GateOperator,
        threshold: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            operator,
            threshold,
            blocking: false,
            description: None,
        }
    }

    /// Marks the gate as blocking.
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of evaluating one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    /// The gate name.
    pub gate: String,
    /// The metric path that was resolved.
    pub metric: String,
    /// Whether the gate passed.
    pub passed: bool,
    /// Whether the gate was blocking.
    pub blocking: bool,
    /// The resolved metric value, if found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<serde_json::Value>,
    /// The configured threshold.
    pub threshold: serde_json::Value,
    /// Failure reason (`metric_not_found`, `not_comparable`,
    /// `threshold_not_met`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate outcome over all gates of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluation {
    /// True iff every blocking gate passed. Non-blocking failures are
    /// recorded in `results` but do not affect this.
    pub passed: bool,
    /// Per-gate outcomes, in definition order.
    pub results: Vec<GateResult>,
}

/// Resolves a dot-separated path into a metrics document.
#[must_use]
pub fn resolve_metric<'a>(
    metrics: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = metrics;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(
    actual: &serde_json::Value,
    operator: GateOperator,
    threshold: &serde_json::Value,
) -> Result<bool, &'static str> {
    match operator {
        GateOperator::Eq => Ok(actual == threshold),
        GateOperator::Ne => Ok(actual != threshold),
        GateOperator::Lt | GateOperator::Le | GateOperator::Gt | GateOperator::Ge => {
            let (Some(a), Some(t)) = (as_number(actual), as_number(threshold)) else {
                return Err("not_comparable");
            };
            Ok(match operator {
                GateOperator::Lt => a < t,
                GateOperator::Le => a <= t,
                GateOperator::Gt => a > t,
                GateOperator::Ge => a >= t,
                GateOperator::Eq | GateOperator::Ne => unreachable!(),
            })
        }
    }
}

/// Evaluates all gates against a stage's reported metrics.
#[must_use]
pub fn evaluate_gates(metrics: &serde_json::Value, gates: &[QualityGate]) -> GateEvaluation {
    let mut results = Vec::with_capacity(gates.len());
    let mut passed = true;

    for gate in gates {
        let result = match resolve_metric(metrics, &gate.metric) {
            None => GateResult {
                gate: gate.name.clone(),
                metric: gate.metric.clone(),
                passed: false,
                blocking: gate.blocking,
                actual: None,
                threshold: gate.threshold.clone(),
                reason: Some("metric_not_found".to_string()),
            },
            Some(actual) => match compare(actual, gate.operator, &gate.threshold) {
                Ok(ok) => GateResult {
                    gate: gate.name.clone(),
                    metric: gate.metric.clone(),
                    passed: ok,
                    blocking: gate.blocking,
                    actual: Some(actual.clone()),
                    threshold: gate.threshold.clone(),
                    reason: (!ok).then(|| "threshold_not_met".to_string()),
                },
                Err(reason) => GateResult {
                    gate: gate.name.clone(),
                    metric: gate.metric.clone(),
                    passed: false,
                    blocking: gate.blocking,
                    actual: Some(actual.clone()),
                    threshold: gate.threshold.clone(),
                    reason: Some(reason.to_string()),
                },
            },
        };

        if gate.blocking && !result.passed {
            passed = false;
        }
        results.push(result);
    }

    GateEvaluation { passed, results }
}

/// Named default gate sets loaded from policy configuration.
///
/// Stage definitions may reference a policy set by name and override
/// individual gates; overrides merge by gate name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Default gate lists keyed by policy set name.
    #[serde(default)]
    pub defaults: HashMap<String, Vec<QualityGate>>,
}

impl GatePolicy {
    /// Loads a policy from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the effective gates for a policy set, with `overrides`
    /// merged in by gate name. Unknown set names yield the overrides
    /// alone.
    #[must_use]
    pub fn gates_for(&self, set: &str, overrides: &[QualityGate]) -> Vec<QualityGate> {
        let mut merged: Vec<QualityGate> = self.defaults.get(set).cloned().unwrap_or_default();

        for override_gate in overrides {
            if let Some(existing) = merged.iter_mut().find(|g| g.name == override_gate.name) {
                *existing = override_gate.clone();
            } else {
                merged.push(override_gate.clone());
            }
        }

        merged
    }
}
