//! Reported results: raw field maps and the validated record the scheduler reads.

use serde::{Deserialize, Serialize};

use crate::error::ResultError;

/// Raw result fields as produced by a trainable step.
pub type ResultFields = serde_json::Map<String, serde_json::Value>;

/// Field reporting voluntary completion of a trial.
pub const DONE: &str = "done";
/// Per-step count accumulated into [`TIMESTEPS_TOTAL`].
pub const TIMESTEPS_THIS_ITER: &str = "timesteps_this_iter";
pub const TIMESTEPS_TOTAL: &str = "timesteps_total";
pub const TRAINING_ITERATION: &str = "training_iteration";
pub const TIME_THIS_ITER_S: &str = "time_this_iter_s";
pub const TIME_TOTAL_S: &str = "time_total_s";
pub const TRIAL_ID: &str = "trial_id";
pub const TIMESTAMP: &str = "timestamp";

/// Names of the two fields the scheduler ranks on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSchema {
    pub time_attr: String,
    pub reward_attr: String,
}

impl ResultSchema {
    pub fn new(time_attr: impl Into<String>, reward_attr: impl Into<String>) -> Self {
        Self {
            time_attr: time_attr.into(),
            reward_attr: reward_attr.into(),
        }
    }
}

/// A validated result: required progress and reward values plus every other
/// field, carried through unmodified for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub time: f64,
    pub reward: f64,
    pub done: bool,
    pub fields: ResultFields,
}

impl TrialResult {
    /// Validate raw fields against `schema`.
    ///
    /// Missing or non-numeric `time_attr` / `reward_attr` values are errors;
    /// they are never defaulted.
    pub fn from_fields(fields: ResultFields, schema: &ResultSchema) -> Result<Self, ResultError> {
        let time = numeric_field(&fields, &schema.time_attr)?;
        let reward = numeric_field(&fields, &schema.reward_attr)?;
        let done = fields
            .get(DONE)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            time,
            reward,
            done,
            fields,
        })
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Numeric value of an arbitrary field, if present.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(serde_json::Value::as_f64)
    }
}

fn numeric_field(fields: &ResultFields, name: &str) -> Result<f64, ResultError> {
    let value = fields.get(name).ok_or_else(|| ResultError::MissingField {
        field: name.to_string(),
    })?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ResultError::NotNumeric {
            field: name.to_string(),
        })
}
