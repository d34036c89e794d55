//! Launch parameters of a job execution.
//!
//! Parameters are keyed by name (unique per execution) and carry a typed value
//! plus an identifying flag. Identifying parameters contribute to the job
//! instance fingerprint; the others are informational.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Storage type tag of a parameter value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    String,
    Long,
    Double,
    Date,
}

impl ParameterType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "STRING",
            ParameterType::Long => "LONG",
            ParameterType::Double => "DOUBLE",
            ParameterType::Date => "DATE",
        }
    }
}

impl FromStr for ParameterType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STRING" => Ok(ParameterType::String),
            "LONG" => Ok(ParameterType::Long),
            "DOUBLE" => Ok(ParameterType::Double),
            "DATE" => Ok(ParameterType::Date),
            other => Err(DomainError::unknown_variant("parameter type", other)),
        }
    }
}

/// Typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl ParameterValue {
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::Long(_) => ParameterType::Long,
            ParameterValue::Double(_) => ParameterType::Double,
            ParameterValue::Date(_) => ParameterType::Date,
        }
    }

    /// Stable textual form used when fingerprinting.
    pub fn canonical_string(&self) -> String {
        match self {
            ParameterValue::String(s) => s.clone(),
            ParameterValue::Long(v) => v.to_string(),
            ParameterValue::Double(v) => v.to_string(),
            ParameterValue::Date(d) => d.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }
}

/// A single launch parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

impl JobParameter {
    pub fn new(value: ParameterValue, identifying: bool) -> Self {
        Self { value, identifying }
    }

    pub fn parameter_type(&self) -> ParameterType {
        self.value.parameter_type()
    }
}

/// Ordered set of launch parameters, keyed by name.
///
/// Ordering is by key, so two parameter sets built in a different insertion
/// order compare equal and fingerprint identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, key: impl Into<String>, parameter: JobParameter) -> &mut Self {
        self.parameters.insert(key.into(), parameter);
        self
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>, identifying: bool) -> Self {
        self.insert(key, JobParameter::new(ParameterValue::String(value.into()), identifying));
        self
    }

    pub fn with_long(mut self, key: impl Into<String>, value: i64, identifying: bool) -> Self {
        self.insert(key, JobParameter::new(ParameterValue::Long(value), identifying));
        self
    }

    pub fn with_double(mut self, key: impl Into<String>, value: f64, identifying: bool) -> Self {
        self.insert(key, JobParameter::new(ParameterValue::Double(value), identifying));
        self
    }

    pub fn with_date(mut self, key: impl Into<String>, value: DateTime<Utc>, identifying: bool) -> Self {
        self.insert(key, JobParameter::new(ParameterValue::Date(value), identifying));
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Only the identifying parameters, still ordered by key.
    pub fn identifying(&self) -> JobParameters {
        JobParameters {
            parameters: self
                .parameters
                .iter()
                .filter(|(_, p)| p.identifying)
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// Reject values that the document representation cannot carry (non-finite doubles).
    pub fn validate(&self) -> Result<(), DomainError> {
        for (key, parameter) in &self.parameters {
            if let ParameterValue::Double(v) = parameter.value {
                if !v.is_finite() {
                    return Err(DomainError::validation(format!(
                        "parameter '{key}' must be a finite number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, JobParameter)> for JobParameters {
    fn from_iter<I: IntoIterator<Item = (String, JobParameter)>>(iter: I) -> Self {
        Self {
            parameters: iter.into_iter().collect(),
        }
    }
}
