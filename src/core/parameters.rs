use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::BatchError;

/// A typed job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl ParameterValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "string",
            ParameterValue::Long(_) => "long",
            ParameterValue::Double(_) => "double",
            ParameterValue::Date(_) => "date",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(value) => write!(f, "{}", value),
            ParameterValue::Long(value) => write!(f, "{}", value),
            ParameterValue::Double(value) => write!(f, "{}", value),
            ParameterValue::Date(value) => write!(f, "{}", value.to_rfc3339()),
        }
    }
}

/// A job parameter: a typed value plus whether it takes part in the
/// job instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

impl JobParameter {
    /// Creates an identifying parameter.
    pub fn new(value: ParameterValue) -> Self {
        Self {
            value,
            identifying: true,
        }
    }

    /// Excludes this parameter from the job instance identity.
    pub fn non_identifying(mut self) -> Self {
        self.identifying = false;
        self
    }
}

/// The parameters a job is launched with.
///
/// Together with the job name, the identifying parameters define the job
/// instance: two launches with the same name and the same identifying
/// parameters target the same instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key).map(|parameter| &parameter.value) {
            Some(ParameterValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key).map(|parameter| &parameter.value) {
            Some(ParameterValue::Long(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(key).map(|parameter| &parameter.value) {
            Some(ParameterValue::Double(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key).map(|parameter| &parameter.value) {
            Some(ParameterValue::Date(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Readable `key=value(type);` rendering of the identifying parameters,
    /// sorted by key. Meant for logs; it is not injective, see
    /// [`JobParameters::instance_key`] for the identity.
    pub fn identifying_key(&self) -> String {
        self.parameters
            .iter()
            .filter(|(_, parameter)| parameter.identifying)
            .map(|(key, parameter)| {
                format!(
                    "{}={}({});",
                    key,
                    parameter.value,
                    parameter.value.type_name()
                )
            })
            .collect()
    }

    /// Deterministic identity of the job instance for `job_name` and these
    /// parameters.
    ///
    /// Every field is length-prefixed before hashing, so no choice of names
    /// or values can make two different parameter sets encode alike.
    pub fn instance_key(&self, job_name: &str) -> Uuid {
        let mut identity = String::new();
        push_field(&mut identity, job_name);
        for (key, parameter) in &self.parameters {
            if parameter.identifying {
                push_field(&mut identity, key);
                push_field(&mut identity, parameter.value.type_name());
                push_field(&mut identity, &parameter.value.to_string());
            }
        }
        Uuid::new_v5(&Uuid::NAMESPACE_OID, identity.as_bytes())
    }

    pub fn to_json(&self) -> Result<String, BatchError> {
        serde_json::to_string(self).map_err(|error| BatchError::Repository(error.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, BatchError> {
        serde_json::from_str(json).map_err(|error| BatchError::Repository(error.to_string()))
    }
}

fn push_field(identity: &mut String, field: &str) {
    identity.push_str(&field.len().to_string());
    identity.push(':');
    identity.push_str(field);
}

/// Builder for [`JobParameters`].
///
/// ```
/// use batch_core::core::parameters::JobParametersBuilder;
///
/// let parameters = JobParametersBuilder::new()
///     .add_long("season", 2023)
///     .add_string("league", "NFL")
///     .build();
///
/// assert_eq!(parameters.get_long("season"), Some(2023));
/// ```
#[derive(Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a copy of existing parameters.
    pub fn from_parameters(parameters: &JobParameters) -> Self {
        Self {
            parameters: parameters.parameters.clone(),
        }
    }

    pub fn add_string(self, key: &str, value: &str) -> Self {
        self.add_parameter(
            key,
            JobParameter::new(ParameterValue::String(value.to_string())),
        )
    }

    pub fn add_long(self, key: &str, value: i64) -> Self {
        self.add_parameter(key, JobParameter::new(ParameterValue::Long(value)))
    }

    pub fn add_double(self, key: &str, value: f64) -> Self {
        self.add_parameter(key, JobParameter::new(ParameterValue::Double(value)))
    }

    pub fn add_date(self, key: &str, value: DateTime<Utc>) -> Self {
        self.add_parameter(key, JobParameter::new(ParameterValue::Date(value)))
    }

    pub fn add_parameter(mut self, key: &str, parameter: JobParameter) -> Self {
        self.parameters.insert(key.to_string(), parameter);
        self
    }

    pub fn build(self) -> JobParameters {
        JobParameters {
            parameters: self.parameters,
        }
    }
}

/// Validates job parameters before a launch touches the repository.
///
/// Implementations must be free of side effects: the validator runs once per
/// launch attempt and its failure means nothing was persisted.
pub trait JobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError>;
}

impl<F> JobParametersValidator for F
where
    F: Fn(&JobParameters) -> Result<(), BatchError>,
{
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        self(parameters)
    }
}

/// Checks required keys are present and, when optional keys are declared,
/// that no other key is.
#[derive(Default)]
pub struct DefaultJobParametersValidator {
    required_keys: Vec<String>,
    optional_keys: Vec<String>,
}

impl DefaultJobParametersValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required_key(mut self, key: &str) -> Self {
        self.required_keys.push(key.to_string());
        self
    }

    pub fn optional_key(mut self, key: &str) -> Self {
        self.optional_keys.push(key.to_string());
        self
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<(), BatchError> {
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .map(String::as_str)
            .filter(|key| !parameters.contains_key(key))
            .collect();

        if !missing.is_empty() {
            return Err(BatchError::InvalidParameters(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        if !self.optional_keys.is_empty() {
            let unexpected: Vec<&str> = parameters
                .keys()
                .filter(|key| {
                    !self.required_keys.iter().any(|required| required == *key)
                        && !self.optional_keys.iter().any(|optional| optional == *key)
                })
                .collect();

            if !unexpected.is_empty() {
                return Err(BatchError::InvalidParameters(format!(
                    "unexpected keys: {}",
                    unexpected.join(", ")
                )));
            }
        }

        Ok(())
    }
}
