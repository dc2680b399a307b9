//! Typed workflow state persisted by the state store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::StateError;

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureStatus {
    Defining,
    Decomposing,
    Designing,
    Implementing,
    Testing,
    Reviewing,
    Completed,
    Failed,
}

/// Workflow phase a feature is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Define,
    Decompose,
    Design,
    Implement,
    Test,
    Review,
}

impl FeatureStatus {
    pub const ALL: [FeatureStatus; 8] = [
        FeatureStatus::Defining,
        FeatureStatus::Decomposing,
        FeatureStatus::Designing,
        FeatureStatus::Implementing,
        FeatureStatus::Testing,
        FeatureStatus::Reviewing,
        FeatureStatus::Completed,
        FeatureStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Defining => "defining",
            FeatureStatus::Decomposing => "decomposing",
            FeatureStatus::Designing => "designing",
            FeatureStatus::Implementing => "implementing",
            FeatureStatus::Testing => "testing",
            FeatureStatus::Reviewing => "reviewing",
            FeatureStatus::Completed => "completed",
            FeatureStatus::Failed => "failed",
        }
    }

    /// The phase a feature with this status is normally in. `None` for
    /// `Failed`, which may stop in any phase.
    pub fn expected_phase(&self) -> Option<Phase> {
        match self {
            FeatureStatus::Defining => Some(Phase::Define),
            FeatureStatus::Decomposing => Some(Phase::Decompose),
            FeatureStatus::Designing => Some(Phase::Design),
            FeatureStatus::Implementing => Some(Phase::Implement),
            FeatureStatus::Testing => Some(Phase::Test),
            FeatureStatus::Reviewing | FeatureStatus::Completed => Some(Phase::Review),
            FeatureStatus::Failed => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, FeatureStatus::Completed | FeatureStatus::Failed)
    }
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Define,
        Phase::Decompose,
        Phase::Design,
        Phase::Implement,
        Phase::Test,
        Phase::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Define => "define",
            Phase::Decompose => "decompose",
            Phase::Design => "design",
            Phase::Implement => "implement",
            Phase::Test => "test",
            Phase::Review => "review",
        }
    }

    /// The status a feature working in this phase carries.
    pub fn working_status(&self) -> FeatureStatus {
        match self {
            Phase::Define => FeatureStatus::Defining,
            Phase::Decompose => FeatureStatus::Decomposing,
            Phase::Design => FeatureStatus::Designing,
            Phase::Implement => FeatureStatus::Implementing,
            Phase::Test => FeatureStatus::Testing,
            Phase::Review => FeatureStatus::Reviewing,
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureStatus {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FeatureStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| StateError::InvalidValue {
                field: "status",
                value: value.to_string(),
            })
    }
}

impl FromStr for Phase {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value)
            .ok_or_else(|| StateError::InvalidValue {
                field: "current_phase",
                value: value.to_string(),
            })
    }
}

fn default_workflow_type() -> String {
    "default".to_string()
}

/// Persisted state of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub status: FeatureStatus,
    pub current_phase: Phase,
    pub prompt: String,
    #[serde(default = "default_workflow_type")]
    pub workflow_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<Value>,
}

impl FeatureRecord {
    /// A new feature at the start of the define phase.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            status: FeatureStatus::Defining,
            current_phase: Phase::Define,
            prompt: prompt.into(),
            workflow_type: default_workflow_type(),
            created_at: Utc::now(),
            updated_at: None,
            progress: BTreeMap::new(),
            branch: None,
            completed_at: None,
            recipe_id: None,
            recipe_name: None,
            issues: Vec::new(),
            commits: Vec::new(),
        }
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = workflow_type.into();
        self
    }

    /// Moves the feature into `phase` with the status normally paired with
    /// it, or `status` when given.
    pub fn advance(&mut self, phase: Phase, status: Option<FeatureStatus>) {
        self.current_phase = phase;
        self.status = status.unwrap_or_else(|| phase.working_status());
        if self.status == FeatureStatus::Completed {
            self.completed_at.get_or_insert_with(Utc::now);
        }
    }

    /// Checks the record before it is written. A phase that does not match
    /// the status is only logged.
    pub fn validate(&self, feature_id: &str) -> Result<(), StateError> {
        if self.prompt.trim().is_empty() {
            return Err(StateError::Validation {
                feature: feature_id.to_string(),
                reason: "prompt must be a non-empty string".to_string(),
            });
        }
        if let Some(expected) = self.status.expected_phase() {
            if expected != self.current_phase {
                warn!(
                    feature = feature_id,
                    phase = %self.current_phase,
                    status = %self.status,
                    expected = %expected,
                    "phase may be inconsistent with status"
                );
            }
        }
        Ok(())
    }

    /// Whether anything other than the timestamps differs from `other`.
    pub(crate) fn content_differs(&self, other: &FeatureRecord) -> bool {
        let mut left = self.clone();
        left.created_at = other.created_at;
        left.updated_at = other.updated_at;
        left != *other
    }

    /// Builds a record from loosely shaped JSON, filling in fields that older
    /// state files lack. Enum values are still checked strictly.
    pub fn from_loose_value(feature_id: &str, value: &Value) -> Result<Self, StateError> {
        let mut fields = match value {
            Value::Object(map) => map.clone(),
            other => {
                warn!(feature = feature_id, "feature state is not an object; coercing");
                let mut map = Map::new();
                map.insert("prompt".to_string(), Value::String(render(other)));
                map
            }
        };

        fill_if_blank(&mut fields, "status", || FeatureStatus::Defining.as_str().into());
        fill_if_blank(&mut fields, "current_phase", || Phase::Define.as_str().into());
        fill_if_blank(&mut fields, "workflow_type", || default_workflow_type().into());
        fill_if_blank(&mut fields, "created_at", || Utc::now().to_rfc3339().into());
        fill_if_blank(&mut fields, "prompt", || Value::String(String::new()));
        for key in ["updated_at", "completed_at"] {
            if fields.get(key).is_some_and(is_blank) {
                fields.insert(key.to_string(), Value::Null);
            }
        }

        let progress = match fields.remove("progress") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(key, value)| (key, Value::String(render(&value))))
                .collect(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("raw".to_string(), Value::String(render(&other)));
                map
            }
        };
        fields.insert("progress".to_string(), Value::Object(progress));

        for key in ["issues", "commits"] {
            match fields.remove(key) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    fields.insert(key.to_string(), Value::Array(items));
                }
                Some(single) => {
                    fields.insert(key.to_string(), Value::Array(vec![single]));
                }
            }
        }

        let record: FeatureRecord =
            serde_json::from_value(Value::Object(fields)).map_err(|err| {
                StateError::Validation {
                    feature: feature_id.to_string(),
                    reason: err.to_string(),
                }
            })?;
        record.validate(feature_id)?;
        Ok(record)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn fill_if_blank(fields: &mut Map<String, Value>, key: &str, default: impl FnOnce() -> Value) {
    if fields.get(key).map_or(true, is_blank) {
        fields.insert(key.to_string(), default());
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub features: BTreeMap<String, FeatureRecord>,
    /// Top-level keys this version does not interpret, kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.extra.is_empty()
    }

    pub fn feature(&self, id: &str) -> Option<&FeatureRecord> {
        self.features.get(id)
    }

    pub fn feature_mut(&mut self, id: &str) -> Option<&mut FeatureRecord> {
        self.features.get_mut(id)
    }

    /// Inserts or replaces a feature, returning the previous record.
    pub fn upsert(&mut self, id: impl Into<String>, record: FeatureRecord) -> Option<FeatureRecord> {
        self.features.insert(id.into(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<FeatureRecord> {
        self.features.remove(id)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        for (id, record) in &self.features {
            record.validate(id)?;
        }
        Ok(())
    }
}
