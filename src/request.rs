use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// What kind of execution a [`Request`] describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    #[default]
    Request,
    Command,
    QueueJob,
    Test,
}

/// How the status field of a request type is compared by searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Number,
    Exact,
}

/// Which record fields play the role of "name" and "status" for a request type.
///
/// Every backend (index lines, SQL conditions, key-value scans) resolves these two roles
/// through [`RequestType::fields`], so the mapping lives in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFields {
    pub name: &'static str,
    pub status: &'static str,
    pub status_kind: StatusKind,
}

const REQUEST_FIELDS: TypeFields = TypeFields {
    name: "uri",
    status: "responseStatus",
    status_kind: StatusKind::Number,
};
const COMMAND_FIELDS: TypeFields = TypeFields {
    name: "commandName",
    status: "commandExitCode",
    status_kind: StatusKind::Number,
};
const QUEUE_JOB_FIELDS: TypeFields = TypeFields {
    name: "jobName",
    status: "jobStatus",
    status_kind: StatusKind::Exact,
};
const TEST_FIELDS: TypeFields = TypeFields {
    name: "testName",
    status: "testStatus",
    status_kind: StatusKind::Exact,
};

impl RequestType {
    pub const ALL: [RequestType; 4] = [
        RequestType::Request,
        RequestType::Command,
        RequestType::QueueJob,
        RequestType::Test,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Command => "command",
            Self::QueueJob => "queue-job",
            Self::Test => "test",
        }
    }

    pub fn fields(self) -> &'static TypeFields {
        match self {
            Self::Request => &REQUEST_FIELDS,
            Self::Command => &COMMAND_FIELDS,
            Self::QueueJob => &QUEUE_JOB_FIELDS,
            Self::Test => &TEST_FIELDS,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow::anyhow!("unknown request type `{s}`"))
    }
}

/// One profiled execution: an HTTP request, console command, queue job or test run.
///
/// The typed fields are the ones storage backends index and search on. Everything else a
/// collector attaches (headers, queries, logs, timeline events, ...) lives in `data` and is
/// opaque to storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: RequestType,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// The lightweight projection of a [`Request`] kept in indexes and matched by searches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSummary {
    pub id: String,
    pub time: f64,
    pub method: Option<String>,
    pub name: Option<String>,
    pub controller: Option<String>,
    pub status: Option<String>,
    pub duration: Option<f64>,
    pub kind: RequestType,
}

impl Request {
    /// Creates an empty record with a fresh id and the current time.
    pub fn new(kind: RequestType) -> Self {
        Self {
            id: generate_id(),
            kind,
            time: now_unix_secs(),
            ..Self::default()
        }
    }

    pub fn with_id(id: impl Into<String>, kind: RequestType, time: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            time,
            ..Self::default()
        }
    }

    /// The type-dependent "name": uri, command name, job name or test name.
    pub fn name(&self) -> Option<&str> {
        match self.kind {
            RequestType::Request => self.uri.as_deref(),
            RequestType::Command => self.command_name.as_deref(),
            RequestType::QueueJob => self.job_name.as_deref(),
            RequestType::Test => self.test_name.as_deref(),
        }
    }

    /// The type-dependent status rendered as text.
    pub fn status(&self) -> Option<String> {
        match self.kind {
            RequestType::Request => self.response_status.map(|status| status.to_string()),
            RequestType::Command => self.command_exit_code.map(|code| code.to_string()),
            RequestType::QueueJob => self.job_status.clone(),
            RequestType::Test => self.test_status.clone(),
        }
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            id: self.id.clone(),
            time: self.time,
            method: self.method.clone(),
            name: self.name().map(ToOwned::to_owned),
            controller: self.controller.clone(),
            status: self.status(),
            duration: self.response_duration,
            kind: self.kind,
        }
    }

    /// Field mapping with null and empty values removed.
    ///
    /// Non-finite floats serialize as null and are dropped here, so a record always
    /// produces some output even when parts of it cannot be represented.
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(id = %self.id, error = %err, "request serialization degraded");
                self.degraded_value()
            }
        };
        match value {
            Value::Object(map) => map
                .into_iter()
                .filter(|(_, value)| !is_empty_value(value))
                .collect(),
            _ => Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    pub fn from_map(map: Map<String, Value>) -> anyhow::Result<Self> {
        serde_json::from_value(Value::Object(map)).context("deserialize request fields")
    }

    fn degraded_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_owned(), Value::from(self.id.clone()));
        map.insert("type".to_owned(), Value::from(self.kind.as_str()));
        map.insert("time".to_owned(), Value::from(self.time));
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Generates a time-ordered id; string order matches creation order across milliseconds.
pub fn generate_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or_default())
}
