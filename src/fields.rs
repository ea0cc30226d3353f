//! The fixed set of request fields persisted by column- and hash-oriented backends.
//!
//! The relational backend creates one column per entry and the key-value backend uses the
//! kinds to decode hash values. Fields outside this table are only kept by the file backend.

use anyhow::Context as _;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Primary key.
    Id,
    /// Short plain string.
    Text,
    /// Structured value stored as serialized JSON text.
    Json,
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> Field {
    Field { name, kind }
}

pub const FIELDS: &[Field] = &[
    field("id", FieldKind::Id),
    field("version", FieldKind::Integer),
    field("type", FieldKind::Text),
    field("time", FieldKind::Float),
    field("method", FieldKind::Text),
    field("url", FieldKind::Text),
    field("uri", FieldKind::Text),
    field("headers", FieldKind::Json),
    field("controller", FieldKind::Text),
    field("getData", FieldKind::Json),
    field("postData", FieldKind::Json),
    field("requestData", FieldKind::Json),
    field("sessionData", FieldKind::Json),
    field("authenticatedUser", FieldKind::Json),
    field("cookies", FieldKind::Json),
    field("responseTime", FieldKind::Float),
    field("responseStatus", FieldKind::Integer),
    field("responseDuration", FieldKind::Float),
    field("memoryUsage", FieldKind::Float),
    field("middleware", FieldKind::Json),
    field("databaseQueries", FieldKind::Json),
    field("databaseQueriesCount", FieldKind::Integer),
    field("databaseSlowQueries", FieldKind::Integer),
    field("databaseSelects", FieldKind::Integer),
    field("databaseInserts", FieldKind::Integer),
    field("databaseUpdates", FieldKind::Integer),
    field("databaseDeletes", FieldKind::Integer),
    field("databaseOthers", FieldKind::Integer),
    field("databaseDuration", FieldKind::Float),
    field("cacheQueries", FieldKind::Json),
    field("cacheReads", FieldKind::Integer),
    field("cacheHits", FieldKind::Integer),
    field("cacheWrites", FieldKind::Integer),
    field("cacheDeletes", FieldKind::Integer),
    field("cacheTime", FieldKind::Float),
    field("modelsActions", FieldKind::Json),
    field("modelsRetrieved", FieldKind::Json),
    field("modelsCreated", FieldKind::Json),
    field("modelsUpdated", FieldKind::Json),
    field("modelsDeleted", FieldKind::Json),
    field("redisCommands", FieldKind::Json),
    field("queueJobs", FieldKind::Json),
    field("timelineData", FieldKind::Json),
    field("log", FieldKind::Json),
    field("events", FieldKind::Json),
    field("routes", FieldKind::Json),
    field("notifications", FieldKind::Json),
    field("emailsData", FieldKind::Json),
    field("viewsData", FieldKind::Json),
    field("userData", FieldKind::Json),
    field("httpRequests", FieldKind::Json),
    field("subrequests", FieldKind::Json),
    field("xdebug", FieldKind::Json),
    field("commandName", FieldKind::Text),
    field("commandArguments", FieldKind::Json),
    field("commandArgumentsDefaults", FieldKind::Json),
    field("commandOptions", FieldKind::Json),
    field("commandOptionsDefaults", FieldKind::Json),
    field("commandExitCode", FieldKind::Integer),
    field("commandOutput", FieldKind::Json),
    field("jobName", FieldKind::Text),
    field("jobDescription", FieldKind::Text),
    field("jobStatus", FieldKind::Text),
    field("jobPayload", FieldKind::Json),
    field("jobQueue", FieldKind::Text),
    field("jobConnection", FieldKind::Text),
    field("jobOptions", FieldKind::Json),
    field("testName", FieldKind::Text),
    field("testStatus", FieldKind::Text),
    field("testStatusMessage", FieldKind::Text),
    field("testAsserts", FieldKind::Json),
    field("clientMetrics", FieldKind::Json),
    field("webVitals", FieldKind::Json),
    field("parent", FieldKind::Json),
    field("updateToken", FieldKind::Text),
];

pub fn lookup(name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|field| field.name == name)
}

/// Encodes a field value as flat text; `None` for null.
///
/// Structured values are always JSON-encoded. Scalars are written as plain text unless the
/// field is unknown, in which case they are JSON-encoded as well so decoding stays lossless.
pub fn encode_text(kind: Option<FieldKind>, value: &Value) -> Option<String> {
    match (kind, value) {
        (_, Value::Null) => None,
        (Some(FieldKind::Json) | None, value) => Some(value.to_string()),
        (Some(_), Value::String(text)) => Some(text.clone()),
        (Some(_), value) => Some(value.to_string()),
    }
}

/// Reverses [`encode_text`].
pub fn decode_text(kind: Option<FieldKind>, text: &str) -> anyhow::Result<Value> {
    match kind {
        Some(FieldKind::Id | FieldKind::Text) => Ok(Value::String(text.to_owned())),
        Some(FieldKind::Integer) => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<f64>().map(Value::from))
            .with_context(|| format!("decode integer field value `{text}`")),
        Some(FieldKind::Float) => text
            .parse::<f64>()
            .map(Value::from)
            .with_context(|| format!("decode float field value `{text}`")),
        Some(FieldKind::Json) | None => {
            serde_json::from_str(text).with_context(|| format!("decode JSON field value `{text}`"))
        }
    }
}
