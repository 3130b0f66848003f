//! One-shot connectivity check against a provisioned database.

use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::admin::{AdminError, RestTransport};
use crate::targets;

pub const SMOKE_QUERY: &str = "SELECT 1 AS test";

#[derive(Debug, Error)]
pub enum SmokeError {
    #[error(
        "SPANNER_INSTANCE_ID, SPANNER_PROJECT_ID, and SPANNER_DATABASE_ID must be set (missing: {0})"
    )]
    MissingIdentifiers(String),
    #[error("failed to create session on {database}: {source}")]
    Session {
        database: String,
        #[source]
        source: AdminError,
    },
    #[error("failed to execute query: {0}")]
    Query(#[source] AdminError),
    #[error("failed to parse result: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmokeTarget {
    pub project: String,
    pub instance: String,
    pub database: String,
}

impl SmokeTarget {
    pub fn new(project: &str, instance: &str, database: &str) -> Result<Self, SmokeError> {
        let missing = [
            ("project", project),
            ("instance", instance),
            ("database", database),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(SmokeError::MissingIdentifiers(missing.join(", ")));
        }
        Ok(Self {
            project: project.trim().to_string(),
            instance: instance.trim().to_string(),
            database: database.trim().to_string(),
        })
    }

    pub fn database_path(&self) -> String {
        targets::database_path(&self.project, &self.instance, &self.database)
    }
}

/// Opens a session, runs [`SMOKE_QUERY`] and returns the scalar it produced.
pub async fn run(
    transport: &RestTransport,
    target: &SmokeTarget,
    cancel: &CancellationToken,
) -> Result<i64, SmokeError> {
    let database = target.database_path();
    let session = transport
        .post_json(&format!("{database}/sessions"), &json!({}), cancel)
        .await
        .map_err(|source| SmokeError::Session {
            database: database.clone(),
            source,
        })?;
    let session_name = session
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SmokeError::Parse("session response has no name".to_string()))?
        .to_string();
    tracing::debug!(session = %session_name, "session created");

    let result = transport
        .post_json(
            &format!("{session_name}:executeSql"),
            &json!({ "sql": SMOKE_QUERY }),
            cancel,
        )
        .await;

    if let Err(err) = transport.delete(&session_name, cancel).await {
        tracing::debug!(session = %session_name, error = %err, "unable to delete session");
    }

    let value = first_scalar(&result.map_err(SmokeError::Query)?)?;
    if value != 1 {
        return Err(SmokeError::Parse(format!("expected 1, got {value}")));
    }
    Ok(value)
}

/// INT64 values arrive as JSON strings; plain numbers are accepted too.
fn first_scalar(result: &Value) -> Result<i64, SmokeError> {
    let cell = result
        .get("rows")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .and_then(|row| row.first())
        .ok_or_else(|| SmokeError::Parse("query returned no rows".to_string()))?;
    match cell {
        Value::String(text) => text
            .parse()
            .map_err(|err| SmokeError::Parse(format!("'{text}' is not an INT64: {err}"))),
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| SmokeError::Parse(format!("{number} is not an INT64"))),
        other => Err(SmokeError::Parse(format!("unexpected cell {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_all_identifiers() {
        let err = SmokeTarget::new("p", " ", "").unwrap_err();
        assert!(matches!(err, SmokeError::MissingIdentifiers(ref missing) if missing == "instance, database"));
        let target = SmokeTarget::new("p", "i", "d").unwrap();
        assert_eq!(target.database_path(), "projects/p/instances/i/databases/d");
    }

    #[test]
    fn reads_int64_cells_in_both_encodings() {
        assert_eq!(first_scalar(&json!({"rows": [["1"]]})).unwrap(), 1);
        assert_eq!(first_scalar(&json!({"rows": [[7]]})).unwrap(), 7);
        assert!(first_scalar(&json!({"rows": []})).is_err());
        assert!(first_scalar(&json!({"rows": [["x"]]})).is_err());
    }
}
