use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Where a record originated. Governs outbox capture and pull conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Server,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Local => write!(f, "local"),
            Source::Server => write!(f, "server"),
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Source::Local),
            "server" => Ok(Source::Server),
            _ => Err(format!(
                "Invalid source '{}'. Valid options: local, server",
                s
            )),
        }
    }
}

/// A row in a syncable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: String,
    pub source: Source,
    pub document: Value,
    pub updated_at: DateTime<Utc>,
}

/// Extracts a record id from a document's `_id` (string or number).
pub fn document_id(document: &Value) -> Option<String> {
    match document.get("_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl fmt::Display for SyncableRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Record: {} ({})", self.id, self.source)?;
        writeln!(f, "{}", "=".repeat(30))?;
        writeln!(f, "Updated: {}", self.updated_at.to_rfc3339())?;
        match serde_json::to_string_pretty(&self.document) {
            Ok(pretty) => writeln!(f, "{}", pretty),
            Err(_) => writeln!(f, "{}", self.document),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_from_str() {
        assert_eq!(Source::from_str("local").unwrap(), Source::Local);
        assert_eq!(Source::from_str("SERVER").unwrap(), Source::Server);
        assert!(Source::from_str("remote").is_err());
    }

    #[test]
    fn test_document_id_string_and_number() {
        assert_eq!(document_id(&json!({"_id": "o1"})), Some("o1".to_string()));
        assert_eq!(document_id(&json!({"_id": 42})), Some("42".to_string()));
        assert_eq!(document_id(&json!({"_id": ""})), None);
        assert_eq!(document_id(&json!({"total": 10})), None);
        assert_eq!(document_id(&json!([1, 2])), None);
    }
}
