use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use super::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OutboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxAction::Insert => write!(f, "INSERT"),
            OutboxAction::Update => write!(f, "UPDATE"),
            OutboxAction::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for OutboxAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INSERT" => Ok(OutboxAction::Insert),
            "UPDATE" => Ok(OutboxAction::Update),
            "DELETE" => Ok(OutboxAction::Delete),
            _ => Err(format!(
                "Invalid outbox action '{}'. Valid options: INSERT, UPDATE, DELETE",
                s
            )),
        }
    }
}

/// Lifecycle of an outbox entry. `Pushed` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Pushed,
    /// Excluded from automatic retry until an operator requeues it.
    Quarantined,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Pushed => "pushed",
            OutboxStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "pushed" => Ok(OutboxStatus::Pushed),
            "quarantined" => Ok(OutboxStatus::Quarantined),
            _ => Err(format!("Invalid outbox status '{}'", s)),
        }
    }
}

/// Errors decoding a stored payload back into an [`OutboxPayload`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Malformed {action} payload: {source}")]
    Json {
        action: OutboxAction,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} payload must be a JSON object")]
    NotAnObject(OutboxAction),
}

/// The mutation recorded by an outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxPayload {
    Insert { document: Value },
    Update { filter: Value, update: Value },
    Delete { filter: Value },
}

#[derive(Serialize, Deserialize)]
struct UpdateBody {
    filter: Value,
    update: Value,
}

#[derive(Serialize, Deserialize)]
struct DeleteBody {
    filter: Value,
}

impl OutboxPayload {
    pub fn insert(document: Value) -> Self {
        OutboxPayload::Insert { document }
    }

    /// Update expressed as a `$set` of the changed fields.
    pub fn update(id: &str, changes: Value) -> Self {
        OutboxPayload::Update {
            filter: json!({ "_id": id }),
            update: json!({ "$set": changes }),
        }
    }

    pub fn delete(id: &str) -> Self {
        OutboxPayload::Delete {
            filter: json!({ "_id": id }),
        }
    }

    pub fn action(&self) -> OutboxAction {
        match self {
            OutboxPayload::Insert { .. } => OutboxAction::Insert,
            OutboxPayload::Update { .. } => OutboxAction::Update,
            OutboxPayload::Delete { .. } => OutboxAction::Delete,
        }
    }

    /// Rewrites the payload's key so it addresses `id`.
    pub fn rekey(&mut self, id: &str) {
        match self {
            OutboxPayload::Insert { document } => {
                if let Some(obj) = document.as_object_mut() {
                    obj.insert("_id".to_string(), Value::String(id.to_string()));
                }
            }
            OutboxPayload::Update { filter, .. } | OutboxPayload::Delete { filter } => {
                *filter = json!({ "_id": id });
            }
        }
    }

    /// Serializes the payload for the `payload` column.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboxPayload::Insert { document } => serde_json::to_string(document),
            OutboxPayload::Update { filter, update } => serde_json::to_string(&UpdateBody {
                filter: filter.clone(),
                update: update.clone(),
            }),
            OutboxPayload::Delete { filter } => serde_json::to_string(&DeleteBody {
                filter: filter.clone(),
            }),
        }
    }

    pub fn from_json(action: OutboxAction, raw: &str) -> Result<Self, PayloadError> {
        let json_err = |source| PayloadError::Json { action, source };
        let payload = match action {
            OutboxAction::Insert => OutboxPayload::Insert {
                document: serde_json::from_str(raw).map_err(json_err)?,
            },
            OutboxAction::Update => {
                let body: UpdateBody = serde_json::from_str(raw).map_err(json_err)?;
                OutboxPayload::Update {
                    filter: body.filter,
                    update: body.update,
                }
            }
            OutboxAction::Delete => {
                let body: DeleteBody = serde_json::from_str(raw).map_err(json_err)?;
                OutboxPayload::Delete {
                    filter: body.filter,
                }
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), PayloadError> {
        let ok = match self {
            OutboxPayload::Insert { document } => document.is_object(),
            OutboxPayload::Update { filter, update } => filter.is_object() && update.is_object(),
            OutboxPayload::Delete { filter } => filter.is_object(),
        };
        if ok {
            Ok(())
        } else {
            Err(PayloadError::NotAnObject(self.action()))
        }
    }

    /// Translates into the remote bulk-write vocabulary.
    pub fn to_operation(&self) -> BulkWriteOp {
        match self {
            OutboxPayload::Insert { document } => BulkWriteOp::InsertOne {
                document: document.clone(),
            },
            OutboxPayload::Update { filter, update } => BulkWriteOp::UpdateOne {
                filter: filter.clone(),
                update: update.clone(),
            },
            OutboxPayload::Delete { filter } => BulkWriteOp::DeleteOne {
                filter: filter.clone(),
            },
        }
    }
}

/// One operation of a remote bulk write, e.g. `{"insertOne":{"document":{..}}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BulkWriteOp {
    #[serde(rename = "insertOne")]
    InsertOne { document: Value },
    #[serde(rename = "updateOne")]
    UpdateOne { filter: Value, update: Value },
    #[serde(rename = "deleteOne")]
    DeleteOne { filter: Value },
}

/// A durable unit of pending push work.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub sequence_id: i64,
    pub request_id: Option<String>,
    pub table_name: Table,
    pub record_id: String,
    pub action: OutboxAction,
    /// Raw JSON as stored; decoded lazily so a corrupt row can be quarantined.
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub status: OutboxStatus,
    pub batch_request_id: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn decode_payload(&self) -> Result<OutboxPayload, PayloadError> {
        OutboxPayload::from_json(self.action, &self.payload)
    }
}

impl fmt::Display for OutboxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:<6} {:<8} {:<6} {:<20} {:<36} {}",
            self.sequence_id,
            self.status,
            self.action,
            self.table_name,
            self.record_id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S")
        )?;
        if let Some(err) = &self.last_error {
            write!(f, " ({} attempts, last error: {})", self.attempts, err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_storage_shapes() {
        let insert = OutboxPayload::insert(json!({"_id": "o1", "total": 10}));
        assert_eq!(insert.to_json().unwrap(), r#"{"_id":"o1","total":10}"#);

        let update = OutboxPayload::update("o1", json!({"total": 12}));
        let stored: Value = serde_json::from_str(&update.to_json().unwrap()).unwrap();
        assert_eq!(stored["filter"], json!({"_id": "o1"}));
        assert_eq!(stored["update"], json!({"$set": {"total": 12}}));

        let delete = OutboxPayload::delete("o1");
        assert_eq!(delete.to_json().unwrap(), r#"{"filter":{"_id":"o1"}}"#);
    }

    #[test]
    fn test_payload_decodes_by_action() {
        let raw = r#"{"filter":{"_id":"o1"},"update":{"$set":{"total":3}}}"#;
        let payload = OutboxPayload::from_json(OutboxAction::Update, raw).unwrap();
        assert_eq!(payload, OutboxPayload::update("o1", json!({"total": 3})));
    }

    #[test]
    fn test_payload_decode_rejects_wrong_shape() {
        assert!(OutboxPayload::from_json(OutboxAction::Update, r#"{"filter":{}}"#).is_err());
        assert!(OutboxPayload::from_json(OutboxAction::Insert, "not json").is_err());
        assert!(matches!(
            OutboxPayload::from_json(OutboxAction::Insert, "[1,2]"),
            Err(PayloadError::NotAnObject(OutboxAction::Insert))
        ));
    }

    #[test]
    fn test_operation_wire_format() {
        let op = OutboxPayload::insert(json!({"_id": "o1"})).to_operation();
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"insertOne": {"document": {"_id": "o1"}}})
        );

        let op = OutboxPayload::update("o1", json!({"total": 1})).to_operation();
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"updateOne": {"filter": {"_id": "o1"}, "update": {"$set": {"total": 1}}}})
        );

        let op = OutboxPayload::delete("o1").to_operation();
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"deleteOne": {"filter": {"_id": "o1"}}})
        );
    }

    #[test]
    fn test_rekey_rewrites_document_and_filter() {
        let mut insert = OutboxPayload::insert(json!({"_id": "local-1", "theme": "dark"}));
        insert.rekey("device-9");
        assert_eq!(
            insert,
            OutboxPayload::insert(json!({"_id": "device-9", "theme": "dark"}))
        );

        let mut delete = OutboxPayload::delete("local-1");
        delete.rekey("device-9");
        assert_eq!(delete, OutboxPayload::delete("device-9"));
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(
            OutboxStatus::from_str("PENDING").unwrap(),
            OutboxStatus::Pending
        );
        assert!(OutboxStatus::from_str("sent").is_err());
    }
}
