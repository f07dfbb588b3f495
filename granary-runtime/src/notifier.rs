//! Pub/sub seam for dispatching staging files to the load-file worker fleet
//!
//! Each `publish` call hands over one batch of messages and returns a
//! dedicated one-shot receiver that resolves with the worker responses for
//! exactly that batch; no correlation ids are needed on this side.

use async_trait::async_trait;
use granary_core::schema::Schema;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Worker response status for a processed batch
pub const RESPONSE_SUCCEEDED: &str = "succeeded";
pub const RESPONSE_ABORTED: &str = "aborted";

/// Errors that can occur while publishing to the bus
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for notifier operations
pub type NotifierResult<T> = std::result::Result<T, NotifierError>;

/// Work description for one staging file, serialised into the message
/// payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierPayload {
    pub upload_id: i64,
    pub staging_file_id: i64,
    pub staging_file_location: String,
    pub schema: Schema,
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub destination_type: String,
    pub destination_config: serde_json::Value,
    pub unique_load_gen_id: String,
}

/// One message on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierMessage {
    pub payload: serde_json::Value,
}

/// Load-file ids emitted by a worker for one staging file batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadFileIdsPayload {
    #[serde(rename = "LoadFileIDs")]
    pub load_file_ids: Vec<i64>,
}

/// One worker response within a batch reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierResponse {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NotifierResponse {
    /// Parse the emitted load-file ids out of a succeeded response.
    pub fn load_file_ids(&self) -> Option<Vec<i64>> {
        serde_json::from_value::<LoadFileIdsPayload>(self.payload.clone())
            .ok()
            .map(|p| p.load_file_ids)
    }
}

/// Work-dispatch bus the load-file builder publishes through.
///
/// Implementations must bind a dedicated completion channel to every
/// `publish` call; the receiver resolves once with all responses for that
/// batch. Dropping the sender without replying is treated as a failed
/// batch by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(
        &self,
        messages: Vec<NotifierMessage>,
    ) -> NotifierResult<oneshot::Receiver<Vec<NotifierResponse>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_parses_load_file_ids() {
        let response = NotifierResponse {
            status: RESPONSE_SUCCEEDED.to_string(),
            error: None,
            payload: json!({"LoadFileIDs": [3, 1, 2]}),
        };
        assert_eq!(response.load_file_ids(), Some(vec![3, 1, 2]));
    }

    #[test]
    fn test_response_without_ids_is_none() {
        let response = NotifierResponse {
            status: RESPONSE_SUCCEEDED.to_string(),
            error: None,
            payload: json!({}),
        };
        assert_eq!(response.load_file_ids(), None);
    }

    #[test]
    fn test_payload_envelope_field_names() {
        let payload = NotifierPayload {
            upload_id: 7,
            staging_file_id: 11,
            staging_file_location: "s3://bucket/file.json.gz".to_string(),
            schema: Schema::new(),
            source_id: "src".to_string(),
            source_name: "Source".to_string(),
            destination_id: "dst".to_string(),
            destination_name: "Warehouse".to_string(),
            destination_type: "postgres".to_string(),
            destination_config: json!({}),
            unique_load_gen_id: "f3b9".to_string(),
        };
        let value = serde_json::to_value(&payload).expect("payload serialises");
        assert_eq!(value["upload_id"], 7);
        assert_eq!(value["staging_file_location"], "s3://bucket/file.json.gz");
        assert_eq!(value["unique_load_gen_id"], "f3b9");
    }
}
