//! Typed view of the `/history/{prompt_id}` response.
//!
//! ComfyUI answers with an object keyed by prompt id. The entry only
//! appears once execution has finished (or failed):
//!
//! ```json
//! {
//!   "abc-123": {
//!     "outputs": { "9": { "images": [{ "filename": "img_00001_.png" }] } },
//!     "status": {
//!       "status_str": "success",
//!       "completed": true,
//!       "messages": [["execution_start", { "prompt_id": "abc-123" }]]
//!     }
//!   }
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;

/// Where a submitted prompt stands.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    /// Not in history yet, or no outputs recorded.
    Pending,
    /// Finished; carries the `outputs` object.
    Completed(Value),
    /// The server reported an execution error.
    Failed(String),
}

/// One prompt's history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[message_type, payload]` pairs in emission order.
    #[serde(default)]
    pub messages: Vec<(String, Value)>,
}

/// Payload of an `execution_error` status message.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl ErrorData {
    pub fn describe(&self) -> String {
        let node = if self.node_type.is_empty() {
            format!("node {}", self.node_id)
        } else {
            format!("node {} ({})", self.node_id, self.node_type)
        };
        format!(
            "{node} raised {}: {}",
            self.exception_type,
            self.exception_message.trim()
        )
    }
}

fn string_or_number<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some("error")
    }

    /// The first `execution_error` payload, if any.
    pub fn error(&self) -> Option<ErrorData> {
        self.messages
            .iter()
            .find(|(kind, _)| kind == "execution_error")
            .and_then(|(_, payload)| serde_json::from_value(payload.clone()).ok())
    }
}

/// Interpret a `/history/{prompt_id}` body.
///
/// Returns `Err` when the entry for `prompt_id` exists but does not have
/// the expected shape.
pub fn parse_history(prompt_id: &str, body: &Value) -> Result<PollStatus, serde_json::Error> {
    let Some(raw) = body.get(prompt_id) else {
        return Ok(PollStatus::Pending);
    };
    let entry: HistoryEntry = serde_json::from_value(raw.clone())?;

    if let Some(status) = entry.status.as_ref().filter(|s| s.is_error()) {
        let message = status
            .error()
            .map(|e| e.describe())
            .unwrap_or_else(|| "Execution failed without error details".to_string());
        return Ok(PollStatus::Failed(message));
    }

    Ok(match entry.outputs {
        Some(outputs) => PollStatus::Completed(outputs),
        None => PollStatus::Pending,
    })
}
