//! Decodes an incoming notification payload. Transport is either raw
//! JSON or base64-of-JSON; the two are told apart by the first byte.

use crate::error::{ReceiverError, Result};
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

/// The only fields the scheduler needs to route a notification: which
/// topic to schedule, and which message id triggered it. Everything else
/// in the envelope is re-read from the state store once the topic worker
/// picks the message up.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationHeader {
    pub id: String,
    pub queue_key: String,
    pub topic: String,
}

/// Decode a raw notification payload. Returns `None` for a null/empty
/// payload, which callers should log and drop rather than treat as an
/// error.
pub fn decode_notification(payload: &[u8]) -> Result<Option<NotificationHeader>> {
    if payload.is_empty() {
        debug!("empty notification payload, dropping");
        return Ok(None);
    }

    let json_bytes = if payload[0] == b'{' {
        payload.to_vec()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ReceiverError::Decode(e.to_string()))?
    };

    let header: NotificationHeader =
        serde_json::from_slice(&json_bytes).map_err(|e| ReceiverError::Decode(e.to_string()))?;
    Ok(Some(header))
}
