//! Correlation envelope wrapping every request and response on the data connection.

use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// Request or response. A request has an empty `response_id`; its response echoes
/// `request_id` and carries a fresh `response_id` plus the result in `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    pub response_id: String,
    pub from_client_id: String,
    pub method: String,
    /// Sender clock, milliseconds.
    pub sent_at: u64,
    /// Receiver clock, milliseconds. Zero on requests.
    pub received_at: u64,
    pub elapsed: u64,
    pub data: Option<Message>,
}

/// Fresh correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Envelope {
    pub fn request(from_client_id: &str, method: &str, data: Option<Message>, now: u64) -> Self {
        Self {
            request_id: new_id(),
            response_id: String::new(),
            from_client_id: from_client_id.to_owned(),
            method: method.to_owned(),
            sent_at: now,
            received_at: 0,
            elapsed: 0,
            data,
        }
    }

    /// Build the response to this request, reusing its `request_id`.
    pub fn response(&self, data: Option<Message>, now: u64) -> Self {
        Self {
            request_id: self.request_id.clone(),
            response_id: new_id(),
            from_client_id: self.from_client_id.clone(),
            method: self.method.clone(),
            sent_at: self.sent_at,
            received_at: now,
            elapsed: now.saturating_sub(self.sent_at),
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        !self.response_id.is_empty()
    }
}
