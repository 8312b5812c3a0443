//! Addressed message envelope shared by every cluster protocol.
//!
//! A [`Message`] pairs a protocol-specific message kind with a set of string
//! headers. The kind is a closed enum per protocol; variants carry whatever
//! payload that kind needs, so a kind without fields is a message without a
//! payload.
//!
//! Addressing is derived from the `to` header:
//! - no `to` header: internal (synthesized locally, e.g. a fired timer)
//! - `to == "*"`: broadcast
//! - anything else: directed at that recipient

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use thiserror::Error;

/// Recipient value addressing every member of the cluster.
pub const BROADCAST: &str = "*";

/// Standard header names.
pub mod headers {
    /// Correlates request/response and timeout/response pairs.
    pub const CONVERSATION_ID: &str = "conversation-id";
    /// Instance that started the conversation.
    pub const CREATED_BY: &str = "created-by";
    /// Sender of the message.
    pub const FROM: &str = "from";
    /// Recipient of the message; absent for internal messages.
    pub const TO: &str = "to";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message has no header named {0:?}")]
    MissingHeader(String),
}

/// A protocol message kind.
///
/// `name` is the stable tag of the kind (e.g. `i_am_alive`), used for
/// logging and for strategies that pick durations per kind.
pub trait MessageType: std::fmt::Debug + Clone + Send + 'static {
    fn name(&self) -> &'static str;
}

/// An addressed, typed unit of communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    #[serde(rename = "type")]
    message_type: T,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl<T: MessageType> Message<T> {
    fn new(message_type: T) -> Self {
        Self {
            message_type,
            headers: HashMap::new(),
        }
    }

    /// Create a message addressed to every member.
    pub fn broadcast(message_type: T) -> Self {
        Self::new(message_type).set_header(headers::TO, BROADCAST)
    }

    /// Create a message addressed to a single recipient.
    pub fn to(message_type: T, recipient: impl Display) -> Self {
        Self::new(message_type).set_header(headers::TO, recipient.to_string())
    }

    /// Create an internal message (no `to` header).
    pub fn internal(message_type: T) -> Self {
        Self::new(message_type)
    }

    /// Create an internal timeout message for a timer armed while handling
    /// `cause`, carrying over its conversation headers.
    pub fn timeout<U>(message_type: T, cause: &Message<U>) -> Self {
        cause.copy_headers_to(
            Self::internal(message_type),
            &[headers::CONVERSATION_ID, headers::CREATED_BY],
        )
    }

    /// Create a response to `request`, addressed to its sender.
    ///
    /// Requests without a `from` header get a broadcast response.
    pub fn respond<U>(message_type: T, request: &Message<U>) -> Self {
        let response = match request.header(headers::FROM) {
            Ok(from) => Self::to(message_type, from),
            Err(_) => Self::broadcast(message_type),
        };
        request.copy_headers_to(response, &[headers::CONVERSATION_ID, headers::CREATED_BY])
    }
}

impl<T> Message<T> {
    /// Set a header, replacing any previous value.
    pub fn set_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Get a header value.
    ///
    /// Fails if the header was never set; use [`Message::has_header`] to
    /// check optional headers.
    pub fn header(&self, name: &str) -> Result<&str, MessageError> {
        self.headers
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| MessageError::MissingHeader(name.to_string()))
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(name)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Copy the named headers that exist on this message onto `other`.
    pub fn copy_headers_to<U>(&self, mut other: Message<U>, names: &[&str]) -> Message<U> {
        for name in names {
            if let Some(value) = self.headers.get(*name) {
                other.headers.insert((*name).to_string(), value.clone());
            }
        }
        other
    }

    pub fn message_type(&self) -> &T {
        &self.message_type
    }

    pub fn into_type(self) -> T {
        self.message_type
    }

    /// The `to` header, if any.
    pub fn recipient(&self) -> Option<&str> {
        self.headers.get(headers::TO).map(String::as_str)
    }

    pub fn is_internal(&self) -> bool {
        self.recipient().is_none()
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient() == Some(BROADCAST)
    }
}
