//! Wire envelope for notifications
//!
//! A single notification payload carries one `(topic, payload)` pair:
//!
//! ```text
//! <24 lowercase letters>:<base64(topic)>:<payload>
//! ```
//!
//! The random id makes every payload unique, so PostgreSQL never folds two
//! identical notifications sent within one transaction into one.

use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;

/// Length of the random message id
pub const ID_LENGTH: usize = 24;

const SEPARATOR: char = ':';

/// An encoded `(topic, payload)` pair ready to be sent as one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    id: String,
    topic: String,
    payload: String,
    formatted_payload: String,
}

impl MessageEnvelope {
    /// Encode a message, failing when the result exceeds `max_size` bytes.
    pub fn create(
        topic: impl Into<String>,
        payload: impl Into<String>,
        max_size: usize,
    ) -> Result<Self> {
        let topic = topic.into();
        let payload = payload.into();
        let id = generate_id();
        let encoded_topic = STANDARD.encode(topic.as_bytes());

        let size = ID_LENGTH + 1 + encoded_topic.len() + 1 + payload.len();
        if size > max_size {
            return Err(Error::MessageTooLarge {
                size,
                max: max_size,
            });
        }

        let mut formatted_payload = String::with_capacity(size);
        formatted_payload.push_str(&id);
        formatted_payload.push(SEPARATOR);
        formatted_payload.push_str(&encoded_topic);
        formatted_payload.push(SEPARATOR);
        formatted_payload.push_str(&payload);

        Ok(Self {
            id,
            topic,
            payload,
            formatted_payload,
        })
    }

    /// Decode a notification payload into `(topic, payload)`.
    ///
    /// Returns `None` for anything not produced by [`MessageEnvelope::create`].
    pub fn parse(formatted: &str) -> Option<(String, String)> {
        Self::decode(formatted).map(|envelope| (envelope.topic, envelope.payload))
    }

    /// Decode a notification payload, keeping its id.
    pub fn decode(formatted: &str) -> Option<Self> {
        let bytes = formatted.as_bytes();
        if bytes.len() < ID_LENGTH + 2
            || !bytes[..ID_LENGTH].iter().all(u8::is_ascii_lowercase)
            || bytes[ID_LENGTH] != SEPARATOR as u8
        {
            return None;
        }

        let rest = &formatted[ID_LENGTH + 1..];
        let (encoded_topic, payload) = rest.split_once(SEPARATOR)?;
        let topic = STANDARD.decode(encoded_topic).ok()?;
        let topic = String::from_utf8(topic).ok()?;

        Some(Self {
            id: formatted[..ID_LENGTH].to_string(),
            topic,
            payload: payload.to_string(),
            formatted_payload: formatted.to_string(),
        })
    }

    /// Random message id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Application topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Message body
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Full notification payload as sent on the wire
    pub fn formatted_payload(&self) -> &str {
        &self.formatted_payload
    }

    /// Take the wire payload
    pub fn into_formatted_payload(self) -> String {
        self.formatted_payload
    }
}

fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}
