// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Message-layer frame: [`StreamMessage`] and its identity types.
//!
//! Wire layout (v31):
//!
//! ```text
//! [version,
//!  [streamId, partition, timestamp, sequenceNumber, publisherId, msgChainId],
//!  prevMsgRef | null,
//!  messageType, contentType, encryptionType,
//!  groupKeyId | null,
//!  content,
//!  newGroupKey | null,
//!  signatureType, signature | null]
//! ```
//!
//! `content` is a string: serialised JSON for plaintext frames, hex
//! ciphertext for encrypted ones. `prevMsgRef` and `newGroupKey` are
//! two-element arrays when present.

use std::fmt;

use serde_json::{json, Value};

use crate::error::ClientError;
use crate::protocol::MESSAGE_LAYER_VERSION;

// -- MessageRef ----------------------------------------------------------------

/// Position of a message within its chain: `(timestamp, sequenceNumber)`.
///
/// The derived `Ord` is lexicographic, which is exactly the total order the
/// chain is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u32,
}

impl MessageRef {
    pub fn new(timestamp: u64, sequence_number: u32) -> Self {
        Self { timestamp, sequence_number }
    }

    /// The ref immediately after this one at the same timestamp.
    pub fn next(&self) -> Self {
        Self { timestamp: self.timestamp, sequence_number: self.sequence_number + 1 }
    }

    fn to_value(self) -> Value {
        json!([self.timestamp, self.sequence_number])
    }

    fn from_value(v: &Value) -> Result<Self, ClientError> {
        let arr = v
            .as_array()
            .ok_or_else(|| ClientError::Protocol("message ref is not an array".to_owned()))?;
        if arr.len() != 2 {
            return Err(ClientError::Protocol(format!(
                "message ref has {} elements, expected 2",
                arr.len()
            )));
        }
        Ok(Self {
            timestamp: u64_elem(&arr[0], "timestamp")?,
            sequence_number: u64_elem(&arr[1], "sequenceNumber")? as u32,
        })
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.sequence_number)
    }
}

// -- MessageId -----------------------------------------------------------------

/// The six identity fields of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub stream_id: String,
    pub stream_partition: u32,
    pub timestamp: u64,
    pub sequence_number: u32,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn msg_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }

    fn to_value(&self) -> Value {
        json!([
            self.stream_id,
            self.stream_partition,
            self.timestamp,
            self.sequence_number,
            self.publisher_id,
            self.msg_chain_id,
        ])
    }

    fn from_value(v: &Value) -> Result<Self, ClientError> {
        let arr = v
            .as_array()
            .ok_or_else(|| ClientError::Protocol("message id is not an array".to_owned()))?;
        if arr.len() != 6 {
            return Err(ClientError::Protocol(format!(
                "message id has {} elements, expected 6",
                arr.len()
            )));
        }
        Ok(Self {
            stream_id: str_elem(&arr[0], "streamId")?,
            stream_partition: u64_elem(&arr[1], "streamPartition")? as u32,
            timestamp: u64_elem(&arr[2], "timestamp")?,
            sequence_number: u64_elem(&arr[3], "sequenceNumber")? as u32,
            publisher_id: str_elem(&arr[4], "publisherId")?,
            msg_chain_id: str_elem(&arr[5], "msgChainId")?,
        })
    }
}

// -- Type enums ----------------------------------------------------------------

/// Kind of payload the frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    StreamMessage = 27,
    GroupKeyRequest = 28,
    GroupKeyResponse = 29,
    GroupKeyAnnounce = 30,
    GroupKeyErrorResponse = 31,
}

impl MessageType {
    fn from_wire(code: u64) -> Result<Self, ClientError> {
        match code {
            27 => Ok(Self::StreamMessage),
            28 => Ok(Self::GroupKeyRequest),
            29 => Ok(Self::GroupKeyResponse),
            30 => Ok(Self::GroupKeyAnnounce),
            31 => Ok(Self::GroupKeyErrorResponse),
            other => Err(ClientError::Protocol(format!("unknown message type {other}"))),
        }
    }
}

/// Encoding of the (decrypted) content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json = 0,
}

impl ContentType {
    fn from_wire(code: u64) -> Result<Self, ClientError> {
        match code {
            0 => Ok(Self::Json),
            other => Err(ClientError::Protocol(format!("unknown content type {other}"))),
        }
    }
}

/// How the content field is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None = 0,
    Aes = 2,
    NewKeyAndAes = 3,
}

impl EncryptionType {
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Self::None)
    }

    fn from_wire(code: u64) -> Result<Self, ClientError> {
        match code {
            0 => Ok(Self::None),
            2 => Ok(Self::Aes),
            3 => Ok(Self::NewKeyAndAes),
            other => Err(ClientError::Protocol(format!("unknown encryption type {other}"))),
        }
    }
}

/// Signature scheme applied to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    None = 0,
    Eth = 2,
}

impl SignatureType {
    fn from_wire(code: u64) -> Result<Self, ClientError> {
        match code {
            0 => Ok(Self::None),
            2 => Ok(Self::Eth),
            other => Err(ClientError::Protocol(format!("unknown signature type {other}"))),
        }
    }
}

// -- Group key announcement ----------------------------------------------------

/// A rotated group key carried inline with a `NEW_KEY_AND_AES` frame.
///
/// `encrypted` is the hex ciphertext of the new key bytes under the key the
/// frame itself is encrypted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedGroupKey {
    pub group_key_id: String,
    pub encrypted: String,
}

// -- StreamMessage -------------------------------------------------------------

/// A single message-layer frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: MessageId,
    /// Ref of the immediately preceding message in the same chain;
    /// `None` only for the chain's first message.
    pub prev_msg_ref: Option<MessageRef>,
    pub message_type: MessageType,
    pub content_type: ContentType,
    pub encryption_type: EncryptionType,
    pub group_key_id: Option<String>,
    /// Serialised JSON when plaintext, hex ciphertext when encrypted.
    pub content: String,
    pub new_group_key: Option<EncryptedGroupKey>,
    pub signature_type: SignatureType,
    pub signature: Option<String>,
}

impl StreamMessage {
    pub fn msg_ref(&self) -> MessageRef {
        self.id.msg_ref()
    }

    /// Parse the content as JSON. Fails on encrypted frames.
    pub fn parse_content(&self) -> Result<Value, ClientError> {
        if self.encryption_type.is_encrypted() {
            return Err(ClientError::Protocol(
                "cannot parse encrypted content as JSON".to_owned(),
            ));
        }
        Ok(serde_json::from_str(&self.content)?)
    }

    /// The exact byte string covered by the ETH signature:
    /// `streamId || timestamp-decimal || publisherAddress-lowercase || content`.
    pub fn signature_payload(&self) -> String {
        format!(
            "{}{}{}{}",
            self.id.stream_id,
            self.id.timestamp,
            self.id.publisher_id.to_lowercase(),
            self.content
        )
    }

    pub fn to_value(&self) -> Value {
        json!([
            MESSAGE_LAYER_VERSION,
            self.id.to_value(),
            self.prev_msg_ref.map(MessageRef::to_value).unwrap_or(Value::Null),
            self.message_type as u8,
            self.content_type as u8,
            self.encryption_type as u8,
            self.group_key_id,
            self.content,
            self.new_group_key
                .as_ref()
                .map(|k| json!([k.group_key_id, k.encrypted]))
                .unwrap_or(Value::Null),
            self.signature_type as u8,
            self.signature,
        ])
    }

    pub fn from_value(v: &Value) -> Result<Self, ClientError> {
        let arr = v
            .as_array()
            .ok_or_else(|| ClientError::Protocol("stream message is not an array".to_owned()))?;
        if arr.len() != 11 {
            return Err(ClientError::Protocol(format!(
                "stream message has {} elements, expected 11",
                arr.len()
            )));
        }
        let version = u64_elem(&arr[0], "version")?;
        if version != u64::from(MESSAGE_LAYER_VERSION) {
            return Err(ClientError::Protocol(format!(
                "unsupported message layer version {version}"
            )));
        }
        let new_group_key = match &arr[8] {
            Value::Null => None,
            v => {
                let pair = v.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    ClientError::Protocol("newGroupKey is not a 2-element array".to_owned())
                })?;
                Some(EncryptedGroupKey {
                    group_key_id: str_elem(&pair[0], "newGroupKey.id")?,
                    encrypted: str_elem(&pair[1], "newGroupKey.encrypted")?,
                })
            }
        };
        Ok(Self {
            id: MessageId::from_value(&arr[1])?,
            prev_msg_ref: opt_ref(&arr[2])?,
            message_type: MessageType::from_wire(u64_elem(&arr[3], "messageType")?)?,
            content_type: ContentType::from_wire(u64_elem(&arr[4], "contentType")?)?,
            encryption_type: EncryptionType::from_wire(u64_elem(&arr[5], "encryptionType")?)?,
            group_key_id: opt_str(&arr[6]),
            content: str_elem(&arr[7], "content")?,
            new_group_key,
            signature_type: SignatureType::from_wire(u64_elem(&arr[9], "signatureType")?)?,
            signature: opt_str(&arr[10]),
        })
    }
}

// -- Element helpers -----------------------------------------------------------

fn str_elem(v: &Value, field: &str) -> Result<String, ClientError> {
    v.as_str()
        .map(str::to_owned)
        .ok_or_else(|| ClientError::Protocol(format!("{field} is not a string")))
}

fn u64_elem(v: &Value, field: &str) -> Result<u64, ClientError> {
    v.as_u64().ok_or_else(|| ClientError::Protocol(format!("{field} is not an integer")))
}

fn opt_str(v: &Value) -> Option<String> {
    v.as_str().map(str::to_owned)
}

fn opt_ref(v: &Value) -> Result<Option<MessageRef>, ClientError> {
    match v {
        Value::Null => Ok(None),
        other => Ok(Some(MessageRef::from_value(other)?)),
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
