// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-layer envelopes: the messages exchanged with an edge node.
//!
//! Layout is `[version, type, ...fields]`. Requests carry a caller-generated
//! `requestId`; resend traffic is tied to its requesting subscription by a
//! `subId`. Session tokens ride along on authenticated requests and may be
//! null for public streams.

use serde_json::{json, Value};

use crate::error::ClientError;
use crate::protocol::message::{MessageRef, StreamMessage};
use crate::protocol::CONTROL_LAYER_VERSION;

/// A typed control-layer message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // -- Server -> client ------------------------------------------------------
    BroadcastMessage {
        request_id: String,
        message: StreamMessage,
    },
    UnicastMessage {
        sub_id: String,
        message: StreamMessage,
    },
    SubscribeResponse {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    UnsubscribeResponse {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendResponseResending {
        sub_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendResponseResent {
        sub_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendResponseNoResend {
        sub_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ErrorResponse {
        request_id: String,
        error_message: String,
        error_code: String,
    },

    // -- Client -> server ------------------------------------------------------
    PublishRequest {
        request_id: String,
        message: StreamMessage,
        session_token: Option<String>,
    },
    SubscribeRequest {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
        session_token: Option<String>,
    },
    UnsubscribeRequest {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
    },
    ResendLastRequest {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
        sub_id: String,
        number_last: u64,
        session_token: Option<String>,
    },
    ResendFromRequest {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
        sub_id: String,
        from: MessageRef,
        publisher_id: Option<String>,
        session_token: Option<String>,
    },
    ResendRangeRequest {
        request_id: String,
        stream_id: String,
        stream_partition: u32,
        sub_id: String,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
        session_token: Option<String>,
    },
}

impl ControlMessage {
    pub fn type_code(&self) -> u8 {
        match self {
            Self::BroadcastMessage { .. } => 0,
            Self::UnicastMessage { .. } => 1,
            Self::SubscribeResponse { .. } => 2,
            Self::UnsubscribeResponse { .. } => 3,
            Self::ResendResponseResending { .. } => 4,
            Self::ResendResponseResent { .. } => 5,
            Self::ResendResponseNoResend { .. } => 6,
            Self::ErrorResponse { .. } => 7,
            Self::PublishRequest { .. } => 8,
            Self::SubscribeRequest { .. } => 9,
            Self::UnsubscribeRequest { .. } => 10,
            Self::ResendLastRequest { .. } => 11,
            Self::ResendFromRequest { .. } => 12,
            Self::ResendRangeRequest { .. } => 13,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::BroadcastMessage { .. } => "BroadcastMessage",
            Self::UnicastMessage { .. } => "UnicastMessage",
            Self::SubscribeResponse { .. } => "SubscribeResponse",
            Self::UnsubscribeResponse { .. } => "UnsubscribeResponse",
            Self::ResendResponseResending { .. } => "ResendResponseResending",
            Self::ResendResponseResent { .. } => "ResendResponseResent",
            Self::ResendResponseNoResend { .. } => "ResendResponseNoResend",
            Self::ErrorResponse { .. } => "ErrorResponse",
            Self::PublishRequest { .. } => "PublishRequest",
            Self::SubscribeRequest { .. } => "SubscribeRequest",
            Self::UnsubscribeRequest { .. } => "UnsubscribeRequest",
            Self::ResendLastRequest { .. } => "ResendLastRequest",
            Self::ResendFromRequest { .. } => "ResendFromRequest",
            Self::ResendRangeRequest { .. } => "ResendRangeRequest",
        }
    }

    /// Serialise to the wire text frame.
    pub fn encode(&self) -> String {
        let v = u64::from(CONTROL_LAYER_VERSION);
        let t = self.type_code();
        let frame = match self {
            Self::BroadcastMessage { request_id, message } => {
                json!([v, t, request_id, message.to_value()])
            }
            Self::UnicastMessage { sub_id, message } => {
                json!([v, t, sub_id, message.to_value()])
            }
            Self::SubscribeResponse { request_id, stream_id, stream_partition }
            | Self::UnsubscribeResponse { request_id, stream_id, stream_partition } => {
                json!([v, t, request_id, stream_id, stream_partition])
            }
            Self::ResendResponseResending { sub_id, stream_id, stream_partition }
            | Self::ResendResponseResent { sub_id, stream_id, stream_partition }
            | Self::ResendResponseNoResend { sub_id, stream_id, stream_partition } => {
                json!([v, t, sub_id, stream_id, stream_partition])
            }
            Self::ErrorResponse { request_id, error_message, error_code } => {
                json!([v, t, request_id, error_message, error_code])
            }
            Self::PublishRequest { request_id, message, session_token } => {
                json!([v, t, request_id, message.to_value(), session_token])
            }
            Self::SubscribeRequest { request_id, stream_id, stream_partition, session_token } => {
                json!([v, t, request_id, stream_id, stream_partition, session_token])
            }
            Self::UnsubscribeRequest { request_id, stream_id, stream_partition } => {
                json!([v, t, request_id, stream_id, stream_partition])
            }
            Self::ResendLastRequest {
                request_id,
                stream_id,
                stream_partition,
                sub_id,
                number_last,
                session_token,
            } => {
                json!([v, t, request_id, stream_id, stream_partition, sub_id, number_last, session_token])
            }
            Self::ResendFromRequest {
                request_id,
                stream_id,
                stream_partition,
                sub_id,
                from,
                publisher_id,
                session_token,
            } => {
                json!([
                    v,
                    t,
                    request_id,
                    stream_id,
                    stream_partition,
                    sub_id,
                    [from.timestamp, from.sequence_number],
                    publisher_id,
                    session_token
                ])
            }
            Self::ResendRangeRequest {
                request_id,
                stream_id,
                stream_partition,
                sub_id,
                from,
                to,
                publisher_id,
                msg_chain_id,
                session_token,
            } => {
                json!([
                    v,
                    t,
                    request_id,
                    stream_id,
                    stream_partition,
                    sub_id,
                    [from.timestamp, from.sequence_number],
                    [to.timestamp, to.sequence_number],
                    publisher_id,
                    msg_chain_id,
                    session_token
                ])
            }
        };
        frame.to_string()
    }

    /// Parse a wire text frame.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ClientError::InvalidJson { reason: e.to_string() })?;
        let arr = value
            .as_array()
            .ok_or_else(|| ClientError::Protocol("control frame is not an array".to_owned()))?;
        if arr.len() < 3 {
            return Err(ClientError::Protocol(format!(
                "control frame has {} elements, expected at least 3",
                arr.len()
            )));
        }
        let version = u64_elem(&arr[0], "version")?;
        if version != u64::from(CONTROL_LAYER_VERSION) {
            return Err(ClientError::Protocol(format!(
                "unsupported control layer version {version}"
            )));
        }
        let type_code = u64_elem(&arr[1], "type")?;
        let rest = &arr[2..];
        match type_code {
            0 => {
                expect_len(rest, 2, "BroadcastMessage")?;
                Ok(Self::BroadcastMessage {
                    request_id: str_elem(&rest[0], "requestId")?,
                    message: StreamMessage::from_value(&rest[1])?,
                })
            }
            1 => {
                expect_len(rest, 2, "UnicastMessage")?;
                Ok(Self::UnicastMessage {
                    sub_id: str_elem(&rest[0], "subId")?,
                    message: StreamMessage::from_value(&rest[1])?,
                })
            }
            2 | 3 => {
                expect_len(rest, 3, "SubscribeResponse")?;
                let request_id = str_elem(&rest[0], "requestId")?;
                let stream_id = str_elem(&rest[1], "streamId")?;
                let stream_partition = u64_elem(&rest[2], "streamPartition")? as u32;
                if type_code == 2 {
                    Ok(Self::SubscribeResponse { request_id, stream_id, stream_partition })
                } else {
                    Ok(Self::UnsubscribeResponse { request_id, stream_id, stream_partition })
                }
            }
            4 | 5 | 6 => {
                expect_len(rest, 3, "ResendResponse")?;
                let sub_id = str_elem(&rest[0], "subId")?;
                let stream_id = str_elem(&rest[1], "streamId")?;
                let stream_partition = u64_elem(&rest[2], "streamPartition")? as u32;
                Ok(match type_code {
                    4 => Self::ResendResponseResending { sub_id, stream_id, stream_partition },
                    5 => Self::ResendResponseResent { sub_id, stream_id, stream_partition },
                    _ => Self::ResendResponseNoResend { sub_id, stream_id, stream_partition },
                })
            }
            7 => {
                expect_len(rest, 3, "ErrorResponse")?;
                Ok(Self::ErrorResponse {
                    request_id: str_elem(&rest[0], "requestId")?,
                    error_message: str_elem(&rest[1], "errorMessage")?,
                    error_code: str_elem(&rest[2], "errorCode")?,
                })
            }
            8 => {
                expect_len(rest, 3, "PublishRequest")?;
                Ok(Self::PublishRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    message: StreamMessage::from_value(&rest[1])?,
                    session_token: opt_str(&rest[2]),
                })
            }
            9 => {
                expect_len(rest, 4, "SubscribeRequest")?;
                Ok(Self::SubscribeRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    stream_id: str_elem(&rest[1], "streamId")?,
                    stream_partition: u64_elem(&rest[2], "streamPartition")? as u32,
                    session_token: opt_str(&rest[3]),
                })
            }
            10 => {
                expect_len(rest, 3, "UnsubscribeRequest")?;
                Ok(Self::UnsubscribeRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    stream_id: str_elem(&rest[1], "streamId")?,
                    stream_partition: u64_elem(&rest[2], "streamPartition")? as u32,
                })
            }
            11 => {
                expect_len(rest, 6, "ResendLastRequest")?;
                Ok(Self::ResendLastRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    stream_id: str_elem(&rest[1], "streamId")?,
                    stream_partition: u64_elem(&rest[2], "streamPartition")? as u32,
                    sub_id: str_elem(&rest[3], "subId")?,
                    number_last: u64_elem(&rest[4], "numberLast")?,
                    session_token: opt_str(&rest[5]),
                })
            }
            12 => {
                expect_len(rest, 6, "ResendFromRequest")?;
                Ok(Self::ResendFromRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    stream_id: str_elem(&rest[1], "streamId")?,
                    stream_partition: u64_elem(&rest[2], "streamPartition")? as u32,
                    sub_id: str_elem(&rest[3], "subId")?,
                    from: msg_ref_elem(&rest[4])?,
                    publisher_id: opt_str(&rest[5]),
                    session_token: rest.get(6).and_then(|v| v.as_str()).map(str::to_owned),
                })
            }
            13 => {
                expect_len(rest, 8, "ResendRangeRequest")?;
                Ok(Self::ResendRangeRequest {
                    request_id: str_elem(&rest[0], "requestId")?,
                    stream_id: str_elem(&rest[1], "streamId")?,
                    stream_partition: u64_elem(&rest[2], "streamPartition")? as u32,
                    sub_id: str_elem(&rest[3], "subId")?,
                    from: msg_ref_elem(&rest[4])?,
                    to: msg_ref_elem(&rest[5])?,
                    publisher_id: opt_str(&rest[6]),
                    msg_chain_id: opt_str(&rest[7]),
                    session_token: rest.get(8).and_then(|v| v.as_str()).map(str::to_owned),
                })
            }
            other => Err(ClientError::Protocol(format!("unknown control type {other}"))),
        }
    }
}

// -- Element helpers -----------------------------------------------------------

fn expect_len(rest: &[Value], at_least: usize, name: &str) -> Result<(), ClientError> {
    if rest.len() < at_least {
        return Err(ClientError::Protocol(format!(
            "{name} has {} fields, expected at least {at_least}",
            rest.len()
        )));
    }
    Ok(())
}

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

fn msg_ref_elem(v: &Value) -> Result<MessageRef, ClientError> {
    let arr = v
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| ClientError::Protocol("message ref is not a 2-element array".to_owned()))?;
    Ok(MessageRef {
        timestamp: u64_elem(&arr[0], "timestamp")?,
        sequence_number: u64_elem(&arr[1], "sequenceNumber")? as u32,
    })
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
