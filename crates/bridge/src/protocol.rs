// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol for the device socket: line-delimited UTF-8 JSON frames
//! terminated by CRLF.
//!
//! Two inbound message kinds share the socket:
//! - Responses carry `jsonrpc` and correlate to a request `id`.
//! - Events carry `Event` and replace the latest-seen state for their name.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame terminator on the device socket.
pub const FRAME_END: &[u8] = b"\r\n";

/// Receive chunk size. Single frames can exceed 50 KiB (comet catalogs),
/// so reads must tolerate frames up to ~64 KiB.
pub const READ_CHUNK: usize = 64 * 1024;

/// Request id used by the heartbeat probe. Responses to this id are never
/// awaited; they land in the pending map and age out.
pub const HEARTBEAT_ID: i64 = 420;

/// An outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { id, method: method.into(), params }
    }

    /// Serialize to a CRLF-terminated frame ready for the socket.
    pub fn to_frame(&self) -> String {
        let mut text = serde_json::to_string(self).unwrap_or_default();
        text.push_str("\r\n");
        text
    }
}

/// Split complete CRLF-terminated frames out of the receive buffer and decode
/// each as JSON.
///
/// Partial trailing bytes stay in the buffer for the next read. A frame that
/// fails to decode is consumed and ends the current batch; bytes after it are
/// preserved and picked up by the next call.
pub fn split_frames(buf: &mut BytesMut) -> Vec<Value> {
    let mut frames = Vec::new();

    while let Some(pos) = find_frame_end(buf) {
        let frame = buf.split_to(pos + FRAME_END.len());
        let payload = &frame[..pos];
        if payload.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => frames.push(value),
            Err(e) => {
                tracing::warn!(err = %e, len = payload.len(), "malformed frame, ending batch");
                break;
            }
        }
    }

    frames
}

fn find_frame_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(FRAME_END.len()).position(|w| w == FRAME_END)
}

/// Inbound message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A JSON-RPC response correlated by `id`.
    Response { id: i64, method: Option<&'a str> },
    /// A device-originated event.
    Event { name: &'a str },
    /// Anything else; logged and discarded.
    Other,
}

/// Classify a decoded frame without taking ownership of it.
pub fn classify(frame: &Value) -> Inbound<'_> {
    if frame.get("jsonrpc").is_some() {
        let id = frame.get("id").and_then(Value::as_i64).unwrap_or(-1);
        let method = frame.get("method").and_then(Value::as_str);
        return Inbound::Response { id, method };
    }
    if let Some(name) = frame.get("Event").and_then(Value::as_str) {
        return Inbound::Event { name };
    }
    Inbound::Other
}

/// Key under which an event is stored in the latest-state map.
///
/// `PiStatus` events multiplex several telemetry shapes under one name and are
/// demultiplexed by payload so one shape does not clobber another.
pub fn event_state_key(name: &str, payload: &Value) -> String {
    if name != "PiStatus" {
        return name.to_owned();
    }
    if payload.get("temp").is_some() {
        "PiStatus_temperature".to_owned()
    } else if payload.get("battery_capacity").is_some() || payload.get("charger_status").is_some() {
        "PiStatus_battery".to_owned()
    } else {
        "PiStatus_other".to_owned()
    }
}

/// True if a response payload reports a device-side failure.
pub fn is_error_response(response: &Value) -> bool {
    if response.get("error").is_some() {
        return true;
    }
    matches!(response.get("code").and_then(Value::as_i64), Some(code) if code != 0)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
