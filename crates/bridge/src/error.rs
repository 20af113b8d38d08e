// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::{json, Value};
use std::fmt;

/// Error codes carried in the northbound reply envelope.
///
/// Numeric values are part of the protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// A scheduler or long-running operation is already active.
    Busy,
    /// Stop was requested but nothing is running.
    NotRunning,
    /// Stop was requested twice; the first request is still winding down.
    AlreadyStopping,
    /// The request was malformed or referenced an unknown command.
    BadRequest,
}

impl BridgeError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Busy => -1,
            Self::NotRunning => -3,
            Self::AlreadyStopping => -4,
            Self::BadRequest => -1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "BUSY",
            Self::NotRunning => "NOT_RUNNING",
            Self::AlreadyStopping => "ALREADY_STOPPING",
            Self::BadRequest => "BAD_REQUEST",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the northbound reply envelope.
///
/// Every northbound command answers with this shape; `code == 0` is success.
pub fn reply(command: &str, code: i64, result: Value) -> Value {
    if code != 0 {
        tracing::warn!(command, code, %result, "returning non-normal result");
    } else {
        tracing::debug!(command, %result, "returning result");
    }
    json!({
        "jsonrpc": "2.0",
        "TimeStamp": epoch_seconds(),
        "command": command,
        "code": code,
        "result": result,
    })
}

/// Current epoch time in fractional seconds.
pub fn epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
