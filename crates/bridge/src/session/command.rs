// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command API: the three request primitives every control loop is built on.
//!
//! - `call_async`: send, return the request id.
//! - `call_sync`: send, block until the correlated response arrives (hard
//!   10 s ceiling, synthetic error payload on timeout).
//! - `await_event_terminal`: block until a named event reaches a terminal
//!   state (`complete` or `fail`).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::Session;
use crate::protocol::RpcRequest;

/// Synthetic result used when a sync call outlives its wait ceiling.
const TIMEOUT_RESULT: &str = "Error: Exceeded alloted wait time for result";

/// Wall-clock ceiling for a synchronous call.
const SYNC_WAIT: Duration = Duration::from_secs(10);
/// After this long, the wait is logged as slow.
const SYNC_SLOW: Duration = Duration::from_secs(2);

impl Session {
    /// Allocate the next request id. Strictly increasing per session.
    pub fn next_id(&self) -> i64 {
        self.cmdid.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request without waiting for its response.
    pub async fn call_async(&self, method: &str, params: Option<Value>) -> i64 {
        let req = RpcRequest::new(self.next_id(), method, params);
        tracing::debug!(id = req.id, method, "sending");
        self.transport.send_nowait(req.to_frame()).await;
        req.id
    }

    /// Send a request and wait for the correlated response.
    ///
    /// `pi_shutdown` and `pi_reboot` are special-cased: the scope must park
    /// before power-off, so a detached task runs the park-then-send sequence
    /// and the caller gets an immediate synthetic acknowledgement.
    pub async fn call_sync(self: &Arc<Self>, method: &str, params: Option<Value>) -> Value {
        if method == "pi_shutdown" || method == "pi_reboot" {
            let session = Arc::clone(self);
            let method_owned = method.to_owned();
            tokio::spawn(async move {
                shutdown_then_park(session, method_owned, params).await;
            });
            return json!({
                "method": method,
                "result": "Sent command async for these types of commands.",
            });
        }

        let req = RpcRequest::new(self.next_id(), method, params);
        self.call_sync_request(req).await
    }

    /// Send a prebuilt request and wait for its response.
    pub(crate) async fn call_sync_request(self: &Arc<Self>, req: RpcRequest) -> Value {
        let id = req.id;
        let rx = {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.pending.lock().await.waiters.insert(id, tx);
            rx
        };

        tracing::debug!(id, method = %req.method, "sending");
        if !self.transport.send(req.to_frame()).await {
            self.pending.lock().await.waiters.remove(&id);
            warn!(id, method = %req.method, "send failed, returning synthetic error");
            return timeout_payload(&req);
        }

        let timeout = tokio::time::sleep(SYNC_WAIT);
        tokio::pin!(timeout);
        let slow = tokio::time::sleep(SYNC_SLOW);
        tokio::pin!(slow);
        let mut rx = rx;
        let mut warned = false;

        loop {
            tokio::select! {
                resp = &mut rx => {
                    return resp.unwrap_or_else(|_| timeout_payload(&req));
                }
                _ = &mut slow, if !warned => {
                    warned = true;
                    warn!(id, method = %req.method, "SLOW message response");
                }
                _ = &mut timeout => {
                    self.pending.lock().await.waiters.remove(&id);
                    error!(id, method = %req.method, "failed to wait for message response");
                    return timeout_payload(&req);
                }
            }
        }
    }

    /// Block until the named event reaches a terminal state.
    ///
    /// Returns true iff the terminal state is `complete`. `goto_target` is
    /// virtual: the goto controller picks `AutoGoto` or `ScopeGoto` based on
    /// the active goto mode, so its predicates are consulted instead.
    pub async fn await_event_terminal(self: &Arc<Self>, name: &str) -> bool {
        if name == "goto_target" {
            return self.await_goto_terminal().await;
        }

        {
            let mut state = self.event_state.write().await;
            state.entry(name.to_owned()).or_insert_with(|| json!({"state": "stopped"}));
        }

        let mut seq = self.event_seq.subscribe();
        loop {
            match self.event_terminal_state(name).await {
                Some(true) => return true,
                Some(false) => return false,
                None => {}
            }
            if !self.wait_event_change(&mut seq).await {
                return false;
            }
        }
    }

    async fn await_goto_terminal(self: &Arc<Self>) -> bool {
        self.mark_goto_start().await;
        let mut seq = self.event_seq.subscribe();
        while self.is_goto().await {
            if !self.wait_event_change(&mut seq).await {
                return false;
            }
        }
        self.is_goto_completed_ok().await
    }

    /// Some(true) for complete, Some(false) for fail, None otherwise.
    async fn event_terminal_state(&self, name: &str) -> Option<bool> {
        let state = self.event_state.read().await;
        let value = state.get(name)?;
        match value.get("state").and_then(Value::as_str) {
            Some("complete") => Some(true),
            Some("fail") => Some(false),
            _ => None,
        }
    }

    /// Wait for the next stored event, a fallback tick, or cancellation.
    /// Returns false when the session is shutting down.
    async fn wait_event_change(&self, seq: &mut tokio::sync::watch::Receiver<u64>) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = seq.changed() => true,
            _ = tokio::time::sleep(self.config.ticks(1)) => true,
        }
    }
}

/// Park the scope, wait for it to reach home, then fire the power command.
///
/// Boxed rather than a plain `async fn`: it is spawned from inside
/// `call_sync`, and it calls back into `call_sync`-reachable methods
/// (`play_sound`), which makes the opaque future type self-referential for
/// auto-trait (`Send`) inference. Naming the return type breaks that cycle.
fn shutdown_then_park(
    session: Arc<Session>,
    method: String,
    params: Option<Value>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        session.play_sound(13).await;
        if let Err(e) = session.reset_dec_offset().await {
            warn!(err = %e, "failed to reset dec offset before shutdown");
        }

        let response = session.call_sync("scope_park", None).await;
        info!(%response, "parking before shutdown");

        session
            .event_state
            .write()
            .await
            .insert("ScopeHome".to_owned(), json!({"state": "working"}));
        let parked = session.await_event_terminal("ScopeHome").await;
        info!(parked, "parking result");

        info!(method = %method, "sending power command");
        session.call_async(&method, params).await;
    })
}

fn timeout_payload(req: &RpcRequest) -> Value {
    json!({
        "id": req.id,
        "method": req.method.clone(),
        "params": req.params.clone(),
        "result": TIMEOUT_RESULT,
    })
}
