// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame router: the single writer for the pending-response map, the
//! event-state map, and the event ring.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::Session;
use crate::protocol::{self, Inbound};

enum Route {
    Response { id: i64, method: Option<String> },
    Event { name: String },
    Other,
}

/// Route one decoded frame from the device.
pub(crate) async fn handle_frame(session: &Arc<Session>, frame: Value) {
    let route = match protocol::classify(&frame) {
        Inbound::Response { id, method } => {
            Route::Response { id, method: method.map(str::to_owned) }
        }
        Inbound::Event { name } => Route::Event { name: name.to_owned() },
        Inbound::Other => Route::Other,
    };

    match route {
        Route::Response { id, method } => {
            handle_response(session, id, method.as_deref(), frame).await;
        }
        Route::Event { name } => {
            handle_event(session, &name, frame).await;
        }
        Route::Other => {
            debug!(%frame, "discarding unrecognized frame");
        }
    }
}

async fn handle_response(session: &Arc<Session>, id: i64, method: Option<&str>, frame: Value) {
    match method {
        Some("scope_get_equ_coord") => update_equ_coord(session, &frame).await,
        Some("get_view_state") => update_view_state(session, &frame).await,
        _ => {}
    }
    debug!(id, method, "response");

    session.pending.lock().await.deliver(id, frame);
}

/// Surface the device-reported pointing, removing the below-horizon bias so
/// callers always see the displayed frame.
async fn update_equ_coord(session: &Arc<Session>, frame: &Value) {
    let Some(result) = frame.get("result") else { return };
    let (Some(ra), Some(dec)) = (
        result.get("ra").and_then(Value::as_f64),
        result.get("dec").and_then(Value::as_f64),
    ) else {
        return;
    };

    let offset = *session.dec_offset.read().await;
    let mut pointing = session.pointing.write().await;
    pointing.ra = ra;
    pointing.dec = dec - offset;
}

async fn update_view_state(session: &Arc<Session>, frame: &Value) {
    let Some(view) = frame.get("result").and_then(|r| r.get("View")) else { return };
    *session.view_state.write().await = view.clone();
}

async fn handle_event(session: &Arc<Session>, name: &str, frame: Value) {
    debug!(event = name, "received event");

    session.event_ring.lock().await.push(frame.clone());
    let _ = session.event_bus.send(frame.clone());

    if name == "PlateSolve" {
        update_solve(session, &frame).await;
    }

    let key = protocol::event_state_key(name, &frame);
    session.event_state.write().await.insert(key, frame);

    // Wake everyone blocked in await_event_terminal.
    session.event_seq.send_modify(|seq| *seq = seq.wrapping_add(1));
}

async fn update_solve(session: &Arc<Session>, frame: &Value) {
    let ra_dec = frame
        .get("result")
        .and_then(|r| r.get("ra_dec"))
        .and_then(Value::as_array)
        .and_then(|pair| {
            let ra = pair.first().and_then(Value::as_f64)?;
            let dec = pair.get(1).and_then(Value::as_f64)?;
            Some((ra, dec))
        });

    let mut solve = session.solve.write().await;
    if let Some((ra, dec)) = ra_dec {
        debug!(ra, dec, "plate solve succeeded");
        solve.ra = ra;
        solve.dec = dec;
    } else if frame.get("state").and_then(Value::as_str) == Some("fail") {
        debug!("plate solve failed");
        solve.ra = 0.0;
        solve.dec = 0.0;
    }
}
