// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic liveness probe.
//!
//! Every three ticks, while the transport is watching, send a
//! `scope_get_equ_coord` with the sentinel id. The probe doubles as the
//! pointing refresh; its response is never awaited. While disconnected the
//! transport loop is already reconnecting, so the probe is skipped.

use std::sync::Arc;

use crate::protocol::{RpcRequest, HEARTBEAT_ID};

use super::Session;

pub(crate) fn spawn(session: Arc<Session>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(session.config.ticks(3));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = session.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            if !session.transport.watching() {
                break;
            }
            if !session.transport.is_connected() {
                continue;
            }

            let probe = RpcRequest::new(HEARTBEAT_ID, "scope_get_equ_coord", None);
            session.transport.send_nowait(probe.to_frame()).await;
        }
    });
}
