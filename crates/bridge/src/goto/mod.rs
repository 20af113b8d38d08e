// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Goto controller.
//!
//! Two paths: the device-native goto (`iscope_start_view`, observed via
//! `AutoGoto`) and a custom path for below-horizon targets that slews with a
//! biased declination and closes the loop over plate solves (`ScopeGoto`).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::astro;
use crate::session::{CustomGotoState, GotoMode, Session, SAFE_DEC_DEG};

pub mod center;
pub mod horizon;

fn default_target_name() -> String {
    "unknown".to_owned()
}

/// Northbound goto request.
#[derive(Debug, Clone, Deserialize)]
pub struct GotoParams {
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub is_j2000: bool,
    #[serde(default = "default_target_name")]
    pub target_name: String,
}

impl Session {
    /// Set the active goto's event to `start` so waiters observe the new
    /// operation rather than a stale terminal state.
    pub(crate) async fn mark_goto_start(&self) {
        let name = self.goto_mode.read().await.event_name();
        self.event_state
            .write()
            .await
            .insert(name.to_owned(), json!({"state": "start"}));
    }

    pub(crate) async fn mark_goto_stopped(&self) {
        let name = self.goto_mode.read().await.event_name();
        self.event_state
            .write()
            .await
            .insert(name.to_owned(), json!({"state": "stopped"}));
    }

    /// True while the active goto's event is in `start` or `working`.
    pub async fn is_goto(&self) -> bool {
        let name = self.goto_mode.read().await.event_name();
        let state = self.event_state.read().await;
        match state.get(name).and_then(|v| v.get("state")).and_then(Value::as_str) {
            Some(s) => s == "working" || s == "start",
            None => false,
        }
    }

    /// True once the active goto's event reports `complete`.
    pub async fn is_goto_completed_ok(&self) -> bool {
        let name = self.goto_mode.read().await.event_name();
        let state = self.event_state.read().await;
        state
            .get(name)
            .and_then(|v| v.get("state"))
            .and_then(Value::as_str)
            .map(|s| s == "complete")
            .unwrap_or(false)
    }

    /// Start a goto. Returns `{"result": 0}` once the motion is underway, or
    /// a failure message when the mount is already in a goto routine.
    pub async fn goto_target(self: &Arc<Self>, params: GotoParams) -> Value {
        if self.is_goto().await {
            info!("failed to goto target: mount is in goto routine");
            return json!({"result": "Failed to goto target: mount is in goto routine."});
        }
        self.mark_goto_start().await;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            goto_task(session, params).await;
        });
        json!({"result": 0})
    }

    /// Stop the in-flight goto, whichever path owns it.
    pub async fn stop_goto_target(self: &Arc<Self>) -> Value {
        if !self.is_goto().await {
            return json!("goto stopped already: no action taken");
        }
        if self.dec_offset().await == 0.0 {
            self.stop_slew().await
        } else {
            // The auto-center task exits at its next poll.
            self.custom_goto.send_replace(CustomGotoState::Stopping);
            json!("Stop requested.")
        }
    }
}

async fn goto_task(session: Arc<Session>, params: GotoParams) {
    let (ra, dec) = astro::parse_coordinate(params.is_j2000, params.ra, params.dec);
    let target_name = params.target_name;
    let offset = session.dec_offset().await;
    info!(target = %target_name, ra, dec, offset, "going to target");

    if session.config.eq_mode {
        let site = session.site().await;
        if dec < -site.lat {
            warn!(
                ra, dec, site_lat = site.lat,
                "target is too low for this site, goto rejected"
            );
            session.mark_goto_stopped().await;
            return;
        }

        let needed_offset = -dec + SAFE_DEC_DEG;
        let result = if offset > 0.0 && dec > SAFE_DEC_DEG {
            session.reset_dec_offset().await
        } else if needed_offset > offset {
            session.set_dec_offset(needed_offset, dec).await
        } else {
            Ok(())
        };

        if let Err(e) = result {
            warn!(err = %e, "failed to set or reset dec offset, goto will not proceed");
            session.mark_goto_stopped().await;
            return;
        }
    }

    if session.dec_offset().await == 0.0 {
        *session.goto_mode.write().await = GotoMode::Standard;
        let params = json!({
            "mode": "star",
            "target_ra_dec": [ra, dec],
            "target_name": target_name,
            "lp_filter": false,
        });
        session.call_sync("iscope_start_view", Some(params)).await;
    } else {
        goto_with_dec_offset(&session, &target_name, ra, dec).await;
    }
}

/// Custom below-horizon path: slew with the biased declination, then hand the
/// mount to the auto-center loop for plate-solve refinement.
async fn goto_with_dec_offset(session: &Arc<Session>, target_name: &str, in_ra: f64, in_dec: f64) {
    let (target_ra, target_dec) = if in_ra < 0.0 {
        let pointing = session.pointing().await;
        (pointing.ra, pointing.dec)
    } else {
        (in_ra, in_dec)
    };
    let offset = session.dec_offset().await;
    info!(
        ra = target_ra, dec = target_dec,
        offset,
        "goto with explicit dec offset logic"
    );

    session.custom_goto.send_replace(CustomGotoState::Start);
    if session.slew_to(target_ra, target_dec).await {
        session.set_target_name(target_name).await;
        let session = Arc::clone(session);
        tokio::spawn(async move {
            center::auto_center(session, target_ra, target_dec).await;
        });
    } else {
        info!("failed to slew");
        session.custom_goto.send_replace(CustomGotoState::Fail);
    }
}
