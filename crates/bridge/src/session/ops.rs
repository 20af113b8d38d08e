// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device operation helpers shared by the control loops.
//!
//! Thin wrappers over `call_sync`; outgoing declinations are biased by the
//! below-horizon offset here so every caller slews in the displayed frame.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::{GotoMode, Session};
use crate::protocol;

impl Session {
    /// Slew to a displayed-frame position and wait for the goto to finish.
    ///
    /// The device receives `dec + offset`. This is the custom-path motion
    /// primitive; it flips the goto watch to `ScopeGoto`.
    pub async fn slew_to(self: &Arc<Self>, ra: f64, dec: f64) -> bool {
        let offset = self.dec_offset().await;
        info!(ra, dec, offset, "slew to target");

        let result = self.call_sync("scope_goto", Some(json!([ra, dec + offset]))).await;
        if protocol::is_error_response(&result) {
            warn!(%result, "error while trying to move");
            return false;
        }
        // Arm the ScopeGoto watch before flipping modes so concurrent goto
        // waiters never observe a gap between the two event names.
        self.event_state
            .write()
            .await
            .insert("ScopeGoto".to_owned(), json!({"state": "start"}));
        *self.goto_mode.write().await = GotoMode::BelowHorizon;

        self.await_event_terminal("goto_target").await
    }

    /// Sync the device's model to a displayed-frame position without moving.
    pub async fn sync_to(self: &Arc<Self>, ra: f64, dec: f64) -> Value {
        let offset = self.dec_offset().await;
        info!(ra, dec, offset, "sync to target");

        let result = self.call_sync("scope_sync", Some(json!([ra, dec + offset]))).await;
        if protocol::is_error_response(&result) {
            info!(%result, "failed to sync");
        } else {
            tokio::time::sleep(self.config.ticks(2)).await;
        }
        result
    }

    /// Abort the device-native goto stage.
    pub async fn stop_slew(self: &Arc<Self>) -> Value {
        info!("stopping slew");
        self.call_sync("iscope_stop_view", Some(json!({"stage": "AutoGoto"}))).await
    }

    /// Begin stacking at the given gain.
    pub async fn start_stack(self: &Arc<Self>, gain: i64, restart: bool) -> bool {
        let result = self.call_sync("iscope_start_stack", Some(json!({"restart": restart}))).await;
        info!(%result, "start stack");
        let result = self.call_sync("set_control_value", Some(json!(["gain", gain]))).await;
        info!(%result, "set gain");
        !protocol::is_error_response(&result)
    }

    /// Stop the stacking stage.
    pub async fn stop_stack(self: &Arc<Self>) -> Value {
        info!("stop stacking");
        self.call_sync("iscope_stop_view", Some(json!({"stage": "Stack"}))).await
    }

    /// Name the capture group; saved frames are filed under this name.
    pub async fn set_target_name(self: &Arc<Self>, name: &str) -> Value {
        self.call_sync("set_sequence_setting", Some(json!([{"group_name": name}]))).await
    }

    /// Move the light-pollution filter in or out of the optical path.
    ///
    /// Sleeps two ticks afterwards; the wheel needs time to move.
    pub async fn set_lp_filter(self: &Arc<Self>, on: bool) -> Value {
        let result = self.call_sync("set_setting", Some(json!({"stack_lenhance": on}))).await;
        tokio::time::sleep(self.config.ticks(2)).await;
        result
    }

    /// Apply the configured exposure, dither, and filter defaults.
    pub async fn apply_imaging_settings(self: &Arc<Self>) -> Value {
        let params = json!({
            "exp_ms": {
                "stack_l": self.config.expo_stack_ms,
                "continuous": self.config.expo_preview_ms,
            },
            "stack_dither": {
                "pix": self.config.dither_pix,
                "interval": self.config.dither_interval,
                "enable": self.config.dither_enabled,
            },
            "stack_lenhance": self.config.lp_filter,
        });
        let result = self.call_sync("set_setting", Some(params)).await;
        tokio::time::sleep(self.config.ticks(2)).await;
        result
    }

    /// Configure the dew heater; 0 turns it off.
    pub async fn set_dew_heater(self: &Arc<Self>, power: i64) -> Value {
        self.call_sync(
            "pi_output_set2",
            Some(json!({"heater": {"state": power > 0, "value": power}})),
        )
        .await
    }

    /// Play a device sound cue.
    pub async fn play_sound(self: &Arc<Self>, num: i64) -> Value {
        let result = self.call_sync("play_sound", Some(json!({"num": num}))).await;
        tokio::time::sleep(self.config.ticks(1)).await;
        result
    }

    /// Run autofocus, retrying up to `try_count` times.
    pub async fn try_auto_focus(self: &Arc<Self>, try_count: u32) -> bool {
        info!("trying auto focus");
        self.event_state
            .write()
            .await
            .insert("AutoFocus".to_owned(), json!({"state": "working"}));

        let mut result = false;
        for attempt in 1..=try_count {
            info!(attempt, try_count, "focusing");
            if attempt > 1 {
                tokio::time::sleep(self.config.ticks(5)).await;
            }
            let response = self.call_sync("start_auto_focuse", None).await;
            if protocol::is_error_response(&response) {
                warn!(%response, "failed to start auto focus");
                continue;
            }
            result = self.await_event_terminal("AutoFocus").await;
            if result {
                break;
            }
        }

        // Let the focuser settle.
        tokio::time::sleep(self.config.ticks(2)).await;
        info!(result, "auto focus completed");
        result
    }

    /// Nudge the arm with a speed move. Refused while a goto is in flight.
    pub async fn move_scope(self: &Arc<Self>, angle: i64, speed: i64, dur_sec: i64) -> bool {
        if self.is_goto().await {
            warn!("failed to move scope: mount is in goto routine");
            return false;
        }
        let params = json!({"speed": speed, "angle": angle, "dur_sec": dur_sec});
        self.call_sync("scope_speed_move", Some(params)).await;
        true
    }
}
