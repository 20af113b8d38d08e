// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup sequence: a one-shot container flow that brings the device from
//! power-on to ready: clock, location, imaging defaults, park, arm aim,
//! and the optional autofocus / polar-align / dark-frame calibrations.

use std::sync::Arc;

use chrono::{Datelike, Timelike};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CurrentItem, SchedState};
use crate::astro;
use crate::goto::GotoParams;
use crate::protocol;
use crate::session::{GotoMode, Session};

/// Northbound startup request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartupParams {
    #[serde(default)]
    pub auto_focus: bool,
    #[serde(rename = "3ppa", default)]
    pub three_ppa: bool,
    #[serde(default)]
    pub dark_frames: bool,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Session {
    /// Launch the startup flow. Callers must have verified the schedule is
    /// idle; the flow borrows the schedule state as its container.
    pub(crate) async fn spawn_startup(self: &Arc<Self>, params: StartupParams) {
        *self.stop.write().await = CancellationToken::new();
        {
            let mut sched = self.schedule.write().await;
            sched.state = SchedState::Working;
            sched.item_number = 0;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            startup_task(session, params).await;
        });
    }
}

async fn startup_task(session: Arc<Session>, params: StartupParams) {
    let result = run_startup(&session, params).await;
    match &result {
        Ok(()) => info!("start-up sequence finished"),
        Err(e) => warn!(err = %e, "start-up sequence stopped and was unsuccessful"),
    }

    {
        let mut sched = session.schedule.write().await;
        sched.state = if sched.state == SchedState::Stopping {
            SchedState::Stopped
        } else {
            SchedState::Complete
        };
    }
    *session.stop.write().await = CancellationToken::new();
    session.play_sound(82).await;
}

async fn run_startup(session: &Arc<Session>, params: StartupParams) -> anyhow::Result<()> {
    let stop = session.stop_token().await;

    info!("start up sequence begins");
    session.play_sound(80).await;
    session
        .set_cur_item(CurrentItem::stub(
            "start_up_sequence",
            "Not Applicable".to_owned(),
            "set configurations",
        ))
        .await;

    session.call_sync("pi_is_verified", None).await;

    set_device_time(session).await;
    set_device_location(session, &params).await;
    session.call_sync("set_setting", Some(json!({"lang": "en"}))).await;
    session.apply_imaging_settings().await;
    session.set_dew_heater(session.config.dew_heater_power).await;
    session
        .call_sync(
            "set_stack_setting",
            Some(json!({
                "save_discrete_ok_frame": session.config.save_good_frames,
                "save_discrete_frame": session.config.save_all_frames,
            })),
        )
        .await;

    // Park for a known reference point before anything moves.
    set_action(session, "Need to park scope first for a good reference start point").await;
    let response = session.call_sync("scope_park", None).await;
    if protocol::is_error_response(&response) {
        anyhow::bail!("failed to park scope; restart the device and try again");
    }
    let parked = session.await_event_terminal("ScopeHome").await;
    info!(parked, "scope park finished");

    aim_at_clear_sky(session, &stop).await?;

    if stop.is_cancelled() {
        return Ok(());
    }

    if params.auto_focus {
        set_action(session, "auto focus").await;
        if !session.try_auto_focus(2).await {
            anyhow::bail!("auto focus failed");
        }
    }
    if stop.is_cancelled() {
        return Ok(());
    }

    if params.three_ppa {
        set_action(session, "3 point polar alignment").await;
        if !try_polar_align(session, &stop).await {
            anyhow::bail!("polar alignment failed");
        }
    }
    if stop.is_cancelled() {
        return Ok(());
    }

    if params.dark_frames {
        set_action(session, "dark frame measurement").await;
        if !try_dark_frame(session).await {
            anyhow::bail!("dark frame measurement failed");
        }
    }
    if stop.is_cancelled() {
        return Ok(());
    }

    if params.three_ppa {
        reanchor_sky_model(session).await;
    }

    set_action(session, "complete").await;
    Ok(())
}

async fn set_action(session: &Arc<Session>, action: &str) {
    info!(action, "startup step");
    session.update_cur_item(|item| item.action = action.to_owned()).await;
}

async fn set_device_time(session: &Arc<Session>) {
    let now = chrono::Local::now();
    let date_json = json!({
        "year": now.year(),
        "mon": now.month(),
        "day": now.day(),
        "hour": now.hour(),
        "min": now.minute(),
        "sec": now.second(),
        "time_zone": session.config.time_zone_name(),
    });
    info!(%date_json, "setting device time");
    let response = session.call_sync("pi_set_time", Some(json!([date_json]))).await;
    info!(%response, "pi_set_time response");
}

/// Resolve the site: request params beat config, config beats the
/// IP-geolocation guess. The resolved site also feeds the goto reach check.
async fn set_device_location(session: &Arc<Session>, params: &StartupParams) {
    let mut site = session.site().await;

    match (params.lat, params.lon) {
        (Some(lat), Some(lon)) if lat > 0.0 || lon > 0.0 => {
            site.lat = lat;
            site.lon = lon;
        }
        _ => {
            if site.lat <= 0.0 && site.lon <= 0.0 {
                if let Some((lat, lon)) = astro::current_gps_coordinates().await {
                    info!(lat, lon, "estimated site location from IP geolocation");
                    site.lat = lat;
                    site.lon = lon;
                }
            }
        }
    }
    *session.site.write().await = site;

    set_action(session, &format!("Setting location to {}, {}", site.lat, site.lon)).await;
    let response = session
        .call_sync(
            "set_user_location",
            Some(json!({"lat": site.lat, "lon": site.lon, "force": true})),
        )
        .await;
    if protocol::is_error_response(&response) {
        warn!(%response, "failed to set location");
    } else {
        info!(%response, "location set");
    }
}

/// Walk the arm toward the configured clear patch of sky with short speed
/// moves, one horizon axis at a time, until within five degrees.
async fn aim_at_clear_sky(
    session: &Arc<Session>,
    stop: &CancellationToken,
) -> anyhow::Result<()> {
    *session.dec_offset.write().await = 0.0;

    let mut lat = session.config.aim_lat;
    let mut lon = session.config.aim_lon;
    if lon < 0.0 {
        lon += 360.0;
    }
    if lat > 80.0 {
        warn!(requested = lat, "aim latitude has a max value of 80");
        lat = 80.0;
    }

    let mut cur = horiz_coord(session).await?;
    set_action(
        session,
        &format!(
            "moving scope's aim toward a clear patch of sky, from {:.1}, {:.1} to {lat:.1}, {lon:.1}",
            cur.0, cur.1
        ),
    )
    .await;

    loop {
        if stop.is_cancelled() {
            return Ok(());
        }
        let delta_lat = lat - cur.0;
        if delta_lat.abs() < 5.0 {
            break;
        }
        let direction = if delta_lat > 0.0 { 90 } else { -90 };
        if !session.move_scope(direction, 1000, 10).await {
            break;
        }
        tokio::time::sleep(session.config.ticks(1) / 10).await;
        cur = horiz_coord(session).await?;
    }
    session.move_scope(0, 0, 0).await;

    loop {
        if stop.is_cancelled() {
            return Ok(());
        }
        let delta_lon = lon - cur.1;
        if delta_lon.abs() < 5.0 {
            break;
        }
        let direction = if delta_lon > 0.0 || delta_lon < -180.0 { 0 } else { 180 };
        if !session.move_scope(direction, 1000, 10).await {
            break;
        }
        tokio::time::sleep(session.config.ticks(1) / 10).await;
        cur = horiz_coord(session).await?;
    }
    session.move_scope(0, 0, 0).await;

    let cur = horiz_coord(session).await?;
    info!(lat = cur.0, lon = cur.1, "final horizon position after aim move");
    Ok(())
}

async fn horiz_coord(session: &Arc<Session>) -> anyhow::Result<(f64, f64)> {
    let response = session.call_sync("scope_get_horiz_coord", None).await;
    let pair = response
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("scope_get_horiz_coord returned no coordinates"))?;
    let lat = pair.first().and_then(Value::as_f64).unwrap_or(0.0);
    let lon = pair.get(1).and_then(Value::as_f64).unwrap_or(0.0);
    Ok((lat, lon))
}

/// Three-point polar alignment, with a fallback to plain stacking when the
/// device has no stored 3PPA offset yet. Either way, progress is observed
/// through the `3PPA` event until it crosses 100% or fails.
async fn try_polar_align(session: &Arc<Session>, stop: &CancellationToken) -> bool {
    *session.goto_mode.write().await = GotoMode::Standard;
    session
        .event_state
        .write()
        .await
        .insert("3PPA".to_owned(), json!({"state": "working"}));

    let response = session.call_sync("get_device_state", None).await;
    info!(%response, "device state before polar alignment");
    let has_3ppa_offset = response
        .get("result")
        .and_then(|r| r.get("setting"))
        .and_then(|s| s.get("offset_deg_3ppa"))
        .is_some();

    let started = if has_3ppa_offset {
        let response = session.call_sync("start_polar_align", None).await;
        if protocol::is_error_response(&response) {
            warn!(%response, "failed to start polar alignment");
            false
        } else {
            true
        }
    } else {
        // No prior alignment data: stack from the current position instead.
        session.start_stack(session.config.gain, true).await
    };
    if !started {
        return false;
    }

    tokio::time::sleep(session.config.ticks(1)).await;
    let result = loop {
        if stop.is_cancelled() || session.shutdown.is_cancelled() {
            break false;
        }
        let event = session.event_state.read().await.get("3PPA").cloned();
        if let Some(event) = event {
            let state = event.get("state").and_then(Value::as_str);
            if state == Some("fail") {
                info!(%event, "polar alignment failed");
                if !has_3ppa_offset {
                    session
                        .call_sync("iscope_stop_view", Some(json!({"stage": "AutoGoto"})))
                        .await;
                }
                break false;
            }
            if let Some(percent) = event.get("percent").and_then(Value::as_f64) {
                if percent > 99.9 {
                    info!("polar alignment reached 100%, stopping");
                    if has_3ppa_offset {
                        session.call_sync("stop_polar_align", None).await;
                    } else {
                        session
                            .call_sync("iscope_stop_view", Some(json!({"stage": "AutoGoto"})))
                            .await;
                    }
                    break true;
                }
            }
            if state == Some("cancel") {
                warn!("unexpected cancel state during polar alignment");
                break false;
            }
        }
        tokio::time::sleep(session.config.ticks(1)).await;
    };

    tokio::time::sleep(session.config.ticks(2)).await;
    info!(result, "polar alignment done");
    result
}

async fn try_dark_frame(session: &Arc<Session>) -> bool {
    info!("start dark frame measurement");
    session
        .event_state
        .write()
        .await
        .insert("DarkLibrary".to_owned(), json!({"state": "working"}));

    let response = session.call_sync("start_create_dark", None).await;
    if protocol::is_error_response(&response) {
        warn!(%response, "failed to start dark frame creation");
        return false;
    }
    let response = session
        .call_sync("set_control_value", Some(json!(["gain", session.config.gain])))
        .await;
    info!(%response, "dark frame gain response");

    let ok = session.await_event_terminal("DarkLibrary").await;
    if ok {
        let response = session.call_sync("iscope_stop_view", Some(json!({"stage": "Stack"}))).await;
        info!(%response, "stopped stack after dark frame measurement");
    } else {
        warn!("create dark frame data failed");
    }
    ok
}

/// After polar alignment the device's sky model is anchored at the last
/// solve; a small throwaway goto re-registers it.
async fn reanchor_sky_model(session: &Arc<Session>) {
    set_action(session, "perform a quick goto routine to confirm and add to the sky model").await;
    let response = session.call_sync("get_last_solve_result", None).await;
    let Some(pair) = response
        .get("result")
        .and_then(|r| r.get("ra_dec"))
        .and_then(Value::as_array)
    else {
        warn!(%response, "no last solve result, skipping re-anchor goto");
        return;
    };
    let ra = pair.first().and_then(Value::as_f64).unwrap_or(0.0);
    let dec = pair.get(1).and_then(Value::as_f64).unwrap_or(0.0);

    info!(ra, dec, "re-anchoring from last solve position");
    session
        .goto_target(GotoParams {
            ra: ra + 0.1,
            dec,
            is_j2000: false,
            target_name: "unknown".to_owned(),
        })
        .await;
    let result = session.await_event_terminal("goto_target").await;
    info!(result, "re-anchor goto finished");
}
