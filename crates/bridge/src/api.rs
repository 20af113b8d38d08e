// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Northbound control surface.
//!
//! The adapter layers (HTTP, ASCOM, INDI) bind their verbs to
//! [`Session::execute`]; every reply is the
//! `{jsonrpc, TimeStamp, command, code, result}` envelope.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{reply, BridgeError};
use crate::goto::GotoParams;
use crate::protocol;
use crate::scheduler::startup::StartupParams;
use crate::scheduler::{ItemKind, SchedState, ScheduleItem};
use crate::session::Session;

impl Session {
    /// Dispatch one northbound command.
    pub async fn execute(self: &Arc<Self>, command: &str, params: Value) -> Value {
        match command {
            "start_up_sequence" => self.cmd_start_up_sequence(params).await,
            "create_schedule" => self.cmd_create_schedule(params).await,
            "add_schedule_item" => self.cmd_add_schedule_item(params).await,
            "insert_schedule_item_before" => self.cmd_insert_schedule_item_before(params).await,
            "replace_schedule_item" => self.cmd_replace_schedule_item(params).await,
            "remove_schedule_item" => self.cmd_remove_schedule_item(params).await,
            "get_schedule" => self.cmd_get_schedule(params).await,
            "start_scheduler" => self.cmd_start_scheduler(params).await,
            "stop_scheduler" => self.cmd_stop_scheduler(params).await,
            "start_mosaic" => self.cmd_start_capture(command, params).await,
            "start_spectra" => self.cmd_start_capture(command, params).await,
            "goto_target" => self.cmd_goto_target(params).await,
            "stop_goto_target" => self.cmd_stop_goto_target().await,
            "sync_target" => self.cmd_sync_target(params).await,
            "get_event_state" => self.cmd_get_event_state(params).await,
            "adjust_mag_declination" => self.cmd_adjust_mag_declination(params).await,
            other => reply(
                other,
                BridgeError::BadRequest.code(),
                json!(format!("Unknown command: {other}")),
            ),
        }
    }

    async fn cmd_start_up_sequence(self: &Arc<Self>, params: Value) -> Value {
        let params: StartupParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return reply("start_up_sequence", BridgeError::BadRequest.code(), json!(e.to_string()))
            }
        };
        if !self.schedule.read().await.state.is_idle() {
            return reply(
                "start_up_sequence",
                BridgeError::Busy.code(),
                json!("Device is busy. Try later."),
            );
        }
        self.spawn_startup(params).await;
        reply("start_up_sequence", 0, json!("Sequence started."))
    }

    async fn cmd_create_schedule(self: &Arc<Self>, params: Value) -> Value {
        let mut sched = self.schedule.write().await;
        match sched.state {
            SchedState::Working => {
                return reply(
                    "create_schedule",
                    BridgeError::Busy.code(),
                    json!("scheduler is still active"),
                );
            }
            SchedState::Stopping => sched.state = SchedState::Stopped,
            _ => {}
        }

        sched.schedule_id = params
            .get("schedule_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        sched.items.clear();
        sched.current_item_id = None;
        sched.item_number = 0;
        reply("create_schedule", 0, sched.to_value())
    }

    async fn cmd_add_schedule_item(self: &Arc<Self>, params: Value) -> Value {
        let item = match self.construct_item(&params).await {
            Ok(item) => item,
            Err(e) => {
                return reply("add_schedule_item", BridgeError::BadRequest.code(), json!(e.to_string()))
            }
        };
        let mut sched = self.schedule.write().await;
        sched.add_item(item);
        reply("add_schedule_item", 0, sched.to_value())
    }

    async fn cmd_insert_schedule_item_before(self: &Arc<Self>, params: Value) -> Value {
        let command = "insert_schedule_item_before";
        let Some(before_id) = parse_uuid(&params, "before_id") else {
            return reply(command, BridgeError::BadRequest.code(), json!("missing before_id"));
        };
        let item = match self.construct_item(&params).await {
            Ok(item) => item,
            Err(e) => return reply(command, BridgeError::BadRequest.code(), json!(e.to_string())),
        };
        let mut sched = self.schedule.write().await;
        match sched.insert_before(before_id, item) {
            Ok(()) => reply(command, 0, sched.to_value()),
            Err(e) => {
                warn!(err = %e, "rejected schedule edit");
                reply(command, BridgeError::Busy.code(), json!(e.to_string()))
            }
        }
    }

    async fn cmd_replace_schedule_item(self: &Arc<Self>, params: Value) -> Value {
        let command = "replace_schedule_item";
        let Some(item_id) = parse_uuid(&params, "item_id") else {
            return reply(command, BridgeError::BadRequest.code(), json!("missing item_id"));
        };
        let item = match self.construct_item(&params).await {
            Ok(item) => item,
            Err(e) => return reply(command, BridgeError::BadRequest.code(), json!(e.to_string())),
        };
        let mut sched = self.schedule.write().await;
        match sched.replace_item(item_id, item) {
            Ok(()) => reply(command, 0, sched.to_value()),
            Err(e) => {
                warn!(err = %e, "rejected schedule edit");
                reply(command, BridgeError::Busy.code(), json!(e.to_string()))
            }
        }
    }

    async fn cmd_remove_schedule_item(self: &Arc<Self>, params: Value) -> Value {
        let command = "remove_schedule_item";
        let Some(item_id) = parse_uuid(&params, "schedule_item_id") else {
            return reply(command, BridgeError::BadRequest.code(), json!("missing schedule_item_id"));
        };
        let mut sched = self.schedule.write().await;
        match sched.remove_item(item_id) {
            Ok(()) => reply(command, 0, sched.to_value()),
            Err(e) => {
                warn!(err = %e, "rejected schedule edit");
                reply(command, BridgeError::Busy.code(), json!(e.to_string()))
            }
        }
    }

    async fn cmd_get_schedule(self: &Arc<Self>, params: Value) -> Value {
        let sched = self.schedule.read().await;
        if let Some(requested) = params.get("schedule_id").and_then(Value::as_str) {
            if requested != sched.schedule_id.to_string() {
                return reply("get_schedule", 0, json!({}));
            }
        }
        reply("get_schedule", 0, sched.to_value())
    }

    async fn cmd_start_scheduler(self: &Arc<Self>, params: Value) -> Value {
        if let Some(msg) = self.schedule_id_mismatch(&params).await {
            return reply("start_scheduler", 0, json!(msg));
        }
        if !self.schedule.read().await.state.is_idle() {
            return reply(
                "start_scheduler",
                BridgeError::Busy.code(),
                json!("An existing scheduler is active. Returned with no action."),
            );
        }
        self.spawn_scheduler().await;
        reply("start_scheduler", 0, self.schedule.read().await.to_value())
    }

    async fn cmd_stop_scheduler(self: &Arc<Self>, params: Value) -> Value {
        if let Some(msg) = self.schedule_id_mismatch(&params).await {
            return reply("stop_scheduler", 0, json!(msg));
        }
        let state = self.schedule.read().await.state;
        match state {
            SchedState::Working => {
                self.request_scheduler_stop().await;
                reply("stop_scheduler", 0, json!("Scheduler stopped successfully."))
            }
            SchedState::Stopped => reply(
                "stop_scheduler",
                BridgeError::NotRunning.code(),
                json!("Scheduler is not running while trying to stop!"),
            ),
            _ => reply(
                "stop_scheduler",
                BridgeError::AlreadyStopping.code(),
                json!("scheduler has already been requested to stop"),
            ),
        }
    }

    /// `start_mosaic` / `start_spectra`: build a one-item schedule and run it.
    async fn cmd_start_capture(self: &Arc<Self>, command: &str, params: Value) -> Value {
        if !self.schedule.read().await.state.is_idle() {
            return reply(
                command,
                BridgeError::Busy.code(),
                json!("An existing scheduler is active. Returned with no action."),
            );
        }

        let item = match self.construct_item(&json!({"action": command, "params": params})).await {
            Ok(item) => item,
            Err(e) => return reply(command, BridgeError::BadRequest.code(), json!(e.to_string())),
        };

        {
            let mut sched = self.schedule.write().await;
            sched.schedule_id = Uuid::new_v4();
            sched.items.clear();
            sched.current_item_id = None;
            sched.item_number = 0;
            sched.add_item(item);
        }
        self.spawn_scheduler().await;
        reply(command, 0, self.schedule.read().await.to_value())
    }

    async fn cmd_goto_target(self: &Arc<Self>, params: Value) -> Value {
        let params: GotoParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return reply("goto_target", BridgeError::BadRequest.code(), json!(e.to_string()))
            }
        };
        let result = self.goto_target(params).await;
        reply("goto_target", 0, result)
    }

    async fn cmd_stop_goto_target(self: &Arc<Self>) -> Value {
        let result = self.stop_goto_target().await;
        reply("stop_goto_target", 0, result)
    }

    async fn cmd_sync_target(self: &Arc<Self>, params: Value) -> Value {
        let state = self.schedule.read().await.state;
        if !state.is_idle() {
            let msg = format!("Cannot sync target while scheduler is active: {}", state.as_str());
            warn!("{msg}");
            return reply("sync_target", BridgeError::Busy.code(), json!(msg));
        }
        let pair = params.as_array().cloned().unwrap_or_default();
        let (Some(ra), Some(dec)) = (
            pair.first().and_then(Value::as_f64),
            pair.get(1).and_then(Value::as_f64),
        ) else {
            return reply(
                "sync_target",
                BridgeError::BadRequest.code(),
                json!("sync_target expects [ra, dec]"),
            );
        };
        let result = self.sync_to(ra, dec).await;
        reply("sync_target", 0, result)
    }

    async fn cmd_get_event_state(self: &Arc<Self>, params: Value) -> Value {
        let scheduler_status = self.scheduler_status().await;
        let result = if let Some(name) = params.get("event_name").and_then(Value::as_str) {
            if name == "scheduler" {
                scheduler_status
            } else {
                self.event_state.read().await.get(name).cloned().unwrap_or_else(|| json!({}))
            }
        } else {
            let state = self.event_state.read().await;
            let mut map = serde_json::Map::new();
            for (key, value) in state.iter() {
                map.insert(key.clone(), value.clone());
            }
            map.insert("scheduler".to_owned(), scheduler_status);
            Value::Object(map)
        };
        reply("get_event_state", 0, result)
    }

    /// Rotate the device's compass calibration by the geomagnetic declination
    /// (plus a fudge angle) so bearings read true instead of magnetic.
    async fn cmd_adjust_mag_declination(self: &Arc<Self>, params: Value) -> Value {
        let command = "adjust_mag_declination";
        let adjust = params.get("adjust_mag_dec").and_then(Value::as_bool).unwrap_or(false);
        let fudge = params.get("fudge_angle").and_then(Value::as_f64).unwrap_or(0.0);

        let response = self
            .call_sync("get_device_state", Some(json!({"keys": ["location_lon_lat"]})))
            .await;
        let Some(loc) = response
            .get("result")
            .and_then(|r| r.get("location_lon_lat"))
            .and_then(Value::as_array)
            .map(|pair| {
                (
                    pair.first().and_then(Value::as_f64).unwrap_or(0.0),
                    pair.get(1).and_then(Value::as_f64).unwrap_or(0.0),
                )
            })
        else {
            return reply(command, BridgeError::Busy.code(), json!("failed to read device location"));
        };
        let (lon, lat) = loc;

        let response = self.call_sync("get_sensor_calibration", None).await;
        let Some(compass) = response
            .get("result")
            .and_then(|r| r.get("compassSensor"))
            .cloned()
        else {
            return reply(command, BridgeError::Busy.code(), json!("failed to read compass calibration"));
        };
        let get = |key: &str| compass.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let (x11, y11, x12, y12) = (get("x11"), get("y11"), get("x12"), get("y12"));

        let mut total_angle = fudge;
        if adjust {
            let mag_dec = crate::astro::geomag_declination(lat, lon);
            tracing::info!(lat, lon, mag_dec, "geomagnetic declination for site");
            total_angle += mag_dec;
        }

        // Columns of the calibration matrix are the sensor axis vectors.
        let rotated = crate::astro::apply_rotation([[x11, x12], [y11, y12]], total_angle);

        let params = json!({"compassSensor": {
            "x": compass.get("x").cloned().unwrap_or(Value::Null),
            "y": compass.get("y").cloned().unwrap_or(Value::Null),
            "z": compass.get("z").cloned().unwrap_or(Value::Null),
            "x11": rotated[0][0],
            "x12": rotated[0][1],
            "y11": rotated[1][0],
            "y12": rotated[1][1],
        }});
        let response = self.call_sync("set_sensor_calibration", Some(params)).await;
        if protocol::is_error_response(&response) {
            return reply(command, BridgeError::Busy.code(), json!("failed to write compass calibration"));
        }

        reply(
            command,
            0,
            json!(format!(
                "Adjusted compass calibration to offset by total of {total_angle} degrees."
            )),
        )
    }

    /// Build a schedule item from an `{action, params}` request, normalizing
    /// mosaic coordinates: -1 means "current pointing", rounded to 4 decimals.
    pub(crate) async fn construct_item(&self, request: &Value) -> anyhow::Result<ScheduleItem> {
        let action = request
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("schedule item requires an action"))?;
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let mut kind = ItemKind::from_action(action, params)?;

        if let ItemKind::Mosaic(ref mut mosaic) = kind {
            if mosaic.ra < 0.0 {
                let pointing = self.pointing().await;
                mosaic.ra = pointing.ra;
                mosaic.dec = pointing.dec;
                mosaic.is_j2000 = false;
            }
            mosaic.ra = round4(mosaic.ra);
            mosaic.dec = round4(mosaic.dec);
        }
        Ok(ScheduleItem::new(kind))
    }

    /// Some(message) when the caller named a schedule this device is not
    /// running.
    async fn schedule_id_mismatch(&self, params: &Value) -> Option<String> {
        let requested = params.get("schedule_id").and_then(Value::as_str)?;
        let sched = self.schedule.read().await;
        if requested == sched.schedule_id.to_string() {
            return None;
        }
        Some(format!(
            "Schedule with id {requested} did not match this device's schedule. Returned with no action."
        ))
    }
}

fn parse_uuid(params: &Value, key: &str) -> Option<Uuid> {
    params.get(key).and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
