// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Schedule data model: an ordered, editable list of tagged items executed
//! one at a time, with edit protection for items that already ran.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub mod mosaic;
pub mod run;
pub mod spectra;
pub mod startup;

/// Scheduler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedState {
    Stopped,
    Working,
    Stopping,
    Complete,
}

impl SchedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Working => "working",
            Self::Stopping => "stopping",
            Self::Complete => "complete",
        }
    }

    /// True when a new scheduler run (or startup sequence) may begin.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Stopped | Self::Complete)
    }
}

fn default_num_tries() -> u32 {
    1
}

fn default_retry_wait_s() -> u64 {
    300
}

/// Parameters for a mosaic capture item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicParams {
    pub target_name: String,
    /// RA in hours; -1 (with dec -1) means "current pointing".
    pub ra: f64,
    /// Dec in degrees.
    pub dec: f64,
    #[serde(default)]
    pub is_j2000: bool,
    #[serde(default)]
    pub is_use_lp_filter: bool,
    pub session_time_sec: u64,
    pub ra_num: u32,
    pub dec_num: u32,
    pub panel_overlap_percent: f64,
    pub gain: i64,
    #[serde(default)]
    pub is_use_autofocus: bool,
    /// Semicolon-separated panel codes, e.g. "11;12;21". Empty means all.
    #[serde(default)]
    pub selected_panels: String,
    #[serde(default = "default_num_tries")]
    pub num_tries: u32,
    #[serde(default = "default_retry_wait_s")]
    pub retry_wait_s: u64,
}

/// Parameters for a spectra capture item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectraParams {
    pub target_name: String,
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub is_j2000: bool,
    pub session_time_sec: u64,
    pub gain: i64,
}

/// A schedule item variant; the `action` string is the discriminator on the
/// wire.
#[derive(Debug, Clone)]
pub enum ItemKind {
    Mosaic(MosaicParams),
    Spectra(SpectraParams),
    AutoFocus { try_count: u32 },
    WaitFor { timer_sec: u64 },
    WaitUntil { local_time: String },
    Shutdown,
    /// Opaque device method passthrough.
    Raw { method: String, params: Option<Value> },
}

impl ItemKind {
    /// Parse an `{action, params}` request into a variant. Unknown actions
    /// become raw device passthrough.
    pub fn from_action(action: &str, params: Value) -> anyhow::Result<Self> {
        let kind = match action {
            "start_mosaic" => Self::Mosaic(serde_json::from_value(params)?),
            "start_spectra" => Self::Spectra(serde_json::from_value(params)?),
            "auto_focus" => {
                let try_count = params
                    .get("try_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as u32;
                Self::AutoFocus { try_count }
            }
            "wait_for" => {
                let timer_sec = params
                    .get("timer_sec")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| anyhow::anyhow!("wait_for requires timer_sec"))?;
                Self::WaitFor { timer_sec }
            }
            "wait_until" => {
                let local_time = params
                    .get("local_time")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("wait_until requires local_time"))?
                    .to_owned();
                Self::WaitUntil { local_time }
            }
            "shutdown" => Self::Shutdown,
            method => Self::Raw {
                method: method.to_owned(),
                params: if params.is_null() { None } else { Some(params) },
            },
        };
        Ok(kind)
    }

    /// The wire discriminator for this variant.
    pub fn action(&self) -> &str {
        match self {
            Self::Mosaic(_) => "start_mosaic",
            Self::Spectra(_) => "start_spectra",
            Self::AutoFocus { .. } => "auto_focus",
            Self::WaitFor { .. } => "wait_for",
            Self::WaitUntil { .. } => "wait_until",
            Self::Shutdown => "shutdown",
            Self::Raw { method, .. } => method,
        }
    }

    /// The `params` payload for this variant, if any.
    pub fn params_value(&self) -> Option<Value> {
        match self {
            Self::Mosaic(p) => serde_json::to_value(p).ok(),
            Self::Spectra(p) => serde_json::to_value(p).ok(),
            Self::AutoFocus { try_count } => Some(json!({"try_count": try_count})),
            Self::WaitFor { timer_sec } => Some(json!({"timer_sec": timer_sec})),
            Self::WaitUntil { local_time } => Some(json!({"local_time": local_time})),
            Self::Shutdown => None,
            Self::Raw { params, .. } => params.clone(),
        }
    }
}

/// A schedule entry with its assigned id.
#[derive(Debug, Clone)]
pub struct ScheduleItem {
    pub schedule_item_id: Uuid,
    pub kind: ItemKind,
}

impl ScheduleItem {
    pub fn new(kind: ItemKind) -> Self {
        Self { schedule_item_id: Uuid::new_v4(), kind }
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "action": self.kind.action(),
            "schedule_item_id": self.schedule_item_id.to_string(),
        });
        if let Some(params) = self.kind.params_value() {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("params".to_owned(), params);
            }
        }
        value
    }
}

/// The editable schedule owned by a session.
#[derive(Debug)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub items: Vec<ScheduleItem>,
    pub state: SchedState,
    pub current_item_id: Option<Uuid>,
    /// 1-based position of the executing item; 0 when idle.
    pub item_number: usize,
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            schedule_id: Uuid::new_v4(),
            items: Vec::new(),
            state: SchedState::Stopped,
            current_item_id: None,
            item_number: 0,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "schedule_id": self.schedule_id.to_string(),
            "list": self.items.iter().map(ScheduleItem::to_value).collect::<Vec<_>>(),
            "state": self.state.as_str(),
            "current_item_id": self.current_item_id.map(|id| id.to_string()).unwrap_or_default(),
            "item_number": self.item_number,
        })
    }

    /// Append an item at the end. Always allowed.
    pub fn add_item(&mut self, item: ScheduleItem) {
        self.items.push(item);
    }

    /// Insert before the item with `before_id`.
    pub fn insert_before(&mut self, before_id: Uuid, item: ScheduleItem) -> anyhow::Result<()> {
        if self.target_already_executed(before_id) {
            anyhow::bail!("Cannot insert before a schedule item that has already been executed");
        }
        if let Some(index) = self.index_of(before_id) {
            self.items.insert(index, item);
        }
        Ok(())
    }

    /// Replace the item with `item_id`.
    pub fn replace_item(&mut self, item_id: Uuid, item: ScheduleItem) -> anyhow::Result<()> {
        if self.target_already_executed(item_id) {
            anyhow::bail!("Cannot replace a schedule item that has already been executed");
        }
        if let Some(index) = self.index_of(item_id) {
            self.items[index] = item;
        }
        Ok(())
    }

    /// Remove the item with `item_id`.
    pub fn remove_item(&mut self, item_id: Uuid) -> anyhow::Result<()> {
        if self.target_already_executed(item_id) {
            anyhow::bail!("Cannot remove a schedule item that has already been executed");
        }
        if let Some(index) = self.index_of(item_id) {
            self.items.remove(index);
        }
        Ok(())
    }

    fn index_of(&self, item_id: Uuid) -> Option<usize> {
        self.items.iter().position(|item| item.schedule_item_id == item_id)
    }

    /// While working, an edit may not touch the executing item or anything
    /// before it: scan from the front and reject if the target shows up
    /// before the cursor passes the active item.
    fn target_already_executed(&self, target: Uuid) -> bool {
        if self.state != SchedState::Working {
            return false;
        }
        let Some(current) = self.current_item_id else {
            return false;
        };
        for item in &self.items {
            if item.schedule_item_id == target {
                return true;
            }
            if item.schedule_item_id == current {
                return false;
            }
        }
        false
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Live observation of the executing item, surfaced through the synthesized
/// `scheduler` event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CurrentItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub schedule_item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_total_time_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_remaining_time_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub panel_remaining_time_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur_ra_panel_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur_dec_panel_num: Option<u32>,
    #[serde(rename = "remaining s", skip_serializing_if = "Option::is_none")]
    pub remaining_s: Option<i64>,
    #[serde(rename = "current time", skip_serializing_if = "Option::is_none")]
    pub current_time: Option<String>,
}

impl CurrentItem {
    /// Fresh observation stub for an item about to run.
    pub fn stub(item_type: &str, schedule_item_id: String, action: &str) -> Self {
        Self {
            item_type: item_type.to_owned(),
            schedule_item_id,
            action: action.to_owned(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
