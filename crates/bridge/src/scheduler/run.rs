// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduler loop: executes items in order, one at a time.
//!
//! This task is the single owner of the `working → stopped/complete`
//! transition. Engines observe the per-run stop token and return; they never
//! write the schedule state themselves.

use std::sync::Arc;

use chrono::Timelike;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CurrentItem, ItemKind, SchedState};
use crate::session::Session;

impl Session {
    /// Install a fresh stop token, mark the schedule working, and launch the
    /// scheduler task. Callers must have verified the schedule is idle.
    pub(crate) async fn spawn_scheduler(self: &Arc<Self>) {
        *self.stop.write().await = CancellationToken::new();
        self.schedule.write().await.state = SchedState::Working;
        let session = Arc::clone(self);
        tokio::spawn(async move {
            run_loop(session).await;
        });
    }

    /// Request the running scheduler to stop: mark stopping, fire the stop
    /// token, and wind down any in-flight slew and stack.
    pub(crate) async fn request_scheduler_stop(self: &Arc<Self>) {
        self.schedule.write().await.state = SchedState::Stopping;
        self.stop_token().await.cancel();
        self.stop_slew().await;
        self.stop_stack().await;
        self.play_sound(83).await;
    }

    /// Snapshot for the synthesized `scheduler` pseudo-event.
    pub async fn scheduler_status(&self) -> Value {
        let (state, schedule_id, item_number) = {
            let sched = self.schedule.read().await;
            (sched.state.as_str(), sched.schedule_id.to_string(), sched.item_number)
        };
        let cur_item = self.cur_item.read().await;
        json!({
            "state": state,
            "schedule_id": schedule_id,
            "item_number": item_number,
            "cur_scheduler_item": serde_json::to_value(&*cur_item).unwrap_or_default(),
            "result": 0,
        })
    }

    pub(crate) async fn set_cur_item(&self, item: CurrentItem) {
        *self.cur_item.write().await = item;
    }

    pub(crate) async fn update_cur_item<F>(&self, f: F)
    where
        F: FnOnce(&mut CurrentItem),
    {
        f(&mut *self.cur_item.write().await);
    }
}

async fn run_loop(session: Arc<Session>) {
    session.play_sound(80).await;
    info!("schedule started");
    let mut issue_shutdown = false;
    let mut index = 0usize;

    loop {
        let item = {
            let mut sched = session.schedule.write().await;
            if sched.state != SchedState::Working || index >= sched.items.len() {
                break;
            }
            let item = sched.items[index].clone();
            sched.current_item_id = Some(item.schedule_item_id);
            sched.item_number = index + 1;
            item
        };
        let item_id = item.schedule_item_id.to_string();

        match item.kind {
            ItemKind::Mosaic(params) => super::mosaic::run(&session, params).await,
            ItemKind::Spectra(params) => super::spectra::run(&session, params).await,
            ItemKind::AutoFocus { try_count } => {
                session.set_cur_item(CurrentItem::stub("auto_focus", item_id, "auto focus")).await;
                session.try_auto_focus(try_count).await;
            }
            ItemKind::WaitFor { timer_sec } => {
                run_wait_for(&session, item_id, timer_sec).await;
            }
            ItemKind::WaitUntil { local_time } => {
                run_wait_until(&session, item_id, &local_time).await;
            }
            ItemKind::Shutdown => {
                session.set_cur_item(CurrentItem::stub("shut_down", item_id, "shut down")).await;
                issue_shutdown = true;
                break;
            }
            ItemKind::Raw { method, params } => {
                session.call_sync(&method, params).await;
            }
        }

        index += 1;
    }

    if let Err(e) = session.reset_dec_offset().await {
        warn!(err = %e, "failed to reset dec offset at scheduler exit");
    }

    {
        let mut sched = session.schedule.write().await;
        sched.state = if sched.state == SchedState::Stopping || issue_shutdown {
            SchedState::Stopped
        } else {
            SchedState::Complete
        };
        sched.current_item_id = None;
        sched.item_number = 0;
    }
    // Replace the fired token so waits outside a scheduler run start fresh.
    *session.stop.write().await = CancellationToken::new();

    info!("scheduler finished");
    session.play_sound(82).await;

    if issue_shutdown {
        session.call_sync("pi_shutdown", None).await;
    }
}

async fn run_wait_for(session: &Arc<Session>, item_id: String, timer_sec: u64) {
    let mut item = CurrentItem::stub("wait_for", item_id, &format!("wait for {timer_sec} seconds"));
    item.remaining_s = Some(timer_sec as i64);
    session.set_cur_item(item).await;

    let mut slept = 0u64;
    while slept < timer_sec {
        if !session.sleep_ticks(5).await {
            info!("wait_for interrupted by stop request");
            return;
        }
        slept += 5;
        let remaining = timer_sec.saturating_sub(slept) as i64;
        session.update_cur_item(|item| item.remaining_s = Some(remaining)).await;
    }
}

async fn run_wait_until(session: &Arc<Session>, item_id: String, local_time: &str) {
    let Some((hour, minute)) = parse_local_time(local_time) else {
        warn!(local_time, "invalid wait_until time, skipping item");
        return;
    };
    let item = CurrentItem::stub(
        "wait_until",
        item_id,
        &format!("wait until local time of {local_time}"),
    );
    session.set_cur_item(item).await;

    loop {
        let now = chrono::Local::now();
        if now.hour() == hour && now.minute() == minute {
            return;
        }
        session
            .update_cur_item(|item| {
                item.current_time = Some(format!("{:02}:{:02}", now.hour(), now.minute()));
            })
            .await;
        if !session.sleep_ticks(5).await {
            info!("wait_until interrupted by stop request");
            return;
        }
    }
}

/// Parse "HH:MM" into (hour, minute).
fn parse_local_time(text: &str) -> Option<(u32, u32)> {
    let (hour, minute) = text.split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
