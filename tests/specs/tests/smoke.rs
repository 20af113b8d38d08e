// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scheduler tests against the mock device: mosaic capture,
//! schedule editing, stop semantics, and reconnection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use starbridge::session::Session;
use starbridge_specs::{
    wait_event_key, wait_item_number, wait_scheduler_state, MockDevice, MockOptions,
};

const DEADLINE: Duration = Duration::from_secs(30);

fn last_item_id(reply: &Value) -> String {
    let list = reply["result"]["list"].as_array().cloned().unwrap_or_default();
    list.last()
        .and_then(|item| item["schedule_item_id"].as_str())
        .unwrap_or_default()
        .to_owned()
}

#[tokio::test]
async fn mosaic_2x2_happy_path() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "start_mosaic",
            json!({
                "target_name": "T1",
                "ra": 10.0,
                "dec": 45.0,
                "is_j2000": false,
                "is_use_lp_filter": false,
                "session_time_sec": 400,
                "ra_num": 2,
                "dec_num": 2,
                "panel_overlap_percent": 20.0,
                "gain": 80,
            }),
        )
        .await;
    assert_eq!(reply["code"], 0, "start_mosaic refused: {reply}");

    wait_scheduler_state(&session, "complete", DEADLINE).await?;

    // Four panels, each slewed to and stacked, named row-major.
    let names: BTreeSet<String> = mock.view_target_names().await.into_iter().collect();
    let expected: BTreeSet<String> =
        ["T1_11", "T1_12", "T1_21", "T1_22"].iter().map(|s| s.to_string()).collect();
    assert_eq!(names, expected);
    assert_eq!(mock.count_method("iscope_start_stack").await, 4);

    let reply = session.execute("get_event_state", json!({"event_name": "scheduler"})).await;
    assert_eq!(reply["result"]["cur_scheduler_item"]["action"], "complete");

    session.close();
    Ok(())
}

#[tokio::test]
async fn mosaic_selected_panels_skips_the_rest() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "start_mosaic",
            json!({
                "target_name": "T1",
                "ra": 10.0,
                "dec": 45.0,
                "is_j2000": false,
                "is_use_lp_filter": false,
                "session_time_sec": 200,
                "ra_num": 2,
                "dec_num": 2,
                "panel_overlap_percent": 20.0,
                "gain": 80,
                "selected_panels": "12;21",
            }),
        )
        .await;
    assert_eq!(reply["code"], 0);

    wait_scheduler_state(&session, "complete", DEADLINE).await?;

    // Exactly the selected panels were captured; no slew for the others.
    let names: BTreeSet<String> = mock.view_target_names().await.into_iter().collect();
    let expected: BTreeSet<String> = ["T1_12", "T1_21"].iter().map(|s| s.to_string()).collect();
    assert_eq!(names, expected);
    assert_eq!(mock.count_method("iscope_start_view").await, 2);
    assert_eq!(mock.count_method("iscope_start_stack").await, 2);

    session.close();
    Ok(())
}

#[tokio::test]
async fn schedule_edits_protect_executed_items() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    session.execute("create_schedule", json!({})).await;
    let a = session
        .execute("add_schedule_item", json!({"action": "wait_for", "params": {"timer_sec": 5}}))
        .await;
    let a_id = last_item_id(&a);
    let b = session
        .execute("add_schedule_item", json!({"action": "wait_for", "params": {"timer_sec": 600}}))
        .await;
    let b_id = last_item_id(&b);
    let c = session
        .execute("add_schedule_item", json!({"action": "wait_for", "params": {"timer_sec": 5}}))
        .await;
    let c_id = last_item_id(&c);
    assert!(!a_id.is_empty() && !b_id.is_empty() && !c_id.is_empty());

    let reply = session.execute("start_scheduler", json!({})).await;
    assert_eq!(reply["code"], 0);

    // Wait until the scheduler has advanced to item B.
    wait_item_number(&session, 2, DEADLINE).await?;

    // A has already executed: every edit against it is rejected.
    let reply = session
        .execute("remove_schedule_item", json!({"schedule_item_id": a_id}))
        .await;
    assert_eq!(reply["code"], -1, "remove of executed item must be rejected: {reply}");
    let reply = session
        .execute(
            "replace_schedule_item",
            json!({"item_id": a_id, "action": "wait_for", "params": {"timer_sec": 1}}),
        )
        .await;
    assert_eq!(reply["code"], -1);
    let reply = session
        .execute(
            "insert_schedule_item_before",
            json!({"before_id": a_id, "action": "wait_for", "params": {"timer_sec": 1}}),
        )
        .await;
    assert_eq!(reply["code"], -1);

    // The schedule is unchanged.
    let reply = session.execute("get_schedule", json!({})).await;
    assert_eq!(reply["result"]["list"].as_array().map(Vec::len), Some(3));

    // C has not run yet: removal succeeds.
    let reply = session
        .execute("remove_schedule_item", json!({"schedule_item_id": c_id}))
        .await;
    assert_eq!(reply["code"], 0);
    assert_eq!(reply["result"]["list"].as_array().map(Vec::len), Some(2));

    session.execute("stop_scheduler", json!({})).await;
    session.close();
    Ok(())
}

#[tokio::test]
async fn stop_during_wait_for_is_prompt_and_idempotent() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    session.execute("create_schedule", json!({})).await;
    session
        .execute("add_schedule_item", json!({"action": "wait_for", "params": {"timer_sec": 600}}))
        .await;
    // A marker item that must never run once the stop lands.
    session.execute("add_schedule_item", json!({"action": "get_albums"})).await;

    let reply = session.execute("start_scheduler", json!({})).await;
    assert_eq!(reply["code"], 0);
    wait_scheduler_state(&session, "working", DEADLINE).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two stops in quick succession: the first wins, the second reports the
    // stop is already in progress and changes nothing.
    let (first, second) = tokio::join!(
        session.execute("stop_scheduler", json!({})),
        session.execute("stop_scheduler", json!({})),
    );
    assert_eq!(first["code"], 0, "first stop: {first}");
    assert_eq!(second["code"], -4, "second stop: {second}");

    wait_scheduler_state(&session, "stopped", Duration::from_secs(5)).await?;

    // The waiter unwound without reaching the marker item.
    assert_eq!(mock.count_method("get_albums").await, 0);

    // Stopping an idle scheduler reports not-running.
    let reply = session.execute("stop_scheduler", json!({})).await;
    assert_eq!(reply["code"], -3);

    session.close();
    Ok(())
}

#[tokio::test]
async fn mosaic_survives_a_connection_drop() -> anyhow::Result<()> {
    let options = MockOptions { drop_after_frames: Some(40), ..MockOptions::default() };
    let mock = MockDevice::start(options).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "start_mosaic",
            json!({
                "target_name": "R1",
                "ra": 10.0,
                "dec": 45.0,
                "is_j2000": false,
                "is_use_lp_filter": false,
                "session_time_sec": 100,
                "ra_num": 1,
                "dec_num": 1,
                "panel_overlap_percent": 20.0,
                "gain": 80,
            }),
        )
        .await;
    assert_eq!(reply["code"], 0);

    wait_scheduler_state(&session, "complete", DEADLINE).await?;

    assert!(mock.connections() >= 2, "expected a reconnect, got {}", mock.connections());
    assert!(mock.count_method("iscope_start_stack").await >= 1);
    let reply = session.execute("get_event_state", json!({"event_name": "scheduler"})).await;
    assert_eq!(reply["result"]["cur_scheduler_item"]["action"], "complete");

    session.close();
    Ok(())
}

#[tokio::test]
async fn event_state_demuxes_pi_status_and_synthesizes_scheduler() -> anyhow::Result<()> {
    let options = MockOptions { emit_pi_status: true, ..MockOptions::default() };
    let mock = MockDevice::start(options).await?;
    let session = Session::connect(mock.bridge_config());

    wait_event_key(&session, "PiStatus_temperature", DEADLINE).await?;
    wait_event_key(&session, "PiStatus_battery", DEADLINE).await?;

    let reply = session.execute("get_event_state", json!({})).await;
    assert_eq!(reply["result"]["PiStatus_temperature"]["temp"], 38.5);
    assert_eq!(reply["result"]["PiStatus_battery"]["battery_capacity"], 73);
    // The scheduler pseudo-event is synthesized from live state.
    assert_eq!(reply["result"]["scheduler"]["state"], "stopped");

    session.close();
    Ok(())
}

#[tokio::test]
async fn startup_sequence_runs_every_configured_step() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "start_up_sequence",
            json!({"auto_focus": true, "3ppa": true, "dark_frames": true}),
        )
        .await;
    assert_eq!(reply["code"], 0, "startup refused: {reply}");
    assert_eq!(reply["result"], "Sequence started.");

    // Starting again while the sequence runs is refused.
    let reply = session.execute("start_up_sequence", json!({})).await;
    assert_eq!(reply["code"], -1);

    wait_scheduler_state(&session, "complete", DEADLINE).await?;

    for method in [
        "pi_is_verified",
        "pi_set_time",
        "set_user_location",
        "set_stack_setting",
        "pi_output_set2",
        "scope_park",
        "start_auto_focuse",
        "start_polar_align",
        "stop_polar_align",
        "start_create_dark",
        "get_last_solve_result",
    ] {
        assert_eq!(mock.count_method(method).await, 1, "missing startup step {method}");
    }
    // The post-alignment re-anchor goto goes out as a device-native goto.
    assert_eq!(mock.count_method("iscope_start_view").await, 1);

    // The reported location came from the configured site.
    let locs = mock.requests_for("set_user_location").await;
    assert_eq!(locs[0]["params"]["lat"], 40.0);
    assert_eq!(locs[0]["params"]["lon"], -105.0);

    session.close();
    Ok(())
}

#[tokio::test]
async fn concurrent_sync_calls_get_distinct_increasing_ids() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let session = Arc::clone(&session);
        handles.push(tokio::spawn(async move {
            session.call_sync("test_connection", None).await
        }));
    }
    let mut returned_ids = BTreeSet::new();
    for handle in handles {
        let response = handle.await?;
        let id = response["id"].as_i64().unwrap_or(-1);
        assert!(id >= 10000, "unexpected request id {id} in {response}");
        returned_ids.insert(id);
    }
    assert_eq!(returned_ids.len(), 10, "request ids must be distinct");

    // In send order the ids are strictly increasing.
    let sent: Vec<i64> = mock
        .requests_for("test_connection")
        .await
        .iter()
        .filter_map(|req| req["id"].as_i64())
        .collect();
    assert_eq!(sent.len(), 10);
    assert!(sent.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {sent:?}");

    session.close();
    Ok(())
}
