// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end goto tests: the below-horizon offset path with plate-solve
//! feedback, convergence, and the bounded give-up.

use std::time::Duration;

use serde_json::json;

use starbridge::session::{CustomGotoState, Session};
use starbridge_specs::{
    wait_custom_goto, wait_dec_offset, wait_goto_idle, wait_pointing_dec, wait_scheduler_state,
    MockDevice, MockOptions, SolveBehavior,
};

const DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn below_horizon_goto_converges_in_one_iteration() -> anyhow::Result<()> {
    // Site latitude 40°, target dec -25°: offset becomes 25 + 10 = 35. The
    // physical sky sits 35° below the device model, which the solve reports.
    let options = MockOptions {
        solve: SolveBehavior::AtPointing,
        solve_dec_bias: -35.0,
        ..MockOptions::default()
    };
    let mock = MockDevice::start(options).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "goto_target",
            json!({"ra": 5.0, "dec": -25.0, "is_j2000": false, "target_name": "LowTarget"}),
        )
        .await;
    assert_eq!(reply["code"], 0);

    wait_custom_goto(&session, CustomGotoState::Complete, DEADLINE).await?;

    assert_eq!(session.dec_offset().await, 35.0);

    // The slew went out in the device frame: dec = -25 + 35 = 10.
    let slews = mock.requests_for("scope_goto").await;
    assert_eq!(slews.len(), 1, "converged goto needs exactly one slew: {slews:?}");
    let sent_dec = slews[0]["params"][1].as_f64().unwrap_or(0.0);
    assert!((sent_dec - 10.0).abs() < 1e-9, "slew dec was {sent_dec}");

    // One solve was enough; no corrective sync beyond the offset apply.
    assert_eq!(mock.count_method("start_solve").await, 1);
    assert_eq!(mock.count_method("scope_sync").await, 1);

    // The displayed pointing surfaces with the bias removed.
    wait_pointing_dec(&session, -25.0, DEADLINE).await?;

    session.close();
    Ok(())
}

#[tokio::test]
async fn auto_center_gives_up_after_bounded_reslew() -> anyhow::Result<()> {
    // Every solve lands 2° off target: the loop can never converge.
    let options = MockOptions {
        solve: SolveBehavior::Offset(2.0),
        solve_dec_bias: -35.0,
        ..MockOptions::default()
    };
    let mock = MockDevice::start(options).await?;
    let session = Session::connect(mock.bridge_config());

    session
        .execute(
            "goto_target",
            json!({"ra": 5.0, "dec": -25.0, "is_j2000": false, "target_name": "NoConverge"}),
        )
        .await;

    wait_custom_goto(&session, CustomGotoState::Fail, DEADLINE).await?;

    // One initial slew plus at most seven corrective re-slews.
    let slews = mock.count_method("scope_goto").await;
    assert_eq!(slews, 8, "expected 1 + 7 slews, got {slews}");

    session.close();
    Ok(())
}

#[tokio::test]
async fn below_horizon_mosaic_resets_offset_on_completion() -> anyhow::Result<()> {
    let options = MockOptions {
        solve: SolveBehavior::AtPointing,
        solve_dec_bias: -35.0,
        ..MockOptions::default()
    };
    let mock = MockDevice::start(options).await?;
    let session = Session::connect(mock.bridge_config());

    let reply = session
        .execute(
            "start_mosaic",
            json!({
                "target_name": "South1",
                "ra": 5.0,
                "dec": -25.0,
                "is_j2000": false,
                "is_use_lp_filter": false,
                "session_time_sec": 50,
                "ra_num": 1,
                "dec_num": 1,
                "panel_overlap_percent": 20.0,
                "gain": 80,
            }),
        )
        .await;
    assert_eq!(reply["code"], 0);

    // The offset engages for the panel goto, and while captured the
    // displayed declination reads the true target.
    wait_dec_offset(&session, 35.0, DEADLINE).await?;
    wait_pointing_dec(&session, -25.0, DEADLINE).await?;

    wait_scheduler_state(&session, "complete", DEADLINE).await?;

    // Scheduler completion clears the offset and parks the model at the safe
    // declination.
    assert_eq!(session.dec_offset().await, 0.0);
    let (_, device_dec) = mock.device_pointing().await;
    assert!((device_dec - 10.0).abs() < 1e-9, "device should rest at safe dec, got {device_dec}");
    wait_pointing_dec(&session, 10.0, DEADLINE).await?;

    // A 1x1 grid saves under the bare target name (the custom path names the
    // capture group explicitly).
    let groups: Vec<String> = mock
        .requests_for("set_sequence_setting")
        .await
        .iter()
        .filter_map(|req| req["params"][0]["group_name"].as_str().map(str::to_owned))
        .collect();
    assert!(groups.contains(&"South1".to_owned()), "capture group not named: {groups:?}");

    session.close();
    Ok(())
}

#[tokio::test]
async fn goto_below_site_reach_is_rejected() -> anyhow::Result<()> {
    let mock = MockDevice::start(MockOptions::default()).await?;
    let session = Session::connect(mock.bridge_config());

    // Site latitude is 40: dec -55 is out of reach.
    session
        .execute(
            "goto_target",
            json!({"ra": 5.0, "dec": -55.0, "is_j2000": false, "target_name": "TooLow"}),
        )
        .await;

    // The goto task rejects without touching the mount.
    wait_goto_idle(&session, Duration::from_secs(5)).await?;
    assert_eq!(mock.count_method("scope_goto").await, 0);
    assert_eq!(mock.count_method("iscope_start_view").await, 0);
    assert_eq!(session.dec_offset().await, 0.0);

    session.close();
    Ok(())
}
