// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Mosaic engine: tile a region with a grid of captures, slewing (and
//! optionally refocusing) per panel, then stacking for the panel's share of
//! the session time.

use std::sync::Arc;

use tracing::{info, warn};

use super::{CurrentItem, MosaicParams};
use crate::astro;
use crate::goto::GotoParams;
use crate::session::{CustomGotoState, Session};

pub(crate) async fn run(session: &Arc<Session>, params: MosaicParams) {
    if params.ra_num < 1 || params.dec_num < 1 {
        info!(
            ra_num = params.ra_num, dec_num = params.dec_num,
            "mosaic size is invalid, moving to next schedule item"
        );
        return;
    }

    let (mut center_ra, mut center_dec) = if params.ra == -1.0 && params.dec == -1.0 {
        let pointing = session.pointing().await;
        (pointing.ra, pointing.dec)
    } else {
        astro::parse_coordinate(params.is_j2000, params.ra, params.dec)
    };

    info!(
        target = %params.target_name,
        ra = center_ra,
        dec = center_dec,
        session_time_sec = params.session_time_sec,
        ra_num = params.ra_num,
        dec_num = params.dec_num,
        overlap = params.panel_overlap_percent,
        gain = params.gain,
        use_lp_filter = params.is_use_lp_filter,
        use_autofocus = params.is_use_autofocus,
        selected_panels = %params.selected_panels,
        num_tries = params.num_tries,
        retry_wait_s = params.retry_wait_s,
        "starting mosaic"
    );

    let (delta_ra, delta_dec) =
        astro::mosaic_next_center_spacing(center_ra, center_dec, params.panel_overlap_percent);

    let panel_set: Vec<&str> =
        params.selected_panels.split(';').filter(|s| !s.is_empty()).collect();
    let num_panels = if panel_set.is_empty() {
        (params.ra_num * params.dec_num) as usize
    } else {
        panel_set.len()
    };

    // Keep an even grid symmetric around the requested center.
    if params.ra_num % 2 == 0 {
        center_ra += delta_ra / 2.0;
    }
    if params.dec_num % 2 == 0 {
        center_dec += delta_dec / 2.0;
    }

    let per_panel_s = params.session_time_sec / u64::from(params.ra_num * params.dec_num);
    let mut item_remaining_s = (per_panel_s * num_panels as u64) as i64;

    let item_id = {
        let sched = session.schedule.read().await;
        sched.current_item_id.map(|id| id.to_string()).unwrap_or_default()
    };
    let mut item = CurrentItem::stub("mosaic", item_id, "start");
    item.target_name = Some(params.target_name.clone());
    item.item_total_time_s = Some(item_remaining_s);
    item.item_remaining_time_s = Some(item_remaining_s);
    session.set_cur_item(item).await;

    let mut cur_dec = center_dec - f64::from(params.dec_num / 2) * delta_dec;
    for index_dec in 0..params.dec_num {
        // RA spacing depends on the row's declination.
        let (row_delta_ra, _) =
            astro::mosaic_next_center_spacing(center_ra, cur_dec, params.panel_overlap_percent);
        let mut cur_ra = center_ra - f64::from(params.ra_num / 2) * row_delta_ra;

        for index_ra in 0..params.ra_num {
            if session.stop_token().await.is_cancelled() {
                info!("mosaic was requested to stop, stopping");
                return;
            }

            let panel = format!("{}{}", index_ra + 1, index_dec + 1);
            if !panel_set.is_empty() && !panel_set.contains(&panel.as_str()) {
                cur_ra += row_delta_ra;
                continue;
            }

            session
                .update_cur_item(|item| {
                    item.cur_ra_panel_num = Some(index_ra + 1);
                    item.cur_dec_panel_num = Some(index_dec + 1);
                })
                .await;

            let save_name = if params.ra_num == 1 && params.dec_num == 1 {
                params.target_name.clone()
            } else {
                format!("{}_{panel}", params.target_name)
            };
            info!(panel = %panel, ra = cur_ra, dec = cur_dec, save_name = %save_name, "mosaic goto for panel");

            // Stacking starts with the LP filter out; the panel's filter
            // choice is applied after the goto lands.
            session.set_lp_filter(false).await;

            for attempt in 1..=params.num_tries {
                session
                    .update_cur_item(|item| {
                        item.action = format!(
                            "attempt #{attempt} slewing to target panel centered at {cur_ra:.2}, {cur_dec:.2}"
                        );
                    })
                    .await;
                info!(attempt, "trying to reach target");
                if goto_panel(session, cur_ra, cur_dec, &save_name, &params).await {
                    break;
                }
                if attempt < params.num_tries && !session.sleep_ticks(params.retry_wait_s).await {
                    return;
                }
            }

            session
                .update_cur_item(|item| {
                    item.action = format!("stacking the panel for {per_panel_s} seconds");
                })
                .await;
            if !session.start_stack(params.gain, true).await {
                session
                    .update_cur_item(|item| item.action = "Failed to start stacking.".to_owned())
                    .await;
                return;
            }

            let mut panel_remaining_s = per_panel_s as i64;
            for _ in 0..(per_panel_s / 5) {
                if !session.sleep_ticks(5).await {
                    info!("scheduler was requested to stop, stopping current mosaic");
                    session
                        .update_cur_item(|item| {
                            item.action =
                                "Scheduler was requested to stop. Stopping current mosaic."
                                    .to_owned();
                        })
                        .await;
                    session.stop_stack().await;
                    return;
                }
                panel_remaining_s -= 5;
                item_remaining_s -= 5;
                session
                    .update_cur_item(|item| {
                        item.panel_remaining_time_s = Some(panel_remaining_s);
                        item.item_remaining_time_s = Some(item_remaining_s);
                    })
                    .await;
            }
            session.stop_stack().await;
            info!(save_name = %save_name, "stacking operation finished");

            cur_ra += row_delta_ra;
        }
        cur_dec += delta_dec;
    }

    info!("finished mosaic");
    session
        .update_cur_item(|item| {
            item.item_remaining_time_s = Some(0);
            item.action = "complete".to_owned();
        })
        .await;
}

/// Slew to one panel and get it ready for stacking: goto (custom path
/// included), optional autofocus, and the LP filter choice.
///
/// Autofocus failure is non-fatal; a failed custom goto is.
async fn goto_panel(
    session: &Arc<Session>,
    ra: f64,
    dec: f64,
    save_name: &str,
    params: &MosaicParams,
) -> bool {
    session
        .goto_target(GotoParams {
            ra,
            dec,
            is_j2000: false,
            target_name: save_name.to_owned(),
        })
        .await;
    let ok = session.await_event_terminal("goto_target").await;
    info!(ok, "goto operation finished");

    tokio::time::sleep(session.config.ticks(3)).await;

    if !ok {
        info!("goto failed");
        return false;
    }

    session.set_lp_filter(params.is_use_lp_filter).await;

    if params.is_use_autofocus {
        session.update_cur_item(|item| item.action = "auto focusing".to_owned()).await;
        if !session.try_auto_focus(2).await {
            info!("failed to auto focus, but will continue to next panel anyway");
        }
    }

    // A below-horizon goto hands the mount to the auto-center loop; stacking
    // must wait until that loop lets go.
    loop {
        let state = session.custom_goto_state();
        if state == CustomGotoState::Fail {
            warn!("custom goto failed before stacking, stopping this panel");
            return false;
        }
        if !state.is_active() {
            break;
        }
        if !session.sleep_ticks(3).await {
            return false;
        }
    }
    session.custom_goto.send_replace(CustomGotoState::Stopped);
    tokio::time::sleep(session.config.ticks(4)).await;
    true
}
