// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spectra engine: one reference exposure on the star, then a fixed ladder
//! of declination offsets where the grating disperses the spectrum.
//!
//! Unlike the mosaic engine there is no plate-solve feedback; every move is
//! a plain motor slew.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::{CurrentItem, SpectraParams};
use crate::astro;
use crate::session::Session;

/// Declination offsets (degrees) above the star for each segment.
const SPACING_DEG: [f64; 8] = [5.3, 6.2, 6.5, 7.1, 8.0, 8.9, 9.2, 9.8];
/// Whether the LP filter is in the path for each segment.
const USE_LP: [bool; 8] = [false, false, true, false, false, false, true, false];

/// Seconds spent on the reference star before the offset ladder.
const STAR_SECONDS: u64 = 60;

pub(crate) async fn run(session: &Arc<Session>, params: SpectraParams) {
    let session_len = params.session_time_sec;
    let per_segment_s = session_len.saturating_sub(STAR_SECONDS) / SPACING_DEG.len() as u64;
    let mut time_remaining = session_len as i64;

    let item_id = {
        let sched = session.schedule.read().await;
        sched.current_item_id.map(|id| id.to_string()).unwrap_or_default()
    };
    let mut item = CurrentItem::stub("spectra", item_id, "slew to target");
    item.target_name = Some(params.target_name.clone());
    item.item_total_time_s = Some(session_len as i64);
    item.item_remaining_time_s = Some(time_remaining);
    session.set_cur_item(item).await;

    let (center_ra, center_dec) = if params.ra < 0.0 {
        let pointing = session.pointing().await;
        (pointing.ra, pointing.dec)
    } else {
        let (ra, dec) = astro::parse_coordinate(params.is_j2000, params.ra, params.dec);
        session.slew_to(ra, dec).await;
        (ra, dec)
    };

    if session.stop_token().await.is_cancelled() {
        return;
    }

    // One minute on the star itself as the wavelength reference.
    session.set_target_name(&format!("{}_star", params.target_name)).await;
    if !session.start_stack(params.gain, true).await {
        return;
    }
    session
        .update_cur_item(|item| {
            item.action = "stack for reference star for 60 seconds".to_owned();
        })
        .await;
    if !session.sleep_ticks(STAR_SECONDS).await {
        session.stop_stack().await;
        return;
    }
    session.stop_stack().await;
    time_remaining -= STAR_SECONDS as i64;
    session
        .update_cur_item(|item| item.item_remaining_time_s = Some(time_remaining))
        .await;

    for (index, (offset, use_lp)) in SPACING_DEG.iter().zip(USE_LP.iter()).enumerate() {
        if session.stop_token().await.is_cancelled() {
            return;
        }
        let cur_dec = center_dec + offset;

        session.call_sync("set_setting", Some(json!({"stack_lenhance": use_lp}))).await;
        session.slew_to(center_ra, cur_dec).await;
        session
            .set_target_name(&format!("{}_spec_{}", params.target_name, index + 1))
            .await;
        if !session.start_stack(params.gain, true).await {
            return;
        }
        session
            .update_cur_item(|item| {
                item.action = format!("stack for spectra at spacing index {index}");
            })
            .await;

        let mut count_down = per_segment_s as i64;
        while count_down > 0 {
            if !session.sleep_ticks(10).await {
                session.stop_stack().await;
                return;
            }
            count_down -= 10;
            time_remaining -= 10;
            session
                .update_cur_item(|item| item.item_remaining_time_s = Some(time_remaining.max(0)))
                .await;
        }
        session.stop_stack().await;
    }

    info!("finished spectra sequence");
    session
        .update_cur_item(|item| {
            item.item_remaining_time_s = Some(0);
            item.action = "complete".to_owned();
        })
        .await;
}
