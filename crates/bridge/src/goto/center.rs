// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auto-center loop: after the biased slew, iterate plate-solve → sync →
//! re-slew until the solved position converges on the target.

use std::sync::Arc;

use tracing::{info, warn};

use crate::session::{CustomGotoState, Pointing, Session, SOLVE_SENTINEL};

/// Convergence tolerance, in squared degrees. Part of the contract.
const CONVERGE_TOLERANCE: f64 = 1.0e-3;

/// Consecutive plate-solve failures tolerated before giving up.
const MAX_SOLVE_FAILURES: u32 = 5;

/// Re-slew attempts before giving up.
const MAX_RESLEW: u32 = 7;

pub(crate) async fn auto_center(session: Arc<Session>, target_ra: f64, target_dec: f64) {
    info!(ra = target_ra, dec = target_dec, "in auto center logic");

    clear_solve(&session).await;
    session.custom_goto.send_replace(CustomGotoState::Working);
    let stop = session.stop_token().await;

    let mut solve_failures: u32 = 0;
    let mut reslew_count: u32 = 0;

    loop {
        if stop_requested(&session, &stop) {
            info!("auto center stopped because a stop was requested");
            session.custom_goto.send_replace(CustomGotoState::Stopped);
            return;
        }

        // Let the preview settle before asking for a solve.
        tokio::time::sleep(session.config.ticks(1)).await;

        clear_solve(&session).await;
        session.call_async("start_solve", None).await;

        // The dispatcher fills in the solve when the PlateSolve event lands.
        let solve = loop {
            if stop_requested(&session, &stop) {
                info!("auto center stopped while waiting for plate solve");
                session.custom_goto.send_replace(CustomGotoState::Stopped);
                return;
            }
            let solve = session.solve_position().await;
            if solve.ra > -1000.0 {
                break solve;
            }
            tokio::time::sleep(session.config.ticks(1)).await;
        };

        if solve.ra == 0.0 && solve.dec == 0.0 {
            solve_failures += 1;
            if solve_failures > MAX_SOLVE_FAILURES {
                warn!(solve_failures, "auto center failed: too many plate solve failures");
                session.custom_goto.send_replace(CustomGotoState::Fail);
                return;
            }
            warn!(attempt = solve_failures, "failed to plate solve current position, will try again");
            continue;
        }
        solve_failures = 0;

        let delta_ra = solve.ra - target_ra;
        let delta_dec = solve.dec - target_dec;
        if delta_ra * delta_ra + delta_dec * delta_dec < CONVERGE_TOLERANCE {
            info!("auto center completed");
            session.custom_goto.send_replace(CustomGotoState::Complete);
            return;
        }

        if reslew_count >= MAX_RESLEW {
            warn!(reslew_count, "auto center failed: could not converge on target");
            session.custom_goto.send_replace(CustomGotoState::Fail);
            return;
        }
        reslew_count += 1;
        warn!(attempt = reslew_count, "not close enough to target, syncing and re-slewing");
        session.sync_to(solve.ra, solve.dec).await;
        session.slew_to(target_ra, target_dec).await;
    }
}

async fn clear_solve(session: &Arc<Session>) {
    *session.solve.write().await = Pointing { ra: SOLVE_SENTINEL, dec: SOLVE_SENTINEL };
}

fn stop_requested(session: &Arc<Session>, stop: &tokio_util::sync::CancellationToken) -> bool {
    stop.is_cancelled()
        || session.shutdown.is_cancelled()
        || session.custom_goto_state() == CustomGotoState::Stopping
}
