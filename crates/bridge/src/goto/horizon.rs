// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Below-horizon declination offset.
//!
//! The device assumes an alt-az mount and rejects targets under its celestial
//! horizon. A positive offset biases every outgoing declination up and every
//! incoming declination back down, so the device tracks a southern target
//! while believing it is high in the sky. The device's star map is kept
//! consistent with a `scope_sync` at each offset change.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::protocol;
use crate::session::{Session, SAFE_DEC_DEG};

/// Highest device-frame declination the offset may push the model to.
const MAX_FAKED_DEC: f64 = 70.0;

impl Session {
    /// Apply a below-horizon declination offset.
    ///
    /// Preconditions: `offset > 0`; when starting from zero the offset must
    /// stay below `90 − site latitude`. If the faked declination would exceed
    /// 70° the mount is first brought back to a safe position and the offset
    /// recomputed for the target.
    pub async fn set_dec_offset(self: &Arc<Self>, offset: f64, target_dec: f64) -> anyhow::Result<()> {
        anyhow::ensure!(offset > 0.0, "offset must be greater than 0: {offset}");

        let site = self.site().await;
        let current = self.dec_offset().await;
        if current == 0.0 && offset > 90.0 - site.lat {
            anyhow::bail!(
                "cannot set dec offset that high: {offset}; it must be less than 90 - site latitude"
            );
        }

        let mut offset = offset;
        if self.pointing().await.dec + offset > MAX_FAKED_DEC {
            // Cannot fake the position that high; park at a safe declination
            // first, then use the smallest offset that reaches the target.
            self.reset_dec_offset()
                .await
                .context("failed to reset dec offset before applying a large offset")?;
            offset = -target_dec + SAFE_DEC_DEG;
        }

        let old = self.pointing().await;
        *self.dec_offset.write().await = offset;

        let result = self.sync_to(old.ra, old.dec).await;
        if protocol::is_error_response(&result) {
            // Revert: clear the offset and restore the unbiased sync.
            *self.dec_offset.write().await = 0.0;
            self.sync_to(old.ra, old.dec).await;
            warn!(%result, "failed to set dec offset; move the mount up first?");
            anyhow::bail!("failed to sync after applying dec offset");
        }

        info!(offset, "below-horizon dec offset applied");
        Ok(())
    }

    /// Clear the offset: slew back to the safe declination (bias still
    /// applied), zero the offset, and re-sync there.
    ///
    /// Explicitly a success when there is nothing to do (not in EQ mode, or
    /// no offset active).
    pub async fn reset_dec_offset(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.config.eq_mode {
            return Ok(());
        }
        let offset = self.dec_offset().await;
        if offset == 0.0 {
            return Ok(());
        }

        let old = self.pointing().await;
        info!(ra = old.ra, dec = old.dec, offset, "resetting dec offset");

        if !self.slew_to(old.ra, SAFE_DEC_DEG).await {
            anyhow::bail!("failed to move back from the offset");
        }

        *self.dec_offset.write().await = 0.0;
        info!(ra = old.ra, dec = SAFE_DEC_DEG, "syncing at safe declination");
        let response = self.sync_to(old.ra, SAFE_DEC_DEG).await;
        if protocol::is_error_response(&response) {
            anyhow::bail!("failed to sync after clearing dec offset");
        }
        tokio::time::sleep(self.config.ticks(2)).await;
        Ok(())
    }
}
