// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Starbridge: control and automation bridge for Seestar-class smart
//! telescopes.
//!
//! One [`session::Session`] per physical device supervises a persistent
//! line-delimited JSON-RPC socket, correlates responses, fans out the device
//! event stream, and drives the compound operations: scheduled mosaics,
//! spectra ladders, below-horizon gotos with plate-solve feedback, and the
//! startup sequence.

pub mod api;
pub mod astro;
pub mod config;
pub mod error;
pub mod goto;
pub mod protocol;
pub mod ring;
pub mod scheduler;
pub mod session;

use crate::config::BridgeConfig;
use crate::session::Session;

/// Run a bridge session until interrupted.
pub async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let session = Session::connect(config);
    tracing::info!(
        host = %session.config.host,
        port = session.config.port,
        "starbridge session started"
    );

    tokio::signal::ctrl_c().await?;
    session.close();
    Ok(())
}
