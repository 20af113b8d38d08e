// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device session: one per physical device, supervising the transport task,
//! the heartbeat, and whatever control loop (scheduler, goto, startup) is
//! active.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::ring::EventRing;
use crate::scheduler::{CurrentItem, Schedule};

pub mod command;
pub mod dispatcher;
pub mod heartbeat;
pub mod ops;
pub mod transport;

/// First request id issued by a fresh session.
pub const FIRST_REQUEST_ID: i64 = 10000;

/// Sentinel marking the plate-solve result as not-yet-received.
pub const SOLVE_SENTINEL: f64 = -9999.0;

/// Lowest declination (degrees) reachable before the below-horizon offset
/// logic kicks in; also the safe parking declination when clearing an offset.
pub const SAFE_DEC_DEG: f64 = 10.0;

/// Bound on the pending-response map; oldest entries are evicted beyond this.
pub(crate) const PENDING_CAPACITY: usize = 100;

/// Which event stream observes the current goto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoMode {
    /// Device-native goto; observed via `AutoGoto`.
    Standard,
    /// Custom below-horizon goto; observed via `ScopeGoto`.
    BelowHorizon,
}

impl GotoMode {
    /// Event name carrying this goto's progress.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Standard => "AutoGoto",
            Self::BelowHorizon => "ScopeGoto",
        }
    }
}

/// State of the custom below-horizon goto loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomGotoState {
    Stopped,
    Start,
    Working,
    Complete,
    Fail,
    Stopping,
}

impl CustomGotoState {
    /// True while the auto-center loop still owns the mount.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Start | Self::Working)
    }
}

/// A celestial pointing: RA in hours, Dec in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pointing {
    pub ra: f64,
    pub dec: f64,
}

/// Observing site coordinates, degrees.
#[derive(Debug, Clone, Copy, Default)]
pub struct Site {
    pub lat: f64,
    pub lon: f64,
}

/// Responses awaiting pickup, plus callers blocked on a specific id.
///
/// Single writer (the dispatcher). A response either completes a registered
/// waiter directly or parks in the bounded map until read or evicted.
pub(crate) struct PendingResponses {
    pub responses: IndexMap<i64, Value>,
    pub waiters: HashMap<i64, oneshot::Sender<Value>>,
}

impl PendingResponses {
    fn new() -> Self {
        Self { responses: IndexMap::new(), waiters: HashMap::new() }
    }

    /// Deliver a response: wake the waiter if one is registered, otherwise
    /// park it, evicting the oldest entry when full.
    pub fn deliver(&mut self, id: i64, response: Value) {
        if let Some(tx) = self.waiters.remove(&id) {
            let _ = tx.send(response);
            return;
        }
        if self.responses.len() >= PENDING_CAPACITY {
            self.responses.shift_remove_index(0);
        }
        self.responses.insert(id, response);
    }
}

/// A supervised session against one device.
pub struct Session {
    pub config: BridgeConfig,
    /// Cancelling this token ends the session (transport, heartbeat, loops).
    pub shutdown: CancellationToken,

    pub(crate) cmdid: AtomicI64,
    pub(crate) pending: Mutex<PendingResponses>,
    pub(crate) event_state: RwLock<HashMap<String, Value>>,
    /// Bumped by the dispatcher after every stored event; terminal-state
    /// waiters block on this instead of polling.
    pub(crate) event_seq: watch::Sender<u64>,
    pub(crate) event_ring: Mutex<EventRing>,
    pub(crate) event_bus: broadcast::Sender<Value>,

    pub(crate) pointing: RwLock<Pointing>,
    pub(crate) view_state: RwLock<Value>,
    pub(crate) solve: RwLock<Pointing>,
    pub(crate) dec_offset: RwLock<f64>,
    pub(crate) goto_mode: RwLock<GotoMode>,
    pub(crate) custom_goto: watch::Sender<CustomGotoState>,

    pub(crate) schedule: RwLock<Schedule>,
    pub(crate) cur_item: RwLock<CurrentItem>,
    /// Per-run scheduler stop token, replaced by each `start_scheduler`.
    pub(crate) stop: RwLock<CancellationToken>,
    pub(crate) site: RwLock<Site>,

    pub(crate) transport: transport::TransportHandle,
}

impl Session {
    /// Build a session and spawn its transport and heartbeat tasks.
    ///
    /// The socket connects lazily; an unreachable device leaves the session
    /// in offline mode, reconnecting in the background.
    pub fn connect(config: BridgeConfig) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(64);
        let (event_seq, _) = watch::channel(0u64);
        let (event_bus, _) = broadcast::channel(256);
        let (custom_goto, _) = watch::channel(CustomGotoState::Stopped);

        let site = Site { lat: config.site_lat, lon: config.site_lon };

        let session = Arc::new(Self {
            shutdown: shutdown.clone(),
            cmdid: AtomicI64::new(FIRST_REQUEST_ID),
            pending: Mutex::new(PendingResponses::new()),
            event_state: RwLock::new(HashMap::new()),
            event_seq,
            event_ring: Mutex::new(EventRing::new(20)),
            event_bus,
            pointing: RwLock::new(Pointing::default()),
            view_state: RwLock::new(Value::Null),
            solve: RwLock::new(Pointing { ra: SOLVE_SENTINEL, dec: SOLVE_SENTINEL }),
            dec_offset: RwLock::new(0.0),
            goto_mode: RwLock::new(GotoMode::Standard),
            custom_goto,
            schedule: RwLock::new(Schedule::new()),
            cur_item: RwLock::new(CurrentItem::default()),
            stop: RwLock::new(CancellationToken::new()),
            site: RwLock::new(site),
            transport: transport::TransportHandle::new(out_tx),
            config,
        });

        transport::spawn(Arc::clone(&session), out_rx);
        heartbeat::spawn(Arc::clone(&session));

        session
    }

    /// End the session: stop reconnecting and wind down all tasks.
    pub fn close(&self) {
        tracing::info!(host = %self.config.host, "closing session");
        self.transport.set_watching(false);
        self.shutdown.cancel();
    }

    /// Last known pointing in the displayed (offset-removed) frame.
    pub async fn pointing(&self) -> Pointing {
        *self.pointing.read().await
    }

    /// Current below-horizon declination offset in degrees.
    pub async fn dec_offset(&self) -> f64 {
        *self.dec_offset.read().await
    }

    /// Latest plate-solve position; RA below -1000 means no solve yet.
    pub async fn solve_position(&self) -> Pointing {
        *self.solve.read().await
    }

    /// Current state of the custom below-horizon goto loop.
    pub fn custom_goto_state(&self) -> CustomGotoState {
        *self.custom_goto.borrow()
    }

    /// Subscribe to the raw device event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.event_bus.subscribe()
    }

    /// Pop the oldest buffered event, if any. Streaming-push adapters drain
    /// this queue; slow consumers lose the oldest events, never the newest.
    pub async fn next_event(&self) -> Option<Value> {
        self.event_ring.lock().await.pop()
    }

    /// Latest device view state, as reported by `get_view_state`.
    pub async fn view_state(&self) -> Value {
        self.view_state.read().await.clone()
    }

    /// Observing site, as currently known.
    pub async fn site(&self) -> Site {
        *self.site.read().await
    }

    pub(crate) async fn stop_token(&self) -> CancellationToken {
        self.stop.read().await.clone()
    }

    /// Sleep for `ticks` control-loop ticks, returning early (false) when the
    /// scheduler stop token fires.
    pub(crate) async fn sleep_ticks(&self, ticks: u64) -> bool {
        let stop = self.stop_token().await;
        tokio::select! {
            _ = stop.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.ticks(ticks)) => true,
        }
    }
}
