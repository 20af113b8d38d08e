// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness: a scriptable mock device speaking the line-delimited
//! JSON-RPC protocol over real TCP.
//!
//! The mock acknowledges every request, tracks its device-frame pointing
//! (`scope_goto` / `scope_sync` / `iscope_start_view` move it), and emits the
//! event sequences the bridge's control loops wait on: `AutoGoto`,
//! `ScopeGoto`, `ScopeHome`, `AutoFocus`, `PlateSolve`, and friends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use starbridge::config::BridgeConfig;
use starbridge::session::{CustomGotoState, Session};

/// How the mock answers `start_solve`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolveBehavior {
    /// Solve at the physical pointing (device pointing + `solve_dec_bias`).
    AtPointing,
    /// Solve off-target by a fixed declination error; never converges.
    Offset(f64),
    /// Every solve fails.
    Fail,
}

/// Mock behavior knobs.
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub solve: SolveBehavior,
    /// Added to the device-frame declination when reporting plate solves.
    /// Mirrors the physical pointing sitting below the device's model by the
    /// below-horizon offset.
    pub solve_dec_bias: f64,
    /// Close the connection after answering this many requests (once).
    pub drop_after_frames: Option<usize>,
    /// Delay between goto start and its terminal event.
    pub goto_delay_ms: u64,
    /// Emit a pair of PiStatus telemetry events on connect.
    pub emit_pi_status: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            solve: SolveBehavior::AtPointing,
            solve_dec_bias: 0.0,
            drop_after_frames: None,
            goto_delay_ms: 20,
            emit_pi_status: false,
        }
    }
}

struct DeviceState {
    options: MockOptions,
    /// Device-frame pointing (RA hours, Dec degrees) as the model sees it.
    pointing: Mutex<(f64, f64)>,
    /// Horizon-frame position, consumed by the startup aim loop.
    horiz: Mutex<(f64, f64)>,
    journal: Mutex<Vec<Value>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    frames_seen: AtomicUsize,
    dropped: AtomicBool,
    connections: AtomicUsize,
}

/// A running mock device. Killed when dropped.
pub struct MockDevice {
    port: u16,
    state: Arc<DeviceState>,
}

impl MockDevice {
    pub async fn start(options: MockOptions) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(DeviceState {
            options,
            // Parked well above the celestial horizon.
            pointing: Mutex::new((0.0, 45.0)),
            horiz: Mutex::new((60.0, 20.0)),
            journal: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            frames_seen: AtomicUsize::new(0),
            dropped: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_conn(state, sock).await;
                });
            }
        });

        Ok(Self { port, state })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A bridge config wired at this mock, with compressed ticks.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            host: "127.0.0.1".to_owned(),
            port: self.port,
            connect_timeout_ms: 1000,
            site_lat: 40.0,
            site_lon: -105.0,
            eq_mode: true,
            gain: 80,
            expo_stack_ms: 10000,
            expo_preview_ms: 500,
            dither_pix: 50,
            dither_interval: 5,
            dither_enabled: true,
            lp_filter: false,
            dew_heater_power: 0,
            save_good_frames: true,
            save_all_frames: false,
            aim_lat: 60.0,
            aim_lon: 20.0,
            time_zone: None,
            tick_ms: 10,
        }
    }

    /// All requests received so far.
    pub async fn requests(&self) -> Vec<Value> {
        self.state.journal.lock().await.clone()
    }

    /// Requests for one method.
    pub async fn requests_for(&self, method: &str) -> Vec<Value> {
        self.state
            .journal
            .lock()
            .await
            .iter()
            .filter(|req| req["method"] == method)
            .cloned()
            .collect()
    }

    pub async fn count_method(&self, method: &str) -> usize {
        self.requests_for(method).await.len()
    }

    /// Target names set through `iscope_start_view` (standard gotos).
    pub async fn view_target_names(&self) -> Vec<String> {
        self.requests_for("iscope_start_view")
            .await
            .iter()
            .filter_map(|req| req["params"]["target_name"].as_str().map(str::to_owned))
            .collect()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Device-frame pointing as the mock's model currently has it.
    pub async fn device_pointing(&self) -> (f64, f64) {
        *self.state.pointing.lock().await
    }
}

async fn handle_conn(state: Arc<DeviceState>, sock: TcpStream) -> anyhow::Result<()> {
    let (read_half, write_half) = sock.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    *state.writer.lock().await = Some(tx.clone());
    tokio::spawn(writer_task(write_half, rx));

    if state.options.emit_pi_status {
        let _ = tx.send(json!({"Event": "PiStatus", "Timestamp": "1.0", "temp": 38.5}));
        let _ = tx.send(json!({
            "Event": "PiStatus", "Timestamp": "1.1",
            "battery_capacity": 73, "charger_status": "Discharging",
        }));
    }

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let Ok(request) = serde_json::from_str::<Value>(text) else { continue };
        state.journal.lock().await.push(request.clone());

        respond(&state, &tx, &request).await;

        let seen = state.frames_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = state.options.drop_after_frames {
            if seen >= limit && !state.dropped.swap(true, Ordering::SeqCst) {
                // One-shot fault injection: answer, flush, then vanish.
                tokio::time::sleep(Duration::from_millis(30)).await;
                *state.writer.lock().await = None;
                break;
            }
        }
    }
    Ok(())
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(value) = rx.recv().await {
        let mut text = value.to_string();
        text.push_str("\r\n");
        if write_half.write_all(text.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn response(method: &str, id: i64, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "Timestamp": "100.000000000",
        "method": method,
        "result": result,
        "code": 0,
        "id": id,
    })
}

async fn respond(state: &Arc<DeviceState>, tx: &mpsc::UnboundedSender<Value>, request: &Value) {
    let method = request["method"].as_str().unwrap_or_default().to_owned();
    let id = request["id"].as_i64().unwrap_or(0);
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let result = match method.as_str() {
        "scope_get_equ_coord" => {
            let (ra, dec) = *state.pointing.lock().await;
            json!({"ra": ra, "dec": dec})
        }
        "scope_goto" => {
            if let (Some(ra), Some(dec)) = (params[0].as_f64(), params[1].as_f64()) {
                *state.pointing.lock().await = (ra, dec);
            }
            spawn_goto_events(state, tx, "ScopeGoto");
            json!(0)
        }
        "iscope_start_view" => {
            let pair = &params["target_ra_dec"];
            if let (Some(ra), Some(dec)) = (pair[0].as_f64(), pair[1].as_f64()) {
                *state.pointing.lock().await = (ra, dec);
            }
            spawn_goto_events(state, tx, "AutoGoto");
            json!(0)
        }
        "scope_sync" => {
            if let (Some(ra), Some(dec)) = (params[0].as_f64(), params[1].as_f64()) {
                *state.pointing.lock().await = (ra, dec);
            }
            json!(0)
        }
        "scope_park" => {
            spawn_terminal_event(tx, "ScopeHome", state.options.goto_delay_ms);
            json!(0)
        }
        "start_auto_focuse" => {
            spawn_terminal_event(tx, "AutoFocus", state.options.goto_delay_ms);
            json!(0)
        }
        "start_create_dark" => {
            spawn_terminal_event(tx, "DarkLibrary", state.options.goto_delay_ms);
            json!(0)
        }
        "start_solve" => {
            spawn_solve_event(state, tx);
            json!(0)
        }
        "get_last_solve_result" => {
            let (ra, dec) = *state.pointing.lock().await;
            json!({"ra_dec": [ra, dec + state.options.solve_dec_bias]})
        }
        "get_device_state" => json!({"setting": {"offset_deg_3ppa": 0.1}}),
        "start_polar_align" => {
            let tx = tx.clone();
            let delay = state.options.goto_delay_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(json!({
                    "Event": "3PPA", "Timestamp": "100.0",
                    "state": "working", "percent": 100.0,
                }));
            });
            json!(0)
        }
        "scope_get_horiz_coord" => {
            let (lat, lon) = *state.horiz.lock().await;
            json!([lat, lon])
        }
        "get_view_state" => json!({"View": {"state": "idle"}}),
        _ => json!(0),
    };

    let _ = tx.send(response(&method, id, result));
}

/// `working` then `complete` for a goto-style event.
fn spawn_goto_events(state: &Arc<DeviceState>, tx: &mpsc::UnboundedSender<Value>, name: &str) {
    let tx = tx.clone();
    let name = name.to_owned();
    let delay = state.options.goto_delay_ms;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay / 2 + 1)).await;
        let _ = tx.send(json!({"Event": name, "Timestamp": "100.0", "state": "working"}));
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let _ = tx.send(json!({"Event": name, "Timestamp": "100.1", "state": "complete"}));
    });
}

fn spawn_terminal_event(tx: &mpsc::UnboundedSender<Value>, name: &str, delay_ms: u64) {
    let tx = tx.clone();
    let name = name.to_owned();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let _ = tx.send(json!({"Event": name, "Timestamp": "100.0", "state": "complete"}));
    });
}

fn spawn_solve_event(state: &Arc<DeviceState>, tx: &mpsc::UnboundedSender<Value>) {
    let tx = tx.clone();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (ra, dec) = *state.pointing.lock().await;
        let event = match state.options.solve {
            SolveBehavior::AtPointing => json!({
                "Event": "PlateSolve", "Timestamp": "100.0", "state": "complete",
                "result": {"ra_dec": [ra, dec + state.options.solve_dec_bias]},
            }),
            SolveBehavior::Offset(err) => json!({
                "Event": "PlateSolve", "Timestamp": "100.0", "state": "complete",
                "result": {"ra_dec": [ra, dec + state.options.solve_dec_bias + err]},
            }),
            SolveBehavior::Fail => json!({
                "Event": "PlateSolve", "Timestamp": "100.0", "state": "fail",
                "error": "solve failed", "code": 251,
            }),
        };
        let _ = tx.send(event);
    });
}

/// Current state string of the synthesized `scheduler` pseudo-event.
pub async fn scheduler_state(session: &Arc<Session>) -> String {
    let reply = session.execute("get_event_state", json!({"event_name": "scheduler"})).await;
    reply["result"]["state"].as_str().unwrap_or_default().to_owned()
}

/// Poll the scheduler pseudo-event until it reaches `want`.
pub async fn wait_scheduler_state(
    session: &Arc<Session>,
    want: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = scheduler_state(session).await;
        if state == want {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("scheduler never reached {want:?} (last: {state:?}) in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the scheduler is executing the item at 1-based `want`.
pub async fn wait_item_number(
    session: &Arc<Session>,
    want: i64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let reply = session.execute("get_event_state", json!({"event_name": "scheduler"})).await;
        if reply["result"]["item_number"].as_i64() == Some(want) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("scheduler never reached item {want} in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the custom below-horizon goto loop reaches `want`.
pub async fn wait_custom_goto(
    session: &Arc<Session>,
    want: CustomGotoState,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = session.custom_goto_state();
        if state == want {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("custom goto never reached {want:?} (last: {state:?}) in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the below-horizon declination offset equals `want`.
pub async fn wait_dec_offset(
    session: &Arc<Session>,
    want: f64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let offset = session.dec_offset().await;
        if (offset - want).abs() < 1e-9 {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("dec offset never reached {want} (last: {offset}) in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the displayed (offset-removed) declination reads `want`.
pub async fn wait_pointing_dec(
    session: &Arc<Session>,
    want: f64,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let dec = session.pointing().await.dec;
        if (dec - want).abs() < 1e-6 {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("pointing dec never reached {want} (last: {dec}) in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until no goto is in flight.
pub async fn wait_goto_idle(session: &Arc<Session>, timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !session.is_goto().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("goto never went idle in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `get_event_state` carries the named key.
pub async fn wait_event_key(
    session: &Arc<Session>,
    key: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let reply = session.execute("get_event_state", json!({})).await;
        if reply["result"].get(key).is_some() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("event {key:?} never arrived in {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
