// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport task: owns the device TCP stream and serializes all traffic.
//!
//! - Outbound frames travel through one mpsc queue, which makes writers
//!   mutually exclusive by construction.
//! - A failed send closes the socket, reconnects once, and retries once;
//!   the caller learns the outcome through its ack channel.
//! - While `watching` is set, a dropped connection is re-established with a
//!   one-second floor between attempts. Clearing `watching` makes closure
//!   final.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{dispatcher, Session};
use crate::protocol;

/// One frame headed for the device, with an optional delivery ack.
pub(crate) struct OutboundFrame {
    pub payload: String,
    pub ack: Option<oneshot::Sender<bool>>,
}

/// Cheap handle held by the session; the transport task owns the socket.
pub(crate) struct TransportHandle {
    tx: mpsc::Sender<OutboundFrame>,
    connected: Arc<AtomicBool>,
    watching: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            tx,
            connected: Arc::new(AtomicBool::new(false)),
            watching: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Queue a frame and wait for the delivery outcome.
    pub async fn send(&self, payload: String) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let frame = OutboundFrame { payload, ack: Some(ack_tx) };
        if self.tx.send(frame).await.is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Queue a frame without waiting for delivery.
    pub async fn send_nowait(&self, payload: String) {
        let _ = self.tx.send(OutboundFrame { payload, ack: None }).await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub fn set_watching(&self, on: bool) {
        self.watching.store(on, Ordering::Release);
    }

    fn set_connected(&self, on: bool) {
        self.connected.store(on, Ordering::Release);
    }
}

/// What the select loop decided must happen outside the stream borrow.
enum Action {
    None,
    /// The peer closed or the read failed; drop the socket.
    Closed,
    /// A write failed mid-frame; reconnect once and retry this frame.
    Retry(OutboundFrame),
}

/// Spawn the transport run loop for a session.
pub(crate) fn spawn(session: Arc<Session>, rx: mpsc::Receiver<OutboundFrame>) {
    tokio::spawn(run_loop(session, rx));
}

async fn run_loop(session: Arc<Session>, mut rx: mpsc::Receiver<OutboundFrame>) {
    let mut stream: Option<TcpStream> = None;
    let mut buf = BytesMut::with_capacity(protocol::READ_CHUNK);

    loop {
        if session.shutdown.is_cancelled() {
            break;
        }

        let Some(sock) = stream.as_mut() else {
            if !session.transport.watching() {
                break;
            }
            match try_connect(&session).await {
                Some(sock) => {
                    info!(host = %session.config.host, port = session.config.port, "device connected");
                    session.transport.set_connected(true);
                    buf.clear();
                    stream = Some(sock);
                }
                None => {
                    // Floor between attempts so a dark device is not hammered.
                    tokio::select! {
                        _ = session.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                    }
                }
            }
            continue;
        };

        let mut action = Action::None;

        tokio::select! {
            _ = session.shutdown.cancelled() => break,

            // Outbound frames, serialized through this single writer.
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sock.write_all(frame.payload.as_bytes()).await.is_ok() {
                            if let Some(ack) = frame.ack {
                                let _ = ack.send(true);
                            }
                        } else {
                            action = Action::Retry(frame);
                        }
                    }
                    None => break,
                }
            }

            // Inbound bytes → frames → dispatcher.
            read = read_chunk(sock, &mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("device closed the connection");
                        action = Action::Closed;
                    }
                    Ok(_) => {
                        for frame in protocol::split_frames(&mut buf) {
                            dispatcher::handle_frame(&session, frame).await;
                        }
                    }
                    Err(e) => {
                        debug!(err = %e, "read socket error");
                        action = Action::Closed;
                    }
                }
            }
        }

        match action {
            Action::None => {}
            Action::Closed => {
                drop_stream(&session, &mut stream);
                if !session.transport.watching() {
                    break;
                }
            }
            Action::Retry(frame) => {
                debug!("send socket error, reconnecting once");
                drop_stream(&session, &mut stream);

                let mut ok = false;
                if session.transport.watching() {
                    if let Some(mut sock) = try_connect(&session).await {
                        ok = sock.write_all(frame.payload.as_bytes()).await.is_ok();
                        if ok {
                            session.transport.set_connected(true);
                            buf.clear();
                            stream = Some(sock);
                        }
                    }
                }
                if !ok {
                    warn!("send failed after reconnect retry");
                }
                if let Some(ack) = frame.ack {
                    let _ = ack.send(ok);
                }
                if stream.is_none() && !session.transport.watching() {
                    break;
                }
            }
        }
    }

    drop_stream(&session, &mut stream);
    debug!("transport task exited");
}

async fn read_chunk(sock: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<usize> {
    use tokio::io::AsyncReadExt;
    buf.reserve(protocol::READ_CHUNK);
    sock.read_buf(buf).await
}

fn drop_stream(session: &Arc<Session>, stream: &mut Option<TcpStream>) {
    if stream.take().is_some() {
        session.transport.set_connected(false);
    }
}

async fn try_connect(session: &Arc<Session>) -> Option<TcpStream> {
    let addr = format!("{}:{}", session.config.host, session.config.port);
    let connect = TcpStream::connect(&addr);
    match tokio::time::timeout(session.config.connect_timeout(), connect).await {
        Ok(Ok(sock)) => Some(sock),
        Ok(Err(e)) => {
            debug!(addr = %addr, err = %e, "connect failed");
            None
        }
        Err(_) => {
            debug!(addr = %addr, "connect timed out");
            None
        }
    }
}
