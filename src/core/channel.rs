//! Realtime event channel to the backend.
//!
//! Transports are tried in order; the first one to complete the Engine.IO
//! open and the Socket.IO connect within the handshake timeout carries the
//! session. There is no reconnect: a dropped transport ends the channel with
//! `connection-lost`, a failed handshake with a single `connection-failed`.

use crate::core::events::ChannelEvent;
use crate::core::model::{CourseFetchProgress, Progress, Severity, User};
use crate::plugins::engineio::{Packet, SocketPacket};
use crate::plugins::registry::{Transport, TransportContext, TransportLink};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const PROBE_EVENT: &str = "test_connection";
pub const DEFAULT_PROBE_MESSAGE: &str = "Hello from CourseDownloader";

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ctx: TransportContext,
    pub probe_message: String,
}

type Outbound = Arc<Mutex<Option<mpsc::Sender<Packet>>>>;

pub struct ChannelHandle {
    events: broadcast::Sender<ChannelEvent>,
    outbound: Outbound,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelHandle {
    /// Starts connecting in the background. The returned receiver is
    /// subscribed before the first event can be sent.
    pub fn open(
        base: Url,
        transports: Vec<Arc<dyn Transport>>,
        opts: ChannelOptions,
    ) -> (Self, broadcast::Receiver<ChannelEvent>) {
        let (events, first_rx) = broadcast::channel(256);
        let outbound: Outbound = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let driver = tokio::spawn(drive(
            base,
            transports,
            opts,
            events.clone(),
            outbound.clone(),
            shutdown.clone(),
        ));

        let handle = Self { events, outbound, shutdown, tasks: Mutex::new(vec![driver]) };
        (handle, first_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().map(|o| o.is_some()).unwrap_or(false)
    }

    /// Sends a named event with a JSON payload.
    pub async fn send(&self, name: &str, payload: Value) -> anyhow::Result<()> {
        let tx = self
            .outbound
            .lock()
            .map_err(|_| anyhow::anyhow!("channel state poisoned"))?
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel is not connected"))?;
        tx.send(SocketPacket::event(name, payload).into_packet())
            .await
            .with_context(|| format!("send {name}"))
    }

    /// Runs `callback` for every event whose [`ChannelEvent::name`] is `name`
    /// until the channel is closed.
    pub fn on_event<F>(&self, name: &'static str, callback: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let mut rx = self.events.subscribe();
        let stop = self.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    ev = rx.recv() => ev,
                };
                match ev {
                    Ok(ev) if ev.name() == name => callback(&ev),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, event = name, "listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Releases the transport. Listeners have stopped when this returns.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut t) => t.drain(..).collect(),
            Err(_) => vec![],
        };
        for t in tasks {
            t.abort();
            let _ = t.await;
        }
        if let Ok(mut o) = self.outbound.lock() {
            o.take();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(tasks) = self.tasks.lock() {
            for t in tasks.iter() {
                t.abort();
            }
        }
    }
}

async fn drive(
    base: Url,
    transports: Vec<Arc<dyn Transport>>,
    opts: ChannelOptions,
    events: broadcast::Sender<ChannelEvent>,
    outbound: Outbound,
    shutdown: CancellationToken,
) {
    let mut failures = vec![];
    let mut connected = None;
    for transport in &transports {
        let attempt = tokio::time::timeout(
            opts.ctx.handshake_timeout,
            handshake(transport.as_ref(), &base, &opts.ctx),
        );
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = attempt => r,
        };
        match result {
            Ok(Ok(ok)) => {
                connected = Some(ok);
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(transport = transport.name(), error = %format!("{e:#}"), "transport failed");
                failures.push(format!("{}: {e:#}", transport.name()));
            }
            Err(_) => {
                tracing::debug!(transport = transport.name(), "handshake timed out");
                failures.push(format!("{}: handshake timed out", transport.name()));
            }
        }
    }

    let Some((mut link, channel_id)) = connected else {
        let error = if failures.is_empty() {
            "no transport enabled".to_string()
        } else {
            failures.join("; ")
        };
        tracing::warn!(%error, "channel connection failed");
        let _ = events.send(ChannelEvent::ConnectionFailed { error });
        return;
    };

    tracing::info!(%channel_id, transport = link.transport, "channel connected");
    if let Ok(mut o) = outbound.lock() {
        *o = Some(link.outbound.clone());
    }
    let _ = events.send(ChannelEvent::ConnectionEstablished { channel_id, transport: link.transport });

    let probe = SocketPacket::event(PROBE_EVENT, json!({ "message": opts.probe_message })).into_packet();
    if link.outbound.send(probe).await.is_err() {
        tracing::debug!("probe not sent, transport already closed");
    }

    let reason = pump(&mut link, &events, &shutdown).await;

    if let Ok(mut o) = outbound.lock() {
        o.take();
    }
    if let Some(reason) = reason {
        tracing::warn!(%reason, "channel lost");
        let _ = events.send(ChannelEvent::ConnectionLost { reason });
    }
}

/// Engine.IO open, then Socket.IO connect on the default namespace. Returns
/// the Socket.IO session id, which the backend uses to address this client.
async fn handshake(
    transport: &dyn Transport,
    base: &Url,
    ctx: &TransportContext,
) -> anyhow::Result<(TransportLink, String)> {
    let mut link = transport.connect(base, ctx).await?;
    link.outbound
        .send(SocketPacket::Connect(None).into_packet())
        .await
        .context("send connect")?;

    loop {
        match link.inbound.recv().await {
            Some(Packet::Message(raw)) => match SocketPacket::decode(&raw)? {
                SocketPacket::Connect(payload) => {
                    let sid = payload
                        .as_ref()
                        .and_then(|v| v.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| link.sid().to_string());
                    return Ok((link, sid));
                }
                SocketPacket::ConnectError(v) => {
                    let msg = v.get("message").and_then(Value::as_str).unwrap_or("connect refused");
                    anyhow::bail!("{msg}");
                }
                other => tracing::debug!(?other, "ignoring packet before connect"),
            },
            Some(Packet::Ping(d)) => {
                let _ = link.outbound.send(Packet::Pong(d)).await;
            }
            Some(Packet::Close) | None => anyhow::bail!("transport closed during handshake"),
            Some(_) => {}
        }
    }
}

/// Moves packets until the transport goes away (returns the reason) or the
/// channel is shut down (returns `None`).
async fn pump(
    link: &mut TransportLink,
    events: &broadcast::Sender<ChannelEvent>,
    shutdown: &CancellationToken,
) -> Option<String> {
    loop {
        let packet = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            p = link.inbound.recv() => p,
        };
        match packet {
            None | Some(Packet::Close) => return Some("transport close".to_string()),
            Some(Packet::Ping(d)) => {
                if link.outbound.send(Packet::Pong(d)).await.is_err() {
                    return Some("transport close".to_string());
                }
            }
            Some(Packet::Message(raw)) => match SocketPacket::decode(&raw) {
                Ok(SocketPacket::Event { name, data }) => match translate(&name, data) {
                    Ok(Some(ev)) => {
                        let _ = events.send(ev);
                    }
                    Ok(None) => tracing::debug!(event = %name, "dropping unknown event"),
                    Err(e) => tracing::debug!(event = %name, error = %e, "dropping malformed payload"),
                },
                Ok(SocketPacket::Disconnect) => return Some("io server disconnect".to_string()),
                Ok(other) => tracing::debug!(?other, "ignoring socket packet"),
                Err(e) => tracing::debug!(error = %e, "dropping undecodable message"),
            },
            Some(_) => {}
        }
    }
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct LogPayload {
    #[serde(default)]
    timestamp: String,
    message: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserPayload {
    Wrapped { user: User },
    Bare(User),
}

/// Maps a server event onto a channel event. `Ok(None)` for names this
/// client does not handle.
pub fn translate(name: &str, data: Value) -> Result<Option<ChannelEvent>, serde_json::Error> {
    let ev = match name {
        "connected" => {
            let p: StatusPayload = serde_json::from_value(data)?;
            ChannelEvent::Welcome { status: p.status }
        }
        "test_response" => {
            let p: StatusPayload = serde_json::from_value(data)?;
            ChannelEvent::EchoTestResult { status: p.status, message: p.message }
        }
        "download_progress" => ChannelEvent::Progress(serde_json::from_value::<Progress>(data)?),
        "download_status" => {
            let p: StatusPayload = serde_json::from_value(data)?;
            ChannelEvent::DownloadStatus { status: p.status }
        }
        "download_log" => {
            let p: LogPayload = serde_json::from_value(data)?;
            ChannelEvent::Log {
                timestamp: p.timestamp,
                message: p.message,
                severity: Severity::from_wire(&p.kind),
            }
        }
        "user_authenticated" => match serde_json::from_value::<UserPayload>(data)? {
            UserPayload::Wrapped { user } | UserPayload::Bare(user) => ChannelEvent::UserAuthenticated(user),
        },
        "course_fetch_progress" => {
            ChannelEvent::CourseFetchProgress(serde_json::from_value::<CourseFetchProgress>(data)?)
        }
        "error" => {
            let p: StatusPayload = serde_json::from_value(data)?;
            ChannelEvent::ChannelError { message: p.message }
        }
        _ => return Ok(None),
    };
    Ok(Some(ev))
}
