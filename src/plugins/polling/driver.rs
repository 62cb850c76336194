use crate::plugins::engineio::{self, Handshake, Packet};
use crate::plugins::registry::{Transport, TransportContext, TransportLink};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const NAME: &str = "polling";

/// Engine.IO over HTTP long-polling: one GET in flight at a time for
/// server packets, one POST per outbound batch.
pub struct PollingTransport;

impl PollingTransport {
    pub fn new() -> Self {
        Self
    }

    fn build_client(ctx: &TransportContext) -> anyhow::Result<reqwest::Client> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        Ok(reqwest::Client::builder().default_headers(h).build()?)
    }

    async fn open(
        client: &reqwest::Client,
        base: &Url,
        timeout: Duration,
    ) -> anyhow::Result<(Handshake, Vec<Packet>)> {
        let resp = client
            .get(engineio::endpoint(base, NAME, None)?)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = resp.text().await?;

        let mut packets = engineio::decode_payload(&body).into_iter();
        let handshake = match packets.next() {
            Some(Ok(Packet::Open(h))) => h,
            Some(Ok(other)) => anyhow::bail!("expected open packet, got {:?}", other),
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("empty handshake response"),
        };
        let rest = packets.filter_map(Result::ok).collect();
        Ok((handshake, rest))
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self, base: &Url, ctx: &TransportContext) -> anyhow::Result<TransportLink> {
        let client = Self::build_client(ctx)?;
        let (handshake, early) = Self::open(&client, base, ctx.handshake_timeout).await?;
        tracing::debug!(sid = %handshake.sid, "polling session open");

        // a poll may legitimately sit idle for a full ping cycle
        let poll_timeout = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout)
            + Duration::from_secs(5);

        let shutdown = CancellationToken::new();
        let (in_tx, inbound) = mpsc::channel::<Packet>(64);
        let (outbound, mut out_rx) = mpsc::channel::<Packet>(64);

        for p in early {
            in_tx.send(p).await?;
        }

        let reader_stop = shutdown.clone();
        let reader_client = client.clone();
        let reader_base = base.clone();
        let sid = handshake.sid.clone();
        let reader = tokio::spawn(async move {
            'poll: loop {
                let url = match engineio::endpoint(&reader_base, NAME, Some(&sid)) {
                    Ok(u) => u,
                    Err(e) => {
                        tracing::debug!(error = %e, "bad poll url");
                        break;
                    }
                };
                let req = reader_client.get(url).timeout(poll_timeout).send();
                let body = tokio::select! {
                    _ = reader_stop.cancelled() => break,
                    r = req => match r.and_then(|r| r.error_for_status()) {
                        Ok(resp) => resp.text().await,
                        Err(e) => Err(e),
                    },
                };
                let body = match body {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::debug!(error = %e, "poll failed");
                        break;
                    }
                };
                for p in engineio::decode_payload(&body) {
                    match p {
                        Ok(Packet::Close) => break 'poll,
                        Ok(p) => {
                            if in_tx.send(p).await.is_err() {
                                break 'poll;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "dropping malformed packet"),
                    }
                }
            }
            reader_stop.cancel();
        });

        let writer_stop = shutdown.clone();
        let writer_base = base.clone();
        let sid = handshake.sid.clone();
        let request_timeout = ctx.handshake_timeout;
        let writer = tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    p = out_rx.recv() => p,
                };
                let Some(first) = first else { break };
                let mut batch = vec![first];
                while let Ok(p) = out_rx.try_recv() {
                    batch.push(p);
                }

                let url = match engineio::endpoint(&writer_base, NAME, Some(&sid)) {
                    Ok(u) => u,
                    Err(_) => break,
                };
                let sent = client
                    .post(url)
                    .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
                    .timeout(request_timeout)
                    .body(engineio::encode_payload(&batch))
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "poll write failed");
                    break;
                }
            }
            writer_stop.cancel();
        });

        Ok(TransportLink {
            transport: NAME,
            handshake,
            outbound,
            inbound,
            shutdown,
            tasks: vec![reader, writer],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::engineio::RECORD_SEPARATOR;
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Fake {
        polls: Arc<AtomicUsize>,
        posted: Arc<Mutex<Vec<String>>>,
    }

    async fn poll(State(fake): State<Fake>, Query(q): Query<HashMap<String, String>>) -> String {
        assert_eq!(q.get("EIO").map(String::as_str), Some("4"));
        if !q.contains_key("sid") {
            return r#"0{"sid":"s1","upgrades":["websocket"],"pingInterval":300,"pingTimeout":200}"#.to_string();
        }
        assert_eq!(q.get("sid").map(String::as_str), Some("s1"));
        if fake.polls.fetch_add(1, Ordering::SeqCst) == 0 {
            format!("40{{\"sid\":\"n1\"}}{RECORD_SEPARATOR}2")
        } else {
            tokio::time::sleep(Duration::from_millis(200)).await;
            "6".to_string()
        }
    }

    async fn post(State(fake): State<Fake>, body: String) -> &'static str {
        fake.posted.lock().unwrap().push(body);
        "ok"
    }

    #[tokio::test]
    async fn exchanges_packets_over_long_polling() {
        let fake = Fake::default();
        let app = Router::new()
            .route("/socket.io/", get(poll).post(post))
            .with_state(fake.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let base = Url::parse(&format!("http://{addr}")).unwrap();
        let ctx = TransportContext { user_agent: "test".into(), handshake_timeout: Duration::from_secs(2) };
        let mut link = PollingTransport::new().connect(&base, &ctx).await.unwrap();
        assert_eq!(link.sid(), "s1");
        assert_eq!(link.transport, "polling");

        assert_eq!(link.inbound.recv().await.unwrap(), Packet::Message(r#"0{"sid":"n1"}"#.into()));
        assert_eq!(link.inbound.recv().await.unwrap(), Packet::Ping(String::new()));
        assert_eq!(link.inbound.recv().await.unwrap(), Packet::Noop);

        link.outbound.send(Packet::Pong(String::new())).await.unwrap();
        for _ in 0..50 {
            if !fake.posted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fake.posted.lock().unwrap().first().map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn refused_connection_fails_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let base = Url::parse(&format!("http://{addr}")).unwrap();
        let ctx = TransportContext { user_agent: "test".into(), handshake_timeout: Duration::from_secs(1) };
        assert!(PollingTransport::new().connect(&base, &ctx).await.is_err());
    }
}
