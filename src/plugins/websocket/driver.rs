use crate::plugins::engineio::{self, Packet};
use crate::plugins::registry::{Transport, TransportContext, TransportLink};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const NAME: &str = "websocket";

pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    fn ws_url(base: &Url) -> anyhow::Result<Url> {
        let mut url = engineio::endpoint(base, NAME, None)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot use {} for a websocket", base))?;
        Ok(url)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn connect(&self, base: &Url, ctx: &TransportContext) -> anyhow::Result<TransportLink> {
        let url = Self::ws_url(base)?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = ws.split();

        let handshake = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match Packet::decode(&text)? {
                    Packet::Open(h) => break h,
                    other => anyhow::bail!("expected open packet, got {:?}", other),
                },
                Some(Ok(Message::Close(_))) | None => anyhow::bail!("websocket closed during handshake"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        tracing::debug!(sid = %handshake.sid, %url, "websocket open");

        let shutdown = CancellationToken::new();
        let (in_tx, inbound) = mpsc::channel::<Packet>(64);
        let (outbound, mut out_rx) = mpsc::channel::<Packet>(64);

        let reader_stop = shutdown.clone();
        let reader = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_stop.cancelled() => break,
                    msg = stream.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => match Packet::decode(&text) {
                        Ok(p) => {
                            if in_tx.send(p).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "websocket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_stop.cancel();
        });

        let writer_stop = shutdown.clone();
        let writer = tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    p = out_rx.recv() => p,
                };
                let Some(packet) = packet else { break };
                if let Err(e) = sink.send(Message::Text(packet.encode())).await {
                    tracing::debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            writer_stop.cancel();
            let _ = sink.close().await;
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
