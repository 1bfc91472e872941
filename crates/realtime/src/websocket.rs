//! WebSocket transport for the content hubs
//!
//! Each connection runs one pump task that owns the socket: frames from the
//! hub are decoded into `HubMessage`s, queued messages are encoded and sent,
//! and a ping record goes out every keepalive interval. The pump ends when the
//! socket closes or the client drops its end of the `Connection`.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use session_auth::Credential;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::connection::{ConnectFuture, Connection, ConnectionFactory};
use crate::error::{Error, Result};
use crate::protocol::{self, HubMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUEUE_DEPTH: usize = 64;

/// Derive the hub base from a configured host URL.
///
/// A trailing `/api` is removed and the scheme mapped to its WebSocket
/// counterpart (`http` to `ws`, `https` to `wss`).
pub fn hub_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let base = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

/// Production `ConnectionFactory` dialing `<hub base>/hubs/<channel>`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    hub_base: String,
    keepalive: Duration,
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(hub_base: impl Into<String>, keepalive: Duration) -> Self {
        Self {
            hub_base: hub_base.into(),
            keepalive,
            handshake_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Full hub URL; the token travels as the `access_token` query parameter.
    pub fn hub_url(&self, channel: &str, token: Option<&Credential>) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&format!("{}/hubs/{channel}", self.hub_base))
            .map_err(|e| Error::ChannelUnavailable(format!("invalid hub url for {channel}: {e}")))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("access_token", token.token());
        }
        Ok(url)
    }

    async fn open(&self, channel: &str, token: Option<Credential>) -> Result<Connection> {
        let url = self.hub_url(channel, token.as_ref())?;
        debug!(
            channel,
            hub = %self.hub_base,
            authenticated = token.is_some(),
            "opening hub connection"
        );

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("{channel} hub: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::text(protocol::handshake_request()))
            .await
            .map_err(|e| Error::ChannelUnavailable(format!("{channel} handshake: {e}")))?;
        let backlog = tokio::time::timeout(self.handshake_timeout, read_handshake(&mut stream))
            .await
            .map_err(|_| Error::ChannelUnavailable(format!("{channel} handshake timed out")))??;

        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(pump(
            channel.to_string(),
            sink,
            stream,
            out_rx,
            in_tx,
            self.keepalive,
            backlog,
        ));

        info!(channel, "hub connection open");
        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

impl ConnectionFactory for WebSocketConnector {
    fn connect<'a>(&'a self, channel: &'a str, token: Option<Credential>) -> ConnectFuture<'a> {
        Box::pin(self.open(channel, token))
    }
}

async fn read_handshake(stream: &mut SplitStream<WsStream>) -> Result<Vec<HubMessage>> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return protocol::parse_handshake_response(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::ChannelUnavailable(
                    "hub closed during handshake".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::ChannelUnavailable(format!("handshake: {e}"))),
        }
    }
}

async fn pump(
    channel: String,
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut outgoing: mpsc::Receiver<HubMessage>,
    incoming: mpsc::Sender<HubMessage>,
    keepalive: Duration,
    backlog: Vec<HubMessage>,
) {
    for message in backlog {
        if incoming.send(message).await.is_err() {
            return;
        }
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);

    'pump: loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                    Ok(messages) => {
                        for message in messages {
                            if incoming.send(message).await.is_err() {
                                break 'pump;
                            }
                        }
                    }
                    Err(e) => warn!(channel, error = %e, "dropping malformed hub frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(channel, frame = ?frame, "hub sent close frame");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(channel, error = %e, "hub socket error");
                    break;
                }
                None => {
                    info!(channel, "hub socket ended");
                    break;
                }
            },
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = send_record(&mut sink, &message).await {
                        warn!(channel, error = %e, "hub send failed");
                        break;
                    }
                }
                None => {
                    debug!(channel, "client released connection");
                    let _ = sink.close().await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = send_record(&mut sink, &HubMessage::Ping).await {
                    warn!(channel, error = %e, "keepalive failed");
                    break;
                }
            }
            _ = incoming.closed() => {
                let _ = sink.close().await;
                break;
            }
        }
    }
    debug!(channel, "hub pump stopped");
}

async fn send_record(sink: &mut SplitSink<WsStream, Message>, message: &HubMessage) -> Result<()> {
    let record = protocol::encode(message)?;
    sink.send(Message::text(record))
        .await
        .map_err(|e| Error::ChannelUnavailable(e.to_string()))
}
