use crate::{
    config::CloudConfig,
    link::{LinkConnection, LinkError, UpstreamLink},
    protocol::OutboundMessage,
    services::credential_store::DeviceIdentity,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use std::time::Duration;
use tokio::{
    net::TcpStream,
    time::{Instant, sleep_until, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};

const DEVICE_CODE_HEADER: &str = "x-device-code";
const DEVICE_SECRET_HEADER: &str = "x-device-secret";

/// Keepalive and connect timing of a websocket link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkTimings {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl From<&CloudConfig> for LinkTimings {
    fn from(config: &CloudConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
        }
    }
}

/// Upstream link over a websocket carrying JSON text frames
#[derive(Clone, Debug)]
pub struct WebSocketLink {
    url: String,
    timings: LinkTimings,
}

impl WebSocketLink {
    pub fn new(url: impl Into<String>, timings: LinkTimings) -> Self {
        Self {
            url: url.into(),
            timings,
        }
    }

    pub fn from_config(config: &CloudConfig) -> Self {
        Self::new(config.ws_url.clone(), LinkTimings::from(config))
    }
}

impl UpstreamLink for WebSocketLink {
    type Connection = WebSocketConnection;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<WebSocketConnection, LinkError> {
        debug!("connecting to {}", self.url);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LinkError::Connect(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            DEVICE_CODE_HEADER,
            HeaderValue::from_str(&identity.code).map_err(|e| LinkError::Connect(e.to_string()))?,
        );
        headers.insert(
            DEVICE_SECRET_HEADER,
            HeaderValue::from_str(&identity.secret)
                .map_err(|e| LinkError::Connect(e.to_string()))?,
        );

        let (socket, _response) = timeout(self.timings.connect_timeout, connect_async(request))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|e| LinkError::Connect(e.to_string()))?;

        info!("connected to {}", self.url);

        Ok(WebSocketConnection {
            socket,
            timings: self.timings,
            last_activity: Instant::now(),
            ping_sent_at: None,
            closed: false,
        })
    }
}

pub struct WebSocketConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    timings: LinkTimings,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
    closed: bool,
}

impl WebSocketConnection {
    fn decode(payload: &[u8]) -> Option<Value> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value @ Value::Object(_)) => Some(value),
            Ok(other) => {
                warn!("skipping message that is not an object: {other}");
                None
            }
            Err(e) => {
                warn!("skipping undecodable message: {e}");
                None
            }
        }
    }

    fn keepalive_deadline(&self) -> Instant {
        match self.ping_sent_at {
            Some(sent_at) => sent_at + self.timings.ping_timeout,
            None => self.last_activity + self.timings.ping_interval,
        }
    }
}

impl LinkConnection for WebSocketConnection {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        let text = serde_json::to_string(message).map_err(|e| LinkError::Encode(e.to_string()))?;
        debug!("sending {}", message.kind());

        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Option<Value>, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        loop {
            let deadline = self.keepalive_deadline();

            tokio::select! {
                frame = self.socket.next() => {
                    let Some(frame) = frame else {
                        self.closed = true;
                        return Ok(None);
                    };
                    let frame = frame.map_err(|e| LinkError::Transport(e.to_string()))?;

                    // any traffic proves the peer is alive
                    self.last_activity = Instant::now();
                    self.ping_sent_at = None;

                    let decoded = match frame {
                        Message::Text(text) => Self::decode(text.as_bytes()),
                        Message::Binary(data) => Self::decode(&data),
                        Message::Close(frame) => {
                            debug!("peer closed connection: {frame:?}");
                            self.closed = true;
                            return Ok(None);
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
                    };

                    if let Some(value) = decoded {
                        return Ok(Some(value));
                    }
                }
                _ = sleep_until(deadline) => {
                    if self.ping_sent_at.is_some() {
                        warn!("no pong within {}s", self.timings.ping_timeout.as_secs());
                        return Err(LinkError::KeepaliveTimeout);
                    }

                    debug!("sending keepalive ping");
                    self.socket
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| LinkError::Transport(e.to_string()))?;
                    self.ping_sent_at = Some(Instant::now());
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match timeout(self.timings.ping_timeout, self.socket.close(None)).await {
            Ok(Ok(())) => debug!("connection closed"),
            Ok(Err(e)) => debug!("close failed: {e}"),
            Err(_) => debug!("close timed out"),
        }
    }
}
