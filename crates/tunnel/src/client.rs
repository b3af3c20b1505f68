//! Tunnel client: registers with the relay and keeps the connection alive.

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::forward::Forwarder;
use crate::frames::{ClientFrame, RelayFrame};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Buffer of frames waiting to be written to the relay
const OUTGOING_BUFFER: usize = 256;

/// Connection state, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected { public_url: String },
    Reconnecting { attempt: u32 },
    Failed,
}

impl TunnelState {
    pub fn public_url(&self) -> Option<&str> {
        match self {
            Self::Connected { public_url } => Some(public_url),
            _ => None,
        }
    }
}

/// Running tunnel. Dropping the handle leaves the tunnel running until
/// [`TunnelHandle::shutdown`] or the shutdown token fires.
pub struct TunnelHandle {
    public_url: String,
    state: watch::Receiver<TunnelState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Public URL assigned at first registration.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Watch state changes, e.g. reconnects that change the public URL.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Close the relay connection and abort forwarded requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Tunnel task failed");
        }
    }
}

/// Tunnel client for one local port.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    forwarder: Forwarder,
    state: watch::Sender<TunnelState>,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> TunnelResult<Self> {
        match config.relay_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TunnelError::Config(format!(
                    "relay URL must use ws or wss, got {}",
                    other
                )))
            }
        }
        let forwarder = Forwarder::new(config.local_port)?;
        let (state, _) = watch::channel(TunnelState::Connecting);
        Ok(Self {
            config: Arc::new(config),
            forwarder,
            state,
        })
    }

    /// Connect and register. A failure here is returned to the caller;
    /// once registered, connection loss is handled in the background with
    /// jittered exponential backoff.
    pub async fn connect(self, shutdown: CancellationToken) -> TunnelResult<TunnelHandle> {
        info!(relay = %self.config.relay_url, port = self.config.local_port, "Connecting tunnel");
        let (stream, public_url) = match establish(&self.config).await {
            Ok(connected) => connected,
            Err(e) => {
                self.set_state(TunnelState::Failed);
                return Err(e);
            }
        };
        info!(public_url = %public_url, "Tunnel established");
        self.set_state(TunnelState::Connected {
            public_url: public_url.clone(),
        });

        let state = self.state.subscribe();
        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { self.maintain(stream, task_shutdown).await });

        Ok(TunnelHandle {
            public_url,
            state,
            shutdown,
            task,
        })
    }

    fn set_state(&self, state: TunnelState) {
        debug!(state = ?state, "Tunnel state change");
        self.state.send_replace(state);
    }

    async fn maintain(self, mut stream: RelayStream, shutdown: CancellationToken) {
        loop {
            match self.serve(stream, &shutdown).await {
                Ok(()) => {
                    info!("Tunnel closed");
                    return;
                }
                Err(e) => warn!(error = %e, "Tunnel connection lost"),
            }

            stream = match self.reconnect(&shutdown).await {
                Some(stream) => stream,
                None => return,
            };
        }
    }

    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<RelayStream> {
        let retry = &self.config.retry;
        let mut failed = 0u32;
        loop {
            if !retry.allows_attempt(failed) {
                error!(attempts = failed, "Giving up on tunnel reconnection");
                self.set_state(TunnelState::Failed);
                return None;
            }
            self.set_state(TunnelState::Reconnecting { attempt: failed + 1 });

            let delay = retry.jittered_backoff(failed);
            debug!(delay_ms = delay.as_millis() as u64, attempt = failed + 1, "Waiting before reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match establish(&self.config).await {
                Ok((stream, public_url)) => {
                    info!(public_url = %public_url, attempt = failed + 1, "Tunnel re-established");
                    self.set_state(TunnelState::Connected { public_url });
                    return Some(stream);
                }
                Err(e) if !e.is_retryable() => {
                    error!(error = %e, "Tunnel reconnection impossible");
                    self.set_state(TunnelState::Failed);
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, attempt = failed + 1, "Tunnel reconnection failed");
                    failed += 1;
                }
            }
        }
    }

    /// Pump frames until shutdown (`Ok`) or connection loss (`Err`).
    /// Forwarded requests still running when this returns are cancelled.
    async fn serve(&self, stream: RelayStream, shutdown: &CancellationToken) -> TunnelResult<()> {
        let (mut sink, mut incoming) = stream.split();
        let (frames_tx, mut frames_rx) = mpsc::channel::<ClientFrame>(OUTGOING_BUFFER);
        let connection = shutdown.child_token();
        let _guard = connection.clone().drop_guard();
        let mut in_flight: HashMap<String, CancellationToken> = HashMap::new();

        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.tick().await;
        // Any frame counts as liveness, including the pong to our ping
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = keepalive.tick() => {
                    let silent = last_seen.elapsed();
                    if silent > self.config.keepalive * 2 {
                        warn!(silent_ms = silent.as_millis() as u64, "Relay stopped answering keepalive pings");
                        return Err(TunnelError::Closed);
                    }
                    sink.send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| TunnelError::Connect(e.to_string()))?;
                }
                Some(frame) = frames_rx.recv() => {
                    if let Some(id) = frame.finished_request() {
                        in_flight.remove(id);
                    }
                    let text = serde_json::to_string(&frame)?;
                    sink.send(Message::Text(text))
                        .await
                        .map_err(|e| TunnelError::Connect(e.to_string()))?;
                }
                message = incoming.next() => match message {
                    Some(Ok(Message::Close(_))) | None => return Err(TunnelError::Closed),
                    Some(Ok(message)) => {
                        last_seen = Instant::now();
                        if let Message::Text(text) = message {
                            self.handle_frame(&text, &frames_tx, &connection, &mut in_flight);
                        }
                    }
                    Some(Err(e)) => return Err(TunnelError::Connect(e.to_string())),
                },
            }
        }
    }

    fn handle_frame(
        &self,
        text: &str,
        frames: &mpsc::Sender<ClientFrame>,
        connection: &CancellationToken,
        in_flight: &mut HashMap<String, CancellationToken>,
    ) {
        let frame = match serde_json::from_str::<RelayFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed relay frame");
                return;
            }
        };

        match frame {
            RelayFrame::Request(request) => {
                let cancel = connection.child_token();
                in_flight.insert(request.id.clone(), cancel.clone());
                let forwarder = self.forwarder.clone();
                let frames = frames.clone();
                tokio::spawn(async move { forwarder.forward(request, frames, cancel).await });
            }
            RelayFrame::Cancel { id } => match in_flight.remove(&id) {
                Some(cancel) => {
                    debug!(request_id = %id, "Relay cancelled request");
                    cancel.cancel();
                }
                None => debug!(request_id = %id, "Cancel for unknown request"),
            },
            RelayFrame::Error { message } => warn!(message = %message, "Relay reported an error"),
            RelayFrame::Registered { .. } => debug!("Ignoring duplicate registration"),
        }
    }
}

/// Open the websocket and register. Bounded by `connect_timeout`.
async fn establish(config: &TunnelConfig) -> TunnelResult<(RelayStream, String)> {
    tokio::time::timeout(config.connect_timeout, open_and_register(config))
        .await
        .map_err(|_| TunnelError::Timeout)?
}

async fn open_and_register(config: &TunnelConfig) -> TunnelResult<(RelayStream, String)> {
    let mut request = config
        .relay_url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::Config(e.to_string()))?;
    if let Some(key) = &config.relay_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|_| TunnelError::Config("relay key is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (mut stream, _) = connect_async(request)
        .await
        .map_err(|e| TunnelError::Connect(e.to_string()))?;

    let register = ClientFrame::Register {
        subdomain: config.subdomain.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    stream
        .send(Message::Text(serde_json::to_string(&register)?))
        .await
        .map_err(|e| TunnelError::Connect(e.to_string()))?;

    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| TunnelError::Connect(e.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Err(TunnelError::Closed),
            _ => continue,
        };
        return match serde_json::from_str::<RelayFrame>(&text)? {
            RelayFrame::Registered { public_url } => Ok((stream, public_url)),
            RelayFrame::Error { message } => Err(TunnelError::Rejected(message)),
            other => Err(TunnelError::Protocol(format!(
                "expected registration reply, got {:?}",
                other
            ))),
        };
    }
    Err(TunnelError::Closed)
}
