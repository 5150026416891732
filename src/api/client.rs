//! Deriv WebSocket transport.
//!
//! A background task owns the socket. It connects with bounded exponential
//! backoff, forwards requests from a channel, keeps the link alive with
//! pings, and reports everything it receives as [`TransportEvent`]s.

use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::types::{parse_response, Request, Response};

/// Public Deriv WebSocket endpoint.
pub const DERIV_WS_URL: &str = "wss://ws.binaryws.com/websockets/v3";

/// Default public application id.
pub const DEFAULT_APP_ID: &str = "1089";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors raised by a single connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Transport settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub app_id: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up reconnecting after this long without a connection
    pub reconnect_budget: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    pub fn url(&self) -> String {
        format!("{}?app_id={}", self.endpoint, self.app_id)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DERIV_WS_URL.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            reconnect_budget: Duration::from_secs(300),
        }
    }
}

/// What the transport reports to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection was (re)established
    Connected,
    Message(Response),
    /// Connection lost, reconnecting
    Disconnected(String),
    /// Reconnection budget exhausted, the transport has stopped
    Failed(String),
}

/// Sending side of a running client.
pub struct DerivHandle {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

impl DerivHandle {
    pub fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .ok()
            .context("Deriv transport has stopped")
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.task.await {
            warn!("Deriv transport task ended abnormally: {}", e);
        }
    }
}

/// Deriv WebSocket client.
pub struct DerivClient;

impl DerivClient {
    /// Start the transport task.
    pub fn spawn(config: ClientConfig) -> (DerivHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(Self::run(config, request_rx, event_tx));

        (
            DerivHandle {
                requests: request_tx,
                task,
            },
            event_rx,
        )
    }

    async fn run(
        config: ClientConfig,
        mut requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            let socket = match Self::connect(&config).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Giving up on Deriv connection: {}", e);
                    let _ = events.send(TransportEvent::Failed(e.to_string()));
                    return;
                }
            };

            // Requests queued while offline belong to the old connection
            let mut stale = 0;
            while requests.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(dropped = stale, "Dropped requests queued while disconnected");
            }

            if events.send(TransportEvent::Connected).is_err() {
                return;
            }

            match Self::run_connection(socket, &config, &mut requests, &events).await {
                Ok(()) => {
                    info!("Deriv transport: clean shutdown");
                    return;
                }
                Err(e) => {
                    warn!("Deriv connection lost: {}", e);
                    if events
                        .send(TransportEvent::Disconnected(e.to_string()))
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn connect(config: &ClientConfig) -> Result<Socket, TransportError> {
        let url = config.url();
        let url = url.as_str();
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_max_elapsed_time(Some(config.reconnect_budget))
            .build();

        backoff::future::retry(policy, move || async move {
            info!("Connecting to Deriv at {}", config.endpoint);
            match tokio::time::timeout(config.connect_timeout, connect_async(url)).await {
                Ok(Ok((socket, _))) => {
                    info!("Connected to Deriv WebSocket");
                    Ok(socket)
                }
                Ok(Err(e)) => {
                    warn!("Deriv connection attempt failed: {}", e);
                    Err(backoff::Error::transient(TransportError::Connection(e.to_string())))
                }
                Err(_) => {
                    warn!("Deriv connection attempt timed out");
                    Err(backoff::Error::transient(TransportError::Timeout))
                }
            }
        })
        .await
    }

    /// Pump one connection until it fails or the request channel closes.
    async fn run_connection(
        socket: Socket,
        config: &ClientConfig,
        requests: &mut mpsc::UnboundedReceiver<Request>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let (mut write, mut read) = socket.split();

        let mut ping_timer = interval(config.ping_interval);
        // Skip the immediate first tick
        ping_timer.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            trace!(frame = %text, "Received frame");
                            match parse_response(&text) {
                                Ok(response) => {
                                    if events.send(TransportEvent::Message(response)).is_err() {
                                        return Ok(());
                                    }
                                }
                                Err(e) => warn!("Skipping unparseable frame: {:#}", e),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            warn!("Deriv: close frame: {:?}", frame);
                            return Err(TransportError::StreamEnded);
                        }
                        Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                        None => return Err(TransportError::StreamEnded),
                        _ => {}
                    }
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    let payload = request.to_json().to_string();
                    debug!(request = request.name(), "Sending request");
                    write.send(Message::Text(payload)).await
                        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Text(Request::Ping.to_json().to_string())).await
                        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
                }
            }
        }
    }
}
