//! WebSocket test-harness client.
//!
//! Connects to a server, starts a background reader that queues every inbound
//! message, and lets any number of tasks send requests and pick replies or
//! pushed messages out of the queue.
//!
//! # Thread Safety
//!
//! `WsClient` is `Send + Sync` and is meant to be shared behind an `Arc`.
//! Writes are serialized by a tokio `Mutex` around the send half of the
//! stream. The receive half is owned by the reader task alone.
//!
//! # Shutdown
//!
//! [`WsClient::close`] marks the queue closed, sends a close frame, waits for
//! the reader to observe the closure (stopping it outright after
//! `close_timeout`), and joins it. Once `close` returns no message will be
//! queued again.

use crate::codec::{build_request, encode};
use crate::config::ClientConfig;
use crate::endpoint::{resolve_endpoint, ServerConfig, WsProtocol};
use crate::queue::MessageQueue;
use crate::reader::{ReaderLoop, ReaderState};
use crate::response::{is_response, normalize_response};
use crate::{Result, WsClientError};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info};
use url::Url;

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// WebSocket client with a background reader and a message queue.
///
/// Tear down with [`WsClient::close`], which returns only after the reader
/// task has stopped. Dropping the client without closing it is best effort:
/// the queue stops accepting messages and the reader task is aborted, but not
/// joined, and no close frame is sent.
pub struct WsClient {
    endpoint: SocketAddr,
    config: ClientConfig,
    queue: Arc<MessageQueue>,
    /// `None` once the client has been closed.
    sink: Mutex<Option<WsSink>>,
    state: StdMutex<ConnectionState>,
    reader_state: watch::Receiver<ReaderState>,
    shutdown_tx: watch::Sender<bool>,
    /// Also serializes concurrent `close` calls.
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsClient {
    /// Connect to `endpoint` and start reading.
    ///
    /// Fails if the TCP connection or the WebSocket handshake fails, or if the
    /// two together take longer than the configured connect timeout. There is
    /// no retry.
    pub async fn connect(endpoint: SocketAddr, config: ClientConfig) -> Result<Self> {
        debug!("Connecting to {}", endpoint);

        let timeout = config.connect_timeout;
        let ws = tokio::time::timeout(timeout, Self::open(endpoint, &config.handshake_path))
            .await
            .map_err(|_| WsClientError::ConnectTimeout {
                addr: endpoint,
                timeout,
            })??;

        let (sink, stream) = ws.split();
        let queue = Arc::new(MessageQueue::new());
        let (state_tx, reader_state) = watch::channel(ReaderState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader = ReaderLoop::new(
            stream,
            queue.clone(),
            config.malformed_frames,
            state_tx,
            shutdown_rx,
        );
        let handle = tokio::spawn(reader.run());

        info!("WebSocket client connected to {}", endpoint);

        Ok(Self {
            endpoint,
            config,
            queue,
            sink: Mutex::new(Some(sink)),
            state: StdMutex::new(ConnectionState::Open),
            reader_state,
            shutdown_tx,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Resolve the endpoint for `protocol` from a server configuration and
    /// connect to it.
    pub async fn connect_with_config(
        server: &ServerConfig,
        protocol: WsProtocol,
        config: ClientConfig,
    ) -> Result<Self> {
        let endpoint = resolve_endpoint(server, protocol)?;
        Self::connect(endpoint, config).await
    }

    async fn open(endpoint: SocketAddr, path: &str) -> Result<WsStream> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| WsClientError::Connect {
                addr: endpoint,
                message: e.to_string(),
            })?;

        let url = Url::parse(&format!("ws://{}{}", endpoint, path)).map_err(|e| {
            WsClientError::Config {
                message: format!("Invalid handshake path '{}': {}", path, e),
            }
        })?;

        let (ws, _response) = client_async(url.as_str(), stream)
            .await
            .map_err(|e| WsClientError::Handshake {
                addr: endpoint,
                message: e.to_string(),
            })?;

        Ok(ws)
    }

    /// Send `message` as one text frame without waiting for a reply.
    pub async fn send(&self, message: &Value) -> Result<()> {
        let text = encode(message)?;
        let mut guard = self.sink.lock().await;
        if matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed) {
            return Err(WsClientError::Closed);
        }
        let sink = guard.as_mut().ok_or(WsClientError::Closed)?;
        sink.send(WsMessage::Text(text))
            .await
            .map_err(|e| WsClientError::Send {
                message: e.to_string(),
            })
    }

    /// Send `command` and wait up to `timeout` for a reply.
    ///
    /// `params` is `null` or an object whose fields are sent alongside the
    /// command. The first queued `"type": "response"` message is taken as the
    /// reply and normalized (see [`normalize_response`]). `Ok(None)` means no
    /// reply arrived in time.
    pub async fn invoke_within(
        &self,
        command: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let request = build_request(command, &params)?;
        self.send(&request).await?;
        debug!("Sent '{}' to {}", command, self.endpoint);

        let reply = self.queue.find_first_matching(timeout, is_response).await;
        if reply.is_none() {
            debug!("No response to '{}' within {:?}", command, timeout);
        }
        Ok(reply.map(normalize_response))
    }

    /// Send `command` and wait for its reply using the configured timeout.
    ///
    /// Returns `null` when nothing arrives in time; callers treat missing
    /// fields as "no response".
    pub async fn invoke(&self, command: &str, params: Value) -> Result<Value> {
        let reply = self
            .invoke_within(command, params, self.config.invoke_timeout)
            .await?;
        Ok(reply.unwrap_or_default())
    }

    /// Take the oldest queued message, waiting up to `timeout`.
    pub async fn get_msg(&self, timeout: Duration) -> Option<Value> {
        self.queue.pop_front(timeout).await
    }

    /// Take the oldest queued message matching `predicate`, waiting up to
    /// `timeout`. Non-matching messages stay queued.
    pub async fn find_msg<P>(&self, timeout: Duration, predicate: P) -> Option<Value>
    where
        P: FnMut(&Value) -> bool,
    {
        self.queue.find_first_matching(timeout, predicate).await
    }

    /// Close the connection and stop the reader.
    ///
    /// Idempotent. Messages queued before the call remain retrievable.
    pub async fn close(&self) {
        let mut reader = self.reader.lock().await;
        let Some(mut handle) = reader.take() else {
            return;
        };

        self.set_state(ConnectionState::Closing);
        self.queue.close();

        // A send stalled on a peer that stopped reading holds the sink lock,
        // so taking the lock counts against the same deadline as the frame.
        let close_frame = async {
            let Some(mut sink) = self.sink.lock().await.take() else {
                return Ok::<(), tungstenite::Error>(());
            };
            sink.close().await
        };
        let frame_sent = match tokio::time::timeout(self.config.close_timeout, close_frame).await
        {
            Ok(Ok(())) => {
                debug!("Sent close frame to {}", self.endpoint);
                true
            }
            Ok(Err(e)) => {
                debug!("Close frame to {} failed: {}", self.endpoint, e);
                true
            }
            Err(_) => {
                debug!("Timed out sending close frame to {}", self.endpoint);
                false
            }
        };

        let reader_done = frame_sent
            && tokio::time::timeout(self.config.close_timeout, &mut handle)
                .await
                .is_ok();
        if !reader_done {
            debug!("Reader for {} still running, stopping it", self.endpoint);
            let _ = self.shutdown_tx.send(true);
            let _ = handle.await;
        }

        self.set_state(ConnectionState::Closed);
        info!("WebSocket client for {} closed", self.endpoint);
    }

    /// Wait up to `timeout` for the reader to stop. Returns whether it has.
    pub async fn wait_reader_terminated(&self, timeout: Duration) -> bool {
        let mut state = self.reader_state.clone();
        let _ = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ReaderState::Terminated),
        )
        .await;
        let terminated = *state.borrow() == ReaderState::Terminated;
        terminated
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn reader_state(&self) -> ReaderState {
        *self.reader_state.borrow()
    }

    /// Number of queued messages no consumer has taken yet.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("reader_state", &self.reader_state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.queue.close();
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsClient::connect(addr, ClientConfig::default()).await;
        match result {
            Err(e @ WsClientError::Connect { .. }) => assert!(e.is_fatal_at_construction()),
            other => panic!("Expected Connect error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_failure_is_reported() {
        // A listener that accepts and immediately hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let result = WsClient::connect(addr, ClientConfig::default()).await;
        match result {
            Err(WsClientError::Handshake { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("Expected Handshake error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // A listener that accepts but never answers the upgrade request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ClientConfig::default().with_connect_timeout(Duration::from_millis(100));
        let result = WsClient::connect(addr, config).await;
        assert!(matches!(result, Err(WsClientError::ConnectTimeout { .. })));
    }

    #[tokio::test]
    async fn test_connect_with_config_missing_port() {
        let server = ServerConfig::from_json_str(r#"{"server": {"ports": []}}"#).unwrap();
        let result =
            WsClient::connect_with_config(&server, WsProtocol::Ws, ClientConfig::default()).await;
        assert!(matches!(
            result,
            Err(WsClientError::MissingWebSocketPort { .. })
        ));
    }
}
