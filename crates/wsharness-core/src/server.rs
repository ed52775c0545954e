//! Scripted WebSocket server for exercising clients.
//!
//! Listens on `127.0.0.1:0` (OS-assigned port), accepts WebSocket connections
//! and answers each request frame through a [`CommandHandler`]. Tests can also
//! push unsolicited messages, or raw text, to every connected client.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task; the handler is shared via `Arc`.

use crate::config::ServerDefaults;
use crate::response::{RESPONSE_TYPE, TYPE_FIELD};
use crate::{Result, WsClientError};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Build a `"status": "success"` reply.
pub fn success_reply(result: Value) -> Value {
    json!({
        "type": "response",
        "status": "success",
        "result": result,
    })
}

/// Build a `"status": "error"` reply.
pub fn error_reply(error: &str) -> Value {
    json!({
        "type": "response",
        "status": "error",
        "error": error,
    })
}

/// Produces the reply to each request a client sends.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Answer `request` (the full decoded request, `command` field included).
    ///
    /// Returning `None` sends nothing, which lets a test exercise client
    /// timeouts. A `"type": "response"` field is added to object replies that
    /// lack one.
    async fn handle(&self, command: &str, request: Value) -> Option<Value>;
}

/// Adapts a plain closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&str, Value) -> Option<Value> + Send + Sync + 'static,
{
    async fn handle(&self, command: &str, request: Value) -> Option<Value> {
        (self.0)(command, request)
    }
}

/// Handle to a running test server. Dropping shuts down the server.
pub struct TestServerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    push_tx: broadcast::Sender<String>,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of currently open client connections.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Send `message` to every connected client.
    ///
    /// Returns how many connections it was queued for.
    pub fn push(&self, message: &Value) -> usize {
        self.push_raw(message.to_string())
    }

    /// Send a verbatim text frame to every connected client.
    pub fn push_raw(&self, text: impl Into<String>) -> usize {
        self.push_tx.send(text.into()).unwrap_or(0)
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and closes every active connection
    /// with a close frame.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for TestServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// One counted connection; releases its place when dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn claim(open: &Arc<AtomicUsize>) -> Option<Self> {
        open.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < ServerDefaults::MAX_CONNECTIONS).then_some(n + 1)
        })
        .ok()
        .map(|_| Self(open.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// WebSocket server that answers requests through a [`CommandHandler`].
pub struct TestServer;

impl TestServer {
    /// Start the server on a random local port.
    pub async fn start<H: CommandHandler>(handler: Arc<H>) -> Result<TestServerHandle> {
        let listener = TcpListener::bind(ServerDefaults::BIND_ADDR).await?;
        let addr = listener.local_addr()?;

        info!("Test server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let (push_tx, _) = broadcast::channel(ServerDefaults::PUSH_BUFFER);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            handler,
            shutdown_rx,
            conn_shutdown_rx,
            push_tx.clone(),
            active_connections.clone(),
        ));

        Ok(TestServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            push_tx,
            active_connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<H: CommandHandler>(
        listener: TcpListener,
        handler: Arc<H>,
        mut stop: oneshot::Receiver<()>,
        close_all: watch::Receiver<bool>,
        push_tx: broadcast::Sender<String>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Test server on {:?} failed to accept: {}", listener.local_addr(), e);
                        continue;
                    }
                },
            };

            let Some(slot) = ConnectionSlot::claim(&active_connections) else {
                warn!(
                    "Test server turning away {}, {} connections already open",
                    peer_addr,
                    ServerDefaults::MAX_CONNECTIONS
                );
                continue;
            };

            // The subscription has to exist before the client sees the
            // handshake response, or an immediate push would be missed.
            let pushes = push_tx.subscribe();
            let handler = handler.clone();
            let mut close_all = close_all.clone();
            tokio::spawn(async move {
                let _slot = slot;
                let result =
                    Self::handle_connection(stream, peer_addr, &*handler, pushes, &mut close_all)
                        .await;
                match result {
                    Ok(()) => debug!("Test server done with {}", peer_addr),
                    Err(e) => debug!("Test server dropped {}: {}", peer_addr, e),
                }
            });
        }

        debug!("Test server stopped accepting");
    }

    async fn handle_connection<H: CommandHandler>(
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: &H,
        mut pushes: broadcast::Receiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let ws = accept_async(stream).await.map_err(|e| WsClientError::Handshake {
            addr: peer_addr,
            message: e.to_string(),
        })?;
        let (mut sink, mut source) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                pushed = pushes.recv() => {
                    match pushed {
                        Ok(text) => sink.send(WsMessage::Text(text)).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Test server connection lagged, {} pushes lost", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = sink.close().await;
                            return Ok(());
                        }
                    }
                }
                frame = source.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                        Some(Ok(WsMessage::Close(_))) | None => {
                            let _ = sink.close().await;
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };

                    if let Some(reply) = Self::process_request(&text, handler).await {
                        sink.send(WsMessage::Text(reply.to_string())).await?;
                    }
                }
            }
        }
    }

    async fn process_request<H: CommandHandler>(request_str: &str, handler: &H) -> Option<Value> {
        let request: Value = match serde_json::from_str(request_str) {
            Ok(request) => request,
            Err(e) => {
                debug!("Test server got undecodable request: {}", e);
                return Some(error_reply("invalidParams"));
            }
        };

        let Some(command) = request
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Some(error_reply("missingCommand"));
        };

        let mut reply = handler.handle(&command, request).await?;
        if let Some(fields) = reply.as_object_mut() {
            fields
                .entry(TYPE_FIELD)
                .or_insert_with(|| Value::String(RESPONSE_TYPE.to_string()));
        }
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    fn echo_handler() -> Arc<FnHandler<impl Fn(&str, Value) -> Option<Value> + Send + Sync + 'static>> {
        Arc::new(FnHandler(|command: &str, request: Value| match command {
            "echo" => Some(success_reply(request)),
            "silent" => None,
            _ => Some(error_reply("unknownCmd")),
        }))
    }

    async fn next_json<S>(source: &mut S) -> Value
    where
        S: futures::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), source.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame ok");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_connection_slots_are_capped_and_released() {
        let open = Arc::new(AtomicUsize::new(0));
        let slots: Vec<_> = (0..ServerDefaults::MAX_CONNECTIONS)
            .map(|_| ConnectionSlot::claim(&open).unwrap())
            .collect();
        assert_eq!(open.load(Ordering::SeqCst), ServerDefaults::MAX_CONNECTIONS);
        assert!(ConnectionSlot::claim(&open).is_none());

        drop(slots);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(ConnectionSlot::claim(&open).is_some());
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = TestServer::start(echo_handler()).await.unwrap();

        assert!(handle.addr.port() > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let mut handle = TestServer::start(echo_handler()).await.unwrap();
        let (ws, _) = connect_async(format!("ws://{}/", handle.addr())).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(WsMessage::Text(r#"{"command":"echo","x":1}"#.into()))
            .await
            .unwrap();
        let reply = next_json(&mut source).await;

        assert_eq!(reply["type"], "response");
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["result"]["x"], 1);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_invalid_json_returns_error_reply() {
        let mut handle = TestServer::start(echo_handler()).await.unwrap();
        let (ws, _) = connect_async(format!("ws://{}/", handle.addr())).await.unwrap();
        let (mut sink, mut source) = ws.split();

        sink.send(WsMessage::Text("not valid json".into())).await.unwrap();
        let reply = next_json(&mut source).await;
        assert_eq!(reply["error"], "invalidParams");

        sink.send(WsMessage::Text(r#"{"id":1}"#.into())).await.unwrap();
        let reply = next_json(&mut source).await;
        assert_eq!(reply["error"], "missingCommand");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_push_reaches_client() {
        let mut handle = TestServer::start(echo_handler()).await.unwrap();
        let (ws, _) = connect_async(format!("ws://{}/", handle.addr())).await.unwrap();
        let (_sink, mut source) = ws.split();

        assert_eq!(handle.push(&json!({"type": "ledgerClosed", "ledger_index": 9})), 1);
        let pushed = next_json(&mut source).await;
        assert_eq!(pushed["ledger_index"], 9);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_connections() {
        let mut handle = TestServer::start(echo_handler()).await.unwrap();
        let (ws, _) = connect_async(format!("ws://{}/", handle.addr())).await.unwrap();
        let (_sink, mut source) = ws.split();

        handle.shutdown();

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(frame)) = source.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "connection should close after shutdown");
    }
}
