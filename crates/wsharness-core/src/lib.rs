//! wsharness core - WebSocket JSON client for driving a server from tests.
//!
//! A [`WsClient`] keeps one WebSocket connection open. A background task reads
//! every inbound frame, decodes it as JSON and queues it in arrival order.
//! Test code then either invokes commands and waits for the matching reply, or
//! picks pushed messages out of the queue, each with an explicit timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use std::time::Duration;
//! use wsharness_core::{ClientConfig, WsClient};
//!
//! #[tokio::main]
//! async fn main() -> wsharness_core::Result<()> {
//!     let client = WsClient::connect("127.0.0.1:6006".parse().unwrap(), ClientConfig::default()).await?;
//!
//!     let reply = client.invoke("subscribe", json!({"streams": ["ledger"]})).await?;
//!     assert_eq!(reply["status"], "success");
//!
//!     let closed = client
//!         .find_msg(Duration::from_secs(10), |m| m["type"] == "ledgerClosed")
//!         .await;
//!     println!("{:?}", closed);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod reader;
pub mod response;
pub mod server;

pub use client::{ConnectionState, WsClient};
pub use config::{ClientConfig, ClientDefaults, MalformedFramePolicy, ServerDefaults};
pub use endpoint::{resolve_endpoint, ServerConfig, WsProtocol};
pub use error::{Result, WsClientError};
pub use queue::MessageQueue;
pub use reader::ReaderState;
pub use response::{is_response, normalize_response};
pub use server::{error_reply, success_reply, CommandHandler, FnHandler, TestServer, TestServerHandle};
