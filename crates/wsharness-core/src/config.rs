//! Client configuration.
//!
//! Defaults live in [`ClientDefaults`] as constants; a [`ClientConfig`] carries
//! the values a particular client instance uses.

use std::time::Duration;

/// Default values for client timeouts and the handshake.
pub struct ClientDefaults;

impl ClientDefaults {
    /// How long `invoke` waits for a `"type": "response"` message.
    pub const INVOKE_TIMEOUT: Duration = Duration::from_secs(5);
    /// Upper bound for TCP connect plus WebSocket handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long `close` waits for the reader to see the server's close reply
    /// before stopping it.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
    pub const HANDSHAKE_PATH: &'static str = "/";
}

/// Defaults for the scripted test server.
pub struct ServerDefaults;

impl ServerDefaults {
    pub const BIND_ADDR: &'static str = "127.0.0.1:0";
    pub const MAX_CONNECTIONS: usize = 64;
    /// Capacity of the per-server push channel.
    pub const PUSH_BUFFER: usize = 1024;
}

/// What the reader does with a frame that is not valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedFramePolicy {
    /// Queue the frame as JSON `null`.
    #[default]
    Deliver,
    /// Log the frame and discard it.
    Drop,
}

/// Per-client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub invoke_timeout: Duration,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub handshake_path: String,
    pub malformed_frames: MalformedFramePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: ClientDefaults::INVOKE_TIMEOUT,
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            close_timeout: ClientDefaults::CLOSE_TIMEOUT,
            handshake_path: ClientDefaults::HANDSHAKE_PATH.to_string(),
            malformed_frames: MalformedFramePolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the request path used for the WebSocket upgrade.
    ///
    /// A missing leading `/` is added.
    pub fn with_handshake_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.handshake_path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        self
    }

    pub fn with_malformed_frames(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed_frames = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.invoke_timeout, Duration::from_secs(5));
        assert_eq!(config.handshake_path, "/");
        assert_eq!(config.malformed_frames, MalformedFramePolicy::Deliver);
    }

    #[test]
    fn test_handshake_path_gets_leading_slash() {
        let config = ClientConfig::default().with_handshake_path("ws");
        assert_eq!(config.handshake_path, "/ws");

        let config = ClientConfig::default().with_handshake_path("/admin");
        assert_eq!(config.handshake_path, "/admin");
    }
}
