//! Endpoint resolution from a server's port configuration.
//!
//! The server describes its listening ports as named sections. The `server`
//! section lists which sections are active and may carry defaults shared by
//! all of them:
//!
//! ```json
//! {
//!   "server": { "ports": ["port_rpc", "port_ws"], "ip": "0.0.0.0" },
//!   "port_rpc": { "port": 5005, "protocol": "http" },
//!   "port_ws":  { "port": 6006, "protocol": "ws,ws2" }
//! }
//! ```
//!
//! [`resolve_endpoint`] picks the first listed port that speaks the requested
//! WebSocket protocol.

use crate::{Result, WsClientError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use tracing::debug;

/// WebSocket protocol flavor a client connects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsProtocol {
    #[default]
    Ws,
    Ws2,
}

impl WsProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsProtocol::Ws => "ws",
            WsProtocol::Ws2 => "ws2",
        }
    }
}

impl fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol list, written either as `"ws,http"` or `["ws", "http"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProtocolList {
    Csv(String),
    List(Vec<String>),
}

impl ProtocolList {
    pub fn contains(&self, protocol: &str) -> bool {
        match self {
            ProtocolList::Csv(csv) => csv
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case(protocol)),
            ProtocolList::List(list) => list
                .iter()
                .any(|p| p.trim().eq_ignore_ascii_case(protocol)),
        }
    }
}

/// One named port section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortSection {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<ProtocolList>,
}

/// The `server` section: active port names plus shared defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(flatten)]
    pub defaults: PortSection,
}

/// A server's port configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    /// Every other top-level section. Only those named in `server.ports`
    /// are read, so unrelated settings may have any shape.
    #[serde(flatten)]
    pub sections: HashMap<String, Value>,
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| WsClientError::Config {
            message: format!("Invalid server configuration: {}", e),
        })
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| WsClientError::Config {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&contents)
    }
}

/// Find the address of the first active port that speaks `protocol`.
///
/// Values missing from a port section are taken from the `server` section.
/// An unspecified bind address is replaced by loopback, since that is where a
/// locally started server can be reached.
pub fn resolve_endpoint(config: &ServerConfig, protocol: WsProtocol) -> Result<SocketAddr> {
    let common = &config.server.defaults;

    for name in &config.server.ports {
        let Some(section) = port_section(config, name)? else {
            continue;
        };

        let speaks = section
            .protocol
            .as_ref()
            .or(common.protocol.as_ref())
            .is_some_and(|p| p.contains(protocol.as_str()));
        if !speaks {
            continue;
        }

        let (Some(ip), Some(port)) = (section.ip.or(common.ip), section.port.or(common.port))
        else {
            return Err(WsClientError::Config {
                message: format!("Port section '{}' has no ip or port", name),
            });
        };

        let addr = SocketAddr::new(connectable(ip), port);
        debug!("Resolved {} endpoint from '{}': {}", protocol, name, addr);
        return Ok(addr);
    }

    Err(WsClientError::MissingWebSocketPort {
        protocol: protocol.to_string(),
    })
}

fn port_section(config: &ServerConfig, name: &str) -> Result<Option<PortSection>> {
    let Some(value) = config.sections.get(name) else {
        debug!("Port section '{}' is listed but not defined", name);
        return Ok(None);
    };
    if !value.is_object() {
        debug!("Port section '{}' is not an object, skipping", name);
        return Ok(None);
    }
    PortSection::deserialize(value)
        .map(Some)
        .map_err(|e| WsClientError::Config {
            message: format!("Invalid port section '{}': {}", name, e),
        })
}

fn connectable(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}
