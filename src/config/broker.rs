//! Remote broker configuration
//!
//! Connection settings for the remote MQTT broker, plus endpoint URL parsing.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use serde::Deserialize;

/// Default MQTT port when the endpoint omits one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Remote broker settings
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Endpoint URL (`mqtt://host:port` or `tcp://host:port`)
    pub endpoint: String,
    /// Message VPN (namespace) name, sent as the `vpn` user property
    pub vpn: String,
    /// Username passed through to the broker
    pub username: Option<String>,
    /// Password passed through to the broker
    pub password: Option<String>,
    /// Client identifier (default: `railbus-<hostname>-<pid>`)
    pub client_id: String,
    /// Deadline covering TCP connect and CONNACK (e.g., "3s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// MQTT keep alive interval (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Reconnect attempts after a lost link (0 = disabled)
    pub reconnect_retries: u32,
    /// Delay between reconnect attempts (e.g., "3s")
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

pub(crate) fn default_endpoint() -> String {
    format!("mqtt://localhost:{}", DEFAULT_MQTT_PORT)
}

pub(crate) fn default_vpn() -> String {
    "default".to_string()
}

/// `railbus-<hostname>-<pid>`
pub fn default_client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("railbus-{}-{}", host, std::process::id())
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            vpn: default_vpn(),
            username: None,
            password: None,
            client_id: default_client_id(),
            connect_timeout: Duration::from_secs(3),
            keep_alive: Duration::from_secs(30),
            reconnect_retries: 3,
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("endpoint", &self.endpoint)
            .field("vpn", &self.vpn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_retries", &self.reconnect_retries)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}

impl BrokerConfig {
    /// Parse the configured endpoint
    pub fn parse_endpoint(&self) -> Result<Endpoint, EndpointError> {
        Endpoint::parse(&self.endpoint)
    }

    /// Keep alive in whole seconds as sent in CONNECT
    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u16::MAX as u64) as u16
    }
}

/// Why an endpoint URL could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    UnsupportedScheme(String),
    MissingHost,
    /// User info, an unbracketed IPv6 literal, or a bracketed non-IPv6 host
    InvalidHost(String),
    InvalidPort(String),
    TrailingPath(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::UnsupportedScheme(s) => write!(f, "unsupported scheme '{}'", s),
            EndpointError::MissingHost => write!(f, "endpoint has no host"),
            EndpointError::InvalidHost(h) => write!(f, "invalid host '{}'", h),
            EndpointError::InvalidPort(p) => write!(f, "invalid port '{}'", p),
            EndpointError::TrailingPath(p) => write!(f, "unexpected path '{}'", p),
        }
    }
}

impl std::error::Error for EndpointError {}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `scheme://host[:port][/]`
    ///
    /// Accepted schemes are `mqtt` and `tcp`; a bare `host:port` is treated as
    /// `mqtt`. IPv6 hosts must be bracketed. Credentials belong in the
    /// config, so `user@host` is refused.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let url = url.trim();
        let rest = match url.split_once("://") {
            Some((scheme, rest)) => {
                if !scheme.eq_ignore_ascii_case("mqtt") && !scheme.eq_ignore_ascii_case("tcp") {
                    return Err(EndpointError::UnsupportedScheme(scheme.to_string()));
                }
                rest
            }
            None => url,
        };

        let authority = match rest.find('/') {
            Some(idx) => {
                let path = &rest[idx..];
                if path != "/" {
                    return Err(EndpointError::TrailingPath(path.to_string()));
                }
                &rest[..idx]
            }
            None => rest,
        };

        if authority.contains('@') {
            return Err(EndpointError::InvalidHost(authority.to_string()));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or(EndpointError::MissingHost)?;
            if !host.is_empty() && host.parse::<Ipv6Addr>().is_err() {
                return Err(EndpointError::InvalidHost(host.to_string()));
            }
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').unwrap_or(p)),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) if port.contains(':') => {
                    return Err(EndpointError::InvalidHost(format!("{}:{}", host, port)));
                }
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointError::MissingHost);
        }

        let port = match port {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(EndpointError::InvalidPort(p.to_string())),
                Ok(port) => port,
            },
            None => DEFAULT_MQTT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// The host as an IP address, if it is a literal one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Whether the host names the local machine
    pub fn is_loopback(&self) -> bool {
        match self.ip() {
            Some(ip) => ip.is_loopback(),
            None => self.host.eq_ignore_ascii_case("localhost"),
        }
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mqtt://{}", self.socket_addr_string())
    }
}
