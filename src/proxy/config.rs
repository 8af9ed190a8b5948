use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SkailarError;

/// Scheme spoken by the forward proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = SkailarError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            other => Err(SkailarError::configuration(
                "proxy.protocol",
                format!("unsupported protocol `{other}`, expected `http` or `https`"),
            )),
        }
    }
}

/// Basic credentials presented to the proxy.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Forward proxy settings exactly as supplied by the caller.
///
/// The record is not trusted: [`ProxyConfig::validate`] turns it into a
/// [`ProxyEndpoint`] or reports a [`SkailarError::Configuration`].
///
/// # Examples
///
/// ```
/// use skailar::proxy::{ProxyConfig, ProxyProtocol};
///
/// let endpoint = ProxyConfig::new("127.0.0.1", 8080, "http").validate().unwrap();
/// assert_eq!(endpoint.port, 8080);
/// assert_eq!(endpoint.protocol, ProxyProtocol::Http);
///
/// assert!(ProxyConfig::new("127.0.0.1", 70000, "http").validate().is_err());
/// assert!(ProxyConfig::new("127.0.0.1", 8080, "ftp").validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u32,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u32, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Checks host, port range and protocol.
    ///
    /// # Errors
    ///
    /// Returns [`SkailarError::Configuration`] when the host is blank or not a bare
    /// host name or IP literal, the port falls outside `1..=65535`, or the protocol is
    /// neither `http` nor `https`.
    pub fn validate(&self) -> Result<ProxyEndpoint, SkailarError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(SkailarError::configuration(
                "proxy.host",
                "host must not be empty",
            ));
        }
        validate_host(host)?;
        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                SkailarError::configuration(
                    "proxy.port",
                    format!("port {} is outside 1..=65535", self.port),
                )
            })?;
        let protocol = self.protocol.parse::<ProxyProtocol>()?;

        Ok(ProxyEndpoint {
            host: host.to_string(),
            port,
            protocol,
            auth: self.auth.clone(),
        })
    }
}

/// Accepts a host name, an IPv4 literal or an IPv6 literal, bracketed or not.
fn validate_host(host: &str) -> Result<(), SkailarError> {
    let invalid = |reason: &str| -> Result<(), SkailarError> {
        Err(SkailarError::configuration(
            "proxy.host",
            format!("`{host}` {reason}"),
        ))
    };

    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | '?' | '#'))
    {
        return invalid("must be a bare host without scheme, path or credentials");
    }
    if host.contains([':', '[', ']']) {
        let literal = host
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(host);
        if literal.parse::<Ipv6Addr>().is_err() {
            return invalid("is not an IPv6 literal; set the port separately");
        }
    }
    Ok(())
}

/// Validated proxy location, the only form the probe and the HTTP layer accept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub auth: Option<ProxyAuth>,
}

impl ProxyEndpoint {
    /// Proxy URL without credentials, e.g. `http://10.0.0.2:3128`.
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}://{}:{}", self.protocol, host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}
