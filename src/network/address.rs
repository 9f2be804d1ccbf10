//! `host:port` network addresses.
//!
//! A `NetAddress` is the key for both the peer set and the node directory.
//! Parsing validates the shape only; no DNS lookup happens here. IPv6 hosts
//! are written in brackets (`[::1]:9981`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("missing port in address {0:?}")]
    MissingPort(String),

    #[error("invalid port in address {0:?}")]
    InvalidPort(String),

    #[error("missing host in address {0:?}")]
    MissingHost(String),

    #[error("malformed host in address {0:?}")]
    MalformedHost(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetAddress {
    host: String,
    port: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        let display = format!("{}:{}", host, port);
        validate_host(&host, &display)?;
        if port == 0 {
            return Err(AddressError::InvalidPort(display));
        }
        Ok(Self { host, port })
    }

    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::MalformedHost(s.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            if host.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(AddressError::MalformedHost(s.to_string()));
            }
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            if host.contains(':') {
                return Err(AddressError::MalformedHost(s.to_string()));
            }
            (host, port)
        };

        if port.is_empty() {
            return Err(AddressError::MissingPort(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        if port == 0 {
            return Err(AddressError::InvalidPort(s.to_string()));
        }
        validate_host(host, s)?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same port, different host. Used when the external address is learned.
    pub fn with_host(&self, host: &str) -> Result<Self, AddressError> {
        Self::new(host, self.port)
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    pub fn is_loopback(&self) -> bool {
        match self.ip() {
            Some(ip) => ip.is_loopback(),
            None => self.host.eq_ignore_ascii_case("localhost"),
        }
    }

    /// Whether the address could plausibly be reached by other nodes on the
    /// public network. Loopback, unspecified and multicast IPs are not.
    pub fn is_routable(&self) -> bool {
        match self.ip() {
            Some(ip) => !(ip.is_loopback() || ip.is_unspecified() || ip.is_multicast()),
            None => !self.host.eq_ignore_ascii_case("localhost"),
        }
    }
}

fn validate_host(host: &str, whole: &str) -> Result<(), AddressError> {
    if host.is_empty() {
        return Err(AddressError::MissingHost(whole.to_string()));
    }
    // IPv6 hosts are stored unbracketed.
    if host.contains(':') && host.parse::<std::net::Ipv6Addr>().is_err() {
        return Err(AddressError::MalformedHost(whole.to_string()));
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '[' || c == ']') {
        return Err(AddressError::MalformedHost(whole.to_string()));
    }
    Ok(())
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NetAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NetAddress> for String {
    fn from(addr: NetAddress) -> Self {
        addr.to_string()
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}
