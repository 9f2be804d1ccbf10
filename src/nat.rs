//! Best-effort reachability helpers.
//!
//! Port forwarding and external address discovery run as side tasks at
//! startup. Their failures are logged by the gateway and never surface as
//! gateway errors.

use std::net::IpAddr;

#[async_trait::async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward_port(&self, port: u16) -> Result<(), String>;
    async fn clear_port(&self, port: u16) -> Result<(), String>;
}

/// Used when no router integration is available.
pub struct NoPortForwarding;

#[async_trait::async_trait]
impl PortForwarder for NoPortForwarding {
    async fn forward_port(&self, port: u16) -> Result<(), String> {
        tracing::debug!("No port forwarder configured, port {} left as is", port);
        Ok(())
    }

    async fn clear_port(&self, _port: u16) -> Result<(), String> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait AddressDiscovery: Send + Sync {
    /// The host other nodes should use to reach us.
    async fn external_host(&self) -> Result<String, String>;
}

/// Reports the operator-configured external address, if any.
pub struct ConfiguredAddress {
    host: Option<String>,
}

impl ConfiguredAddress {
    /// Accepts either a bare host or `host:port`; the port is ignored since
    /// the gateway always advertises its listening port.
    pub fn new(external: Option<String>) -> Self {
        let host = external.map(|ext| strip_port(&ext));
        Self { host }
    }
}

fn strip_port(ext: &str) -> String {
    let ext = ext.trim();
    if ext.parse::<IpAddr>().is_ok() {
        return ext.to_string();
    }
    if let Some(rest) = ext.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match ext.rsplit_once(':') {
        Some((host, _)) => host.to_string(),
        None => ext.to_string(),
    }
}

#[async_trait::async_trait]
impl AddressDiscovery for ConfiguredAddress {
    async fn external_host(&self) -> Result<String, String> {
        self.host
            .clone()
            .ok_or_else(|| "no external address configured".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_address() {
        let found = ConfiguredAddress::new(Some("198.51.100.4:9981".into()));
        assert_eq!(found.external_host().await.unwrap(), "198.51.100.4");

        let bare = ConfiguredAddress::new(Some("node.example.org".into()));
        assert_eq!(bare.external_host().await.unwrap(), "node.example.org");

        let v6 = ConfiguredAddress::new(Some("[2001:db8::2]:9981".into()));
        assert_eq!(v6.external_host().await.unwrap(), "2001:db8::2");

        assert!(ConfiguredAddress::new(None).external_host().await.is_err());
    }

    #[tokio::test]
    async fn test_no_port_forwarding_succeeds() {
        assert!(NoPortForwarding.forward_port(9981).await.is_ok());
        assert!(NoPortForwarding.clear_port(9981).await.is_ok());
    }
}
