//! Peer address discovery sources.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ltcspv_consensus::params::ChainConfig;
use tokio::time::timeout;

use crate::error::NetError;

/// Per-seed resolution deadline.
pub const SEED_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    fn source(&self) -> String;

    async fn discover(&self) -> Result<Vec<SocketAddr>, NetError>;
}

/// Resolves DNS seed hostnames to peer addresses on the default port.
pub struct DnsSeedDiscovery {
    seeds: Vec<String>,
    port: u16,
}

impl DnsSeedDiscovery {
    pub fn for_network(config: &ChainConfig) -> Self {
        Self {
            seeds: config.dns_seeds.iter().map(|seed| seed.to_string()).collect(),
            port: config.default_port,
        }
    }

    pub fn new(seeds: Vec<String>, port: u16) -> Self {
        Self { seeds, port }
    }
}

#[async_trait]
impl PeerDiscovery for DnsSeedDiscovery {
    fn source(&self) -> String {
        format!("dns[{}]", self.seeds.len())
    }

    async fn discover(&self) -> Result<Vec<SocketAddr>, NetError> {
        let mut out = Vec::new();
        for seed in &self.seeds {
            match timeout(SEED_TIMEOUT, tokio::net::lookup_host((seed.as_str(), self.port))).await
            {
                Ok(Ok(addrs)) => out.extend(addrs),
                Ok(Err(err)) => log_debug!("dns seed {seed} failed: {err}"),
                Err(_) => log_debug!("dns seed {seed} timed out"),
            }
        }
        if out.is_empty() {
            return Err(NetError::NetworkUnavailable);
        }
        Ok(out)
    }
}

/// Fetches `host:port` lines from an HTTP seed document.
pub struct HttpSeedDiscovery {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl HttpSeedDiscovery {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            client: reqwest::Client::new(),
        }
    }

    pub fn for_network(config: &ChainConfig) -> Self {
        Self::new(config.http_seeds.iter().map(|url| url.to_string()).collect())
    }
}

#[async_trait]
impl PeerDiscovery for HttpSeedDiscovery {
    fn source(&self) -> String {
        format!("http[{}]", self.urls.len())
    }

    async fn discover(&self) -> Result<Vec<SocketAddr>, NetError> {
        let mut out = Vec::new();
        for url in &self.urls {
            let body = match timeout(SEED_TIMEOUT, fetch_text(&self.client, url)).await {
                Ok(Ok(body)) => body,
                Ok(Err(err)) => {
                    log_debug!("http seed {url} failed: {err}");
                    continue;
                }
                Err(_) => {
                    log_debug!("http seed {url} timed out");
                    continue;
                }
            };
            for line in body.lines() {
                if let Ok(addr) = line.trim().parse::<SocketAddr>() {
                    out.push(addr);
                }
            }
        }
        if out.is_empty() {
            return Err(NetError::NetworkUnavailable);
        }
        Ok(out)
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, NetError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| NetError::Io(err.to_string()))?;
    response
        .text()
        .await
        .map_err(|err| NetError::Io(err.to_string()))
}

/// Explicitly configured peer addresses.
pub struct FixedAddresses {
    addresses: Vec<SocketAddr>,
}

impl FixedAddresses {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl PeerDiscovery for FixedAddresses {
    fn source(&self) -> String {
        format!("fixed[{}]", self.addresses.len())
    }

    async fn discover(&self) -> Result<Vec<SocketAddr>, NetError> {
        if self.addresses.is_empty() {
            return Err(NetError::NetworkUnavailable);
        }
        Ok(self.addresses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_addresses_round_trip() {
        let addr: SocketAddr = "127.0.0.1:19335".parse().expect("addr");
        let discovery = FixedAddresses::new(vec![addr]);
        assert_eq!(discovery.discover().await.expect("addrs"), vec![addr]);
    }

    #[tokio::test]
    async fn empty_fixed_list_is_unavailable() {
        let discovery = FixedAddresses::new(Vec::new());
        assert!(matches!(
            discovery.discover().await,
            Err(NetError::NetworkUnavailable)
        ));
    }
}
