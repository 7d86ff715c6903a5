use anyhow::Context;
use hex::DisplayHex;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use crate::channel::{Channel, ChannelFees, RoutingPolicy};
use crate::config::NodeConfig;

/// Trait abstracting the node API surface used by the rebalancer.
///
/// This enables mock-based testing without a live node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn own_pubkey(&self) -> anyhow::Result<String>;
    /// Channels currently marked active by the node.
    async fn list_active_channels(&self) -> anyhow::Result<Vec<Channel>>;
    async fn node_alias(&self, pubkey: &str) -> anyhow::Result<String>;
    async fn local_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy>;
    async fn remote_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy>;

    /// Fresh snapshot of one channel; `None` once it is no longer active.
    async fn channel_by_id(&self, chan_id: &str) -> anyhow::Result<Option<Channel>> {
        Ok(self
            .list_active_channels()
            .await?
            .into_iter()
            .find(|c| c.chan_id == chan_id))
    }

    async fn channel_fees(&self, chan_id: &str) -> anyhow::Result<ChannelFees> {
        Ok(ChannelFees {
            local: self.local_policy(chan_id).await?,
            remote: self.remote_policy(chan_id).await?,
        })
    }
}

#[derive(Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
}

#[derive(Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Deserialize)]
struct NodeInfoResponse {
    node: Option<LightningNode>,
}

#[derive(Deserialize)]
struct LightningNode {
    #[serde(default)]
    alias: String,
}

#[derive(Deserialize)]
struct ChannelEdge {
    node1_pub: String,
    #[serde(default)]
    node1_policy: Option<RoutingPolicy>,
    #[serde(default)]
    node2_policy: Option<RoutingPolicy>,
}

/// Retrying client for LND's REST gateway.
///
/// Authenticates with the admin macaroon and trusts only the node's own
/// TLS certificate. Node identity and peer aliases are cached for the
/// lifetime of the process.
pub struct LndClient {
    http: reqwest::Client,
    base_url: String,
    own_pubkey: OnceCell<String>,
    aliases: Mutex<HashMap<String, String>>,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const REQUEST_TIMEOUT_SECS: u64 = 30;

impl LndClient {
    pub fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        let macaroon_path = config.macaroon_path();
        let macaroon = std::fs::read(&macaroon_path).with_context(|| {
            format!("Failed to read macaroon at {}", macaroon_path.display())
        })?;

        let cert_path = config.tls_cert_path();
        let cert_pem = std::fs::read(&cert_path)
            .with_context(|| format!("Failed to read TLS cert at {}", cert_path.display()))?;
        let tls = pinned_tls_config(&cert_pem)
            .with_context(|| format!("Invalid TLS cert at {}", cert_path.display()))?;

        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&macaroon.as_slice().to_lower_hex_string())?;
        value.set_sensitive(true);
        headers.insert("Grpc-Metadata-macaroon", value);

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: format!("https://{}", config.rpc),
            own_pubkey: OnceCell::new(),
            aliases: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.to_string(),
            own_pubkey: OnceCell::new(),
            aliases: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        self.get_json_opt(path)
            .await?
            .with_context(|| format!("GET {}: not found", path))
    }

    /// Like `get_json`, but a 404 is `None` and is not retried.
    async fn get_json_opt<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<Option<T>> {
        let url = format!("{}/{}", self.base_url, path);
        for attempt in 0..MAX_RETRIES {
            match self.fetch(&url).await {
                Ok(resp) => {
                    debug!("GET {}: {}", path, if resp.is_some() { "success" } else { "not found" });
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                        warn!(
                            "GET {}: attempt {} failed ({:#}), retrying in {}ms",
                            path,
                            attempt + 1,
                            e,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    } else {
                        return Err(e.context(format!(
                            "GET {}: all {} attempts failed",
                            path, MAX_RETRIES
                        )));
                    }
                }
            }
        }
        unreachable!()
    }

    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> anyhow::Result<Option<T>> {
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json::<T>().await?))
    }

    async fn channel_edge(&self, chan_id: &str) -> anyhow::Result<ChannelEdge> {
        self.get_json(&format!("v1/graph/edge/{}", chan_id)).await
    }

    async fn policy(&self, chan_id: &str, local: bool) -> anyhow::Result<RoutingPolicy> {
        let own = self.own_pubkey().await?;
        let edge = self.channel_edge(chan_id).await?;
        let ours_is_node1 = edge.node1_pub == own;
        let policy = if ours_is_node1 == local {
            edge.node1_policy
        } else {
            edge.node2_policy
        };
        Ok(policy.unwrap_or_else(|| {
            warn!(
                "Channel {}: {} policy not announced, assuming zero fees",
                chan_id,
                if local { "local" } else { "remote" }
            );
            RoutingPolicy::default()
        }))
    }
}

#[async_trait::async_trait]
impl NodeClient for LndClient {
    async fn own_pubkey(&self) -> anyhow::Result<String> {
        let pubkey = self
            .own_pubkey
            .get_or_try_init(|| async {
                let info: GetInfoResponse = self.get_json("v1/getinfo").await?;
                Ok::<_, anyhow::Error>(info.identity_pubkey)
            })
            .await?;
        Ok(pubkey.clone())
    }

    async fn list_active_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let resp: ListChannelsResponse = self.get_json("v1/channels").await?;
        Ok(resp.channels.into_iter().filter(|c| c.active).collect())
    }

    async fn node_alias(&self, pubkey: &str) -> anyhow::Result<String> {
        let cached = self
            .aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(pubkey)
            .cloned();
        if let Some(alias) = cached {
            return Ok(alias);
        }

        // Private peers are unknown to the graph and come back as 404.
        let info: Option<NodeInfoResponse> = self
            .get_json_opt(&format!("v1/graph/node/{}", pubkey))
            .await?;
        let alias = info
            .and_then(|i| i.node)
            .map(|n| n.alias)
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| {
                debug!("Node {} has no alias, using its pubkey", pubkey);
                pubkey.to_string()
            });

        self.aliases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pubkey.to_string(), alias.clone());
        Ok(alias)
    }

    async fn local_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy> {
        self.policy(chan_id, true).await
    }

    async fn remote_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy> {
        self.policy(chan_id, false).await
    }
}

/// Accepts exactly the certificate(s) in LND's `tls.cert`.
///
/// LND serves a self-signed cert carrying CA basic constraints, which webpki
/// refuses as an end-entity certificate, so the chain is not validated and
/// the leaf is compared byte for byte instead.
struct PinnedCertVerifier {
    pinned: Vec<Vec<u8>>,
}

impl rustls::client::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        if self.pinned.iter().any(|der| *der == end_entity.0) {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the configured tls.cert".to_string(),
            ))
        }
    }
}

fn pinned_verifier(cert_pem: &[u8]) -> anyhow::Result<PinnedCertVerifier> {
    let pinned = rustls_pemfile::certs(&mut &cert_pem[..]).context("TLS cert is not valid PEM")?;
    if pinned.is_empty() {
        anyhow::bail!("no certificate found in PEM");
    }
    Ok(PinnedCertVerifier { pinned })
}

fn pinned_tls_config(cert_pem: &[u8]) -> anyhow::Result<rustls::ClientConfig> {
    let verifier = pinned_verifier(cert_pem)?;
    Ok(rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

// ---------------------------------------------------------------------------
// Mock client for testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Mock node that serves preset channels and records lookups.
    ///
    /// `channels` is shared so a test can mutate balances between calls,
    /// emulating the effect of a rebalance.
    pub struct MockNodeClient {
        pub own_pubkey: String,
        pub channels: Arc<Mutex<Vec<Channel>>>,
        pub aliases: HashMap<String, String>,
        pub fees: HashMap<String, ChannelFees>,
        pub fail_listing: bool,
        // Call recorders
        pub list_calls: Arc<Mutex<usize>>,
        pub alias_calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockNodeClient {
        pub fn new() -> Self {
            Self {
                own_pubkey: "03mock_own_node".to_string(),
                channels: Arc::new(Mutex::new(Vec::new())),
                aliases: HashMap::new(),
                fees: HashMap::new(),
                fail_listing: false,
                list_calls: Arc::new(Mutex::new(0)),
                alias_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn with_channels(channels: Vec<Channel>) -> Self {
            let mock = Self::new();
            *mock.channels.lock().unwrap() = channels;
            mock
        }

        pub fn set_alias(&mut self, pubkey: &str, alias: &str) {
            self.aliases.insert(pubkey.to_string(), alias.to_string());
        }
    }

    #[async_trait::async_trait]
    impl NodeClient for MockNodeClient {
        async fn own_pubkey(&self) -> anyhow::Result<String> {
            Ok(self.own_pubkey.clone())
        }

        async fn list_active_channels(&self) -> anyhow::Result<Vec<Channel>> {
            *self.list_calls.lock().unwrap() += 1;
            if self.fail_listing {
                anyhow::bail!("mock node unreachable");
            }
            Ok(self
                .channels
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.active)
                .cloned()
                .collect())
        }

        async fn node_alias(&self, pubkey: &str) -> anyhow::Result<String> {
            self.alias_calls.lock().unwrap().push(pubkey.to_string());
            Ok(self
                .aliases
                .get(pubkey)
                .cloned()
                .unwrap_or_else(|| pubkey.to_string()))
        }

        async fn local_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy> {
            Ok(self.fees.get(chan_id).map(|f| f.local).unwrap_or_default())
        }

        async fn remote_policy(&self, chan_id: &str) -> anyhow::Result<RoutingPolicy> {
            Ok(self.fees.get(chan_id).map(|f| f.remote).unwrap_or_default())
        }
    }
}
