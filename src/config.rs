use serde::Deserialize;
use std::path::{Path, PathBuf};

/// The rebalance tool rejects amounts below this.
pub const MIN_REBALANCE_AMOUNT: u64 = 50_000;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// LND data directory
    #[serde(default = "default_lnddir")]
    pub lnddir: PathBuf,
    /// LND REST endpoint (host:port, no scheme)
    #[serde(default = "default_rpc")]
    pub rpc: String,
    /// Chain network, used to locate the macaroon
    #[serde(default = "default_network")]
    pub network: String,
    /// Overrides `{lnddir}/data/chain/bitcoin/{network}/admin.macaroon`
    #[serde(default)]
    pub macaroon: Option<PathBuf>,
    /// Overrides `{lnddir}/tls.cert`
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the attempt history database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Dry-run mode: log the commands but execute nothing
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct RebalanceConfig {
    /// Satoshis moved per attempt
    #[serde(default = "default_amount")]
    pub amount: u64,
    /// Session wall-clock budget in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Per-attempt fee cap in satoshis (0 = unset)
    #[serde(default)]
    pub fee_limit: u64,
    /// Per-attempt fee cap in ppm, used only when `fee_limit` is unset
    #[serde(default)]
    pub fee_ppm_limit: u64,
    /// Session fee budget in satoshis
    #[serde(default = "default_max_total_fees")]
    pub max_total_fees: u64,
    /// Channel ids or aliases never touched
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Continuation rules; only the first is evaluated
    #[serde(default)]
    pub expressions: Vec<String>,
    /// Maximum successful attempts per session
    #[serde(default = "default_limit_rebalance")]
    pub limit_rebalance: u64,
    /// Saved node name passed to the tool as `--node`
    #[serde(default)]
    pub node_save: Option<String>,
    /// Explicit path to the `bos` executable
    #[serde(default)]
    pub bos_path: Option<PathBuf>,
}

// Default value functions
fn default_lnddir() -> PathBuf {
    PathBuf::from("~/.lnd")
}
fn default_rpc() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_network() -> String {
    "mainnet".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("autorebalance.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_amount() -> u64 {
    MIN_REBALANCE_AMOUNT
}
fn default_timeout() -> u64 {
    300
}
fn default_max_total_fees() -> u64 {
    5_000
}
fn default_limit_rebalance() -> u64 {
    1
}

// Default implementations
impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            lnddir: default_lnddir(),
            rpc: default_rpc(),
            network: default_network(),
            macaroon: None,
            tls_cert: None,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            dry_run: false,
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            amount: default_amount(),
            timeout: default_timeout(),
            fee_limit: 0,
            fee_ppm_limit: 0,
            max_total_fees: default_max_total_fees(),
            excluded: Vec::new(),
            expressions: Vec::new(),
            limit_rebalance: default_limit_rebalance(),
            node_save: None,
            bos_path: None,
        }
    }
}

impl NodeConfig {
    pub fn macaroon_path(&self) -> PathBuf {
        match &self.macaroon {
            Some(p) => expand_tilde(p),
            None => expand_tilde(&self.lnddir)
                .join("data")
                .join("chain")
                .join("bitcoin")
                .join(&self.network)
                .join("admin.macaroon"),
        }
    }

    pub fn tls_cert_path(&self) -> PathBuf {
        match &self.tls_cert {
            Some(p) => expand_tilde(p),
            None => expand_tilde(&self.lnddir).join("tls.cert"),
        }
    }
}

/// Replace a leading `~` with `$HOME`. Other paths are returned unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

impl Config {
    /// A missing file is not an error: every setting has a default.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Checks the settings a rebalance run depends on.
    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.rebalance;
        if r.amount < MIN_REBALANCE_AMOUNT {
            anyhow::bail!(
                "amount ({}) below the minimum of {} sats",
                r.amount,
                MIN_REBALANCE_AMOUNT
            );
        }
        if r.fee_limit == 0 && r.fee_ppm_limit == 0 {
            anyhow::bail!("either fee_limit or fee_ppm_limit must be set");
        }
        if r.limit_rebalance == 0 {
            anyhow::bail!("limit_rebalance must be at least 1");
        }
        if r.timeout == 0 {
            anyhow::bail!("timeout must be greater than 0");
        }
        if self.node.rpc.contains("://") {
            anyhow::bail!("rpc must be host:port without a scheme: {}", self.node.rpc);
        }
        Ok(())
    }

    /// Create a config with all defaults and a fee limit set, for testing.
    #[cfg(test)]
    pub fn test_default() -> Self {
        let mut config = Config::default();
        config.rebalance.fee_limit = 100;
        config
    }
}
