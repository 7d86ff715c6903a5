use anyhow::Context;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Per-attempt budget handed to the tool via `--minutes`.
pub const ATTEMPT_MINUTES: u64 = 1;
/// Extra time granted after the tool's own budget before it is killed.
const KILL_GRACE_SECS: u64 = 30;

const DEFAULT_BOS_PATHS: [&str; 2] = ["/usr/local/bin/bos", "/usr/bin/bos"];

/// Fee cap for one attempt. Only one form is ever passed to the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeLimit {
    /// `--max-fee`, in satoshis.
    Fixed(u64),
    /// `--max-fee-rate`, in parts per million.
    Rate(u64),
}

impl FeeLimit {
    /// The fixed form wins when both are configured; zero means unset.
    pub fn from_config(fixed_sats: u64, rate_ppm: u64) -> Option<Self> {
        if fixed_sats > 0 {
            Some(FeeLimit::Fixed(fixed_sats))
        } else if rate_ppm > 0 {
            Some(FeeLimit::Rate(rate_ppm))
        } else {
            None
        }
    }
}

/// One attempt to move `amount_sats` out of `out_alias` and into `in_alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceRequest {
    pub amount_sats: u64,
    pub out_alias: String,
    pub in_alias: String,
    pub fee_limit: Option<FeeLimit>,
    pub avoid: Vec<String>,
    pub node: Option<String>,
}

impl RebalanceRequest {
    /// Arguments following the executable name.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "rebalance".to_string(),
            "--amount".to_string(),
            self.amount_sats.to_string(),
            "--out".to_string(),
            self.out_alias.clone(),
            "--in".to_string(),
            self.in_alias.clone(),
        ];
        match self.fee_limit {
            Some(FeeLimit::Fixed(sats)) => {
                args.push("--max-fee".to_string());
                args.push(sats.to_string());
            }
            Some(FeeLimit::Rate(ppm)) => {
                args.push("--max-fee-rate".to_string());
                args.push(ppm.to_string());
            }
            None => {}
        }
        for entry in &self.avoid {
            args.push("--avoid".to_string());
            args.push(entry.split_whitespace().collect());
        }
        args.push("--no-color".to_string());
        args.push("--minutes".to_string());
        args.push(ATTEMPT_MINUTES.to_string());
        if let Some(node) = &self.node {
            args.push("--node".to_string());
            args.push(node.clone());
        }
        args
    }
}

/// Runs one rebalance attempt and returns the tool's raw report text.
#[async_trait::async_trait]
pub trait RebalanceExecutor: Send + Sync {
    async fn execute(&self, request: &RebalanceRequest) -> anyhow::Result<String>;
}

/// Drives Balance of Satoshis (`bos rebalance`).
pub struct BosExecutor {
    path: PathBuf,
    kill_after: Duration,
}

impl BosExecutor {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            kill_after: Duration::from_secs(ATTEMPT_MINUTES * 60 + KILL_GRACE_SECS),
        }
    }

    /// Use `configured` if given, otherwise the first standard install
    /// location that exists.
    pub fn locate(configured: Option<&Path>) -> Self {
        let path = match configured {
            Some(p) => p.to_path_buf(),
            None => DEFAULT_BOS_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BOS_PATHS[1])),
        };
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl RebalanceExecutor for BosExecutor {
    async fn execute(&self, request: &RebalanceRequest) -> anyhow::Result<String> {
        let args = request.to_args();
        debug!("Executing {} {}", self.path.display(), args.join(" "));

        let child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.path.display()))?;

        // Dropping the pending future on timeout kills the child.
        let output = match tokio::time::timeout(self.kill_after, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to collect rebalance output")?,
            Err(_) => {
                warn!(
                    "Rebalance attempt exceeded {}s, killed",
                    self.kill_after.as_secs()
                );
                return Ok(format!(
                    "err:\n  - 408\n  - RebalanceAttemptKilledAfter{}s\n",
                    self.kill_after.as_secs()
                ));
            }
        };

        Ok(combine_output(&output.stdout, &output.stderr))
    }
}

/// Stdout followed by stderr, always on separate lines so a marker at the
/// start of stderr stays at a line start.
fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    if !text.is_empty() && !stderr.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&String::from_utf8_lossy(stderr));
    text.trim().to_string()
}

// ---------------------------------------------------------------------------
// Mock executor for testing
// ---------------------------------------------------------------------------
