mod channel;
mod client;
mod config;
mod db;
mod history;
mod liquidity;
mod policy;
mod rebalancer;
mod selector;

use anyhow::Context;
use crate::client::NodeClient;
use clap::{Args, Parser, Subcommand};
use config::Config;
use log::{info, warn};
use rebalancer::executor::{BosExecutor, RebalanceExecutor};
use rebalancer::{CompletedRebalance, RunSummary};
use selector::{EligibleChannel, ExclusionSet};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "autorebalance",
    about = "Automatic channel rebalancing for LND via Balance of Satoshis"
)]
struct Cli {
    /// Path to autorebalance.toml config file
    #[arg(short, long, default_value = "autorebalance.toml")]
    config: PathBuf,

    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides for the `[node]` section.
#[derive(Args, Default)]
struct NodeArgs {
    /// LND data directory
    #[arg(short = 'd', long, global = true)]
    lnddir: Option<PathBuf>,
    /// LND REST endpoint (host:port)
    #[arg(short = 's', long, global = true)]
    rpc: Option<String>,
    /// Chain network (mainnet, testnet, ...)
    #[arg(short = 'n', long, global = true)]
    network: Option<String>,
}

impl NodeArgs {
    fn apply(&self, node: &mut config::NodeConfig) {
        if let Some(dir) = &self.lnddir {
            node.lnddir = dir.clone();
        }
        if let Some(rpc) = &self.rpc {
            node.rpc = rpc.clone();
        }
        if let Some(network) = &self.network {
            node.network = network.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Rebalance every low-outbound channel (default)
    Rebalance(RebalanceArgs),
    /// Print active channels with their liquidity and fees
    ListChannels,
    /// Print rebalance history totals from the database
    Status,
}

/// Overrides for the `[rebalance]` section.
#[derive(Args, Default)]
struct RebalanceArgs {
    /// Satoshis moved per attempt
    #[arg(short, long)]
    amount: Option<u64>,
    /// Session timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Per-attempt fee cap in satoshis
    #[arg(short, long)]
    fee_limit: Option<u64>,
    /// Per-attempt fee cap in ppm
    #[arg(short = 'p', long)]
    fee_ppm_limit: Option<u64>,
    /// Session fee budget in satoshis
    #[arg(short, long)]
    max_total_fees: Option<u64>,
    /// Channel id or alias to leave alone (repeatable)
    #[arg(short, long)]
    excluded: Vec<String>,
    /// Continuation rule, e.g. "LOCAL_AVAILABLE_PERCENTAGE < 20"
    #[arg(short = 'x', long = "expression")]
    expressions: Vec<String>,
    /// Maximum successful attempts per session
    #[arg(short, long)]
    limit_rebalance: Option<u64>,
    /// Saved node name for `bos --node`
    #[arg(long)]
    node_save: Option<String>,
    /// Path to the bos executable
    #[arg(long)]
    bos_path: Option<PathBuf>,
    /// Log the commands but execute nothing
    #[arg(long)]
    dry_run: bool,
}

impl RebalanceArgs {
    fn apply(&self, config: &mut Config) {
        let r = &mut config.rebalance;
        if let Some(v) = self.amount {
            r.amount = v;
        }
        if let Some(v) = self.timeout {
            r.timeout = v;
        }
        if let Some(v) = self.fee_limit {
            r.fee_limit = v;
        }
        if let Some(v) = self.fee_ppm_limit {
            r.fee_ppm_limit = v;
        }
        if let Some(v) = self.max_total_fees {
            r.max_total_fees = v;
        }
        if !self.excluded.is_empty() {
            r.excluded = self.excluded.clone();
        }
        if !self.expressions.is_empty() {
            r.expressions = self.expressions.clone();
        }
        if let Some(v) = self.limit_rebalance {
            r.limit_rebalance = v;
        }
        if let Some(v) = &self.node_save {
            r.node_save = Some(v.clone());
        }
        if let Some(v) = &self.bos_path {
            r.bos_path = Some(v.clone());
        }
        if self.dry_run {
            config.general.dry_run = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Commands::Rebalance(RebalanceArgs::default()));

    let mut config = Config::load(&cli.config)?;
    cli.node.apply(&mut config.node);
    if let Commands::Rebalance(args) = &command {
        args.apply(&mut config);
    }

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    match command {
        Commands::Rebalance(_) => {
            config.validate()?;
            info!("autorebalance v{} starting", env!("CARGO_PKG_VERSION"));
            if config.general.dry_run {
                warn!("DRY-RUN MODE: No rebalances will be executed");
            }
            let client = client::LndClient::new(&config.node)?;
            let db = db::Database::open(&config.general.database_path)?;
            let executor = BosExecutor::locate(config.rebalance.bos_path.as_deref());
            info!("Using {}", executor.path().display());

            for line in run_rebalance(&config, &client, &executor, &db).await? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::ListChannels => {
            let client = client::LndClient::new(&config.node)?;
            for line in list_channels(&config, &client).await? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Status => {
            let db = db::Database::open(&config.general.database_path)?;
            for line in status_lines(&db)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

/// One rebalance invocation. Fails when nothing was moved, outside dry runs.
async fn run_rebalance(
    config: &Config,
    client: &(impl NodeClient + ?Sized),
    executor: &(impl RebalanceExecutor + ?Sized),
    db: &db::Database,
) -> anyhow::Result<Vec<String>> {
    let summary = rebalancer::run(config, client, executor, db).await?;
    if !summary.has_rebalanced() {
        if config.general.dry_run {
            return Ok(vec!["Dry run complete, nothing was executed.".to_string()]);
        }
        anyhow::bail!("No channels have been rebalanced.");
    }
    Ok(summary_lines(&summary))
}

fn summary_lines(summary: &RunSummary) -> Vec<String> {
    let mut lines: Vec<String> = summary.completed().map(completed_line).collect();
    lines.push(format!(
        "Total amount rebalanced: {} sats",
        summary.session.total_amount_moved
    ));
    lines.push(format!(
        "Total fees spent:        {} sats",
        summary.session.total_fees_spent
    ));
    lines.push(format!(
        "Attempts:                {}",
        summary.session.total_attempts
    ));
    lines
}

fn completed_line(c: &CompletedRebalance) -> String {
    let (out_hop, middle, in_hop) = c
        .report
        .route_summary()
        .unwrap_or((c.donor_alias.as_str(), "?", "?"));
    format!(
        "{:>10} sats  fee {:>6} sats  {} -> {} -> {}",
        c.amount_sats, c.fee_sats, out_hop, middle, in_hop
    )
}

async fn list_channels(
    config: &Config,
    client: &(impl NodeClient + ?Sized),
) -> anyhow::Result<Vec<String>> {
    let excluded = ExclusionSet::new(config.rebalance.excluded.iter().cloned());
    let mut lines = vec![format!(
        "{:>12}  {:<12}  {:>12}  {:>9}  {:>9}  {}",
        "inbound", "ratio", "outbound", "local fee", "peer fee", "alias"
    )];
    for eligible in selector::list_eligible(client, &excluded).await? {
        let fees = client.channel_fees(&eligible.channel.chan_id).await?;
        lines.push(channel_line(&eligible, &fees));
    }
    Ok(lines)
}

/// Inbound on the left, outbound on the right, one bar slot per ratio unit.
fn channel_line(eligible: &EligibleChannel, fees: &channel::ChannelFees) -> String {
    let ch = &eligible.channel;
    let bar = match liquidity::ratio(ch) {
        Ok(r) => format!(
            "[{}{}]",
            "=".repeat(r.remote as usize),
            "#".repeat(r.local as usize)
        ),
        Err(_) => format!("[{}]", " ".repeat(liquidity::RATIO_SCALE as usize)),
    };
    format!(
        "{:>12}  {:<12}  {:>12}  {:>9}  {:>9}  {}",
        liquidity::remote_available(ch),
        bar,
        liquidity::local_available(ch),
        format!("{}/{}", fees.local.fee_base_msat, fees.local.fee_rate_milli_msat),
        format!("{}/{}", fees.remote.fee_base_msat, fees.remote.fee_rate_milli_msat),
        eligible.alias
    )
}

fn status_lines(db: &db::Database) -> anyhow::Result<Vec<String>> {
    let totals = history::totals(db)?;
    let sessions: i64 = db
        .conn()
        .query_row("SELECT COUNT(*) FROM rebalance_sessions", [], |r| r.get(0))
        .context("Failed to count rebalance sessions")?;

    let mut lines = vec![
        "autorebalance status".to_string(),
        "====================".to_string(),
        format!("Sessions recorded:      {}", sessions),
        format!(
            "Attempts:               {} ({} succeeded)",
            totals.attempts, totals.succeeded
        ),
        format!("Amount rebalanced:      {} sats", totals.amount_sats),
        format!("Fees spent:             {} sats", totals.fees_sats),
    ];

    let recent = history::recent_attempts(db, 10)?;
    if !recent.is_empty() {
        lines.push(String::new());
        lines.push("Recent attempts:".to_string());
        for row in recent {
            let when = chrono::DateTime::from_timestamp(row.attempted_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            let outcome = match (&row.error, row.fee_sats) {
                (Some(err), _) => format!("failed: {}", err),
                (None, Some(fee)) => format!("fee {} sats", fee),
                (None, None) => "fee unknown".to_string(),
            };
            lines.push(format!(
                "  {}  {} sats  {} -> {}  {}",
                when, row.amount_sats, row.out_alias, row.in_alias, outcome
            ));
        }
    }
    Ok(lines)
}
