pub mod executor;
pub mod report;
pub mod session;

use crate::channel::Channel;
use crate::client::NodeClient;
use crate::config::Config;
use crate::db::Database;
use crate::history;
use crate::policy::{ChannelMetrics, ContinuationPolicy};
use crate::selector::{self, EligibleChannel, ExclusionSet};
use executor::{FeeLimit, RebalanceExecutor, RebalanceRequest};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use report::{RebalanceOutcome, RebalanceReport};
use session::RebalanceSession;

/// Budgets and tool options for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceSettings {
    pub amount_sats: u64,
    pub timeout_secs: u64,
    pub max_total_fees: u64,
    pub limit_rebalance: u64,
    pub fee_limit: Option<FeeLimit>,
    pub node: Option<String>,
    pub dry_run: bool,
}

impl RebalanceSettings {
    pub fn from_config(config: &Config) -> Self {
        let r = &config.rebalance;
        Self {
            amount_sats: r.amount,
            timeout_secs: r.timeout,
            max_total_fees: r.max_total_fees,
            limit_rebalance: r.limit_rebalance,
            fee_limit: FeeLimit::from_config(r.fee_limit, r.fee_ppm_limit),
            node: r.node_save.clone(),
            dry_run: config.general.dry_run,
        }
    }
}

/// Why the loop for one target channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    PolicySatisfied,
    FeeBudgetReached,
    AttemptLimitReached,
    ChannelGone,
    NoDonor,
    AttemptFailed { code: Option<u32>, message: String },
    /// The attempt succeeded but its report carried no readable fee.
    FeeUnknown,
    DryRun,
}

/// One successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRebalance {
    pub donor_alias: String,
    pub amount_sats: u64,
    pub fee_sats: u64,
    pub report: RebalanceReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRun {
    pub target: EligibleChannel,
    pub completed: Vec<CompletedRebalance>,
    pub stop: StopReason,
}

/// Everything one invocation did, in candidate order.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub runs: Vec<ChannelRun>,
    pub session: RebalanceSession,
}

impl RunSummary {
    pub fn completed(&self) -> impl Iterator<Item = &CompletedRebalance> {
        self.runs.iter().flat_map(|r| r.completed.iter())
    }

    pub fn has_rebalanced(&self) -> bool {
        self.session.total_attempts > 0
    }
}

/// Drives rebalances into depleted channels under the session budgets.
pub struct Rebalancer<'a, C: NodeClient + ?Sized, E: RebalanceExecutor + ?Sized> {
    client: &'a C,
    executor: &'a E,
    db: &'a Database,
    settings: RebalanceSettings,
    policy: ContinuationPolicy,
    excluded: ExclusionSet,
}

impl<'a, C: NodeClient + ?Sized, E: RebalanceExecutor + ?Sized> Rebalancer<'a, C, E> {
    pub fn new(
        client: &'a C,
        executor: &'a E,
        db: &'a Database,
        settings: RebalanceSettings,
        policy: ContinuationPolicy,
        excluded: ExclusionSet,
    ) -> Self {
        Self {
            client,
            executor,
            db,
            settings,
            policy,
            excluded,
        }
    }

    #[cfg(test)]
    pub fn excluded(&self) -> &ExclusionSet {
        &self.excluded
    }

    /// Rebalance every low-outbound candidate in turn. The candidate list is
    /// taken once, up front.
    pub async fn run(&mut self, session: &mut RebalanceSession) -> anyhow::Result<Vec<ChannelRun>> {
        let candidates = selector::low_outbound_candidates(self.client, &self.excluded).await?;
        info!("Rebalancer: {} low-outbound candidate(s)", candidates.len());

        let mut runs = Vec::with_capacity(candidates.len());
        for target in candidates {
            let run = self.loop_rebalance(session, target).await?;
            debug!("Rebalancer: {} finished: {:?}", run.target.alias, run.stop);
            runs.push(run);
        }
        Ok(runs)
    }

    /// Repeatedly push liquidity into `target` until a budget, the policy, or
    /// a failed attempt stops it.
    pub async fn loop_rebalance(
        &mut self,
        session: &mut RebalanceSession,
        target: EligibleChannel,
    ) -> anyhow::Result<ChannelRun> {
        let mut completed = Vec::new();

        let stop = loop {
            if session.timed_out(self.settings.timeout_secs) {
                break StopReason::Timeout;
            }

            let Some(fresh) = self.client.channel_by_id(&target.channel.chan_id).await? else {
                warn!(
                    "Rebalancer: channel {} ({}) is no longer active",
                    target.channel.chan_id, target.alias
                );
                break StopReason::ChannelGone;
            };
            if !self.policy_allows(&fresh).await? {
                break StopReason::PolicySatisfied;
            }
            if session.total_fees_spent >= self.settings.max_total_fees {
                break StopReason::FeeBudgetReached;
            }
            if session.total_attempts >= self.settings.limit_rebalance {
                break StopReason::AttemptLimitReached;
            }

            let Some(donor) = self.pick_donor(&target.alias).await? else {
                info!("Rebalancer: no donor available for {}", target.alias);
                break StopReason::NoDonor;
            };

            let request = RebalanceRequest {
                amount_sats: self.settings.amount_sats,
                out_alias: donor.clone(),
                in_alias: target.alias.clone(),
                fee_limit: self.settings.fee_limit,
                avoid: self.excluded.entries().to_vec(),
                node: self.settings.node.clone(),
            };

            if self.settings.dry_run {
                info!(
                    "Rebalancer: dry run, would execute: {}",
                    request.to_args().join(" ")
                );
                break StopReason::DryRun;
            }

            info!(
                "Rebalancer: moving {} sats from {} into {}",
                request.amount_sats, donor, target.alias
            );
            let raw = self.executor.execute(&request).await?;

            match report::parse(&raw) {
                RebalanceOutcome::Failed { code, message } => {
                    warn!(
                        "Rebalancer: attempt {} -> {} failed: {}",
                        donor, target.alias, message
                    );
                    history::record_attempt(
                        self.db,
                        &target,
                        &request,
                        None,
                        Some(message.as_str()),
                    )?;
                    break StopReason::AttemptFailed { code, message };
                }
                RebalanceOutcome::Succeeded(report) => {
                    let fee = report.fee_spent_sats();
                    history::record_attempt(self.db, &target, &request, fee, None)?;
                    session.record_success(request.amount_sats, fee.unwrap_or(0));
                    completed.push(CompletedRebalance {
                        donor_alias: donor,
                        amount_sats: request.amount_sats,
                        fee_sats: fee.unwrap_or(0),
                        report,
                    });
                    if fee.is_none() {
                        warn!(
                            "Rebalancer: no fee in report for {}, stopping this channel",
                            target.alias
                        );
                        break StopReason::FeeUnknown;
                    }
                    info!(
                        "Rebalancer: {} fees spent so far, {} attempt(s)",
                        session.total_fees_spent, session.total_attempts
                    );
                }
            }
        };

        Ok(ChannelRun {
            target,
            completed,
            stop,
        })
    }

    async fn policy_allows(&self, channel: &Channel) -> anyhow::Result<bool> {
        if self.policy.is_empty() {
            return Ok(true);
        }
        let fees = self.client.channel_fees(&channel.chan_id).await?;
        match ChannelMetrics::new(channel, &fees) {
            Ok(metrics) => Ok(self.policy.should_continue(&metrics)),
            Err(e) => {
                warn!("Rebalancer: {}", e);
                Ok(false)
            }
        }
    }

    /// A random outbound-rich channel other than the target. The target is
    /// excluded only for the duration of the selection.
    async fn pick_donor(&mut self, target_alias: &str) -> anyhow::Result<Option<String>> {
        let guard = self.excluded.exclude_temporarily(target_alias);
        let donors = selector::high_outbound_donors(self.client, &guard).await;
        drop(guard);
        let donors = donors?;
        Ok(donors
            .choose(&mut rand::thread_rng())
            .map(|d| d.alias.clone()))
    }
}

/// Run one rebalance invocation with settings taken from `config`.
pub async fn run(
    config: &Config,
    client: &(impl NodeClient + ?Sized),
    executor: &(impl RebalanceExecutor + ?Sized),
    db: &Database,
) -> anyhow::Result<RunSummary> {
    let settings = RebalanceSettings::from_config(config);
    let policy = ContinuationPolicy::new(config.rebalance.expressions.clone());
    let excluded = ExclusionSet::new(config.rebalance.excluded.iter().cloned());

    let mut session = RebalanceSession::start();
    let mut rebalancer = Rebalancer::new(client, executor, db, settings, policy, excluded);
    let runs = rebalancer.run(&mut session).await?;

    if !config.general.dry_run {
        history::record_session(db, &session)?;
    }
    info!(
        "Rebalancer: done, {} attempt(s), {} sats moved, {} sats in fees",
        session.total_attempts, session.total_amount_moved, session.total_fees_spent
    );
    Ok(RunSummary { runs, session })
}
