pub mod expr;

use crate::channel::{Channel, ChannelFees};
use crate::liquidity::{self, ClassificationError};
use expr::{Expression, PolicyError};
use log::{debug, warn};

/// Live channel values an expression may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    LocalAvailable,
    RemoteAvailable,
    CapacityAvailable,
    LocalAvailablePercentage,
    RemoteAvailablePercentage,
    LocalFeeRate,
    LocalFeeBase,
    RemoteFeeRate,
    RemoteFeeBase,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::LocalAvailable,
        Metric::RemoteAvailable,
        Metric::CapacityAvailable,
        Metric::LocalAvailablePercentage,
        Metric::RemoteAvailablePercentage,
        Metric::LocalFeeRate,
        Metric::LocalFeeBase,
        Metric::RemoteFeeRate,
        Metric::RemoteFeeBase,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::LocalAvailable => "LOCAL_AVAILABLE",
            Metric::RemoteAvailable => "REMOTE_AVAILABLE",
            Metric::CapacityAvailable => "CAPACITY_AVAILABLE",
            Metric::LocalAvailablePercentage => "LOCAL_AVAILABLE_PERCENTAGE",
            Metric::RemoteAvailablePercentage => "REMOTE_AVAILABLE_PERCENTAGE",
            Metric::LocalFeeRate => "LOCAL_FEE_RATE",
            Metric::LocalFeeBase => "LOCAL_FEE_BASE",
            Metric::RemoteFeeRate => "REMOTE_FEE_RATE",
            Metric::RemoteFeeBase => "REMOTE_FEE_BASE",
        }
    }

    pub fn from_name(name: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// Snapshot of the placeholder values for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelMetrics {
    pub local_available: u64,
    pub remote_available: u64,
    pub capacity_available: u64,
    pub local_available_percentage: u64,
    pub remote_available_percentage: u64,
    pub local_fee_rate: u64,
    pub local_fee_base: u64,
    pub remote_fee_rate: u64,
    pub remote_fee_base: u64,
}

impl ChannelMetrics {
    pub fn new(channel: &Channel, fees: &ChannelFees) -> Result<Self, ClassificationError> {
        Ok(Self {
            local_available: liquidity::local_available(channel),
            remote_available: liquidity::remote_available(channel),
            capacity_available: liquidity::capacity(channel),
            local_available_percentage: liquidity::local_available_percentage(channel)?,
            remote_available_percentage: liquidity::remote_available_percentage(channel)?,
            local_fee_rate: fees.local.fee_rate_milli_msat,
            local_fee_base: fees.local.fee_base_msat,
            remote_fee_rate: fees.remote.fee_rate_milli_msat,
            remote_fee_base: fees.remote.fee_base_msat,
        })
    }

    pub fn get(&self, metric: Metric) -> u64 {
        match metric {
            Metric::LocalAvailable => self.local_available,
            Metric::RemoteAvailable => self.remote_available,
            Metric::CapacityAvailable => self.capacity_available,
            Metric::LocalAvailablePercentage => self.local_available_percentage,
            Metric::RemoteAvailablePercentage => self.remote_available_percentage,
            Metric::LocalFeeRate => self.local_fee_rate,
            Metric::LocalFeeBase => self.local_fee_base,
            Metric::RemoteFeeRate => self.remote_fee_rate,
            Metric::RemoteFeeBase => self.remote_fee_base,
        }
    }
}

/// Operator-supplied rule deciding whether a channel keeps being rebalanced.
///
/// Only the first configured expression is consulted; any further ones are
/// accepted but inert. With no expressions the policy never stops a channel.
#[derive(Debug, Clone, Default)]
pub struct ContinuationPolicy {
    expressions: Vec<String>,
}

impl ContinuationPolicy {
    pub fn new(expressions: Vec<String>) -> Self {
        if expressions.len() > 1 {
            warn!(
                "Policy: {} expressions configured, only the first is evaluated: {:?}",
                expressions.len(),
                expressions[0]
            );
        }
        if let Some(first) = expressions.first() {
            if let Err(e) = Expression::compile(first) {
                warn!("Policy: expression {:?} is invalid ({}), rebalancing will stop", first, e);
            }
        }
        Self { expressions }
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    /// Fails closed: an expression that cannot be compiled or evaluated
    /// stops rebalancing.
    pub fn should_continue(&self, metrics: &ChannelMetrics) -> bool {
        let Some(first) = self.expressions.first() else {
            return true;
        };
        match evaluate(first, metrics) {
            Ok(verdict) => {
                debug!("Policy: {:?} -> {}", first, verdict);
                verdict
            }
            Err(e) => {
                warn!("Policy: cannot evaluate {:?}: {}", first, e);
                false
            }
        }
    }
}

fn evaluate(text: &str, metrics: &ChannelMetrics) -> Result<bool, PolicyError> {
    Expression::compile(text)?.evaluate(metrics)
}
