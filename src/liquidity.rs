//! Liquidity classification of a channel.
//!
//! All amounts are satoshis. "Available" means balance above the channel
//! reserve, i.e. what can actually move on that side.

use crate::channel::Channel;

/// Number of slots in the coarse ratio scale.
pub const RATIO_SCALE: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("channel {chan_id} has no capacity above its reserves")]
    ZeroCapacity { chan_id: String },
}

/// Coarse 0..=10 split of a channel's available capacity.
/// `local + remote == RATIO_SCALE` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityRatio {
    pub local: u64,
    pub remote: u64,
}

pub fn available(balance: u64, reserve: u64) -> u64 {
    balance.saturating_sub(reserve)
}

pub fn local_available(channel: &Channel) -> u64 {
    available(channel.local_balance, channel.local_chan_reserve_sat)
}

pub fn remote_available(channel: &Channel) -> u64 {
    available(channel.remote_balance, channel.remote_chan_reserve_sat)
}

pub fn capacity(channel: &Channel) -> u64 {
    local_available(channel) + remote_available(channel)
}

fn nonzero_capacity(channel: &Channel) -> Result<u64, ClassificationError> {
    match capacity(channel) {
        0 => Err(ClassificationError::ZeroCapacity {
            chan_id: channel.chan_id.clone(),
        }),
        c => Ok(c),
    }
}

pub fn ratio(channel: &Channel) -> Result<LiquidityRatio, ClassificationError> {
    let capacity = nonzero_capacity(channel)?;
    let local = RATIO_SCALE * local_available(channel) / capacity;
    Ok(LiquidityRatio {
        local,
        remote: RATIO_SCALE - local,
    })
}

/// Share of the available capacity on our side, 0..=100, ties to even.
pub fn local_available_percentage(channel: &Channel) -> Result<u64, ClassificationError> {
    Ok(percentage(local_available(channel), nonzero_capacity(channel)?))
}

pub fn remote_available_percentage(channel: &Channel) -> Result<u64, ClassificationError> {
    Ok(percentage(remote_available(channel), nonzero_capacity(channel)?))
}

fn percentage(part: u64, capacity: u64) -> u64 {
    (part as f64 / capacity as f64 * 100.0).round_ties_even() as u64
}
