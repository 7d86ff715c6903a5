use serde::{Deserialize, Deserializer};

/// Snapshot of one LND channel as returned by `GET /v1/channels`.
///
/// Treated as immutable for one decision; the rebalancer re-fetches it
/// before every continuation check.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub chan_id: String,
    #[serde(default)]
    pub remote_pubkey: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub local_balance: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub remote_balance: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub local_chan_reserve_sat: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub remote_chan_reserve_sat: u64,
}

/// Forwarding policy of one side of a channel (`node1_policy`/`node2_policy`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub fee_base_msat: u64,
    #[serde(default, deserialize_with = "u64_from_str_or_num")]
    pub fee_rate_milli_msat: u64,
}

/// Local and remote fee policies of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFees {
    pub local: RoutingPolicy,
    pub remote: RoutingPolicy,
}

/// LND's REST gateway renders 64-bit integers as JSON strings.
pub(crate) fn u64_from_str_or_num<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(u64),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Num(n) => Ok(n),
        StrOrNum::Str(s) if s.is_empty() => Ok(0),
        StrOrNum::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
