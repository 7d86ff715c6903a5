use crate::channel::Channel;
use crate::client::NodeClient;
use crate::liquidity;
use log::debug;
use std::ops::Deref;

/// Channels whose local ratio is below this are rebalance targets.
pub const LOW_OUTBOUND_RATIO: u64 = 5;

/// Channel ids and/or peer aliases that must never take part in a rebalance.
///
/// Order is kept because every entry is forwarded to the rebalance tool as
/// an `--avoid` argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    entries: Vec<String>,
}

impl ExclusionSet {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Matching either the peer alias or the channel id is enough.
    pub fn excludes(&self, alias: &str, chan_id: &str) -> bool {
        self.entries.iter().any(|e| e == alias || e == chan_id)
    }

    /// Exclude `entry` until the returned guard is dropped.
    ///
    /// The set is restored on every exit path, including early returns
    /// through `?`.
    pub fn exclude_temporarily(&mut self, entry: impl Into<String>) -> TemporaryExclusion<'_> {
        let restore_len = self.entries.len();
        self.entries.push(entry.into());
        TemporaryExclusion {
            set: self,
            restore_len,
        }
    }
}

pub struct TemporaryExclusion<'a> {
    set: &'a mut ExclusionSet,
    restore_len: usize,
}

impl Deref for TemporaryExclusion<'_> {
    type Target = ExclusionSet;

    fn deref(&self) -> &ExclusionSet {
        self.set
    }
}

impl Drop for TemporaryExclusion<'_> {
    fn drop(&mut self) {
        self.set.entries.truncate(self.restore_len);
    }
}

/// An active, non-excluded channel together with its peer's alias.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleChannel {
    pub channel: Channel,
    pub alias: String,
}

/// Active channels that are not excluded by alias or channel id.
pub async fn list_eligible(
    client: &(impl NodeClient + ?Sized),
    excluded: &ExclusionSet,
) -> anyhow::Result<Vec<EligibleChannel>> {
    let mut eligible = Vec::new();
    for channel in client.list_active_channels().await? {
        let alias = client.node_alias(&channel.remote_pubkey).await?;
        if excluded.excludes(&alias, &channel.chan_id) {
            debug!("Selector: channel {} ({}) is excluded", channel.chan_id, alias);
            continue;
        }
        eligible.push(EligibleChannel { channel, alias });
    }
    Ok(eligible)
}

/// Rebalance targets: most depleted outbound first.
pub async fn low_outbound_candidates(
    client: &(impl NodeClient + ?Sized),
    excluded: &ExclusionSet,
) -> anyhow::Result<Vec<EligibleChannel>> {
    Ok(select_low_outbound(list_eligible(client, excluded).await?))
}

/// Donors: outbound-rich channels, most local liquidity first.
pub async fn high_outbound_donors(
    client: &(impl NodeClient + ?Sized),
    excluded: &ExclusionSet,
) -> anyhow::Result<Vec<EligibleChannel>> {
    Ok(select_donors(list_eligible(client, excluded).await?))
}

pub fn select_low_outbound(eligible: Vec<EligibleChannel>) -> Vec<EligibleChannel> {
    let mut targets: Vec<_> = eligible
        .into_iter()
        .filter(|e| matches!(classify(e), Some(r) if r.local < LOW_OUTBOUND_RATIO))
        .collect();
    targets.sort_by_key(|e| liquidity::local_available(&e.channel));
    targets
}

pub fn select_donors(eligible: Vec<EligibleChannel>) -> Vec<EligibleChannel> {
    let mut donors: Vec<_> = eligible
        .into_iter()
        .filter(|e| matches!(classify(e), Some(r) if r.local > r.remote))
        .collect();
    donors.sort_by(|a, b| {
        liquidity::local_available(&b.channel).cmp(&liquidity::local_available(&a.channel))
    });
    donors
}

fn classify(eligible: &EligibleChannel) -> Option<liquidity::LiquidityRatio> {
    match liquidity::ratio(&eligible.channel) {
        Ok(r) => Some(r),
        Err(e) => {
            debug!("Selector: skipping {}: {}", eligible.alias, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;

    fn make_channel(id: &str, peer: &str, local: u64, remote: u64) -> Channel {
        Channel {
            chan_id: id.to_string(),
            remote_pubkey: peer.to_string(),
            active: true,
            local_balance: local,
            remote_balance: remote,
            ..Default::default()
        }
    }

    fn eligible(id: &str, local: u64, remote: u64) -> EligibleChannel {
        EligibleChannel {
            channel: make_channel(id, &format!("pk_{}", id), local, remote),
            alias: format!("alias_{}", id),
        }
    }

    fn ids(list: &[EligibleChannel]) -> Vec<&str> {
        list.iter().map(|e| e.channel.chan_id.as_str()).collect()
    }

    #[test]
    fn test_temporary_exclusion_restores() {
        let mut set = ExclusionSet::new(["a", "b"]);
        let before = set.clone();
        for i in 0..5 {
            let guard = set.exclude_temporarily(format!("target{}", i));
            assert!(guard.excludes(&format!("target{}", i), ""));
            assert_eq!(guard.entries().len(), 3);
        }
        assert_eq!(set, before);
    }

    #[test]
    fn test_temporary_exclusion_restores_on_error_path() {
        fn select(set: &mut ExclusionSet) -> Result<(), String> {
            let guard = set.exclude_temporarily("target");
            if guard.excludes("target", "") {
                return Err("bail out mid-selection".to_string());
            }
            Ok(())
        }

        let mut set = ExclusionSet::new(["x"]);
        assert!(select(&mut set).is_err());
        assert_eq!(set.entries(), ["x".to_string()]);
    }

    #[test]
    fn test_temporary_exclusion_of_existing_entry() {
        let mut set = ExclusionSet::new(["dup"]);
        {
            let _guard = set.exclude_temporarily("dup");
        }
        // The pre-existing entry survives.
        assert!(set.excludes("dup", ""));
        assert_eq!(set.entries().len(), 1);
    }

    #[test]
    fn test_low_outbound_and_donors_partition() {
        // ratio.local = 1 and ratio.local = 6
        let channels = vec![eligible("low", 10, 90), eligible("high", 60, 40)];
        let low = select_low_outbound(channels.clone());
        assert_eq!(ids(&low), vec!["low"]);
        let donors = select_donors(channels);
        assert_eq!(ids(&donors), vec!["high"]);
    }

    #[test]
    fn test_evenly_split_channel_is_neither() {
        let channels = vec![eligible("even", 500, 500)];
        assert!(select_low_outbound(channels.clone()).is_empty());
        assert!(select_donors(channels).is_empty());
    }

    #[test]
    fn test_low_outbound_sorted_most_depleted_first() {
        let channels = vec![
            eligible("c", 300, 700),
            eligible("a", 100, 900),
            eligible("b", 200, 800),
            eligible("balanced", 500, 500),
        ];
        let low = select_low_outbound(channels);
        assert_eq!(ids(&low), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_donors_sorted_richest_first() {
        let channels = vec![
            eligible("small", 400, 100),
            eligible("big", 4_000, 100),
            eligible("inbound", 100, 900),
        ];
        let donors = select_donors(channels);
        assert_eq!(ids(&donors), vec!["big", "small"]);
    }

    #[test]
    fn test_zero_capacity_channels_dropped() {
        let mut reserved = eligible("reserved", 1_000, 1_000);
        reserved.channel.local_chan_reserve_sat = 1_000;
        reserved.channel.remote_chan_reserve_sat = 1_000;
        let channels = vec![reserved, eligible("low", 10, 90), eligible("high", 90, 10)];
        assert_eq!(ids(&select_low_outbound(channels.clone())), vec!["low"]);
        assert_eq!(ids(&select_donors(channels)), vec!["high"]);
    }

    #[tokio::test]
    async fn test_list_eligible_excludes_by_alias_or_chan_id() {
        let mut mock = MockNodeClient::with_channels(vec![
            make_channel("1", "pk1", 10, 90),
            make_channel("2", "pk2", 10, 90),
            make_channel("3", "pk3", 10, 90),
        ]);
        mock.set_alias("pk1", "ACINQ");
        mock.set_alias("pk2", "Kraken");
        mock.set_alias("pk3", "Bitrefill");

        let excluded = ExclusionSet::new(["ACINQ", "3"]);
        let list = list_eligible(&mock, &excluded).await.unwrap();
        assert_eq!(ids(&list), vec!["2"]);
        assert_eq!(list[0].alias, "Kraken");
        // One listing; every peer's alias is resolved before filtering
        assert_eq!(*mock.list_calls.lock().unwrap(), 1);
        assert_eq!(*mock.alias_calls.lock().unwrap(), vec!["pk1", "pk2", "pk3"]);
    }

    #[tokio::test]
    async fn test_list_eligible_skips_inactive() {
        let mut inactive = make_channel("2", "pk2", 10, 90);
        inactive.active = false;
        let mock = MockNodeClient::with_channels(vec![make_channel("1", "pk1", 10, 90), inactive]);
        let list = list_eligible(&mock, &ExclusionSet::default()).await.unwrap();
        assert_eq!(ids(&list), vec!["1"]);
    }

    #[tokio::test]
    async fn test_candidates_propagate_collaborator_error() {
        let mut mock = MockNodeClient::new();
        mock.fail_listing = true;
        assert!(low_outbound_candidates(&mock, &ExclusionSet::default())
            .await
            .is_err());
    }
}
