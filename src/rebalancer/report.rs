//! Parser for the human-readable report printed by `bos rebalance`.
//!
//! The report is YAML-ish text, not a stable format. Recognition relies on
//! line shapes (token counts of 2, 3 and 6), so keep every format
//! assumption in this module.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;

const ERROR_MARKER: &str = "err:";
const FEES_SPENT_KEY: &str = "rebalance_fees_spent";
const SATS_PER_BTC: u64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub alias: String,
    pub pubkey: String,
}

/// Structured form of a successful report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Route as listed under `evaluating`, first hop first.
    pub hops: Vec<Hop>,
    /// Key/value stats from the `rebalance` section.
    pub rebalance: BTreeMap<String, String>,
    /// Named nodes from the preamble, e.g. the increase-inbound peer.
    pub endpoints: BTreeMap<String, Hop>,
    /// Flat key/value pairs from the preamble.
    pub fields: BTreeMap<String, String>,
}

impl RebalanceReport {
    /// Routing fee paid, converted from BTC to whole satoshis (truncated).
    pub fn fee_spent_sats(&self) -> Option<u64> {
        btc_to_sats(self.rebalance.get(FEES_SPENT_KEY)?)
    }

    /// (first hop, middle hop, last hop) aliases, for display.
    pub fn route_summary(&self) -> Option<(&str, &str, &str)> {
        let first = self.hops.first()?;
        let last = self.hops.last()?;
        let middle = &self.hops[self.hops.len() / 2];
        Some((&first.alias, &middle.alias, &last.alias))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    Failed { code: Option<u32>, message: String },
    Succeeded(RebalanceReport),
}

impl RebalanceOutcome {
    #[cfg(test)]
    pub fn is_error(&self) -> bool {
        matches!(self, RebalanceOutcome::Failed { .. })
    }
}

pub fn btc_to_sats(value: &str) -> Option<u64> {
    let btc = Decimal::from_str(value.trim()).ok()?;
    (btc * Decimal::from(SATS_PER_BTC)).trunc().to_u64()
}

/// Parse the combined stdout/stderr of one tool invocation.
pub fn parse(text: &str) -> RebalanceOutcome {
    match find_error_marker(text) {
        Some(end) => parse_error(&text[end..]),
        None => RebalanceOutcome::Succeeded(parse_report(text)),
    }
}

/// Byte offset just past the first `err:` that starts a word.
fn find_error_marker(text: &str) -> Option<usize> {
    text.match_indices(ERROR_MARKER)
        .find(|&(idx, _)| {
            text[..idx]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric() && c != '_')
        })
        .map(|(idx, m)| idx + m.len())
}

/// bos prints errors as a list, usually `[code, message, details...]`.
fn parse_error(tail: &str) -> RebalanceOutcome {
    let entries: Vec<&str> = tail
        .lines()
        .map(|l| l.trim().trim_start_matches('-').trim())
        .filter(|l| !l.is_empty())
        .collect();

    let code = entries.first().and_then(|e| e.parse::<u32>().ok());
    let message = match (code, entries.as_slice()) {
        (Some(_), [_, message, ..]) => message.to_string(),
        (_, [first, ..]) => first.to_string(),
        (_, []) => "unknown error".to_string(),
    };
    RebalanceOutcome::Failed { code, message }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Evaluating,
    Rebalance,
}

fn parse_report(text: &str) -> RebalanceReport {
    let mut report = RebalanceReport::default();
    let mut section = Section::Preamble;

    for raw in text.lines() {
        let line = raw.trim_matches(|c: char| c.is_whitespace() || c == ':' || c == '-');

        match line {
            "evaluating" if section != Section::Evaluating => {
                section = Section::Evaluating;
                continue;
            }
            "rebalance" if section != Section::Rebalance => {
                section = Section::Rebalance;
                continue;
            }
            _ => {}
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match (section, tokens.as_slice()) {
            (Section::Evaluating, [alias, pubkey, _, _, _, _]) => report.hops.push(Hop {
                alias: alias.to_string(),
                pubkey: drop_last_char(pubkey),
            }),
            (Section::Rebalance, [k, v]) => {
                report.rebalance.insert(key(k), v.to_string());
            }
            (Section::Rebalance, [k, _, v]) => {
                report.rebalance.insert(key(k), strip_enclosing(v));
            }
            (Section::Preamble, [k, alias, pubkey]) => {
                report.endpoints.insert(
                    key(k),
                    Hop {
                        alias: alias.to_string(),
                        pubkey: pubkey.to_string(),
                    },
                );
            }
            (Section::Preamble, [k, v]) => {
                report.fields.insert(key(k), v.to_string());
            }
            _ => {}
        }
    }

    report
}

fn key(token: &str) -> String {
    token.trim_end_matches(':').to_string()
}

fn drop_last_char(token: &str) -> String {
    let mut s = token.to_string();
    s.pop();
    s
}

/// `(12)` -> `12`
fn strip_enclosing(token: &str) -> String {
    let mut chars = token.chars();
    chars.next();
    chars.next_back();
    chars.as_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS: &str = "\
increase_inbound_on: LNBig 03abcdef
increase_outbound_on: ACINQ 03fedcba
amount: 50000
evaluating:
  - NodeA pubkey123: 1 hop, 10 ppm
  - NodeB pubkey456: 2 hops, 25 ppm
  - NodeC pubkey789: 3 hops, 40 ppm
rebalance:
  rebalanced: 0.00050000
  rebalance_fees_spent: 0.00001234
  rebalance_fee_rate: 24 (24)
";

    fn succeeded(text: &str) -> RebalanceReport {
        match parse(text) {
            RebalanceOutcome::Succeeded(r) => r,
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_error_first_entry_is_message() {
        assert_eq!(
            parse("err: - something wrong\n"),
            RebalanceOutcome::Failed {
                code: None,
                message: "something wrong".to_string()
            }
        );
    }

    #[test]
    fn test_error_with_status_code() {
        let text = "evaluating:\n  - x\nerr:\n  - 503\n  - FailedToFindPathBetweenPeers\n  - {}\n";
        assert_eq!(
            parse(text),
            RebalanceOutcome::Failed {
                code: Some(503),
                message: "FailedToFindPathBetweenPeers".to_string()
            }
        );
    }

    #[test]
    fn test_error_without_message() {
        assert_eq!(
            parse("err:"),
            RebalanceOutcome::Failed {
                code: None,
                message: "unknown error".to_string()
            }
        );
        assert!(parse("err:\n  - 400\n").is_error());
    }

    #[test]
    fn test_err_inside_word_is_not_a_marker() {
        let text = "evaluating:\n  - Ferrari_err: pk1: a b c d\n";
        assert!(!parse(text).is_error());
        assert!(!parse("referrer: somebody\n").is_error());
    }

    #[test]
    fn test_single_hop_line() {
        let report = succeeded("evaluating:\nNodeA pubkey123: x y z w\n");
        assert_eq!(
            report.hops,
            vec![Hop {
                alias: "NodeA".to_string(),
                pubkey: "pubkey123".to_string()
            }]
        );
    }

    #[test]
    fn test_full_report() {
        let report = succeeded(SUCCESS);
        assert_eq!(report.hops.len(), 3);
        assert_eq!(report.hops[1].alias, "NodeB");
        assert_eq!(report.hops[1].pubkey, "pubkey456");

        assert_eq!(report.rebalance["rebalanced"], "0.00050000");
        assert_eq!(report.rebalance["rebalance_fees_spent"], "0.00001234");
        assert_eq!(report.rebalance["rebalance_fee_rate"], "24");

        assert_eq!(
            report.endpoints["increase_inbound_on"],
            Hop {
                alias: "LNBig".to_string(),
                pubkey: "03abcdef".to_string()
            }
        );
        assert_eq!(report.fields["amount"], "50000");
        assert_eq!(report.fee_spent_sats(), Some(1234));
        assert_eq!(report.route_summary(), Some(("NodeA", "NodeB", "NodeC")));
    }

    #[test]
    fn test_section_rules_do_not_leak() {
        let text = "\
evaluating:
  two tokens
  a b c
rebalance:
  - a b c d e f
";
        let report = succeeded(text);
        assert!(report.hops.is_empty());
        assert!(report.fields.is_empty());
        assert!(report.endpoints.is_empty());
        assert_eq!(report.rebalance.len(), 0);
    }

    #[test]
    fn test_sections_can_reenter() {
        let text = "\
evaluating:
  A pk1: a b c d
rebalance:
  fee: 1
evaluating:
  B pk2: a b c d
";
        let report = succeeded(text);
        let aliases: Vec<_> = report.hops.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["A", "B"]);
    }

    #[test]
    fn test_unrecognised_text_is_empty_success() {
        let report = succeeded("");
        assert_eq!(report, RebalanceReport::default());
        assert_eq!(report.fee_spent_sats(), None);
        assert_eq!(report.route_summary(), None);
    }

    #[test]
    fn test_btc_to_sats() {
        assert_eq!(btc_to_sats("0.00001234"), Some(1234));
        assert_eq!(btc_to_sats("0"), Some(0));
        assert_eq!(btc_to_sats("1"), Some(100_000_000));
        // Sub-satoshi remainder is truncated
        assert_eq!(btc_to_sats("0.000000019"), Some(1));
        assert_eq!(btc_to_sats("-0.1"), None);
        assert_eq!(btc_to_sats("lots"), None);
    }
}
