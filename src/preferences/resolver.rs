use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ledger::models::{ChainId, TokenRef};

pub const YIELD_SPLIT_KEY: &str = "escrow.yield-split";
pub const SETTLEMENT_CHAIN_KEY: &str = "escrow.settlement-chain";
pub const SETTLEMENT_TOKEN_KEY: &str = "escrow.settlement-token";
pub const DISPUTE_TIMEOUT_KEY: &str = "escrow.dispute-timeout";

/// The four record keys requested from the preference source
pub const PREFERENCE_KEYS: [&str; 4] = [
    YIELD_SPLIT_KEY,
    SETTLEMENT_CHAIN_KEY,
    SETTLEMENT_TOKEN_KEY,
    DISPUTE_TIMEOUT_KEY,
];

const SECONDS_PER_DAY: u64 = 86_400;

/// Counterparty settlement preferences; `None` means "use the default"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterpartyPreferences {
    pub yield_split_percent: Option<u8>,
    pub settlement_chain_id: Option<ChainId>,
    pub settlement_token: Option<TokenRef>,
    pub dispute_timeout_days: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPreferences {
    pub preferences: CounterpartyPreferences,
    /// At least one key was present and non-empty, valid or not
    pub has_preferences: bool,
}

/// Protocol-wide fallbacks for absent preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDefaults {
    pub yield_split_percent: u8,
    pub dispute_timeout_days: u32,
}

impl Default for ProtocolDefaults {
    fn default() -> Self {
        Self {
            yield_split_percent: 50,
            dispute_timeout_days: 30,
        }
    }
}

/// Preferences with every field filled in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePreferences {
    pub yield_split_percent: u8,
    pub settlement_chain_id: ChainId,
    pub settlement_token: TokenRef,
    pub dispute_timeout_seconds: u64,
}

impl CounterpartyPreferences {
    pub fn with_defaults(
        &self,
        defaults: &ProtocolDefaults,
        origin_chain: ChainId,
        origin_token: &TokenRef,
    ) -> EffectivePreferences {
        let timeout_days = self
            .dispute_timeout_days
            .unwrap_or(defaults.dispute_timeout_days);

        EffectivePreferences {
            yield_split_percent: self
                .yield_split_percent
                .unwrap_or(defaults.yield_split_percent),
            settlement_chain_id: self.settlement_chain_id.unwrap_or(origin_chain),
            settlement_token: self
                .settlement_token
                .clone()
                .unwrap_or_else(|| origin_token.clone()),
            dispute_timeout_seconds: u64::from(timeout_days) * SECONDS_PER_DAY,
        }
    }
}

/// Turn raw text records into typed preferences.
///
/// Never fails: malformed or out-of-range values resolve to `None`.
pub fn resolve(records: &HashMap<String, Option<String>>) -> ResolvedPreferences {
    let value_of = |key: &str| -> Option<&str> {
        records
            .get(key)
            .and_then(|v| v.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let has_preferences = PREFERENCE_KEYS.iter().any(|key| value_of(key).is_some());

    let preferences = CounterpartyPreferences {
        yield_split_percent: value_of(YIELD_SPLIT_KEY).and_then(parse_split),
        settlement_chain_id: value_of(SETTLEMENT_CHAIN_KEY).and_then(parse_chain),
        settlement_token: value_of(SETTLEMENT_TOKEN_KEY).and_then(TokenRef::new),
        dispute_timeout_days: value_of(DISPUTE_TIMEOUT_KEY).and_then(parse_timeout_days),
    };

    ResolvedPreferences {
        preferences,
        has_preferences,
    }
}

fn parse_split(raw: &str) -> Option<u8> {
    raw.parse::<u8>().ok().filter(|v| *v <= 100)
}

fn parse_chain(raw: &str) -> Option<ChainId> {
    raw.parse::<u64>().ok().filter(|v| *v > 0).map(ChainId)
}

fn parse_timeout_days(raw: &str) -> Option<u32> {
    raw.parse::<u32>().ok().filter(|v| *v > 0)
}
