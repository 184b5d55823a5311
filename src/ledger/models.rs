use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::SettlementError;

/// Numeric chain identifier (EVM-style, e.g. 1, 10, 8453)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token symbol or contract address on some chain
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenRef(String);

impl TokenRef {
    /// Returns `None` for blank input.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Symbols and hex addresses are both case-insensitive.
impl PartialEq for TokenRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for TokenRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Integer amount in the token's smallest unit (6 decimals for USDC)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deal lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealState {
    Created,
    Funded,
    Accruing,
    Settling,
    Settled,
    Disputed,
    Cancelled,
}

impl DealState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealState::Created => "created",
            DealState::Funded => "funded",
            DealState::Accruing => "accruing",
            DealState::Settling => "settling",
            DealState::Settled => "settled",
            DealState::Disputed => "disputed",
            DealState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DealState::Settled | DealState::Cancelled)
    }

    /// States the dispute sweeper watches. A `Settling` deal additionally
    /// needs a stalled instruction before it can be disputed.
    pub const TIMEOUT_ELIGIBLE: [DealState; 3] =
        [DealState::Funded, DealState::Accruing, DealState::Settling];

    /// Whether the dispute clock is running in this state
    pub fn is_timeout_eligible(&self) -> bool {
        Self::TIMEOUT_ELIGIBLE.contains(self)
    }

    /// Allowed lifecycle edges. `Settling -> Accruing` is the retry edge;
    /// `Disputed -> Settled/Cancelled` are the resolution edges.
    pub fn can_transition_to(&self, next: DealState) -> bool {
        use DealState::*;
        matches!(
            (*self, next),
            (Created, Funded)
                | (Created, Cancelled)
                | (Funded, Accruing)
                | (Funded, Cancelled)
                | (Funded, Disputed)
                | (Accruing, Settling)
                | (Accruing, Disputed)
                | (Accruing, Cancelled)
                | (Settling, Settled)
                | (Settling, Accruing)
                | (Settling, Disputed)
                | (Disputed, Settled)
                | (Disputed, Cancelled)
        )
    }
}

impl fmt::Display for DealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for opening a new deal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeal {
    pub principal: Amount,
    pub depositor: String,
    pub counterparty: String,
    pub origin_chain: ChainId,
    pub origin_token: TokenRef,
}

/// Escrow deal between a depositor and a counterparty
///
/// INVARIANTS:
/// - principal > 0 and never changes after funding
/// - dispute_timeout_seconds is fixed at funding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub principal: Amount,
    pub depositor: String,
    pub counterparty: String,
    pub origin_chain: ChainId,
    pub origin_token: TokenRef,
    pub state: DealState,
    pub funded_at: Option<DateTime<Utc>>,
    pub dispute_timeout_seconds: Option<u64>,
    pub settlement_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(input: NewDeal, now: DateTime<Utc>) -> Result<Self, SettlementError> {
        if input.principal.is_zero() {
            return Err(SettlementError::InvalidAmount(
                "principal must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            principal: input.principal,
            depositor: input.depositor,
            counterparty: input.counterparty,
            origin_chain: input.origin_chain,
            origin_token: input.origin_token,
            state: DealState::Created,
            funded_at: None,
            dispute_timeout_seconds: None,
            settlement_attempts: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next`, rejecting edges outside the lifecycle table.
    pub fn transition(&mut self, next: DealState, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if !self.state.can_transition_to(next) {
            return Err(SettlementError::InvalidState {
                deal_id: self.id,
                current: self.state,
                expected: format!("a state that can move to {}", next),
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn require_state(&self, expected: DealState) -> Result<(), SettlementError> {
        if self.state != expected {
            return Err(SettlementError::InvalidState {
                deal_id: self.id,
                current: self.state,
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    pub fn dispute_deadline(&self) -> Option<DateTime<Utc>> {
        let funded_at = self.funded_at?;
        let timeout = i64::try_from(self.dispute_timeout_seconds?).ok()?;
        funded_at.checked_add_signed(Duration::seconds(timeout))
    }

    /// `now - funded_at > dispute_timeout_seconds`
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.dispute_deadline() {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

/// Verified yield position read, replaced wholesale on every read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldSnapshot {
    pub principal: Amount,
    /// Smallest units per second; estimation only
    pub rate_per_second: Decimal,
    pub as_of: DateTime<Utc>,
    /// Amount known accrued at `as_of` from an on-chain read
    pub accrued_at_snapshot: Amount,
}

/// Validated cross-chain payout quote
///
/// INVARIANT: to_amount_min > 0 and execution_payload is non-empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementQuote {
    pub from_chain_id: ChainId,
    pub to_chain_id: ChainId,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    pub from_amount: Amount,
    pub to_amount: Amount,
    pub to_amount_min: Amount,
    pub estimated_seconds: Option<u64>,
    pub bridge_name: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub gas_cost_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee_cost_usd: Decimal,
    #[serde(with = "hex_bytes")]
    pub execution_payload: Vec<u8>,
    pub quoted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SettlementQuote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Signed payout instruction handed to the executor
///
/// INVARIANT: depositor_amount + counterparty_amount == principal + accrued_yield
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub deal_id: Uuid,
    pub principal: Amount,
    pub accrued_yield: Amount,
    pub yield_split_percent: u8,
    pub depositor_amount: Amount,
    pub counterparty_amount: Amount,
    pub payout_chain_id: ChainId,
    pub payout_token: TokenRef,
    pub payout_quote: Option<SettlementQuote>,
    pub finalized_at: DateTime<Utc>,
    pub digest: String,
    pub signature: String,
    pub signer: String,
}

impl SettlementInstruction {
    pub fn is_conserved(&self) -> bool {
        let paid = self.depositor_amount.0 as u128 + self.counterparty_amount.0 as u128;
        paid == self.principal.0 as u128 + self.accrued_yield.0 as u128
    }
}

/// Hex (0x-prefixed) serde for opaque call data
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let stripped = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(stripped).map_err(serde::de::Error::custom)
    }
}
