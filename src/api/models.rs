use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use crate::accrual::EstimatedYield;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::preferences::ResolvedPreferences;

// ========== REQUEST MODELS ==========

/// Open a new escrow deal
#[derive(Debug, Deserialize, Validate)]
pub struct CreateDealRequest {
    #[validate(range(min = 1, message = "principal must be greater than zero"))]
    pub principal: u64,

    #[validate(length(min = 1, max = 256))]
    pub depositor: String,

    #[validate(length(min = 1, max = 256))]
    pub counterparty: String,

    #[validate(range(min = 1, message = "chain id must be positive"))]
    pub origin_chain: u64,

    #[validate(length(min = 1, max = 128))]
    pub origin_token: String,
}

impl CreateDealRequest {
    pub fn into_new_deal(self) -> AppResult<NewDeal> {
        let origin_token = TokenRef::new(&self.origin_token)
            .ok_or_else(|| AppError::InvalidInput("origin_token must not be blank".to_string()))?;

        Ok(NewDeal {
            principal: Amount(self.principal),
            depositor: self.depositor,
            counterparty: self.counterparty,
            origin_chain: ChainId(self.origin_chain),
            origin_token,
        })
    }
}

/// Verified yield read pushed by the on-chain indexer
#[derive(Debug, Deserialize)]
pub struct RecordYieldRequest {
    pub accrued_at_snapshot: u64,
    pub rate_per_second: Decimal,
    pub as_of: DateTime<Utc>,
    /// Must equal the deal's principal when given
    pub principal: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct EstimateQuery {
    /// Annual rate as a fraction, e.g. `0.04`
    pub apy: Option<String>,
}

impl EstimateQuery {
    pub fn apy(&self) -> AppResult<Option<Decimal>> {
        self.apy
            .as_deref()
            .map(|raw| {
                raw.trim()
                    .parse::<Decimal>()
                    .map_err(|_| AppError::InvalidInput(format!("invalid apy: {}", raw)))
            })
            .transpose()
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct InitiateSettlementRequest {
    #[validate(range(max = 10000, message = "max_slippage_bps must be at most 10000"))]
    pub max_slippage_bps: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveDisputeRequest {
    pub counterparty_principal: u64,

    #[validate(range(max = 10000, message = "max_slippage_bps must be at most 10000"))]
    pub max_slippage_bps: Option<u32>,
}

/// Replace a counterparty's text records
#[derive(Debug, Deserialize, Validate)]
pub struct PutRecordsRequest {
    #[validate(length(max = 64, message = "too many records"))]
    pub records: HashMap<String, String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct DealResponse {
    pub deal_id: Uuid,
    pub principal: Amount,
    pub depositor: String,
    pub counterparty: String,
    pub origin_chain: ChainId,
    pub origin_token: TokenRef,
    pub state: DealState,
    pub funded_at: Option<DateTime<Utc>>,
    pub dispute_timeout_seconds: Option<u64>,
    pub dispute_deadline: Option<DateTime<Utc>>,
    pub settlement_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Deal> for DealResponse {
    fn from(deal: Deal) -> Self {
        Self {
            dispute_deadline: deal.dispute_deadline(),
            deal_id: deal.id,
            principal: deal.principal,
            depositor: deal.depositor,
            counterparty: deal.counterparty,
            origin_chain: deal.origin_chain,
            origin_token: deal.origin_token,
            state: deal.state,
            funded_at: deal.funded_at,
            dispute_timeout_seconds: deal.dispute_timeout_seconds,
            settlement_attempts: deal.settlement_attempts,
            created_at: deal.created_at,
            updated_at: deal.updated_at,
        }
    }
}

/// Display-only accrual projection; never a settlement amount
#[derive(Debug, Serialize)]
pub struct YieldEstimateResponse {
    pub deal_id: Uuid,
    pub estimated_yield: Amount,
    pub at: DateTime<Utc>,
    pub verified: bool,
}

impl YieldEstimateResponse {
    pub fn new(deal_id: Uuid, estimate: EstimatedYield) -> Self {
        Self {
            deal_id,
            estimated_yield: estimate.amount(),
            at: estimate.at(),
            verified: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimeoutResponse {
    pub deal_id: Uuid,
    pub disputed: bool,
    pub state: DealState,
}

#[derive(Debug, Serialize)]
pub struct PreferencesResponse {
    pub counterparty: String,
    #[serde(flatten)]
    pub resolved: ResolvedPreferences,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub open_deals: usize,
    pub disputed_deals: usize,
    pub signer: String,
}
