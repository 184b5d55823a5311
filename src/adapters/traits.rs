use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{Amount, ChainId, TokenRef, YieldSnapshot};

/// Failure reported by an external collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source rejected request: {0}")]
    Rejected(String),
}

/// Parameters for a cross-chain payout quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub from_chain_id: ChainId,
    pub to_chain_id: ChainId,
    pub from_token: TokenRef,
    pub to_token: TokenRef,
    pub from_amount: Amount,
    pub from_address: String,
    pub to_address: String,
}

impl QuoteRequest {
    /// Same chain and same token: nothing to bridge or swap
    pub fn is_same_route(&self) -> bool {
        self.from_chain_id == self.to_chain_id && self.from_token == self.to_token
    }
}

/// Reads the yield position backing a deal from settled on-chain state.
/// Must never return a time-extrapolated estimate.
#[async_trait]
pub trait VerifiedYieldSource: Send + Sync {
    async fn read_yield_snapshot(&self, deal_id: Uuid) -> Result<YieldSnapshot, SourceError>;
}

/// Fetches the counterparty's raw text records (e.g. naming-service records).
/// Missing keys map to `None` or are simply absent.
#[async_trait]
pub trait PreferenceRecordSource: Send + Sync {
    async fn fetch_records(
        &self,
        counterparty: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<String>>, SourceError>;
}

/// Bridge/aggregator quote endpoint. Returns the raw, loosely typed response;
/// parsing happens once in the quote engine.
#[async_trait]
pub trait BridgeQuoteSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn quote(&self, request: &QuoteRequest) -> Result<serde_json::Value, SourceError>;
}
