use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::traits::{
    BridgeQuoteSource, PreferenceRecordSource, QuoteRequest, SourceError, VerifiedYieldSource,
};
use crate::ledger::{models::YieldSnapshot, LedgerRepository};

/// Serves verified reads that were pushed into the ledger by the indexer
pub struct LedgerYieldSource {
    ledger: Arc<LedgerRepository>,
}

impl LedgerYieldSource {
    pub fn new(ledger: Arc<LedgerRepository>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl VerifiedYieldSource for LedgerYieldSource {
    async fn read_yield_snapshot(&self, deal_id: Uuid) -> Result<YieldSnapshot, SourceError> {
        self.ledger
            .latest_snapshot(deal_id)
            .await
            .ok_or_else(|| SourceError::Unavailable(format!("no verified read for deal {}", deal_id)))
    }
}

/// Counterparty text records kept in process, keyed by identity
pub struct InMemoryPreferenceRecords {
    records: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryPreferenceRecords {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Replace every record for `identity`
    pub async fn set_records(&self, identity: &str, records: HashMap<String, String>) {
        let mut all = self.records.write().await;
        info!("Stored {} preference records for {}", records.len(), identity);
        all.insert(identity.to_string(), records);
    }
}

impl Default for InMemoryPreferenceRecords {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferenceRecordSource for InMemoryPreferenceRecords {
    async fn fetch_records(
        &self,
        counterparty: &str,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<String>>, SourceError> {
        let all = self.records.read().await;
        let stored = all.get(counterparty);
        debug!("Fetching {} records for {}", keys.len(), counterparty);

        Ok(keys
            .iter()
            .map(|key| {
                let value = stored.and_then(|r| r.get(*key)).cloned();
                (key.to_string(), value)
            })
            .collect())
    }
}

/// Placeholder route source for deployments without a bridge aggregator.
/// Every request is reported as having no route.
pub struct NoBridgeRoutes;

#[async_trait]
impl BridgeQuoteSource for NoBridgeRoutes {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<serde_json::Value, SourceError> {
        warn!(
            "No bridge source configured for {}:{} -> {}:{}",
            request.from_chain_id, request.from_token, request.to_chain_id, request.to_token
        );
        Err(SourceError::Unavailable("no bridge source configured".to_string()))
    }
}
