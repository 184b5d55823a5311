use super::models::*;
use crate::error::{AppError, AppResult};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Ledger repository - persisted state surface for deals
///
/// Holds the deal record, the latest verified yield snapshot and the last
/// settlement instruction per deal. Values are replaced whole, so readers see
/// either the previous or the new record, never a partial one.
pub struct LedgerRepository {
    deals: RwLock<HashMap<Uuid, Deal>>,
    snapshots: RwLock<HashMap<Uuid, YieldSnapshot>>,
    instructions: RwLock<HashMap<Uuid, SettlementInstruction>>,
}

impl LedgerRepository {
    pub fn new() -> Self {
        Self {
            deals: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            instructions: RwLock::new(HashMap::new()),
        }
    }

    // ========== DEAL OPERATIONS ==========

    pub async fn create_deal(&self, deal: Deal) -> AppResult<Deal> {
        let mut deals = self.deals.write().await;
        if deals.contains_key(&deal.id) {
            return Err(AppError::Internal(format!("Deal {} already exists", deal.id)));
        }
        deals.insert(deal.id, deal.clone());
        info!("Deal {} recorded in ledger", deal.id);
        Ok(deal)
    }

    pub async fn get_deal(&self, deal_id: Uuid) -> AppResult<Deal> {
        let deals = self.deals.read().await;
        deals
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Deal {} not found", deal_id)))
    }

    /// Replace the stored deal record
    pub async fn update_deal(&self, deal: Deal) -> AppResult<Deal> {
        let mut deals = self.deals.write().await;
        if !deals.contains_key(&deal.id) {
            return Err(AppError::NotFound(format!("Deal {} not found", deal.id)));
        }
        deals.insert(deal.id, deal.clone());
        debug!("Deal {} now {}", deal.id, deal.state);
        Ok(deal)
    }

    pub async fn get_deals_by_state(&self, states: &[DealState]) -> AppResult<Vec<Deal>> {
        let deals = self.deals.read().await;
        let matching = deals
            .values()
            .filter(|d| states.contains(&d.state))
            .cloned()
            .collect();
        Ok(matching)
    }

    // ========== YIELD SNAPSHOT OPERATIONS ==========

    /// Store a verified read, replacing whatever was there before
    pub async fn record_snapshot(&self, deal_id: Uuid, snapshot: YieldSnapshot) -> AppResult<()> {
        if snapshot.rate_per_second < Decimal::ZERO {
            return Err(AppError::InvalidInput(
                "rate_per_second must not be negative".to_string(),
            ));
        }

        // Deal must exist before snapshots can be attached to it
        self.get_deal(deal_id).await?;

        let mut snapshots = self.snapshots.write().await;
        if let Some(previous) = snapshots.get(&deal_id) {
            if snapshot.as_of < previous.as_of {
                return Err(AppError::InvalidInput(format!(
                    "Snapshot at {} is older than stored snapshot at {}",
                    snapshot.as_of, previous.as_of
                )));
            }
        }
        info!(
            "Verified yield for deal {}: {} as of {}",
            deal_id, snapshot.accrued_at_snapshot, snapshot.as_of
        );
        snapshots.insert(deal_id, snapshot);
        Ok(())
    }

    pub async fn latest_snapshot(&self, deal_id: Uuid) -> Option<YieldSnapshot> {
        let snapshots = self.snapshots.read().await;
        snapshots.get(&deal_id).cloned()
    }

    // ========== INSTRUCTION OPERATIONS ==========

    pub async fn save_instruction(&self, instruction: SettlementInstruction) -> AppResult<()> {
        let mut instructions = self.instructions.write().await;
        instructions.insert(instruction.deal_id, instruction);
        Ok(())
    }

    pub async fn last_instruction(&self, deal_id: Uuid) -> Option<SettlementInstruction> {
        let instructions = self.instructions.read().await;
        instructions.get(&deal_id).cloned()
    }
}

impl Default for LedgerRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn new_deal() -> Deal {
        Deal::new(
            NewDeal {
                principal: Amount(5_000_000),
                depositor: "alice".to_string(),
                counterparty: "bob".to_string(),
                origin_chain: ChainId(8453),
                origin_token: TokenRef::new("USDC").unwrap(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn snapshot(accrued: u64, at: chrono::DateTime<Utc>) -> YieldSnapshot {
        YieldSnapshot {
            principal: Amount(5_000_000),
            rate_per_second: dec!(0.0063),
            as_of: at,
            accrued_at_snapshot: Amount(accrued),
        }
    }

    #[tokio::test]
    async fn test_deal_roundtrip_and_state_filter() {
        let ledger = LedgerRepository::new();
        let mut deal = ledger.create_deal(new_deal()).await.unwrap();

        deal.state = DealState::Funded;
        ledger.update_deal(deal.clone()).await.unwrap();

        let funded = ledger.get_deals_by_state(&[DealState::Funded]).await.unwrap();
        assert_eq!(funded.len(), 1);
        assert!(ledger
            .get_deals_by_state(&[DealState::Accruing])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_deal_is_not_found() {
        let ledger = LedgerRepository::new();
        let err = ledger.get_deal(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_replaced_wholesale() {
        let ledger = LedgerRepository::new();
        let deal = ledger.create_deal(new_deal()).await.unwrap();
        let t0 = Utc::now();

        ledger.record_snapshot(deal.id, snapshot(10, t0)).await.unwrap();
        ledger
            .record_snapshot(deal.id, snapshot(25, t0 + Duration::seconds(60)))
            .await
            .unwrap();

        let latest = ledger.latest_snapshot(deal.id).await.unwrap();
        assert_eq!(latest.accrued_at_snapshot, Amount(25));

        // Older reads never overwrite newer ones
        let err = ledger.record_snapshot(deal.id, snapshot(5, t0)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_negative_rate_rejected() {
        let ledger = LedgerRepository::new();
        let deal = ledger.create_deal(new_deal()).await.unwrap();
        let mut bad = snapshot(0, Utc::now());
        bad.rate_per_second = dec!(-1);
        assert!(ledger.record_snapshot(deal.id, bad).await.is_err());
    }
}
