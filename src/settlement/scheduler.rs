// Dispute sweeper - liveness for silent deals
//
// Periodically walks Funded/Accruing/Settling deals and moves any whose
// dispute timeout has passed to Disputed, so funds are never parked
// indefinitely. Busy deals are skipped and picked up on the next tick.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::ledger::models::DealState;
use crate::ledger::LedgerRepository;
use crate::settlement::orchestrator::SettlementOrchestrator;

/// Sweep configuration
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval_seconds: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_seconds: 60 }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub disputed: usize,
    pub failed: usize,
}

pub struct DisputeSweeper {
    config: SweepConfig,
    ledger: Arc<LedgerRepository>,
    orchestrator: Arc<SettlementOrchestrator>,
}

impl DisputeSweeper {
    pub fn new(
        config: SweepConfig,
        ledger: Arc<LedgerRepository>,
        orchestrator: Arc<SettlementOrchestrator>,
    ) -> Self {
        Self {
            config,
            ledger,
            orchestrator,
        }
    }

    /// Start the sweeper (runs in background)
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_seconds.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "⏰ Dispute sweeper started, every {}s",
                self.config.interval_seconds
            );

            loop {
                ticker.tick().await;
                let report = self.sweep_once().await;
                if report.disputed > 0 || report.failed > 0 {
                    info!(
                        "🔄 Sweep: {} checked, {} disputed, {} failed",
                        report.checked, report.disputed, report.failed
                    );
                }
            }
        })
    }

    /// One pass over every deal whose dispute clock is running
    pub async fn sweep_once(&self) -> SweepReport {
        let deals = match self
            .ledger
            .get_deals_by_state(&DealState::TIMEOUT_ELIGIBLE)
            .await
        {
            Ok(deals) => deals,
            Err(e) => {
                error!("❌ Sweep could not list deals: {}", e);
                return SweepReport::default();
            }
        };

        let now = Utc::now();
        let results = join_all(
            deals
                .iter()
                .map(|deal| self.orchestrator.enforce_timeout(deal.id, now)),
        )
        .await;

        let mut report = SweepReport {
            checked: deals.len(),
            ..SweepReport::default()
        };

        for (deal, result) in deals.iter().zip(results) {
            match result {
                Ok(true) => report.disputed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Timeout check for deal {} failed: {}", deal.id, e);
                }
            }
        }

        debug!("Sweep finished: {:?}", report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryPreferenceRecords, LedgerYieldSource, NoBridgeRoutes};
    use crate::ledger::models::{Amount, ChainId, NewDeal, TokenRef, YieldSnapshot};
    use crate::quote_engine::{QuoteBroker, QuoteBrokerConfig};
    use crate::settlement::orchestrator::{OrchestratorConfig, SettlementRequest};
    use crate::settlement::signing::InstructionSigner;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    fn sweeper() -> (Arc<LedgerRepository>, Arc<SettlementOrchestrator>, DisputeSweeper) {
        let ledger = Arc::new(LedgerRepository::new());
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            ledger.clone(),
            Arc::new(LedgerYieldSource::new(ledger.clone())),
            Arc::new(InMemoryPreferenceRecords::new()),
            Arc::new(QuoteBroker::new(QuoteBrokerConfig::default(), Arc::new(NoBridgeRoutes))),
            Arc::new(InstructionSigner::from_seed_hex(&"07".repeat(32)).unwrap()),
            OrchestratorConfig::default(),
        ));
        let sweeper = DisputeSweeper::new(SweepConfig::default(), ledger.clone(), orchestrator.clone());
        (ledger, orchestrator, sweeper)
    }

    fn new_deal() -> NewDeal {
        NewDeal {
            principal: Amount(5_000),
            depositor: "alice.eth".to_string(),
            counterparty: "bob.eth".to_string(),
            origin_chain: ChainId(10),
            origin_token: TokenRef::new("USDC").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_sweep_disputes_only_expired_deals() {
        let (ledger, orchestrator, sweeper) = sweeper();

        // funded 31 days ago with the 30 day default
        let stale = orchestrator
            .create_deal(new_deal(), Utc::now() - ChronoDuration::days(31))
            .await
            .unwrap();
        orchestrator
            .fund(stale.id, Utc::now() - ChronoDuration::days(31))
            .await
            .unwrap();

        let fresh = orchestrator.create_deal(new_deal(), Utc::now()).await.unwrap();
        orchestrator.fund(fresh.id, Utc::now()).await.unwrap();
        orchestrator.start_accrual(fresh.id, Utc::now()).await.unwrap();

        let unfunded = orchestrator.create_deal(new_deal(), Utc::now()).await.unwrap();

        let report = sweeper.sweep_once().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.disputed, 1);
        assert_eq!(report.failed, 0);

        assert_eq!(ledger.get_deal(stale.id).await.unwrap().state, DealState::Disputed);
        assert_eq!(ledger.get_deal(fresh.id).await.unwrap().state, DealState::Accruing);
        assert_eq!(ledger.get_deal(unfunded.id).await.unwrap().state, DealState::Created);
    }

    #[tokio::test]
    async fn test_sweep_disputes_stalled_settlement() {
        let (ledger, orchestrator, sweeper) = sweeper();

        let funded_at = Utc::now() - ChronoDuration::days(31);
        let deal = orchestrator.create_deal(new_deal(), funded_at).await.unwrap();
        orchestrator.fund(deal.id, funded_at).await.unwrap();
        orchestrator.start_accrual(deal.id, funded_at).await.unwrap();
        ledger
            .record_snapshot(
                deal.id,
                YieldSnapshot {
                    principal: Amount(5_000),
                    rate_per_second: Decimal::ZERO,
                    as_of: funded_at + ChronoDuration::days(1),
                    accrued_at_snapshot: Amount(12),
                },
            )
            .await
            .unwrap();

        // same-route instruction signed before the deadline, never confirmed
        orchestrator
            .initiate_settlement(deal.id, SettlementRequest::default(), funded_at + ChronoDuration::days(2))
            .await
            .unwrap();
        assert_eq!(ledger.get_deal(deal.id).await.unwrap().state, DealState::Settling);

        let report = sweeper.sweep_once().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.disputed, 1);
        assert_eq!(ledger.get_deal(deal.id).await.unwrap().state, DealState::Disputed);
    }
}
