use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex as RegistryMutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::accrual::{compute_accrued, rate_per_second, EstimatedYield, VerifiedYield};
use crate::adapters::traits::{PreferenceRecordSource, QuoteRequest, VerifiedYieldSource};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::{Amount, Deal, DealState, NewDeal, SettlementInstruction, YieldSnapshot};
use crate::ledger::LedgerRepository;
use crate::preferences::{resolve, EffectivePreferences, ProtocolDefaults, ResolvedPreferences, PREFERENCE_KEYS};
use crate::quote_engine::{QuoteBroker, SlippagePolicy};
use crate::settlement::payout::split_payout;
use crate::settlement::signing::{InstructionBody, InstructionSigner};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub defaults: ProtocolDefaults,
    /// Used when a caller does not name its own tolerance
    pub default_max_slippage_bps: u32,
    /// Source address quoted for cross-chain payouts
    pub escrow_address: String,
    /// How long a same-route instruction may sit in `Settling` before a
    /// past-deadline deal is disputed
    pub settling_grace_seconds: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            defaults: ProtocolDefaults::default(),
            default_max_slippage_bps: 50,
            escrow_address: String::new(),
            settling_grace_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub max_slippage_bps: Option<u32>,
}

/// Arbiter decision for a disputed deal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeResolution {
    /// Portion of the principal awarded to the counterparty
    pub counterparty_principal: Amount,
    pub max_slippage_bps: Option<u32>,
}

/// One async mutex per deal, created on first use and dropped again once
/// nobody holds or waits for it
#[derive(Default)]
struct DealLocks {
    locks: RegistryMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DealLocks {
    fn handle(&self, deal_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(deal_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire(&self, deal_id: Uuid) -> DealGuard<'_> {
        let guard = self.handle(deal_id).lock_owned().await;
        DealGuard {
            locks: self,
            deal_id,
            guard: Some(guard),
        }
    }

    /// `None` when another operation holds the deal
    fn try_acquire(&self, deal_id: Uuid) -> Option<DealGuard<'_>> {
        let guard = self.handle(deal_id).try_lock_owned().ok()?;
        Some(DealGuard {
            locks: self,
            deal_id,
            guard: Some(guard),
        })
    }

    /// Remove the entry when the registry holds the only reference
    fn prune(&self, deal_id: Uuid) {
        let mut locks = self.locks.lock();
        if locks
            .get(&deal_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&deal_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held for the duration of one deal mutation
struct DealGuard<'a> {
    locks: &'a DealLocks,
    deal_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DealGuard<'_> {
    fn drop(&mut self) {
        // release first so the guard's reference is gone before pruning
        self.guard.take();
        self.locks.prune(self.deal_id);
    }
}

/// Settlement orchestrator - drives the deal lifecycle
///
/// SECURITY:
/// - payouts are computed from verified reads only
/// - at most one settlement attempt per deal is in flight
/// - a step persists nothing until all of its validations passed, so a
///   dropped future leaves the deal as it was
pub struct SettlementOrchestrator {
    ledger: Arc<LedgerRepository>,
    yield_source: Arc<dyn VerifiedYieldSource>,
    preference_source: Arc<dyn PreferenceRecordSource>,
    broker: Arc<QuoteBroker>,
    signer: Arc<InstructionSigner>,
    config: OrchestratorConfig,
    locks: DealLocks,
}

impl SettlementOrchestrator {
    pub fn new(
        ledger: Arc<LedgerRepository>,
        yield_source: Arc<dyn VerifiedYieldSource>,
        preference_source: Arc<dyn PreferenceRecordSource>,
        broker: Arc<QuoteBroker>,
        signer: Arc<InstructionSigner>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            yield_source,
            preference_source,
            broker,
            signer,
            config,
            locks: DealLocks::default(),
        }
    }

    pub fn signer(&self) -> &InstructionSigner {
        &self.signer
    }

    // ========== LIFECYCLE ==========

    pub async fn create_deal(&self, input: NewDeal, now: DateTime<Utc>) -> AppResult<Deal> {
        let depositor = input.depositor.trim();
        let counterparty = input.counterparty.trim();

        if depositor.is_empty() || counterparty.is_empty() {
            return Err(AppError::InvalidInput(
                "depositor and counterparty are required".to_string(),
            ));
        }
        if depositor.eq_ignore_ascii_case(counterparty) {
            return Err(AppError::InvalidInput(
                "depositor and counterparty must differ".to_string(),
            ));
        }

        let deal = Deal::new(
            NewDeal {
                depositor: depositor.to_string(),
                counterparty: counterparty.to_string(),
                ..input
            },
            now,
        )?;

        info!(
            "📝 Deal {} created: {} {} on chain {} ({} -> {})",
            deal.id, deal.principal, deal.origin_token, deal.origin_chain, deal.depositor, deal.counterparty
        );
        self.ledger.create_deal(deal).await
    }

    /// `Created -> Funded`. The dispute timeout is fixed here and never
    /// re-read afterwards.
    #[instrument(skip(self, now))]
    pub async fn fund(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Created)?;

        let effective = self.effective_preferences(&deal).await;

        deal.transition(DealState::Funded, now)?;
        deal.funded_at = Some(now);
        deal.dispute_timeout_seconds = Some(effective.dispute_timeout_seconds);

        info!(
            "💰 Deal {} funded, dispute timeout {}s",
            deal.id, effective.dispute_timeout_seconds
        );
        self.ledger.update_deal(deal).await
    }

    /// `Funded -> Accruing`
    #[instrument(skip(self, now))]
    pub async fn start_accrual(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Funded)?;
        deal.transition(DealState::Accruing, now)?;

        info!("📈 Deal {} accruing", deal.id);
        self.ledger.update_deal(deal).await
    }

    /// Price, split and sign the payout for an accruing deal.
    ///
    /// Fails fast with `SettlementInProgress` if another attempt holds the deal.
    #[instrument(skip(self, request, now))]
    pub async fn initiate_settlement(
        &self,
        deal_id: Uuid,
        request: SettlementRequest,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementInstruction> {
        let _guard = self
            .locks
            .try_acquire(deal_id)
            .ok_or(SettlementError::SettlementInProgress(deal_id))?;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Accruing)?;

        if deal.is_timed_out(now) {
            deal.transition(DealState::Disputed, now)?;
            self.ledger.update_deal(deal).await?;
            warn!("⏰ Deal {} hit its dispute timeout before settlement", deal_id);
            return Err(SettlementError::DisputeTimeoutElapsed(deal_id).into());
        }

        let policy = self.slippage_policy(request.max_slippage_bps)?;
        let instruction = self.build_instruction(&deal, deal.principal, policy, now).await?;

        deal.transition(DealState::Settling, now)?;
        deal.settlement_attempts += 1;

        self.ledger.save_instruction(instruction.clone()).await?;
        self.ledger.update_deal(deal).await?;

        info!(
            "✓ Deal {} settling: depositor {} / counterparty {} (yield {}, split {}%)",
            deal_id,
            instruction.depositor_amount,
            instruction.counterparty_amount,
            instruction.accrued_yield,
            instruction.yield_split_percent
        );
        Ok(instruction)
    }

    /// Executor confirmed the payout: `Settling -> Settled`
    #[instrument(skip(self, now))]
    pub async fn complete_settlement(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Settling)?;

        let instruction = self
            .ledger
            .last_instruction(deal_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("No instruction for deal {}", deal_id)))?;

        self.signer.verify(&instruction)?;

        if let Some(quote) = &instruction.payout_quote {
            if quote.is_expired(now) {
                warn!("Quote for deal {} expired at {}", deal_id, quote.expires_at);
                return Err(SettlementError::QuoteExpired(quote.expires_at).into());
            }
        }

        deal.transition(DealState::Settled, now)?;
        let deal = self.ledger.update_deal(deal).await?;

        info!("✅ Deal {} settled", deal_id);
        Ok(deal)
    }

    /// Executor or counterparty rejected the payout. Back to `Accruing` for
    /// a retry, or `Disputed` once the timeout has passed.
    #[instrument(skip(self, now))]
    pub async fn reject_settlement(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Settling)?;

        let next = if deal.is_timed_out(now) {
            DealState::Disputed
        } else {
            DealState::Accruing
        };
        deal.transition(next, now)?;

        warn!("Settlement for deal {} rejected, now {}", deal_id, next);
        self.ledger.update_deal(deal).await
    }

    /// Move a silent deal to `Disputed` once its timeout has passed.
    ///
    /// A `Settling` deal is only disputed when its instruction has stalled:
    /// the payout quote expired, or a same-route instruction has waited past
    /// `settling_grace_seconds`.
    ///
    /// Returns whether the deal transitioned. A deal held by an in-flight
    /// operation is skipped and reported as unchanged.
    #[instrument(skip(self, now))]
    pub async fn enforce_timeout(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<bool> {
        let Some(_guard) = self.locks.try_acquire(deal_id) else {
            debug!("Deal {} busy, skipping timeout check", deal_id);
            return Ok(false);
        };

        let mut deal = self.ledger.get_deal(deal_id).await?;
        if !deal.state.is_timeout_eligible() || !deal.is_timed_out(now) {
            return Ok(false);
        }
        if deal.state == DealState::Settling && !self.settlement_stalled(deal_id, now).await {
            debug!("Deal {} past its deadline but settlement still live", deal_id);
            return Ok(false);
        }

        deal.transition(DealState::Disputed, now)?;
        self.ledger.update_deal(deal).await?;

        warn!("⏰ Deal {} disputed after timeout", deal_id);
        Ok(true)
    }

    /// `Disputed -> Settled` with an arbiter-chosen principal share
    #[instrument(skip(self, resolution, now))]
    pub async fn resolve_dispute(
        &self,
        deal_id: Uuid,
        resolution: DisputeResolution,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementInstruction> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Disputed)?;

        if resolution.counterparty_principal > deal.principal {
            return Err(AppError::InvalidInput(format!(
                "counterparty principal {} exceeds principal {}",
                resolution.counterparty_principal, deal.principal
            )));
        }

        let policy = self.slippage_policy(resolution.max_slippage_bps)?;
        let instruction = self
            .build_instruction(&deal, resolution.counterparty_principal, policy, now)
            .await?;

        deal.transition(DealState::Settled, now)?;
        deal.settlement_attempts += 1;

        self.ledger.save_instruction(instruction.clone()).await?;
        self.ledger.update_deal(deal).await?;

        info!(
            "⚖️ Dispute on deal {} resolved: depositor {} / counterparty {}",
            deal_id, instruction.depositor_amount, instruction.counterparty_amount
        );
        Ok(instruction)
    }

    /// `Disputed -> Cancelled`; principal and yield return to the depositor
    #[instrument(skip(self, now))]
    pub async fn abort(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        deal.require_state(DealState::Disputed)?;
        deal.transition(DealState::Cancelled, now)?;

        let deal = self.ledger.update_deal(deal).await?;

        info!("Dispute on deal {} aborted", deal_id);
        Ok(deal)
    }

    /// Depositor walks away before any settlement attempt
    #[instrument(skip(self, now))]
    pub async fn cancel(&self, deal_id: Uuid, now: DateTime<Utc>) -> AppResult<Deal> {
        let _guard = self.locks.acquire(deal_id).await;

        let mut deal = self.ledger.get_deal(deal_id).await?;
        if !matches!(
            deal.state,
            DealState::Created | DealState::Funded | DealState::Accruing
        ) {
            return Err(SettlementError::InvalidState {
                deal_id,
                current: deal.state,
                expected: "created, funded or accruing".to_string(),
            }
            .into());
        }
        deal.transition(DealState::Cancelled, now)?;

        let deal = self.ledger.update_deal(deal).await?;

        info!("Deal {} cancelled by depositor", deal_id);
        Ok(deal)
    }

    // ========== READS ==========

    /// Display-only projection of accrued yield.
    ///
    /// With `apy` set, the rate is derived from it instead of the snapshot's;
    /// without any verified read the projection starts from zero at funding.
    pub async fn estimate_yield(
        &self,
        deal_id: Uuid,
        apy: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> AppResult<EstimatedYield> {
        let deal = self.ledger.get_deal(deal_id).await?;

        let snapshot = match (self.ledger.latest_snapshot(deal_id).await, deal.funded_at) {
            (Some(snapshot), _) => snapshot,
            (None, Some(funded_at)) if apy.is_some() => YieldSnapshot {
                principal: deal.principal,
                rate_per_second: Decimal::ZERO,
                as_of: funded_at,
                accrued_at_snapshot: Amount::ZERO,
            },
            _ => return Err(SettlementError::NoVerifiedYield(deal_id).into()),
        };

        let snapshot = match apy {
            Some(apy) => YieldSnapshot {
                rate_per_second: rate_per_second(snapshot.principal, apy),
                ..snapshot
            },
            None => snapshot,
        };

        Ok(compute_accrued(&snapshot, now)?)
    }

    /// Fetch and resolve a counterparty's records. Fetch failures degrade to
    /// "no preferences".
    pub async fn preferences_for(&self, counterparty: &str) -> ResolvedPreferences {
        match self
            .preference_source
            .fetch_records(counterparty, &PREFERENCE_KEYS)
            .await
        {
            Ok(records) => resolve(&records),
            Err(e) => {
                warn!("Preference records for {} unavailable: {}", counterparty, e);
                ResolvedPreferences::default()
            }
        }
    }

    // ========== INTERNALS ==========

    /// Whether the in-flight instruction can no longer be executed
    async fn settlement_stalled(&self, deal_id: Uuid, now: DateTime<Utc>) -> bool {
        let Some(instruction) = self.ledger.last_instruction(deal_id).await else {
            return true;
        };

        match &instruction.payout_quote {
            Some(quote) => quote.is_expired(now),
            None => Duration::try_seconds(self.config.settling_grace_seconds)
                .and_then(|grace| instruction.finalized_at.checked_add_signed(grace))
                .map_or(true, |stale_at| now >= stale_at),
        }
    }

    async fn effective_preferences(&self, deal: &Deal) -> EffectivePreferences {
        let resolved = self.preferences_for(&deal.counterparty).await;
        if !resolved.has_preferences {
            debug!("Counterparty {} has no preferences, using defaults", deal.counterparty);
        }
        resolved
            .preferences
            .with_defaults(&self.config.defaults, deal.origin_chain, &deal.origin_token)
    }

    fn slippage_policy(&self, requested_bps: Option<u32>) -> Result<SlippagePolicy, SettlementError> {
        SlippagePolicy::new(requested_bps.unwrap_or(self.config.default_max_slippage_bps))
    }

    /// Verified yield for the deal. Reads taken before funding do not count.
    async fn verified_yield(&self, deal: &Deal, now: DateTime<Utc>) -> Result<VerifiedYield, SettlementError> {
        let funded_at = deal
            .funded_at
            .ok_or(SettlementError::NoVerifiedYield(deal.id))?;

        let snapshot = self
            .yield_source
            .read_yield_snapshot(deal.id)
            .await
            .map_err(|e| {
                warn!("No verified read for deal {}: {}", deal.id, e);
                SettlementError::NoVerifiedYield(deal.id)
            })?;

        if snapshot.as_of < funded_at {
            warn!(
                "Verified read for deal {} predates funding ({} < {})",
                deal.id, snapshot.as_of, funded_at
            );
            return Err(SettlementError::NoVerifiedYield(deal.id));
        }

        VerifiedYield::from_snapshot(&snapshot, now)
    }

    /// Shared pricing path for normal settlement and dispute resolution.
    /// Nothing is persisted here.
    async fn build_instruction(
        &self,
        deal: &Deal,
        principal_share: Amount,
        policy: SlippagePolicy,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementInstruction> {
        let verified = self.verified_yield(deal, now).await?;
        let effective = self.effective_preferences(deal).await;

        let split = split_payout(
            deal.principal,
            principal_share,
            verified.amount(),
            effective.yield_split_percent,
        )?;

        let cross_route = effective.settlement_chain_id != deal.origin_chain
            || effective.settlement_token != deal.origin_token;

        let payout_quote = if cross_route && !split.counterparty_amount.is_zero() {
            let request = QuoteRequest {
                from_chain_id: deal.origin_chain,
                to_chain_id: effective.settlement_chain_id,
                from_token: deal.origin_token.clone(),
                to_token: effective.settlement_token.clone(),
                from_amount: split.counterparty_amount,
                from_address: self.config.escrow_address.clone(),
                to_address: deal.counterparty.clone(),
            };

            let quote = self.broker.request_quote(&request, now).await?;
            let check = policy.enforce(split.counterparty_amount, quote.to_amount_min)?;
            debug!("Slippage for deal {}: {}", deal.id, check.to_display_string());
            Some(quote)
        } else {
            None
        };

        self.signer.sign(InstructionBody {
            deal_id: deal.id,
            principal: deal.principal,
            accrued_yield: verified.amount(),
            yield_split_percent: effective.yield_split_percent,
            depositor_amount: split.depositor_amount,
            counterparty_amount: split.counterparty_amount,
            payout_chain_id: effective.settlement_chain_id,
            payout_token: effective.settlement_token,
            payout_quote,
            finalized_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryPreferenceRecords, LedgerYieldSource};
    use crate::adapters::traits::{BridgeQuoteSource, SourceError};
    use crate::ledger::models::{ChainId, TokenRef};
    use crate::quote_engine::QuoteBrokerConfig;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    /// Bridge source with a fixed answer that counts calls. When `gate` is
    /// set, every call parks until the test releases it.
    struct ScriptedBridge {
        response: Value,
        calls: AtomicUsize,
        entered: Notify,
        gate: Option<Notify>,
    }

    impl ScriptedBridge {
        fn new(response: Value) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: None,
            })
        }

        fn gated(response: Value) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: Some(Notify::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BridgeQuoteSource for ScriptedBridge {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn quote(&self, _request: &QuoteRequest) -> Result<Value, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.response.clone())
        }
    }

    fn quote_response(min: u64) -> Value {
        json!({
            "tool": "across",
            "estimate": {
                "toAmount": min.to_string(),
                "toAmountMin": min.to_string(),
                "gasCosts": [{ "amountUSD": "0.30" }]
            },
            "transactionRequest": { "data": "0xabcdef" }
        })
    }

    struct Harness {
        ledger: Arc<LedgerRepository>,
        records: Arc<InMemoryPreferenceRecords>,
        bridge: Arc<ScriptedBridge>,
        orchestrator: Arc<SettlementOrchestrator>,
    }

    fn harness(bridge: Arc<ScriptedBridge>) -> Harness {
        let ledger = Arc::new(LedgerRepository::new());
        let records = Arc::new(InMemoryPreferenceRecords::new());
        let broker = Arc::new(QuoteBroker::new(QuoteBrokerConfig::default(), bridge.clone()));
        let signer = Arc::new(InstructionSigner::from_seed_hex(SEED).unwrap());

        let orchestrator = Arc::new(SettlementOrchestrator::new(
            ledger.clone(),
            Arc::new(LedgerYieldSource::new(ledger.clone())),
            records.clone(),
            broker,
            signer,
            OrchestratorConfig {
                escrow_address: "0xescrow".to_string(),
                ..OrchestratorConfig::default()
            },
        ));

        Harness {
            ledger,
            records,
            bridge,
            orchestrator,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn new_deal() -> NewDeal {
        NewDeal {
            principal: Amount(1_000_000),
            depositor: "alice.eth".to_string(),
            counterparty: "bob.eth".to_string(),
            origin_chain: ChainId(1),
            origin_token: TokenRef::new("USDC").unwrap(),
        }
    }

    async fn set_prefs(h: &Harness, pairs: &[(&str, &str)]) {
        let records = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        h.records.set_records("bob.eth", records).await;
    }

    /// Created -> Funded -> Accruing with a verified read of `accrued`
    /// taken one day after funding
    async fn accruing_deal(h: &Harness, accrued: u64) -> Uuid {
        let deal = h.orchestrator.create_deal(new_deal(), t0()).await.unwrap();
        h.orchestrator.fund(deal.id, t0()).await.unwrap();
        h.orchestrator.start_accrual(deal.id, t0()).await.unwrap();
        h.ledger
            .record_snapshot(
                deal.id,
                YieldSnapshot {
                    principal: Amount(1_000_000),
                    rate_per_second: dec!(0.00126),
                    as_of: t0() + Duration::days(1),
                    accrued_at_snapshot: Amount(accrued),
                },
            )
            .await
            .unwrap();
        deal.id
    }

    #[tokio::test]
    async fn test_same_route_settlement_is_conserved_and_skips_broker() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 109).await;

        let now = t0() + Duration::days(2);
        let instruction = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await
            .unwrap();

        assert_eq!(h.bridge.calls(), 0);
        assert!(instruction.payout_quote.is_none());
        // verified component only, the extra day of rate is not paid out
        assert_eq!(instruction.accrued_yield, Amount(109));
        assert_eq!(instruction.counterparty_amount, Amount(1_000_054));
        assert_eq!(instruction.depositor_amount, Amount(55));
        assert!(instruction.is_conserved());
        assert!(h.orchestrator.signer().verify(&instruction).is_ok());

        let deal = h.ledger.get_deal(deal_id).await.unwrap();
        assert_eq!(deal.state, DealState::Settling);
        assert_eq!(deal.settlement_attempts, 1);
        assert_eq!(h.ledger.last_instruction(deal_id).await, Some(instruction));
    }

    #[tokio::test]
    async fn test_out_of_range_split_falls_back_to_default() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        set_prefs(&h, &[("escrow.yield-split", "150")]).await;
        let deal_id = accruing_deal(&h, 200).await;

        let instruction = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap();

        assert_eq!(instruction.yield_split_percent, 50);
        assert_eq!(instruction.counterparty_amount, Amount(1_000_100));
    }

    #[tokio::test]
    async fn test_cross_chain_payout_is_quoted() {
        let h = harness(ScriptedBridge::new(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453"), ("escrow.yield-split", "100")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        let instruction = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap();

        assert_eq!(h.bridge.calls(), 1);
        assert_eq!(instruction.payout_chain_id, ChainId(8453));
        let quote = instruction.payout_quote.as_ref().unwrap();
        assert_eq!(quote.from_amount, Amount(1_000_100));
        assert_eq!(quote.execution_payload, vec![0xab, 0xcd, 0xef]);
    }

    #[tokio::test]
    async fn test_slippage_exceeded_keeps_accruing() {
        let h = harness(ScriptedBridge::new(quote_response(900_000)));
        set_prefs(&h, &[("escrow.settlement-token", "DAI")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        let err = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::SlippageExceeded { to_amount_min: 900_000, .. })
        ));
        let deal = h.ledger.get_deal(deal_id).await.unwrap();
        assert_eq!(deal.state, DealState::Accruing);
        assert_eq!(deal.settlement_attempts, 0);
        assert!(h.ledger.last_instruction(deal_id).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_payload_keeps_accruing() {
        let h = harness(ScriptedBridge::new(json!({
            "estimate": { "toAmountMin": "1000000" }
        })));
        set_prefs(&h, &[("escrow.settlement-chain", "10")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        let err = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Settlement(SettlementError::NoExecutionPayload)));
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Accruing);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_one_wins() {
        let h = harness(ScriptedBridge::gated(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453")]).await;
        let deal_id = accruing_deal(&h, 100).await;
        let now = t0() + Duration::days(2);

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .initiate_settlement(deal_id, SettlementRequest::default(), now)
                    .await
            })
        };

        // first attempt is parked inside the quote call, holding the lock
        h.bridge.entered.notified().await;

        let second = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await;
        assert!(matches!(
            second,
            Err(AppError::Settlement(SettlementError::SettlementInProgress(id))) if id == deal_id
        ));

        if let Some(gate) = &h.bridge.gate {
            gate.notify_one();
        }
        assert!(first.await.unwrap().is_ok());
        assert_eq!(h.bridge.calls(), 1);
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Settling);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_leaves_deal_untouched() {
        let h = harness(ScriptedBridge::gated(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453")]).await;
        let deal_id = accruing_deal(&h, 100).await;
        let now = t0() + Duration::days(2);

        let attempt = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), attempt).await;
        assert!(timed_out.is_err());

        let deal = h.ledger.get_deal(deal_id).await.unwrap();
        assert_eq!(deal.state, DealState::Accruing);
        assert!(h.ledger.last_instruction(deal_id).await.is_none());

        // lock was released with the dropped future
        if let Some(gate) = &h.bridge.gate {
            gate.notify_one();
        }
        assert!(h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_moves_silent_deal_to_disputed() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        set_prefs(&h, &[("escrow.dispute-timeout", "7")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        let deal = h.ledger.get_deal(deal_id).await.unwrap();
        assert_eq!(deal.dispute_timeout_seconds, Some(7 * 86_400));

        // exactly at the deadline is not yet past it
        let deadline = t0() + Duration::days(7);
        assert!(!h.orchestrator.enforce_timeout(deal_id, deadline).await.unwrap());

        let later = deadline + Duration::seconds(1);
        assert!(h.orchestrator.enforce_timeout(deal_id, later).await.unwrap());
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Disputed);

        // already disputed: nothing more to do
        assert!(!h.orchestrator.enforce_timeout(deal_id, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_cross_chain_settlement_is_disputed() {
        let h = harness(ScriptedBridge::new(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap();

        // before the deadline the executor still owns the deal
        assert!(!h
            .orchestrator
            .enforce_timeout(deal_id, t0() + Duration::days(20))
            .await
            .unwrap());

        assert!(h
            .orchestrator
            .enforce_timeout(deal_id, t0() + Duration::days(365))
            .await
            .unwrap());
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Disputed);
    }

    #[tokio::test]
    async fn test_live_quote_holds_off_timeout() {
        let h = harness(ScriptedBridge::new(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453")]).await;
        let deal_id = accruing_deal(&h, 100).await;

        // priced one minute before the deadline, quote valid for 120s
        let priced_at = t0() + Duration::days(30) - Duration::seconds(60);
        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), priced_at)
            .await
            .unwrap();

        let past_deadline = t0() + Duration::days(30) + Duration::seconds(1);
        assert!(!h.orchestrator.enforce_timeout(deal_id, past_deadline).await.unwrap());
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Settling);

        assert!(h
            .orchestrator
            .enforce_timeout(deal_id, priced_at + Duration::seconds(120))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_same_route_settlement_disputed_after_grace() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 100).await;

        let initiated = t0() + Duration::days(30) - Duration::minutes(30);
        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), initiated)
            .await
            .unwrap();

        // past the deadline, still inside the one hour grace
        let inside_grace = initiated + Duration::minutes(59);
        assert!(!h.orchestrator.enforce_timeout(deal_id, inside_grace).await.unwrap());

        assert!(h
            .orchestrator
            .enforce_timeout(deal_id, initiated + Duration::hours(1))
            .await
            .unwrap());
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Disputed);
    }

    #[tokio::test]
    async fn test_lock_registry_does_not_grow() {
        let h = harness(ScriptedBridge::new(quote_response(1)));

        for _ in 0..1000 {
            let err = h.orchestrator.fund(Uuid::new_v4(), t0()).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
            assert!(h.orchestrator.enforce_timeout(Uuid::new_v4(), t0()).await.is_err());
        }
        assert_eq!(h.orchestrator.locks.len(), 0);

        // live deals release their entry between operations too
        let deal_id = accruing_deal(&h, 100).await;
        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(h.orchestrator.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_settlement_after_timeout_disputes() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 100).await;

        let err = h
            .orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(31))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::DisputeTimeoutElapsed(_))
        ));
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Disputed);
    }

    #[tokio::test]
    async fn test_no_verified_read_since_funding() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal = h.orchestrator.create_deal(new_deal(), t0()).await.unwrap();
        h.orchestrator.fund(deal.id, t0()).await.unwrap();
        h.orchestrator.start_accrual(deal.id, t0()).await.unwrap();

        let err = h
            .orchestrator
            .initiate_settlement(deal.id, SettlementRequest::default(), t0() + Duration::days(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Settlement(SettlementError::NoVerifiedYield(_))));
    }

    #[tokio::test]
    async fn test_wrong_state_rejected() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal = h.orchestrator.create_deal(new_deal(), t0()).await.unwrap();

        let err = h
            .orchestrator
            .initiate_settlement(deal.id, SettlementRequest::default(), t0())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::InvalidState { current: DealState::Created, .. })
        ));
    }

    #[tokio::test]
    async fn test_complete_and_reject() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 100).await;
        let now = t0() + Duration::days(2);

        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await
            .unwrap();
        let deal = h.orchestrator.reject_settlement(deal_id, now).await.unwrap();
        assert_eq!(deal.state, DealState::Accruing);

        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await
            .unwrap();
        let deal = h.orchestrator.complete_settlement(deal_id, now).await.unwrap();
        assert_eq!(deal.state, DealState::Settled);
        assert_eq!(deal.settlement_attempts, 2);
    }

    #[tokio::test]
    async fn test_expired_quote_blocks_completion() {
        let h = harness(ScriptedBridge::new(quote_response(1_000_050)));
        set_prefs(&h, &[("escrow.settlement-chain", "8453")]).await;
        let deal_id = accruing_deal(&h, 100).await;
        let now = t0() + Duration::days(2);

        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), now)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .complete_settlement(deal_id, now + Duration::seconds(121))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Settlement(SettlementError::QuoteExpired(_))));
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Settling);
    }

    #[tokio::test]
    async fn test_dispute_resolution_and_abort() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 100).await;
        let late = t0() + Duration::days(31);
        assert!(h.orchestrator.enforce_timeout(deal_id, late).await.unwrap());

        let too_much = DisputeResolution {
            counterparty_principal: Amount(1_000_001),
            max_slippage_bps: None,
        };
        assert!(matches!(
            h.orchestrator.resolve_dispute(deal_id, too_much, late).await,
            Err(AppError::InvalidInput(_))
        ));

        let instruction = h
            .orchestrator
            .resolve_dispute(
                deal_id,
                DisputeResolution {
                    counterparty_principal: Amount(400_000),
                    max_slippage_bps: None,
                },
                late,
            )
            .await
            .unwrap();
        assert_eq!(instruction.counterparty_amount, Amount(400_050));
        assert_eq!(instruction.depositor_amount, Amount(600_050));
        assert_eq!(h.ledger.get_deal(deal_id).await.unwrap().state, DealState::Settled);

        let other = accruing_deal(&h, 0).await;
        h.orchestrator.enforce_timeout(other, late).await.unwrap();
        let deal = h.orchestrator.abort(other, late).await.unwrap();
        assert_eq!(deal.state, DealState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_only_before_settling() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal = h.orchestrator.create_deal(new_deal(), t0()).await.unwrap();
        let cancelled = h.orchestrator.cancel(deal.id, t0()).await.unwrap();
        assert_eq!(cancelled.state, DealState::Cancelled);

        let deal_id = accruing_deal(&h, 10).await;
        h.orchestrator
            .initiate_settlement(deal_id, SettlementRequest::default(), t0() + Duration::days(2))
            .await
            .unwrap();
        assert!(h.orchestrator.cancel(deal_id, t0() + Duration::days(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_create_deal_validation() {
        let h = harness(ScriptedBridge::new(quote_response(1)));

        let same_party = NewDeal {
            counterparty: "ALICE.eth".to_string(),
            ..new_deal()
        };
        assert!(matches!(
            h.orchestrator.create_deal(same_party, t0()).await,
            Err(AppError::InvalidInput(_))
        ));

        let zero = NewDeal {
            principal: Amount::ZERO,
            ..new_deal()
        };
        assert!(matches!(
            h.orchestrator.create_deal(zero, t0()).await,
            Err(AppError::Settlement(SettlementError::InvalidAmount(_)))
        ));
    }

    #[tokio::test]
    async fn test_estimate_is_display_only() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal_id = accruing_deal(&h, 109).await;

        let later = t0() + Duration::days(2);
        let estimate = h.orchestrator.estimate_yield(deal_id, None, later).await.unwrap();
        // 109 + floor(0.00126 * 86400)
        assert_eq!(estimate.amount(), Amount(217));

        let deal = h.ledger.get_deal(deal_id).await.unwrap();
        assert_eq!(deal.state, DealState::Accruing);
    }

    #[tokio::test]
    async fn test_estimate_from_apy_without_read() {
        let h = harness(ScriptedBridge::new(quote_response(1)));
        let deal = h.orchestrator.create_deal(new_deal(), t0()).await.unwrap();
        h.orchestrator.fund(deal.id, t0()).await.unwrap();

        let estimate = h
            .orchestrator
            .estimate_yield(deal.id, Some(dec!(0.04)), t0() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(estimate.amount(), Amount(109));

        assert!(h
            .orchestrator
            .estimate_yield(deal.id, None, t0() + Duration::days(1))
            .await
            .is_err());
    }
}
