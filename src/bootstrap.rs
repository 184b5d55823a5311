use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    adapters::memory::{InMemoryPreferenceRecords, LedgerYieldSource, NoBridgeRoutes},
    api::handler::AppState,
    config::Config,
    error::AppResult,
    ledger::LedgerRepository,
    quote_engine::{QuoteBroker, QuoteBrokerConfig},
    settlement::{DisputeSweeper, InstructionSigner, OrchestratorConfig, SettlementOrchestrator, SweepConfig},
};

/// Application components plus the background sweeper
pub struct App {
    pub state: AppState,
    pub sweeper: Arc<DisputeSweeper>,
}

pub fn initialize_app(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    let ledger = Arc::new(LedgerRepository::new());
    info!("✅ Ledger initialized");

    let signer = Arc::new(InstructionSigner::from_seed_hex(&config.signing_key_hex)?);
    info!("✅ Instruction signer loaded: {}", signer.public_key_hex());

    // Collaborators
    let yield_source = Arc::new(LedgerYieldSource::new(ledger.clone()));
    let preference_records = Arc::new(InMemoryPreferenceRecords::new());
    warn!("⚠️  No bridge aggregator configured - cross-chain payouts will report QUOTE_UNAVAILABLE");

    let broker = Arc::new(QuoteBroker::new(
        QuoteBrokerConfig {
            quote_validity_seconds: config.quote_validity_seconds,
        },
        Arc::new(NoBridgeRoutes),
    ));
    info!("✅ Quote broker initialized (source: {})", broker.source_name());

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        ledger.clone(),
        yield_source,
        preference_records.clone(),
        broker,
        signer,
        OrchestratorConfig {
            defaults: config.protocol_defaults(),
            default_max_slippage_bps: config.default_max_slippage_bps,
            escrow_address: config.escrow_address.clone(),
            settling_grace_seconds: config.settling_grace_seconds,
        },
    ));
    info!(
        "✅ Settlement orchestrator initialized (split {}%, timeout {} days, slippage {}bps)",
        config.default_yield_split_percent,
        config.default_dispute_timeout_days,
        config.default_max_slippage_bps
    );

    let sweeper = Arc::new(DisputeSweeper::new(
        SweepConfig {
            interval_seconds: config.sweep_interval_seconds,
        },
        ledger.clone(),
        orchestrator.clone(),
    ));

    Ok(App {
        state: AppState {
            orchestrator,
            ledger,
            preference_records,
        },
        sweeper,
    })
}
