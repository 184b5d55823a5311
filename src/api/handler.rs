use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    adapters::memory::InMemoryPreferenceRecords,
    error::{AppError, AppResult},
    ledger::{
        models::{Amount, DealState, SettlementInstruction, YieldSnapshot},
        repository::LedgerRepository,
    },
    middleware::validate_body,
    settlement::{DisputeResolution, SettlementOrchestrator, SettlementRequest},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub ledger: Arc<LedgerRepository>,
    pub preference_records: Arc<InMemoryPreferenceRecords>,
}

// ========== DEALS ==========

/// POST /deals
pub async fn create_deal(
    State(state): State<AppState>,
    Json(request): Json<CreateDealRequest>,
) -> AppResult<(StatusCode, Json<DealResponse>)> {
    validate_body(&request)?;

    let deal = state
        .orchestrator
        .create_deal(request.into_new_deal()?, Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(DealResponse::from(deal))))
}

/// GET /deals/:id
pub async fn get_deal(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.ledger.get_deal(deal_id).await?;
    Ok(Json(DealResponse::from(deal)))
}

/// POST /deals/:id/fund
pub async fn fund_deal(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.fund(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

/// POST /deals/:id/accrual
pub async fn start_accrual(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.start_accrual(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

/// POST /deals/:id/cancel - depositor cancel
pub async fn cancel_deal(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.cancel(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

// ========== YIELD ==========

/// PUT /deals/:id/yield - verified read from the indexer
pub async fn record_yield(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
    Json(request): Json<RecordYieldRequest>,
) -> AppResult<StatusCode> {
    let deal = state.ledger.get_deal(deal_id).await?;

    if let Some(principal) = request.principal {
        if Amount(principal) != deal.principal {
            return Err(AppError::InvalidInput(format!(
                "snapshot principal {} does not match deal principal {}",
                principal, deal.principal
            )));
        }
    }

    let snapshot = YieldSnapshot {
        principal: deal.principal,
        rate_per_second: request.rate_per_second,
        as_of: request.as_of,
        accrued_at_snapshot: Amount(request.accrued_at_snapshot),
    };

    state.ledger.record_snapshot(deal_id, snapshot).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /deals/:id/yield/estimate?apy=0.04 - display only
pub async fn estimate_yield(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
    Query(query): Query<EstimateQuery>,
) -> AppResult<Json<YieldEstimateResponse>> {
    let estimate = state
        .orchestrator
        .estimate_yield(deal_id, query.apy()?, Utc::now())
        .await?;

    Ok(Json(YieldEstimateResponse::new(deal_id, estimate)))
}

// ========== SETTLEMENT ==========

/// POST /deals/:id/settlement
///
/// Returns the signed instruction for the executor. A concurrent attempt on
/// the same deal gets 409 SETTLEMENT_IN_PROGRESS.
pub async fn initiate_settlement(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
    body: Option<Json<InitiateSettlementRequest>>,
) -> AppResult<Json<SettlementInstruction>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    validate_body(&request)?;

    info!("Settlement requested for deal {}", deal_id);

    let instruction = state
        .orchestrator
        .initiate_settlement(
            deal_id,
            SettlementRequest {
                max_slippage_bps: request.max_slippage_bps,
            },
            Utc::now(),
        )
        .await?;

    Ok(Json(instruction))
}

/// GET /deals/:id/settlement - last issued instruction
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<SettlementInstruction>> {
    state
        .ledger
        .last_instruction(deal_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No settlement instruction for deal {}", deal_id)))
}

/// POST /deals/:id/settlement/complete - executor callback
pub async fn complete_settlement(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.complete_settlement(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

/// POST /deals/:id/settlement/reject - executor callback
pub async fn reject_settlement(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.reject_settlement(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

// ========== DISPUTES ==========

/// POST /deals/:id/timeout
pub async fn enforce_timeout(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<TimeoutResponse>> {
    let disputed = state.orchestrator.enforce_timeout(deal_id, Utc::now()).await?;
    let deal = state.ledger.get_deal(deal_id).await?;

    Ok(Json(TimeoutResponse {
        deal_id,
        disputed,
        state: deal.state,
    }))
}

/// POST /deals/:id/dispute/resolve - arbiter decision
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
    Json(request): Json<ResolveDisputeRequest>,
) -> AppResult<Json<SettlementInstruction>> {
    validate_body(&request)?;

    let instruction = state
        .orchestrator
        .resolve_dispute(
            deal_id,
            DisputeResolution {
                counterparty_principal: Amount(request.counterparty_principal),
                max_slippage_bps: request.max_slippage_bps,
            },
            Utc::now(),
        )
        .await?;

    Ok(Json(instruction))
}

/// POST /deals/:id/dispute/abort
pub async fn abort_dispute(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<DealResponse>> {
    let deal = state.orchestrator.abort(deal_id, Utc::now()).await?;
    Ok(Json(DealResponse::from(deal)))
}

// ========== COUNTERPARTIES ==========

/// PUT /counterparties/:identity/records
pub async fn put_records(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(request): Json<PutRecordsRequest>,
) -> AppResult<StatusCode> {
    validate_body(&request)?;
    if identity.trim().is_empty() {
        return Err(AppError::InvalidInput("identity must not be blank".to_string()));
    }

    state
        .preference_records
        .set_records(identity.trim(), request.records)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /counterparties/:identity/preferences
pub async fn get_preferences(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> AppResult<Json<PreferencesResponse>> {
    let resolved = state.orchestrator.preferences_for(identity.trim()).await;

    Ok(Json(PreferencesResponse {
        counterparty: identity,
        resolved,
    }))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let open = state
        .ledger
        .get_deals_by_state(&[
            DealState::Created,
            DealState::Funded,
            DealState::Accruing,
            DealState::Settling,
        ])
        .await?;
    let disputed = state.ledger.get_deals_by_state(&[DealState::Disputed]).await?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        open_deals: open.len(),
        disputed_deals: disputed.len(),
        signer: state.orchestrator.signer().public_key_hex(),
    }))
}
