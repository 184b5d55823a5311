use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        abort_dispute, cancel_deal, complete_settlement, create_deal, enforce_timeout, estimate_yield,
        fund_deal, get_deal, get_preferences, get_settlement, health_check, initiate_settlement,
        put_records, record_yield, reject_settlement, resolve_dispute, start_accrual, AppState,
    },
    middleware::create_cors_layer,
};

pub fn create_app(state: AppState, cors_allowed_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Deal lifecycle
                .route("/deals", post(create_deal))
                .route("/deals/:id", get(get_deal))
                .route("/deals/:id/fund", post(fund_deal))
                .route("/deals/:id/accrual", post(start_accrual))
                .route("/deals/:id/cancel", post(cancel_deal))
                // Yield reads
                .route("/deals/:id/yield", put(record_yield))
                .route("/deals/:id/yield/estimate", get(estimate_yield))
                // Settlement
                .route(
                    "/deals/:id/settlement",
                    post(initiate_settlement).get(get_settlement),
                )
                .route("/deals/:id/settlement/complete", post(complete_settlement))
                .route("/deals/:id/settlement/reject", post(reject_settlement))
                // Disputes
                .route("/deals/:id/timeout", post(enforce_timeout))
                .route("/deals/:id/dispute/resolve", post(resolve_dispute))
                .route("/deals/:id/dispute/abort", post(abort_dispute))
                // Counterparty preference records
                .route("/counterparties/:identity/records", put(put_records))
                .route("/counterparties/:identity/preferences", get(get_preferences)),
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(cors_allowed_origins))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
