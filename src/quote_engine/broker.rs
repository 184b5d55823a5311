use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::adapters::traits::{BridgeQuoteSource, QuoteRequest};
use crate::error::SettlementError;
use crate::ledger::models::SettlementQuote;
use crate::quote_engine::models::{MalformedQuote, QuoteOutcome};

/// Longest validity window a quote may be given
pub const MAX_QUOTE_VALIDITY_SECONDS: i64 = 86_400;

/// Quote broker configuration
#[derive(Debug, Clone)]
pub struct QuoteBrokerConfig {
    /// How long a quote stays usable after it was priced
    pub quote_validity_seconds: i64,
}

impl Default for QuoteBrokerConfig {
    fn default() -> Self {
        Self {
            quote_validity_seconds: 120,
        }
    }
}

impl QuoteBrokerConfig {
    /// Validity window clamped to `1..=MAX_QUOTE_VALIDITY_SECONDS`
    pub fn validity(&self) -> Duration {
        Duration::seconds(self.quote_validity_seconds.clamp(1, MAX_QUOTE_VALIDITY_SECONDS))
    }
}

/// Quote broker - prices cross-chain payouts through an injected bridge source
///
/// Quotes are requested fresh every time and never cached: each call may
/// return a different price.
pub struct QuoteBroker {
    config: QuoteBrokerConfig,
    source: Arc<dyn BridgeQuoteSource>,
}

impl QuoteBroker {
    pub fn new(config: QuoteBrokerConfig, source: Arc<dyn BridgeQuoteSource>) -> Self {
        Self { config, source }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Request and validate a payout quote
    ///
    /// Callers must not invoke this for a same-chain, same-token payout.
    #[instrument(
        skip(self, request, now),
        fields(
            source = self.source.name(),
            from_chain = %request.from_chain_id,
            to_chain = %request.to_chain_id,
            amount = %request.from_amount
        )
    )]
    pub async fn request_quote(
        &self,
        request: &QuoteRequest,
        now: DateTime<Utc>,
    ) -> Result<SettlementQuote, SettlementError> {
        // VALIDATION 1: Something to move
        if request.from_amount.is_zero() {
            return Err(SettlementError::InvalidAmount(
                "quote amount must be greater than zero".to_string(),
            ));
        }

        // VALIDATION 2: Same route needs no quote
        if request.is_same_route() {
            warn!("Rejected quote request for same chain and token");
            return Err(SettlementError::QuoteNotRequired);
        }

        let response = self.source.quote(request).await;

        let parsed = match QuoteOutcome::from_response(response) {
            QuoteOutcome::Valid(parsed) => parsed,
            QuoteOutcome::Unavailable(reason) => {
                warn!("Quote unavailable: {}", reason);
                return Err(SettlementError::QuoteUnavailable(reason));
            }
            QuoteOutcome::Malformed(MalformedQuote::MissingPayload) => {
                warn!("Quote rejected: no execution payload");
                return Err(SettlementError::NoExecutionPayload);
            }
            QuoteOutcome::Malformed(reason) => {
                warn!("Quote rejected: {}", reason);
                return Err(SettlementError::MalformedQuote(reason.to_string()));
            }
        };

        let quote = SettlementQuote {
            from_chain_id: request.from_chain_id,
            to_chain_id: request.to_chain_id,
            from_token: request.from_token.clone(),
            to_token: request.to_token.clone(),
            from_amount: request.from_amount,
            to_amount: parsed.to_amount,
            to_amount_min: parsed.to_amount_min,
            estimated_seconds: parsed.estimated_seconds,
            bridge_name: parsed.bridge_name,
            gas_cost_usd: parsed.gas_cost_usd,
            fee_cost_usd: parsed.fee_cost_usd,
            execution_payload: parsed.execution_payload,
            quoted_at: now,
            expires_at: now
                .checked_add_signed(self.config.validity())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        info!(
            "✓ Quote via {}: {} -> min {} (gas ${}, fees ${})",
            quote.bridge_name.as_deref().unwrap_or("unknown"),
            quote.from_amount,
            quote.to_amount_min,
            quote.gas_cost_usd,
            quote.fee_cost_usd
        );

        Ok(quote)
    }
}
