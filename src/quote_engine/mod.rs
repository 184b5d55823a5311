pub mod broker;
pub mod models;
pub mod slippage;

pub use broker::{QuoteBroker, QuoteBrokerConfig, MAX_QUOTE_VALIDITY_SECONDS};
pub use models::QuoteOutcome;
pub use slippage::{SlippageCheck, SlippagePolicy};
