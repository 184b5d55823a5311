pub mod memory;
pub mod traits;

pub use memory::{InMemoryPreferenceRecords, LedgerYieldSource, NoBridgeRoutes};
pub use traits::{BridgeQuoteSource, PreferenceRecordSource, QuoteRequest, SourceError, VerifiedYieldSource};
