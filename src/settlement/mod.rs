// Deal lifecycle, payout pricing and signing
pub mod orchestrator;
pub mod payout;
pub mod scheduler;
pub mod signing;

pub use orchestrator::{DisputeResolution, OrchestratorConfig, SettlementOrchestrator, SettlementRequest};
pub use scheduler::{DisputeSweeper, SweepConfig};
pub use signing::InstructionSigner;
