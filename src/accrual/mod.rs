// Yield accrual math: display estimates and verified settleable yield
pub mod calculator;

pub use calculator::{compute_accrued, rate_per_second, EstimatedYield, VerifiedYield, SECONDS_PER_YEAR};
