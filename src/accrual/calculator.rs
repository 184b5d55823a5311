use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::SettlementError;
use crate::ledger::models::{Amount, YieldSnapshot};

/// 365 days
pub const SECONDS_PER_YEAR: i64 = 31_536_000;

/// Time-extrapolated yield for display.
///
/// Deliberately has no conversion into `VerifiedYield` or `Amount`-taking
/// settlement APIs; the settlement path only accepts `VerifiedYield`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EstimatedYield {
    amount: Amount,
    at: DateTime<Utc>,
}

impl EstimatedYield {
    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Yield backed by a verified on-chain read. Only constructible from a
/// `YieldSnapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifiedYield {
    amount: Amount,
    as_of: DateTime<Utc>,
}

impl VerifiedYield {
    /// Settleable yield as of `now`: the verified component of the snapshot.
    /// The per-second rate never contributes to a payout.
    pub fn from_snapshot(snapshot: &YieldSnapshot, now: DateTime<Utc>) -> Result<Self, SettlementError> {
        ensure_not_before(snapshot, now)?;
        Ok(Self {
            amount: snapshot.accrued_at_snapshot,
            as_of: snapshot.as_of,
        })
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }
}

/// Per-second accrual for `principal` at `apy` (0.04 = 4%). Estimation only.
pub fn rate_per_second(principal: Amount, apy: Decimal) -> Decimal {
    if apy <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    principal.to_decimal() * apy / Decimal::from(SECONDS_PER_YEAR)
}

/// `accrued_at_snapshot + rate_per_second * (now - as_of)`, floored to the
/// smallest unit. Never rounds up.
pub fn compute_accrued(snapshot: &YieldSnapshot, now: DateTime<Utc>) -> Result<EstimatedYield, SettlementError> {
    ensure_not_before(snapshot, now)?;

    let elapsed = (now - snapshot.as_of).num_seconds();
    let rate = snapshot.rate_per_second.max(Decimal::ZERO);

    let extrapolated = rate
        .checked_mul(Decimal::from(elapsed))
        .and_then(|v| v.floor().to_u64())
        .ok_or_else(|| SettlementError::InvalidAmount("accrual overflow".to_string()))?;

    let amount = snapshot
        .accrued_at_snapshot
        .checked_add(Amount(extrapolated))
        .ok_or_else(|| SettlementError::InvalidAmount("accrual overflow".to_string()))?;

    Ok(EstimatedYield { amount, at: now })
}

fn ensure_not_before(snapshot: &YieldSnapshot, now: DateTime<Utc>) -> Result<(), SettlementError> {
    if now < snapshot.as_of {
        return Err(SettlementError::ClockSkew {
            now: now.timestamp(),
            as_of: snapshot.as_of.timestamp(),
        });
    }
    Ok(())
}
