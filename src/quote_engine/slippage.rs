use serde::{Deserialize, Serialize};

use crate::error::SettlementError;
use crate::ledger::models::Amount;

pub const BPS_DENOMINATOR: u32 = 10_000;

/// Slippage impact information for a payout quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippageCheck {
    /// Amount the counterparty is owed
    pub expected_amount: Amount,
    /// Lowest `to_amount_min` the policy accepts
    pub minimum_acceptable: Amount,
    /// Minimum the quote guarantees
    pub quoted_minimum: Amount,
    /// Worst-case slippage of the quote in basis points
    pub slippage_bps: u32,
    pub is_acceptable: bool,
}

impl SlippageCheck {
    /// Format for logs
    pub fn to_display_string(&self) -> String {
        format!(
            "Expected: {} | Quoted min: {} | Floor: {} | Slippage: {}bps",
            self.expected_amount, self.quoted_minimum, self.minimum_acceptable, self.slippage_bps
        )
    }
}

/// Minimum-acceptable-value policy for quotes
///
/// A quote passes iff `to_amount_min >= expected * (1 - max_slippage)`,
/// compared exactly in integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippagePolicy {
    max_slippage_bps: u32,
}

impl SlippagePolicy {
    pub fn new(max_slippage_bps: u32) -> Result<Self, SettlementError> {
        if max_slippage_bps > BPS_DENOMINATOR {
            return Err(SettlementError::InvalidAmount(format!(
                "max slippage {}bps exceeds {}bps",
                max_slippage_bps, BPS_DENOMINATOR
            )));
        }
        Ok(Self { max_slippage_bps })
    }

    pub fn max_slippage_bps(&self) -> u32 {
        self.max_slippage_bps
    }

    /// `ceil(expected * (10_000 - bps) / 10_000)`
    pub fn minimum_acceptable(&self, expected: Amount) -> Amount {
        let numerator = u128::from(expected.value()) * u128::from(BPS_DENOMINATOR - self.max_slippage_bps);
        let denominator = u128::from(BPS_DENOMINATOR);
        let floor = numerator.div_ceil(denominator);
        // Never exceeds `expected`, so it fits back into u64
        Amount(floor as u64)
    }

    pub fn check(&self, expected: Amount, quoted_minimum: Amount) -> SlippageCheck {
        let lhs = u128::from(quoted_minimum.value()) * u128::from(BPS_DENOMINATOR);
        let rhs = u128::from(expected.value()) * u128::from(BPS_DENOMINATOR - self.max_slippage_bps);

        let slippage_bps = if quoted_minimum >= expected || expected.is_zero() {
            0
        } else {
            let shortfall = u128::from(expected.value() - quoted_minimum.value());
            (shortfall * u128::from(BPS_DENOMINATOR) / u128::from(expected.value())) as u32
        };

        SlippageCheck {
            expected_amount: expected,
            minimum_acceptable: self.minimum_acceptable(expected),
            quoted_minimum,
            slippage_bps,
            is_acceptable: lhs >= rhs,
        }
    }

    /// Fails with `SlippageExceeded` when the quote's minimum is below the floor
    pub fn enforce(&self, expected: Amount, quoted_minimum: Amount) -> Result<SlippageCheck, SettlementError> {
        let check = self.check(expected, quoted_minimum);
        if !check.is_acceptable {
            return Err(SettlementError::SlippageExceeded {
                to_amount_min: quoted_minimum.value(),
                floor: check.minimum_acceptable.value(),
            });
        }
        Ok(check)
    }
}
