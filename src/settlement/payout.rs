use serde::Serialize;
use tracing::error;

use crate::error::SettlementError;
use crate::ledger::models::Amount;

/// Division of principal + verified yield between the two parties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayoutSplit {
    pub depositor_amount: Amount,
    pub counterparty_amount: Amount,
}

/// `counterparty = principal_share + floor(accrued * split / 100)` and the
/// depositor receives the rest. All integer math in u128.
///
/// INVARIANTS:
/// - depositor + counterparty == principal + accrued, exactly
/// - a violation aborts the attempt; no instruction may be built from it
pub fn split_payout(
    principal: Amount,
    principal_share: Amount,
    accrued: Amount,
    yield_split_percent: u8,
) -> Result<PayoutSplit, SettlementError> {
    if yield_split_percent > 100 {
        return Err(SettlementError::InvalidAmount(format!(
            "yield split {}% is above 100%",
            yield_split_percent
        )));
    }
    if principal_share > principal {
        return Err(SettlementError::InvalidAmount(format!(
            "principal share {} exceeds principal {}",
            principal_share, principal
        )));
    }

    let total = u128::from(principal.value()) + u128::from(accrued.value());
    let yield_share = u128::from(accrued.value()) * u128::from(yield_split_percent) / 100;
    let counterparty = u128::from(principal_share.value()) + yield_share;

    let depositor = total.checked_sub(counterparty).ok_or_else(|| {
        SettlementError::InvalidAmount("counterparty amount exceeds total".to_string())
    })?;

    let to_amount = |v: u128| {
        u64::try_from(v)
            .map(Amount)
            .map_err(|_| SettlementError::InvalidAmount("payout exceeds u64".to_string()))
    };

    let split = PayoutSplit {
        depositor_amount: to_amount(depositor)?,
        counterparty_amount: to_amount(counterparty)?,
    };

    ensure_conserved(&split, principal, accrued)?;
    Ok(split)
}

/// Re-check conservation on the final u64 amounts
pub fn ensure_conserved(split: &PayoutSplit, principal: Amount, accrued: Amount) -> Result<(), SettlementError> {
    let expected = u128::from(principal.value()) + u128::from(accrued.value());
    let paid = u128::from(split.depositor_amount.value()) + u128::from(split.counterparty_amount.value());

    if paid != expected {
        error!(
            "❌ Conservation violated: {} + {} != {}",
            split.depositor_amount, split.counterparty_amount, expected
        );
        return Err(SettlementError::ConservationViolated {
            depositor: split.depositor_amount.value(),
            counterparty: split.counterparty_amount.value(),
            expected,
        });
    }
    Ok(())
}
