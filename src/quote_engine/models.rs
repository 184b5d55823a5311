use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::adapters::traits::SourceError;
use crate::ledger::models::Amount;

/// Response shape of the bridge aggregator. Every field is optional; presence
/// and validity are decided in `QuoteOutcome::from_response`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuote {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    estimate: Option<RawEstimate>,
    #[serde(default)]
    transaction_request: Option<RawTransactionRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEstimate {
    #[serde(default)]
    to_amount: Option<Value>,
    #[serde(default)]
    to_amount_min: Option<Value>,
    #[serde(default)]
    execution_duration: Option<Value>,
    #[serde(default)]
    gas_costs: Option<Vec<RawCost>>,
    #[serde(default)]
    fee_costs: Option<Vec<RawCost>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCost {
    #[serde(default, rename = "amountUSD")]
    amount_usd: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTransactionRequest {
    #[serde(default)]
    data: Option<String>,
}

/// Quote fields that passed boundary validation
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuote {
    pub to_amount: Amount,
    pub to_amount_min: Amount,
    pub estimated_seconds: Option<u64>,
    pub bridge_name: Option<String>,
    pub gas_cost_usd: Decimal,
    pub fee_cost_usd: Decimal,
    pub execution_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedQuote {
    MissingPayload,
    InvalidPayload,
    InvalidMinimum,
    UnexpectedShape(String),
}

impl std::fmt::Display for MalformedQuote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedQuote::MissingPayload => f.write_str("missing transaction data"),
            MalformedQuote::InvalidPayload => f.write_str("transaction data is not hex"),
            MalformedQuote::InvalidMinimum => f.write_str("minimum destination amount missing or zero"),
            MalformedQuote::UnexpectedShape(detail) => write!(f, "unexpected response shape: {}", detail),
        }
    }
}

/// Closed classification of a bridge response, produced once at the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteOutcome {
    Valid(ParsedQuote),
    Unavailable(String),
    Malformed(MalformedQuote),
}

impl QuoteOutcome {
    pub fn from_response(response: Result<Value, SourceError>) -> Self {
        let value = match response {
            Ok(Value::Null) => return QuoteOutcome::Unavailable("empty response".to_string()),
            Ok(value) => value,
            Err(err) => return QuoteOutcome::Unavailable(err.to_string()),
        };

        let raw: RawQuote = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(err) => return QuoteOutcome::Malformed(MalformedQuote::UnexpectedShape(err.to_string())),
        };

        // No estimate means the aggregator found no route
        let Some(estimate) = raw.estimate else {
            return QuoteOutcome::Unavailable("no route returned".to_string());
        };

        let payload = match raw.transaction_request.and_then(|tx| tx.data) {
            Some(data) => {
                let stripped = data.trim();
                let stripped = stripped.strip_prefix("0x").unwrap_or(stripped);
                if stripped.is_empty() {
                    return QuoteOutcome::Malformed(MalformedQuote::MissingPayload);
                }
                match hex::decode(stripped) {
                    Ok(bytes) => bytes,
                    Err(_) => return QuoteOutcome::Malformed(MalformedQuote::InvalidPayload),
                }
            }
            None => return QuoteOutcome::Malformed(MalformedQuote::MissingPayload),
        };

        let to_amount_min = match estimate.to_amount_min.as_ref().and_then(parse_amount) {
            Some(min) if !min.is_zero() => min,
            _ => return QuoteOutcome::Malformed(MalformedQuote::InvalidMinimum),
        };

        let to_amount = estimate
            .to_amount
            .as_ref()
            .and_then(parse_amount)
            .unwrap_or(to_amount_min);

        QuoteOutcome::Valid(ParsedQuote {
            to_amount,
            to_amount_min,
            estimated_seconds: estimate.execution_duration.as_ref().and_then(parse_seconds),
            bridge_name: raw.tool.filter(|t| !t.trim().is_empty()),
            gas_cost_usd: sum_costs(estimate.gas_costs.as_deref()),
            fee_cost_usd: sum_costs(estimate.fee_costs.as_deref()),
            execution_payload: payload,
        })
    }
}

/// Integer amounts arrive as decimal strings or JSON numbers
fn parse_amount(value: &Value) -> Option<Amount> {
    match value {
        Value::String(s) => s.trim().parse::<u64>().ok().map(Amount),
        Value::Number(n) => n.as_u64().map(Amount),
        _ => None,
    }
}

fn parse_seconds(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}

fn parse_usd(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Absent or unparsable cost entries count as zero
fn sum_costs(costs: Option<&[RawCost]>) -> Decimal {
    costs
        .unwrap_or_default()
        .iter()
        .filter_map(|c| c.amount_usd.as_ref().and_then(parse_usd))
        .fold(Decimal::ZERO, |acc, v| acc + v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn full_response() -> Value {
        json!({
            "tool": "stargate",
            "estimate": {
                "toAmount": "1049000",
                "toAmountMin": "1043755",
                "executionDuration": 64,
                "gasCosts": [{ "amountUSD": "0.42" }, { "amountUSD": "0.08" }],
                "feeCosts": [{ "amountUSD": "0.15" }]
            },
            "transactionRequest": { "data": "0xa9059cbb00ff" }
        })
    }

    #[test]
    fn test_valid_response_parsed() {
        match QuoteOutcome::from_response(Ok(full_response())) {
            QuoteOutcome::Valid(q) => {
                assert_eq!(q.to_amount, Amount(1_049_000));
                assert_eq!(q.to_amount_min, Amount(1_043_755));
                assert_eq!(q.estimated_seconds, Some(64));
                assert_eq!(q.bridge_name.as_deref(), Some("stargate"));
                assert_eq!(q.gas_cost_usd, dec!(0.50));
                assert_eq!(q.fee_cost_usd, dec!(0.15));
                assert_eq!(q.execution_payload, vec![0xa9, 0x05, 0x9c, 0xbb, 0x00, 0xff]);
            }
            other => panic!("expected valid quote, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_payload() {
        let mut response = full_response();
        response["transactionRequest"] = json!({});
        assert_eq!(
            QuoteOutcome::from_response(Ok(response)),
            QuoteOutcome::Malformed(MalformedQuote::MissingPayload)
        );

        let mut response = full_response();
        response["transactionRequest"]["data"] = json!("0x");
        assert_eq!(
            QuoteOutcome::from_response(Ok(response)),
            QuoteOutcome::Malformed(MalformedQuote::MissingPayload)
        );
    }

    #[test]
    fn test_zero_minimum_is_malformed() {
        let mut response = full_response();
        response["estimate"]["toAmountMin"] = json!("0");
        assert_eq!(
            QuoteOutcome::from_response(Ok(response)),
            QuoteOutcome::Malformed(MalformedQuote::InvalidMinimum)
        );
    }

    #[test]
    fn test_missing_costs_default_to_zero() {
        let mut response = full_response();
        response["estimate"].as_object_mut().unwrap().remove("gasCosts");
        response["estimate"]["feeCosts"] = json!([{ "amountUSD": "n/a" }, {}]);

        match QuoteOutcome::from_response(Ok(response)) {
            QuoteOutcome::Valid(q) => {
                assert_eq!(q.gas_cost_usd, Decimal::ZERO);
                assert_eq!(q.fee_cost_usd, Decimal::ZERO);
            }
            other => panic!("expected valid quote, got {:?}", other),
        }
    }

    #[test]
    fn test_no_route_and_source_errors_are_unavailable() {
        assert!(matches!(
            QuoteOutcome::from_response(Ok(json!({ "message": "No available quotes" }))),
            QuoteOutcome::Unavailable(_)
        ));
        assert!(matches!(
            QuoteOutcome::from_response(Err(SourceError::Unavailable("timeout".into()))),
            QuoteOutcome::Unavailable(_)
        ));
        assert!(matches!(QuoteOutcome::from_response(Ok(Value::Null)), QuoteOutcome::Unavailable(_)));
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        assert!(matches!(
            QuoteOutcome::from_response(Ok(json!({ "estimate": "soon" }))),
            QuoteOutcome::Malformed(MalformedQuote::UnexpectedShape(_))
        ));
    }
}
