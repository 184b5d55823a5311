use config::{Environment, File};
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::preferences::ProtocolDefaults;
use crate::quote_engine::slippage::BPS_DENOMINATOR;
use crate::quote_engine::MAX_QUOTE_VALIDITY_SECONDS;

const MAX_SETTLING_GRACE_SECONDS: i64 = 7 * 86_400;

/// Service configuration, read from `SETTLEMENT_*` environment variables
/// (after `.env`) and an optional `settlement.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub bind_address: String,
    pub default_yield_split_percent: u8,
    pub default_dispute_timeout_days: u32,
    pub quote_validity_seconds: i64,
    pub default_max_slippage_bps: u32,
    pub sweep_interval_seconds: u64,
    /// Time a signed same-route instruction may stay unconfirmed once the
    /// dispute deadline has passed
    pub settling_grace_seconds: i64,
    /// 32-byte ed25519 seed, hex
    pub signing_key_hex: String,
    #[serde(default)]
    pub escrow_address: String,
    /// Comma separated; empty allows any origin
    #[serde(default)]
    pub cors_allowed_origins: String,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let config: Config = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("default_yield_split_percent", 50)?
            .set_default("default_dispute_timeout_days", 30)?
            .set_default("quote_validity_seconds", 120)?
            .set_default("default_max_slippage_bps", 50)?
            .set_default("sweep_interval_seconds", 60)?
            .set_default("settling_grace_seconds", 3600)?
            .add_source(File::with_name("settlement").required(false))
            .add_source(Environment::with_prefix("SETTLEMENT").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.default_yield_split_percent > 100 {
            return Err(AppError::Config(
                "default_yield_split_percent must be between 0 and 100".to_string(),
            ));
        }
        if self.default_dispute_timeout_days == 0 {
            return Err(AppError::Config(
                "default_dispute_timeout_days must be greater than zero".to_string(),
            ));
        }
        if self.default_max_slippage_bps > BPS_DENOMINATOR {
            return Err(AppError::Config(format!(
                "default_max_slippage_bps must be at most {}",
                BPS_DENOMINATOR
            )));
        }
        if self.quote_validity_seconds <= 0 || self.quote_validity_seconds > MAX_QUOTE_VALIDITY_SECONDS {
            return Err(AppError::Config(format!(
                "quote_validity_seconds must be between 1 and {}",
                MAX_QUOTE_VALIDITY_SECONDS
            )));
        }
        if self.settling_grace_seconds <= 0 || self.settling_grace_seconds > MAX_SETTLING_GRACE_SECONDS {
            return Err(AppError::Config(format!(
                "settling_grace_seconds must be between 1 and {}",
                MAX_SETTLING_GRACE_SECONDS
            )));
        }
        if self.signing_key_hex.trim().is_empty() {
            return Err(AppError::Config("signing_key_hex is required".to_string()));
        }
        Ok(())
    }

    pub fn protocol_defaults(&self) -> ProtocolDefaults {
        ProtocolDefaults {
            yield_split_percent: self.default_yield_split_percent,
            dispute_timeout_days: self.default_dispute_timeout_days,
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            default_yield_split_percent: 50,
            default_dispute_timeout_days: 30,
            quote_validity_seconds: 120,
            default_max_slippage_bps: 50,
            sweep_interval_seconds: 60,
            settling_grace_seconds: 3600,
            signing_key_hex: "ab".repeat(32),
            escrow_address: String::new(),
            cors_allowed_origins: " https://a.example, ,https://b.example".to_string(),
        }
    }

    #[test]
    fn test_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.default_yield_split_percent = 101;
        assert!(matches!(bad.validate(), Err(AppError::Config(_))));

        let mut bad = config();
        bad.default_dispute_timeout_days = 0;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.signing_key_hex = "  ".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_time_windows_are_bounded() {
        let mut bad = config();
        bad.quote_validity_seconds = i64::MAX;
        assert!(matches!(bad.validate(), Err(AppError::Config(_))));

        let mut bad = config();
        bad.quote_validity_seconds = 0;
        assert!(bad.validate().is_err());

        let mut ok = config();
        ok.quote_validity_seconds = MAX_QUOTE_VALIDITY_SECONDS;
        assert!(ok.validate().is_ok());

        let mut bad = config();
        bad.settling_grace_seconds = i64::MAX;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cors_origins_split() {
        assert_eq!(
            config().cors_origins(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
