// 10.0 config.rs: exchange-wide parameters in one place. fees, margins, funding, gas.
// 10.1 Environment picks a preset. market launches copy defaults from here when the
// launch message leaves a field empty.

use crate::funding::DEFAULT_FUNDING_INTERVAL;
use crate::gas::{FixedGasTable, KvGasConfig};
use crate::types::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeParams {
    // Fees, as fractions of notional. negative maker fee = rebate
    pub default_spot_maker_fee_rate: Decimal,
    pub default_spot_taker_fee_rate: Decimal,
    pub default_derivative_maker_fee_rate: Decimal,
    pub default_derivative_taker_fee_rate: Decimal,
    // Margin
    pub default_initial_margin_ratio: Decimal,
    pub default_maintenance_margin_ratio: Decimal,
    pub default_min_notional: Decimal,
    // Funding, for newly launched perpetuals
    pub default_funding_interval: i64,
    pub default_hourly_funding_rate_cap: Decimal,
    pub default_hourly_interest_rate: Decimal,
    // Taker fee multiplier for atomic market orders
    pub atomic_market_order_fee_multiplier: Decimal,
    // Every limit order is post-only below this height
    pub post_only_mode_height_threshold: u64,
    // Gas
    pub fixed_gas_enabled: bool,
    pub fixed_gas: FixedGasTable,
    pub kv_gas: KvGasConfig,
    // Allowed to launch markets, change status and force settlement
    pub admin: Address,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            default_spot_maker_fee_rate: dec!(-0.0001),
            default_spot_taker_fee_rate: dec!(0.001),
            default_derivative_maker_fee_rate: dec!(-0.0001),
            default_derivative_taker_fee_rate: dec!(0.001),
            default_initial_margin_ratio: dec!(0.05),
            default_maintenance_margin_ratio: dec!(0.02),
            default_min_notional: Decimal::ZERO,
            default_funding_interval: DEFAULT_FUNDING_INTERVAL,
            default_hourly_funding_rate_cap: dec!(0.000625),
            default_hourly_interest_rate: dec!(0.00000416666),
            atomic_market_order_fee_multiplier: dec!(2.5),
            post_only_mode_height_threshold: 0,
            fixed_gas_enabled: false,
            fixed_gas: FixedGasTable::default(),
            kv_gas: KvGasConfig::default(),
            admin: Address([0xad; 20]),
        }
    }
}

impl ExchangeParams {
    pub fn testnet() -> Self {
        Self {
            default_spot_maker_fee_rate: Decimal::ZERO,
            default_derivative_maker_fee_rate: Decimal::ZERO,
            atomic_market_order_fee_multiplier: Decimal::ONE,
            ..Self::default()
        }
    }

    pub fn mainnet() -> Self {
        Self {
            default_initial_margin_ratio: dec!(0.1),
            default_maintenance_margin_ratio: dec!(0.05),
            default_min_notional: dec!(1),
            fixed_gas_enabled: true,
            ..Self::default()
        }
    }

    pub fn is_post_only_mode(&self, height: u64) -> bool {
        height < self.post_only_mode_height_threshold
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, maker, taker) in [
            ("spot", self.default_spot_maker_fee_rate, self.default_spot_taker_fee_rate),
            ("derivative", self.default_derivative_maker_fee_rate, self.default_derivative_taker_fee_rate),
        ] {
            if taker < Decimal::ZERO || taker >= Decimal::ONE {
                return Err(ConfigError::InvalidFees(format!("{name} taker fee must lie in [0, 1)")));
            }
            // a maker rebate larger than the taker fee would pay out of nothing
            if maker + taker < Decimal::ZERO {
                return Err(ConfigError::InvalidFees(format!("{name} maker rebate exceeds taker fee")));
            }
        }

        let (imr, mmr) = (self.default_initial_margin_ratio, self.default_maintenance_margin_ratio);
        if mmr <= Decimal::ZERO || imr >= Decimal::ONE || imr <= mmr {
            return Err(ConfigError::InvalidMargin("need 0 < maintenance < initial < 1".into()));
        }
        if self.default_min_notional < Decimal::ZERO {
            return Err(ConfigError::InvalidMargin("min notional must not be negative".into()));
        }

        if self.default_funding_interval <= 0 {
            return Err(ConfigError::InvalidFunding("funding interval must be positive".into()));
        }
        if self.default_hourly_funding_rate_cap <= Decimal::ZERO {
            return Err(ConfigError::InvalidFunding("funding rate cap must be positive".into()));
        }

        if self.atomic_market_order_fee_multiplier < Decimal::ONE {
            return Err(ConfigError::InvalidFees("atomic fee multiplier below 1".into()));
        }
        if self.fixed_gas.expiring_order_multiplier < Decimal::ONE {
            return Err(ConfigError::InvalidGas("expiring order multiplier below 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid fees: {0}")]
    InvalidFees(String),

    #[error("invalid margin: {0}")]
    InvalidMargin(String),

    #[error("invalid funding: {0}")]
    InvalidFunding(String),

    #[error("invalid gas: {0}")]
    InvalidGas(String),

    #[error("config parse error: {0}")]
    Parse(String),
}

// 10.1: environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Local,
    Testnet,
    Mainnet,
}

impl Environment {
    pub fn params(&self) -> ExchangeParams {
        match self {
            Environment::Local => ExchangeParams::default(),
            Environment::Testnet => ExchangeParams::testnet(),
            Environment::Mainnet => ExchangeParams::mainnet(),
        }
    }
}

/// Parses and validates params from JSON, filling nothing in: every field is required.
pub fn params_from_json(json: &str) -> Result<ExchangeParams, ConfigError> {
    let params: ExchangeParams = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        assert!(Environment::Local.params().validate().is_ok());
        assert!(Environment::Testnet.params().validate().is_ok());
        assert!(Environment::Mainnet.params().validate().is_ok());
        assert!(Environment::Mainnet.params().fixed_gas_enabled);
    }

    #[test]
    fn rejects_inverted_margin_ratios() {
        let mut params = ExchangeParams::default();
        params.default_maintenance_margin_ratio = dec!(0.06);
        assert!(matches!(params.validate(), Err(ConfigError::InvalidMargin(_))));
    }

    #[test]
    fn rejects_rebate_larger_than_fee() {
        let mut params = ExchangeParams::default();
        params.default_spot_maker_fee_rate = dec!(-0.002);
        assert!(matches!(params.validate(), Err(ConfigError::InvalidFees(_))));
    }

    #[test]
    fn post_only_window() {
        let mut params = ExchangeParams::default();
        assert!(!params.is_post_only_mode(1));
        params.post_only_mode_height_threshold = 10;
        assert!(params.is_post_only_mode(9));
        assert!(!params.is_post_only_mode(10));
    }

    #[test]
    fn json_round_trip() {
        let params = ExchangeParams::mainnet();
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(params_from_json(&json).unwrap(), params);
        assert!(matches!(params_from_json("{}"), Err(ConfigError::Parse(_))));
    }
}
