//! Hierarchical configuration (spec §6): CLI > environment > file > defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastPolicy {
    #[serde(rename = "SELF")]
    SelfBroadcast,
    RandomPeer,
    MultiplePeers,
    NotSelf,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        BroadcastPolicy::MultiplePeers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionAlgorithm {
    Cheapest,
    Weighted,
    Random,
    FidelityBondWeighted,
}

impl Default for SelectionAlgorithm {
    fn default() -> Self {
        SelectionAlgorithm::FidelityBondWeighted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub max_offer_age: u64,
    pub counterparty_count: usize,
    pub max_maker_replacement_attempts: u8,
    pub session_timeout_sec: u64,
    pub taker_utxo_age: u32,
    pub taker_utxo_amtpercent: u8,
    pub taker_utxo_retries: u8,
    pub dust_threshold: u64,
    pub message_rate_limit: u32,
    pub message_burst_limit: u32,
    pub broadcast_policy: BroadcastPolicy,
    pub prefer_direct_connections: bool,
    pub selection_algorithm: SelectionAlgorithm,
    /// Fraction of selected slots filled from the bond-weighted distribution
    /// under `fidelity_bond_weighted`; the remainder fills uniformly at
    /// random. Preserved as a tunable per spec §9's open question.
    pub fidelity_bond_weighted_fraction: (u32, u32),
    pub weighted_alpha: f64,
    pub commitment_retry_indices: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_offer_age: 3600,
            counterparty_count: 3,
            max_maker_replacement_attempts: 3,
            session_timeout_sec: 300,
            taker_utxo_age: 5,
            taker_utxo_amtpercent: 20,
            taker_utxo_retries: 3,
            dust_threshold: 27_300,
            message_rate_limit: 100,
            message_burst_limit: 200,
            broadcast_policy: BroadcastPolicy::MultiplePeers,
            prefer_direct_connections: false,
            selection_algorithm: SelectionAlgorithm::FidelityBondWeighted,
            fidelity_bond_weighted_fraction: (7, 8),
            weighted_alpha: 1.0,
            commitment_retry_indices: 3,
        }
    }
}

impl CoreConfig {
    /// Load CLI > env (`JOINSWAP_*`) > file > defaults, mirroring the
    /// priority order of spec §6.
    pub fn load(file: Option<&Path>, cli_overrides: config::Config) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&CoreConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path).required(false),
            );
        }

        builder = builder
            .add_source(config::Environment::with_prefix("JOINSWAP").separator("__"))
            .add_source(cli_overrides);

        let cfg = builder.build()?;
        let core: CoreConfig = cfg.try_deserialize()?;
        core.validate()?;
        Ok(core)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.counterparty_count < 2 {
            return Err(ConfigError::InvalidValue {
                key: "counterparty_count".into(),
                reason: "counterparty_count=1 gives no anonymity set".into(),
            });
        }
        if self.max_maker_replacement_attempts > 10 {
            return Err(ConfigError::InvalidValue {
                key: "max_maker_replacement_attempts".into(),
                reason: "must be in 0..=10".into(),
            });
        }
        if self.taker_utxo_amtpercent > 100 {
            return Err(ConfigError::InvalidValue {
                key: "taker_utxo_amtpercent".into(),
                reason: "must be in 0..=100".into(),
            });
        }
        if self.taker_utxo_retries > 9 {
            return Err(ConfigError::InvalidValue {
                key: "taker_utxo_retries".into(),
                reason: "must be in 0..=9".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.dust_threshold, 27_300);
        assert_eq!(cfg.session_timeout_sec, 300);
        assert_eq!(cfg.fidelity_bond_weighted_fraction, (7, 8));
    }

    #[test]
    fn counterparty_count_one_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.counterparty_count = 1;
        assert!(cfg.validate().is_err());
    }
}
