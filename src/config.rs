use std::str::FromStr;

use crate::claims::DEFAULT_CLAIM_NAME_PREFIX;
use crate::error::{PlatformError, Result};
use crate::oracle::DEFAULT_UPDATE_LIMIT_SECONDS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Bound into root-activation signatures so they cannot be replayed across environments.
    pub chain_id: u64,
    pub authority_threshold: u32,
    pub oracle_threshold: u32,
    pub oracle_update_limit_seconds: i64,
    pub claim_name_prefix: String,
    pub default_minimum_deposit: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            authority_threshold: 2,
            oracle_threshold: 1,
            oracle_update_limit_seconds: DEFAULT_UPDATE_LIMIT_SECONDS,
            claim_name_prefix: DEFAULT_CLAIM_NAME_PREFIX.to_string(),
            default_minimum_deposit: 1,
        }
    }
}

impl PlatformConfig {
    /// Reads the environment (and `.env` if present), falling back to defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            chain_id: parse_var("CHAIN_ID", defaults.chain_id)?,
            authority_threshold: parse_var("AUTHORITY_THRESHOLD", defaults.authority_threshold)?,
            oracle_threshold: parse_var("ORACLE_THRESHOLD", defaults.oracle_threshold)?,
            oracle_update_limit_seconds: parse_var(
                "ORACLE_UPDATE_LIMIT_SECONDS",
                defaults.oracle_update_limit_seconds,
            )?,
            claim_name_prefix: std::env::var("CLAIM_NAME_PREFIX").unwrap_or(defaults.claim_name_prefix),
            default_minimum_deposit: parse_var("DEFAULT_MINIMUM_DEPOSIT", defaults.default_minimum_deposit)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.authority_threshold == 0 {
            return Err(PlatformError::ConfigurationError(
                "AUTHORITY_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.oracle_threshold == 0 {
            return Err(PlatformError::ConfigurationError(
                "ORACLE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.oracle_update_limit_seconds <= 0 {
            return Err(PlatformError::ConfigurationError(
                "ORACLE_UPDATE_LIMIT_SECONDS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| PlatformError::ConfigurationError(format!("Invalid {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}
