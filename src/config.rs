use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ledger::Amount;

/// 0.01 of the native currency at 18 decimals.
pub const DEFAULT_MIN_PRICE: Amount = 10_000_000_000_000_000;
pub const DEFAULT_MAX_SUPPLY: u64 = 100;
pub const DEFAULT_MAX_BATCH: u8 = 5;
pub const DEFAULT_FIRST_TOKEN_ID: u64 = 1;

/// Constants fixed when a ledger is created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MintConfig {
    pub max_supply: u64,
    pub max_batch: u8,
    pub min_price: Amount,
    pub first_token_id: u64,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            max_supply: DEFAULT_MAX_SUPPLY,
            max_batch: DEFAULT_MAX_BATCH,
            min_price: DEFAULT_MIN_PRICE,
            first_token_id: DEFAULT_FIRST_TOKEN_ID,
        }
    }
}

impl MintConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path)?;
        let config: MintConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check().map_err(ConfigError::Invalid)
    }

    pub(crate) fn check(&self) -> Result<(), &'static str> {
        if self.max_supply == 0 {
            return Err("max_supply must be > 0");
        }
        if self.max_batch == 0 {
            return Err("max_batch must be > 0");
        }
        // the last id ever issued must fit in a token id
        if self.first_token_id.checked_add(self.max_supply - 1).is_none() {
            return Err("first_token_id + max_supply overflows the token id range");
        }
        Ok(())
    }
}
