//! Token ownership registry.
//!
//! The ledger treats the registry as an external key-value collaborator: it
//! only needs to assign an owner to a fresh id and to ask whether an id is
//! already taken. [`InMemoryRegistry`] is the `BTreeMap` backed store used by
//! the CLI and the tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::identity::Identity;
use crate::ledger::TokenId;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub owner: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Total supply right after this token was issued.
    pub minted_at_supply: u64,
}

pub trait TokenRegistry: Send {
    fn owner_of(&self, id: TokenId) -> Option<Identity>;

    fn record(&self, id: TokenId) -> Option<TokenRecord>;

    fn contains(&self, id: TokenId) -> bool {
        self.owner_of(id).is_some()
    }

    /// Registers `record` under `id`. An id can be assigned only once.
    fn assign(&mut self, id: TokenId, record: TokenRecord) -> Result<(), RegistryError>;

    fn tokens_of(&self, owner: &Identity) -> Vec<TokenId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in ascending id order.
    fn records(&self) -> Vec<(TokenId, TokenRecord)>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryRegistry {
    tokens: BTreeMap<TokenId, TokenRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenRegistry for InMemoryRegistry {
    fn owner_of(&self, id: TokenId) -> Option<Identity> {
        self.tokens.get(&id).map(|r| r.owner.clone())
    }

    fn record(&self, id: TokenId) -> Option<TokenRecord> {
        self.tokens.get(&id).cloned()
    }

    fn contains(&self, id: TokenId) -> bool {
        self.tokens.contains_key(&id)
    }

    fn assign(&mut self, id: TokenId, record: TokenRecord) -> Result<(), RegistryError> {
        if self.tokens.contains_key(&id) {
            return Err(RegistryError::AlreadyAssigned(id));
        }
        self.tokens.insert(id, record);
        Ok(())
    }

    fn tokens_of(&self, owner: &Identity) -> Vec<TokenId> {
        self.tokens
            .iter()
            .filter(|(_, r)| &r.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn records(&self) -> Vec<(TokenId, TokenRecord)> {
        self.tokens
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect()
    }
}
