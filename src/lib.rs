//! Limited-edition token issuance.
//!
//! [`ledger`] holds the issuance state machine: capped supply, a per-unit
//! minimum price, bounded batches and owner-only withdrawals. It writes token
//! ownership through a [`registry`] and sends withdrawn value to a [`payout`].
//! Callers are named by [`identity`] values derived from ed25519 keys, and
//! [`store`] keeps the locked JSON state file used by the `edition-mint` binary.

pub mod config;
pub mod identity;
pub mod ledger;
pub mod payout;
pub mod registry;
pub mod store;

mod error;

pub use config::MintConfig;
pub use error::{ConfigError, MintError, MintResult, PayoutError, RegistryError, SnapshotError};
pub use identity::Identity;
pub use ledger::{Amount, IssuanceLedger, LedgerEvent, LedgerSnapshot, TokenId};
pub use payout::{AccountBook, Payout};
pub use registry::{InMemoryRegistry, TokenRecord, TokenRegistry};
