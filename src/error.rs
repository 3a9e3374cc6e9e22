use thiserror::Error;

use crate::identity::Identity;
use crate::ledger::{Amount, TokenId};

/// Canonical error type returned by the issuance ledger.
///
/// Every variant is terminal for the call that produced it: the ledger state
/// is exactly what it was before the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MintError {
    /// Attached payment is below `count * min_price`.
    #[error("insufficient payment: required at least {required}, provided {provided}")]
    InsufficientPayment { required: Amount, provided: Amount },

    /// Minting would push total supply past the cap.
    #[error("supply exceeded: max {max}, current {current}, requested {requested}")]
    SupplyExceeded { max: u64, current: u64, requested: u64 },

    /// Batch count outside `[1, max_batch]`.
    #[error("batch size {count} outside 1..={max}")]
    BatchTooLarge { count: u8, max: u8 },

    /// Withdrawal attempted by someone other than the owner.
    #[error("unauthorized: {caller} is not the ledger owner")]
    Unauthorized { caller: Identity },

    /// A counter or amount computation left the representable range.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// The token registry refused a write.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The external payout failed; the withdrawal was reverted.
    #[error("payout error: {0}")]
    Payout(#[from] PayoutError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("token {0} is already assigned")]
    AlreadyAssigned(TokenId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("account {account} cannot receive {amount}: balance would overflow")]
    Overflow { account: Identity, amount: Amount },
    #[error("payout rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Rejections raised while rebuilding a ledger from a snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("state root mismatch")]
    RootMismatch,
    #[error("snapshot supply {supply} does not match {tokens} registered tokens")]
    SupplyMismatch { supply: u64, tokens: u64 },
    #[error("snapshot supply {supply} exceeds max supply {max}")]
    OverCap { supply: u64, max: u64 },
    #[error("token {0} is outside the issued id range")]
    UnexpectedToken(TokenId),
    #[error("snapshot config invalid: {0}")]
    Config(&'static str),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type MintResult<T> = Result<T, MintError>;
