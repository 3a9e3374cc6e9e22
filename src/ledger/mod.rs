use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::MintConfig;
use crate::error::{ConfigError, MintError, MintResult, RegistryError, SnapshotError};
use crate::identity::Identity;
use crate::payout::Payout;
use crate::registry::{InMemoryRegistry, TokenRecord, TokenRegistry};

pub type TokenId = u64;
pub type Amount = u128;

/// Externally tagged: serde_json cannot buffer `u128` fields through an
/// internally tagged enum.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Minted {
        recipient: Identity,
        token_ids: Vec<TokenId>,
        payment: Amount,
    },
    Withdrawn {
        to: Identity,
        amount: Amount,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub config: MintConfig,
    pub owner: Identity,
    pub total_supply: u64,
    pub balance: Amount,
    pub tokens: BTreeMap<TokenId, TokenRecord>,
    pub events: Vec<LedgerEvent>,
    pub state_root: [u8; 32],
}

struct LedgerState {
    total_supply: u64,
    balance: Amount,
    registry: Box<dyn TokenRegistry>,
    events: Vec<LedgerEvent>,
}

impl LedgerState {
    /// Validates a mint of `count` tokens and applies it. Nothing is written
    /// unless every check passes.
    fn issue(
        &mut self,
        config: &MintConfig,
        recipient: &Identity,
        count: u64,
        payment: Amount,
        uri: Option<&str>,
    ) -> MintResult<Vec<TokenId>> {
        let required = config
            .min_price
            .checked_mul(Amount::from(count))
            .ok_or(MintError::ArithmeticOverflow)?;
        if payment < required {
            return Err(MintError::InsufficientPayment {
                required,
                provided: payment,
            });
        }

        let new_supply = self
            .total_supply
            .checked_add(count)
            .ok_or(MintError::ArithmeticOverflow)?;
        if new_supply > config.max_supply {
            return Err(MintError::SupplyExceeded {
                max: config.max_supply,
                current: self.total_supply,
                requested: count,
            });
        }
        let new_balance = self
            .balance
            .checked_add(payment)
            .ok_or(MintError::ArithmeticOverflow)?;

        let first = config
            .first_token_id
            .checked_add(self.total_supply)
            .ok_or(MintError::ArithmeticOverflow)?;
        let ids = (0..count)
            .map(|offset| first.checked_add(offset))
            .collect::<Option<Vec<TokenId>>>()
            .ok_or(MintError::ArithmeticOverflow)?;
        if let Some(taken) = ids.iter().find(|id| self.registry.contains(**id)) {
            return Err(RegistryError::AlreadyAssigned(*taken).into());
        }

        for (offset, id) in (1u64..).zip(&ids) {
            self.registry.assign(
                *id,
                TokenRecord {
                    owner: recipient.clone(),
                    uri: uri.map(str::to_owned),
                    minted_at_supply: self.total_supply + offset,
                },
            )?;
        }
        self.total_supply = new_supply;
        self.balance = new_balance;
        self.events.push(LedgerEvent::Minted {
            recipient: recipient.clone(),
            token_ids: ids.clone(),
            payment,
        });
        Ok(ids)
    }
}

/// Capped, paid issuance of limited-edition tokens.
///
/// All mutable state sits behind one lock that is held for the whole
/// validate-then-mutate sequence of a call, so concurrent callers are
/// serialized and never observe a partial update.
pub struct IssuanceLedger {
    owner: Identity,
    config: MintConfig,
    state: Mutex<LedgerState>,
    payout: Arc<dyn Payout>,
}

impl IssuanceLedger {
    pub fn new(
        owner: Identity,
        config: MintConfig,
        payout: Arc<dyn Payout>,
    ) -> Result<Self, ConfigError> {
        Self::with_registry(owner, config, Box::new(InMemoryRegistry::new()), payout)
    }

    pub fn with_registry(
        owner: Identity,
        config: MintConfig,
        registry: Box<dyn TokenRegistry>,
        payout: Arc<dyn Payout>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            owner = %owner,
            max_supply = config.max_supply,
            max_batch = config.max_batch,
            min_price = %config.min_price,
            "issuance ledger created"
        );
        Ok(Self {
            owner,
            config,
            state: Mutex::new(LedgerState {
                total_supply: 0,
                balance: 0,
                registry,
                events: Vec::new(),
            }),
            payout,
        })
    }

    /// Rebuilds a ledger from a snapshot, loading its tokens into `registry`.
    pub fn restore(
        snapshot: LedgerSnapshot,
        mut registry: Box<dyn TokenRegistry>,
        payout: Arc<dyn Payout>,
    ) -> Result<Self, SnapshotError> {
        let LedgerSnapshot {
            config,
            owner,
            total_supply,
            balance,
            tokens,
            events,
            state_root,
        } = snapshot;
        config.check().map_err(SnapshotError::Config)?;
        if compute_state_root(&config, &owner, total_supply, balance, &tokens, &events)
            != state_root
        {
            return Err(SnapshotError::RootMismatch);
        }
        if total_supply > config.max_supply {
            return Err(SnapshotError::OverCap {
                supply: total_supply,
                max: config.max_supply,
            });
        }
        if tokens.len() as u64 != total_supply {
            return Err(SnapshotError::SupplyMismatch {
                supply: total_supply,
                tokens: tokens.len() as u64,
            });
        }
        for (id, record) in tokens {
            if id < config.first_token_id || id - config.first_token_id >= total_supply {
                return Err(SnapshotError::UnexpectedToken(id));
            }
            registry.assign(id, record)?;
        }
        debug!(supply = total_supply, balance = %balance, "issuance ledger restored");
        Ok(Self {
            owner,
            config,
            state: Mutex::new(LedgerState {
                total_supply,
                balance,
                registry,
                events,
            }),
            payout,
        })
    }

    pub fn mint_one(&self, recipient: &Identity, payment: Amount) -> MintResult<TokenId> {
        self.mint_single(recipient, payment, None)
    }

    /// Same as [`mint_one`](Self::mint_one), recording `uri` on the token.
    pub fn mint_with_uri(
        &self,
        recipient: &Identity,
        uri: &str,
        payment: Amount,
    ) -> MintResult<TokenId> {
        self.mint_single(recipient, payment, Some(uri))
    }

    fn mint_single(
        &self,
        recipient: &Identity,
        payment: Amount,
        uri: Option<&str>,
    ) -> MintResult<TokenId> {
        let mut state = self.state.lock();
        let ids = state
            .issue(&self.config, recipient, 1, payment, uri)
            .map_err(|err| {
                debug!(recipient = %recipient, payment = %payment, %err, "mint rejected");
                err
            })?;
        info!(
            recipient = %recipient,
            token_id = ids[0],
            payment = %payment,
            total_supply = state.total_supply,
            "token minted"
        );
        Ok(ids[0])
    }

    /// Mints `count` sequential tokens to `recipient`.
    ///
    /// The whole attached payment is retained, including anything above
    /// `count * min_price`.
    pub fn mint_batch(
        &self,
        recipient: &Identity,
        count: u8,
        payment: Amount,
    ) -> MintResult<Vec<TokenId>> {
        if count == 0 || count > self.config.max_batch {
            debug!(recipient = %recipient, count, "batch size rejected");
            return Err(MintError::BatchTooLarge {
                count,
                max: self.config.max_batch,
            });
        }
        let mut state = self.state.lock();
        let ids = state
            .issue(&self.config, recipient, u64::from(count), payment, None)
            .map_err(|err| {
                debug!(recipient = %recipient, count, payment = %payment, %err, "batch mint rejected");
                err
            })?;
        info!(
            recipient = %recipient,
            count,
            first_id = ids[0],
            payment = %payment,
            total_supply = state.total_supply,
            "batch minted"
        );
        Ok(ids)
    }

    /// Pays the whole accumulated balance out to the owner.
    ///
    /// The balance is zeroed and the event recorded under the lock, then the
    /// payout runs without it. A failed payout re-credits the amount, drops
    /// the event and returns the error.
    pub fn withdraw(&self, caller: &Identity) -> MintResult<Amount> {
        let (amount, event_index) = {
            let mut state = self.state.lock();
            if caller != &self.owner {
                debug!(caller = %caller, "withdrawal by non-owner rejected");
                return Err(MintError::Unauthorized {
                    caller: caller.clone(),
                });
            }
            let amount = std::mem::take(&mut state.balance);
            state.events.push(LedgerEvent::Withdrawn {
                to: self.owner.clone(),
                amount,
            });
            (amount, state.events.len() - 1)
        };

        if let Err(err) = self.payout.transfer(&self.owner, amount) {
            warn!(owner = %self.owner, amount = %amount, %err, "payout failed, reverting withdrawal");
            let mut state = self.state.lock();
            // mints that landed during the payout may have refilled the balance
            state.balance = match state.balance.checked_add(amount) {
                Some(restored) => restored,
                None => {
                    warn!(amount = %amount, "re-credit saturated the balance");
                    Amount::MAX
                }
            };
            // the log is append-only, so our entry is still at the same index
            state.events.remove(event_index);
            return Err(err.into());
        }

        info!(owner = %self.owner, amount = %amount, "balance withdrawn");
        Ok(amount)
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn config(&self) -> &MintConfig {
        &self.config
    }

    pub fn total_supply(&self) -> u64 {
        self.state.lock().total_supply
    }

    pub fn remaining_supply(&self) -> u64 {
        self.config.max_supply - self.state.lock().total_supply
    }

    /// Native value currently held by the ledger.
    pub fn balance(&self) -> Amount {
        self.state.lock().balance
    }

    pub fn owner_of(&self, id: TokenId) -> Option<Identity> {
        self.state.lock().registry.owner_of(id)
    }

    pub fn token_uri(&self, id: TokenId) -> Option<String> {
        self.state.lock().registry.record(id).and_then(|r| r.uri)
    }

    pub fn tokens_of(&self, owner: &Identity) -> Vec<TokenId> {
        self.state.lock().registry.tokens_of(owner)
    }

    /// Number of tokens held by `owner`.
    pub fn balance_of(&self, owner: &Identity) -> u64 {
        self.tokens_of(owner).len() as u64
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.lock().events.clone()
    }

    pub fn state_root(&self) -> [u8; 32] {
        let state = self.state.lock();
        let tokens: BTreeMap<_, _> = state.registry.records().into_iter().collect();
        compute_state_root(
            &self.config,
            &self.owner,
            state.total_supply,
            state.balance,
            &tokens,
            &state.events,
        )
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        let tokens: BTreeMap<_, _> = state.registry.records().into_iter().collect();
        LedgerSnapshot {
            config: self.config.clone(),
            owner: self.owner.clone(),
            total_supply: state.total_supply,
            balance: state.balance,
            state_root: compute_state_root(
                &self.config,
                &self.owner,
                state.total_supply,
                state.balance,
                &tokens,
                &state.events,
            ),
            tokens,
            events: state.events.clone(),
        }
    }
}

fn compute_state_root(
    config: &MintConfig,
    owner: &Identity,
    total_supply: u64,
    balance: Amount,
    tokens: &BTreeMap<TokenId, TokenRecord>,
    events: &[LedgerEvent],
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(tokens.len() + events.len() + 1);
    let mut hasher = Sha256::new();
    hasher.update(b"ledger");
    hasher.update(config.max_supply.to_le_bytes());
    hasher.update([config.max_batch]);
    hasher.update(config.min_price.to_le_bytes());
    hasher.update(config.first_token_id.to_le_bytes());
    hasher.update((owner.as_str().len() as u64).to_le_bytes());
    hasher.update(owner.as_str().as_bytes());
    hasher.update(total_supply.to_le_bytes());
    hasher.update(balance.to_le_bytes());
    leaves.push(hasher.finalize().into());
    for (id, record) in tokens {
        let mut hasher = Sha256::new();
        hasher.update(b"token");
        hasher.update(id.to_le_bytes());
        hasher.update((record.owner.as_str().len() as u64).to_le_bytes());
        hasher.update(record.owner.as_str().as_bytes());
        match &record.uri {
            Some(uri) => {
                hasher.update([1u8]);
                hasher.update(uri.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(record.minted_at_supply.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (index, event) in events.iter().enumerate() {
        leaves.push(event_leaf(index as u64, event));
    }
    build_merkle(leaves)
}

fn event_leaf(index: u64, event: &LedgerEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"event");
    hasher.update(index.to_le_bytes());
    match event {
        LedgerEvent::Minted {
            recipient,
            token_ids,
            payment,
        } => {
            hasher.update(b"minted");
            hasher.update((recipient.as_str().len() as u64).to_le_bytes());
            hasher.update(recipient.as_str().as_bytes());
            hasher.update((token_ids.len() as u64).to_le_bytes());
            for id in token_ids {
                hasher.update(id.to_le_bytes());
            }
            hasher.update(payment.to_le_bytes());
        }
        LedgerEvent::Withdrawn { to, amount } => {
            hasher.update(b"withdrawn");
            hasher.update((to.as_str().len() as u64).to_le_bytes());
            hasher.update(to.as_str().as_bytes());
            hasher.update(amount.to_le_bytes());
        }
    }
    hasher.finalize().into()
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock, Weak,
    };
    use std::thread;

    use proptest::prelude::*;

    use crate::config::DEFAULT_MIN_PRICE;
    use crate::error::PayoutError;
    use crate::payout::AccountBook;

    const PRICE: Amount = DEFAULT_MIN_PRICE;

    fn ledger() -> (IssuanceLedger, Arc<AccountBook>) {
        let book = Arc::new(AccountBook::new());
        let ledger =
            IssuanceLedger::new("owner".into(), MintConfig::default(), book.clone()).unwrap();
        (ledger, book)
    }

    fn alice() -> Identity {
        "alice".into()
    }

    #[test]
    fn mint_one_at_exact_minimum_price() {
        let (ledger, _) = ledger();
        let id = ledger.mint_one(&alice(), PRICE).unwrap();
        assert_eq!(id, 1);
        assert_eq!(ledger.total_supply(), 1);
        assert_eq!(ledger.balance(), PRICE);
        assert_eq!(ledger.owner_of(id), Some(alice()));
        assert_eq!(ledger.remaining_supply(), 99);
    }

    #[test]
    fn underpaid_mints_change_nothing() {
        let (ledger, _) = ledger();
        ledger.mint_one(&alice(), PRICE).unwrap();
        let before = ledger.snapshot();

        let err = ledger.mint_one(&alice(), 1).unwrap_err();
        assert_eq!(
            err,
            MintError::InsufficientPayment {
                required: PRICE,
                provided: 1
            }
        );
        let err = ledger.mint_batch(&alice(), 3, 3 * PRICE - 1).unwrap_err();
        assert!(matches!(err, MintError::InsufficientPayment { required, .. } if required == 3 * PRICE));

        assert_eq!(ledger.snapshot(), before);
        assert_eq!(ledger.owner_of(2), None);
    }

    #[test]
    fn batch_size_outside_bounds_is_rejected_regardless_of_payment() {
        let (ledger, _) = ledger();
        for count in [0u8, 6, u8::MAX] {
            let err = ledger.mint_batch(&alice(), count, Amount::MAX).unwrap_err();
            assert_eq!(err, MintError::BatchTooLarge { count, max: 5 });
        }
        assert_eq!(ledger.total_supply(), 0);
        assert_eq!(ledger.balance(), 0);
    }

    #[test]
    fn hundred_and_first_mint_exceeds_supply() {
        let (ledger, _) = ledger();
        for expected in 1..=100u64 {
            assert_eq!(ledger.mint_one(&alice(), PRICE).unwrap(), expected);
        }
        let err = ledger.mint_one(&alice(), PRICE).unwrap_err();
        assert_eq!(
            err,
            MintError::SupplyExceeded {
                max: 100,
                current: 100,
                requested: 1
            }
        );
        assert!(matches!(
            ledger.mint_batch(&alice(), 1, PRICE),
            Err(MintError::SupplyExceeded { .. })
        ));
        assert_eq!(ledger.total_supply(), 100);
        assert_eq!(ledger.balance(), 100 * PRICE);
    }

    #[test]
    fn batch_crossing_the_cap_is_all_or_nothing() {
        let (ledger, _) = ledger();
        for _ in 0..99 {
            ledger.mint_one(&alice(), PRICE).unwrap();
        }
        let err = ledger.mint_batch(&"bob".into(), 2, 2 * PRICE).unwrap_err();
        assert!(matches!(err, MintError::SupplyExceeded { current: 99, requested: 2, .. }));
        assert_eq!(ledger.total_supply(), 99);
        assert_eq!(ledger.owner_of(100), None);
        assert_eq!(ledger.balance_of(&"bob".into()), 0);

        assert_eq!(ledger.mint_batch(&"bob".into(), 1, PRICE).unwrap(), vec![100]);
    }

    #[test]
    fn batch_keeps_overpayment_and_issues_sequential_ids() {
        let (ledger, _) = ledger();
        ledger.mint_one(&"bob".into(), PRICE).unwrap();
        let ids = ledger.mint_batch(&alice(), 5, 7 * PRICE).unwrap();
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
        assert_eq!(ledger.balance(), 8 * PRICE);
        assert_eq!(ledger.tokens_of(&alice()), ids);
        assert_eq!(ledger.balance_of(&alice()), 5);
        assert_eq!(
            ledger.events().last(),
            Some(&LedgerEvent::Minted {
                recipient: alice(),
                token_ids: ids,
                payment: 7 * PRICE,
            })
        );
    }

    #[test]
    fn mint_with_uri_records_the_uri() {
        let (ledger, _) = ledger();
        let id = ledger.mint_with_uri(&alice(), "first image", PRICE).unwrap();
        assert_eq!(ledger.token_uri(id).as_deref(), Some("first image"));
        let plain = ledger.mint_one(&alice(), PRICE).unwrap();
        assert_eq!(ledger.token_uri(plain), None);
    }

    #[test]
    fn only_owner_withdraws_the_full_balance() {
        let (ledger, book) = ledger();
        ledger.mint_one(&"other".into(), PRICE).unwrap();

        let err = ledger.withdraw(&"other".into()).unwrap_err();
        assert_eq!(
            err,
            MintError::Unauthorized {
                caller: "other".into()
            }
        );
        assert_eq!(ledger.balance(), PRICE);
        assert_eq!(book.balance(&"other".into()), 0);

        assert_eq!(ledger.withdraw(&"owner".into()).unwrap(), PRICE);
        assert_eq!(ledger.balance(), 0);
        assert_eq!(book.balance(&"owner".into()), PRICE);

        // nothing left, still succeeds
        assert_eq!(ledger.withdraw(&"owner".into()).unwrap(), 0);
        assert_eq!(book.balance(&"owner".into()), PRICE);
    }

    struct RejectingPayout;

    impl Payout for RejectingPayout {
        fn transfer(&self, _to: &Identity, _amount: Amount) -> Result<(), PayoutError> {
            Err(PayoutError::Rejected("account frozen".into()))
        }
    }

    #[test]
    fn failed_payout_reverts_the_withdrawal() {
        let ledger = IssuanceLedger::new(
            "owner".into(),
            MintConfig::default(),
            Arc::new(RejectingPayout),
        )
        .unwrap();
        ledger.mint_batch(&alice(), 2, 2 * PRICE).unwrap();
        let events_before = ledger.events().len();

        let err = ledger.withdraw(&"owner".into()).unwrap_err();
        assert!(matches!(err, MintError::Payout(PayoutError::Rejected(_))));
        assert_eq!(ledger.balance(), 2 * PRICE);
        assert_eq!(ledger.events().len(), events_before);
    }

    /// Calls back into the ledger from inside the payout.
    struct ReentrantPayout {
        ledger: OnceLock<Weak<IssuanceLedger>>,
        entered: AtomicBool,
        nested: parking_lot::Mutex<Option<MintResult<Amount>>>,
        book: AccountBook,
    }

    impl Payout for ReentrantPayout {
        fn transfer(&self, to: &Identity, amount: Amount) -> Result<(), PayoutError> {
            if !self.entered.swap(true, Ordering::SeqCst) {
                let ledger = self.ledger.get().and_then(Weak::upgrade).unwrap();
                *self.nested.lock() = Some(ledger.withdraw(to));
            }
            self.book.transfer(to, amount)
        }
    }

    #[test]
    fn reentrant_withdrawal_sees_a_zero_balance() {
        let payout = Arc::new(ReentrantPayout {
            ledger: OnceLock::new(),
            entered: AtomicBool::new(false),
            nested: parking_lot::Mutex::new(None),
            book: AccountBook::new(),
        });
        let ledger = Arc::new(
            IssuanceLedger::new("owner".into(), MintConfig::default(), payout.clone()).unwrap(),
        );
        payout.ledger.set(Arc::downgrade(&ledger)).ok();
        ledger.mint_batch(&alice(), 3, 3 * PRICE).unwrap();

        assert_eq!(ledger.withdraw(&"owner".into()).unwrap(), 3 * PRICE);
        assert_eq!(*payout.nested.lock(), Some(Ok(0)));
        assert_eq!(payout.book.balance(&"owner".into()), 3 * PRICE);
        assert_eq!(ledger.balance(), 0);
    }

    #[test]
    fn overflowing_amounts_are_rejected() {
        let book = Arc::new(AccountBook::new());
        let pricey = IssuanceLedger::new(
            "owner".into(),
            MintConfig {
                min_price: Amount::MAX,
                ..MintConfig::default()
            },
            book.clone(),
        )
        .unwrap();
        assert_eq!(
            pricey.mint_batch(&alice(), 2, Amount::MAX).unwrap_err(),
            MintError::ArithmeticOverflow
        );

        let free = IssuanceLedger::new(
            "owner".into(),
            MintConfig {
                min_price: 0,
                ..MintConfig::default()
            },
            book,
        )
        .unwrap();
        free.mint_one(&alice(), Amount::MAX).unwrap();
        assert_eq!(
            free.mint_one(&alice(), 1).unwrap_err(),
            MintError::ArithmeticOverflow
        );
        assert_eq!(free.total_supply(), 1);
        assert_eq!(free.balance(), Amount::MAX);
    }

    #[test]
    fn prefilled_registry_collision_rejects_the_whole_batch() {
        let mut registry = InMemoryRegistry::new();
        registry
            .assign(
                3,
                TokenRecord {
                    owner: "squatter".into(),
                    uri: None,
                    minted_at_supply: 0,
                },
            )
            .unwrap();
        let ledger = IssuanceLedger::with_registry(
            "owner".into(),
            MintConfig::default(),
            Box::new(registry),
            Arc::new(AccountBook::new()),
        )
        .unwrap();
        let err = ledger.mint_batch(&alice(), 5, 5 * PRICE).unwrap_err();
        assert_eq!(err, MintError::Registry(RegistryError::AlreadyAssigned(3)));
        assert_eq!(ledger.owner_of(1), None);
        assert_eq!(ledger.total_supply(), 0);
    }

    #[test]
    fn concurrent_mints_never_exceed_the_cap() {
        let (ledger, _) = ledger();
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let who: Identity = format!("minter-{t}").into();
                    (0..20)
                        .filter_map(|_| ledger.mint_one(&who, PRICE).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<TokenId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<_>>());
        assert_eq!(ledger.total_supply(), 100);
        assert_eq!(ledger.balance(), 100 * PRICE);
    }

    #[test]
    fn snapshot_restores_and_detects_tampering() {
        let (ledger, book) = ledger();
        ledger.mint_with_uri(&alice(), "first image", PRICE).unwrap();
        ledger.mint_batch(&"bob".into(), 2, 3 * PRICE).unwrap();
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.state_root, ledger.state_root());

        let restored = IssuanceLedger::restore(
            snapshot.clone(),
            Box::new(InMemoryRegistry::new()),
            book.clone(),
        )
        .unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.mint_one(&alice(), PRICE).unwrap(), 4);

        let mut tampered = snapshot.clone();
        tampered.balance += 1;
        assert_eq!(
            IssuanceLedger::restore(tampered, Box::new(InMemoryRegistry::new()), book.clone())
                .err(),
            Some(SnapshotError::RootMismatch)
        );

        let mut missing = snapshot;
        missing.tokens.remove(&2);
        missing.state_root = compute_state_root(
            &missing.config,
            &missing.owner,
            missing.total_supply,
            missing.balance,
            &missing.tokens,
            &missing.events,
        );
        assert_eq!(
            IssuanceLedger::restore(missing, Box::new(InMemoryRegistry::new()), book).err(),
            Some(SnapshotError::SupplyMismatch {
                supply: 3,
                tokens: 2
            })
        );
    }

    #[test]
    fn snapshot_with_both_event_kinds_survives_json() {
        let (ledger, book) = ledger();
        ledger.mint_batch(&alice(), 2, 2 * PRICE).unwrap();
        ledger.withdraw(&"owner".into()).unwrap();
        ledger.mint_one(&alice(), Amount::from(u64::MAX) * 4).unwrap();

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let decoded: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, ledger.snapshot());
        assert!(matches!(decoded.events[1], LedgerEvent::Withdrawn { amount, .. } if amount == 2 * PRICE));

        let restored =
            IssuanceLedger::restore(decoded, Box::new(InMemoryRegistry::new()), book).unwrap();
        assert_eq!(restored.events().len(), 3);
    }

    #[test]
    fn events_decode_with_large_amounts() {
        let event: LedgerEvent =
            serde_json::from_str(r#"{"withdrawn":{"to":"o","amount":340282366920938463463374607431768211455}}"#)
                .unwrap();
        assert_eq!(
            event,
            LedgerEvent::Withdrawn {
                to: "o".into(),
                amount: Amount::MAX
            }
        );
    }

    #[test]
    fn edited_event_log_breaks_the_root() {
        let (ledger, book) = ledger();
        ledger.mint_one(&alice(), PRICE).unwrap();
        ledger.withdraw(&"owner".into()).unwrap();

        let mut rewritten = ledger.snapshot();
        rewritten.events[0] = LedgerEvent::Minted {
            recipient: "mallory".into(),
            token_ids: vec![1],
            payment: PRICE,
        };
        assert_eq!(
            IssuanceLedger::restore(rewritten, Box::new(InMemoryRegistry::new()), book.clone())
                .err(),
            Some(SnapshotError::RootMismatch)
        );

        let mut truncated = ledger.snapshot();
        truncated.events.pop();
        assert_eq!(
            IssuanceLedger::restore(truncated, Box::new(InMemoryRegistry::new()), book).err(),
            Some(SnapshotError::RootMismatch)
        );
    }

    /// Mints `payment` into the ledger from inside the payout, then fails.
    struct RefillThenFail {
        ledger: OnceLock<Weak<IssuanceLedger>>,
        payment: Amount,
    }

    impl Payout for RefillThenFail {
        fn transfer(&self, _to: &Identity, _amount: Amount) -> Result<(), PayoutError> {
            let ledger = self.ledger.get().and_then(Weak::upgrade).unwrap();
            ledger.mint_one(&"alice".into(), self.payment).unwrap();
            Err(PayoutError::Rejected("node offline".into()))
        }
    }

    #[test]
    fn failed_payout_re_credit_saturates_instead_of_losing_funds() {
        let payout = Arc::new(RefillThenFail {
            ledger: OnceLock::new(),
            payment: Amount::MAX - 5,
        });
        let ledger = Arc::new(
            IssuanceLedger::new(
                "owner".into(),
                MintConfig {
                    min_price: 0,
                    ..MintConfig::default()
                },
                payout.clone(),
            )
            .unwrap(),
        );
        payout.ledger.set(Arc::downgrade(&ledger)).ok();
        ledger.mint_one(&alice(), 10).unwrap();

        let err = ledger.withdraw(&"owner".into()).unwrap_err();
        assert!(matches!(err, MintError::Payout(_)));
        assert_eq!(ledger.balance(), Amount::MAX);
        assert_eq!(ledger.total_supply(), 2);
        assert!(ledger
            .events()
            .iter()
            .all(|e| matches!(e, LedgerEvent::Minted { .. })));
    }

    #[test]
    fn withdrawn_event_is_logged_with_the_zeroing() {
        let (ledger, _) = ledger();
        ledger.mint_one(&alice(), PRICE).unwrap();
        ledger.withdraw(&"owner".into()).unwrap();
        ledger.mint_one(&alice(), PRICE).unwrap();
        let events = ledger.events();
        assert_eq!(
            events[1],
            LedgerEvent::Withdrawn {
                to: "owner".into(),
                amount: PRICE
            }
        );
        assert!(matches!(events[2], LedgerEvent::Minted { .. }));
    }

    proptest! {
        #[test]
        fn supply_and_balance_track_successful_mints(
            calls in prop::collection::vec((0u8..8, any::<bool>(), 0u128..3), 1..80)
        ) {
            let (ledger, _) = ledger();
            let mut minted = 0u64;
            let mut collected: Amount = 0;
            for (count, underpay, tip) in calls {
                let due = PRICE * Amount::from(count);
                let payment = if underpay { due.saturating_sub(1) } else { due + tip };
                let result = if count == 1 && tip == 0 {
                    ledger.mint_one(&alice(), payment).map(|id| vec![id])
                } else {
                    ledger.mint_batch(&alice(), count, payment)
                };
                match result {
                    Ok(ids) => {
                        prop_assert_eq!(ids.len() as u64, u64::from(count));
                        minted += u64::from(count);
                        collected += payment;
                    }
                    Err(MintError::BatchTooLarge { .. }) => {
                        prop_assert!(count == 0 || count > 5)
                    }
                    Err(MintError::InsufficientPayment { .. }) => {
                        prop_assert!(underpay)
                    }
                    Err(MintError::SupplyExceeded { .. }) => {
                        prop_assert!(minted + u64::from(count) > 100)
                    }
                    Err(other) => {
                        prop_assert!(false, "unexpected error {}", other)
                    }
                }
                prop_assert_eq!(ledger.total_supply(), minted);
                prop_assert!(ledger.total_supply() <= 100);
                prop_assert_eq!(ledger.balance(), collected);
            }
        }
    }
}
