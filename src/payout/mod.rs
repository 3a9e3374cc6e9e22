use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::PayoutError;
use crate::identity::Identity;
use crate::ledger::Amount;

/// External value transfer used by withdrawals.
///
/// Called by the ledger after its own balance has already been zeroed and
/// without the ledger lock held, so an implementation may call back into the
/// ledger.
pub trait Payout: Send + Sync {
    fn transfer(&self, to: &Identity, amount: Amount) -> Result<(), PayoutError>;
}

/// Native balances of external accounts.
#[derive(Debug, Default)]
pub struct AccountBook {
    balances: Mutex<BTreeMap<Identity, Amount>>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_balances(balances: BTreeMap<Identity, Amount>) -> Self {
        Self {
            balances: Mutex::new(balances),
        }
    }

    pub fn balance(&self, account: &Identity) -> Amount {
        self.balances.lock().get(account).copied().unwrap_or(0)
    }

    pub fn balances(&self) -> BTreeMap<Identity, Amount> {
        self.balances.lock().clone()
    }
}

impl Payout for AccountBook {
    fn transfer(&self, to: &Identity, amount: Amount) -> Result<(), PayoutError> {
        let mut balances = self.balances.lock();
        let current = balances.get(to).copied().unwrap_or(0);
        let next = current
            .checked_add(amount)
            .ok_or_else(|| PayoutError::Overflow {
                account: to.clone(),
                amount,
            })?;
        balances.insert(to.clone(), next);
        Ok(())
    }
}
