//! In-memory custody of the distributed token.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use paymaster_core::error::CustodyError;
use paymaster_core::traits::Custody;
use paymaster_core::types::{Address, Amount};

#[derive(Debug, Default)]
struct Balances {
    accounts: HashMap<Address, Amount>,
    pool: Amount,
}

/// Account balances plus the reward pool.
///
/// Clones share the same balances.
#[derive(Debug, Clone, Default)]
pub struct Treasury {
    inner: Arc<RwLock<Balances>>,
}

impl Treasury {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` to `account` out of thin air.
    pub fn mint(&self, account: &Address, amount: Amount) -> Result<(), CustodyError> {
        let mut inner = self.inner.write();
        let balance = inner.accounts.entry(*account).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or(CustodyError::ArithmeticOverflow)?;
        Ok(())
    }

    /// Sum of every account balance and the pool.
    pub fn total_supply(&self) -> Amount {
        let inner = self.inner.read();
        inner
            .accounts
            .values()
            .fold(inner.pool, |acc, v| acc.saturating_add(*v))
    }
}

impl Custody for Treasury {
    fn transfer_in(&mut self, from: &Address, amount: Amount) -> Result<(), CustodyError> {
        let mut inner = self.inner.write();
        let have = inner.accounts.get(from).copied().unwrap_or(0);
        if have < amount {
            return Err(CustodyError::InsufficientFunds {
                account: *from,
                have,
                need: amount,
            });
        }
        let pool = inner
            .pool
            .checked_add(amount)
            .ok_or(CustodyError::ArithmeticOverflow)?;
        inner.accounts.insert(*from, have - amount);
        inner.pool = pool;
        Ok(())
    }

    fn transfer_out(&mut self, to: &Address, amount: Amount) -> Result<(), CustodyError> {
        let mut inner = self.inner.write();
        if inner.pool < amount {
            return Err(CustodyError::InsufficientFunds {
                account: Address::ZERO,
                have: inner.pool,
                need: amount,
            });
        }
        let credited = inner
            .accounts
            .get(to)
            .copied()
            .unwrap_or(0)
            .checked_add(amount)
            .ok_or(CustodyError::ArithmeticOverflow)?;
        inner.pool -= amount;
        inner.accounts.insert(*to, credited);
        Ok(())
    }

    fn balance_of(&self, account: &Address) -> Amount {
        self.inner.read().accounts.get(account).copied().unwrap_or(0)
    }

    fn pool_balance(&self) -> Amount {
        self.inner.read().pool
    }
}
