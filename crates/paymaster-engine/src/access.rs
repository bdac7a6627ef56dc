//! Permission checks for administrative operations.

use std::collections::HashSet;

use paymaster_core::traits::Authority;
use paymaster_core::types::{Address, Operation};

/// Role-based authority: administrators may do everything, price setters
/// may only update the unit price.
#[derive(Debug, Clone, Default)]
pub struct RoleAuthority {
    admins: HashSet<Address>,
    price_setters: HashSet<Address>,
}

impl RoleAuthority {
    /// Create an authority with a single administrator.
    pub fn new(admin: Address) -> Self {
        let mut authority = Self::default();
        authority.admins.insert(admin);
        authority
    }

    /// Add another administrator.
    pub fn with_admin(mut self, admin: Address) -> Self {
        self.admins.insert(admin);
        self
    }

    /// Allow `setter` to update the unit price.
    pub fn with_price_setter(mut self, setter: Address) -> Self {
        self.price_setters.insert(setter);
        self
    }

    pub fn is_admin(&self, address: &Address) -> bool {
        self.admins.contains(address)
    }
}

impl Authority for RoleAuthority {
    fn is_authorized(&self, caller: &Address, operation: Operation) -> bool {
        match operation {
            Operation::SetPrice => {
                self.admins.contains(caller) || self.price_setters.contains(caller)
            }
            _ => self.admins.contains(caller),
        }
    }
}

/// Authority that permits every caller. For simulations and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authority for AllowAll {
    fn is_authorized(&self, _caller: &Address, _operation: Operation) -> bool {
        true
    }
}
