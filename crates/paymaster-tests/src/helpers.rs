//! Shared harness for scenario and adversarial tests.

use paymaster_core::constants::ONE_TOKEN;
use paymaster_core::traits::Custody;
use paymaster_core::types::{Address, Amount, RecipientId, SourceId, Timestamp};
use paymaster_engine::{EngineConfig, ManualClock, PriceFeed, RoleAuthority, SettlementEngine, Treasury};

pub const ADMIN: Address = Address([0xAA; 20]);
pub const PAYER: Address = Address([0xCC; 20]);

/// 2024-01-10T00:00:00Z
pub const JAN_10: Timestamp = 1_704_844_800;
pub const FEB_1: Timestamp = 1_706_745_600;
pub const MAR_1: Timestamp = 1_709_251_200;
pub const APR_1: Timestamp = 1_711_929_600;
pub const MAY_1: Timestamp = 1_714_521_600;

/// Quote price of one month.
pub const FEE: Amount = 5_000 * ONE_TOKEN;
/// Quote price of one distributed token.
pub const UNIT_PRICE: Amount = 2 * ONE_TOKEN;
/// Tokens charged per month at the harness prices.
pub const MONTHLY: Amount = 2_500 * ONE_TOKEN;

pub const PAYER_FUNDS: Amount = 1_000 * MONTHLY;

/// Address of recipient `id` in harness scenarios.
pub fn recipient_address(id: RecipientId) -> Address {
    let mut bytes = [0u8; 20];
    bytes[12..].copy_from_slice(&id.to_be_bytes());
    bytes[0] = 0x10;
    Address(bytes)
}

/// An engine on calendar months with its collaborators kept at hand.
pub struct Harness {
    pub engine: SettlementEngine,
    pub clock: ManualClock,
    pub treasury: Treasury,
    pub feed: PriceFeed,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::new(JAN_10);
        let treasury = Treasury::new();
        treasury
            .mint(&PAYER, PAYER_FUNDS)
            .expect("mint payer funds");
        let feed = PriceFeed::new(FEE, u64::MAX);
        feed.set_unit_price(UNIT_PRICE, JAN_10);
        let engine = SettlementEngine::new(
            config,
            Box::new(clock.clone()),
            Box::new(treasury.clone()),
            Box::new(feed.clone()),
            Box::new(RoleAuthority::new(ADMIN)),
        );
        Self {
            engine,
            clock,
            treasury,
            feed,
        }
    }

    pub fn source(&mut self, label: &str) -> SourceId {
        self.engine
            .register_source(&ADMIN, label)
            .expect("register source")
    }

    /// Register recipient `id` with `count` active resources.
    pub fn recipient(&mut self, id: RecipientId, count: u64) -> Address {
        let address = recipient_address(id);
        self.engine
            .register_recipient(&ADMIN, id, address)
            .expect("register recipient");
        if count > 0 {
            self.engine
                .set_resource_count(&ADMIN, id, count)
                .expect("set resource count");
        }
        address
    }

    pub fn pay(&mut self, id: &SourceId, periods: u32) -> Timestamp {
        self.engine.pay(&PAYER, id, periods).expect("pay")
    }

    /// Claim as recipient `id`, paying out to its own address.
    pub fn claim(&mut self, id: RecipientId) -> Amount {
        let address = recipient_address(id);
        self.engine.claim(&address, &address).expect("claim")
    }

    pub fn balance(&self, address: &Address) -> Amount {
        self.treasury.balance_of(address)
    }

    pub fn pool(&self) -> Amount {
        self.treasury.pool_balance()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
