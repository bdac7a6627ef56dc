//! Unit-price feed for buying periods.
//!
//! A period costs a fixed fee in quote units (for example 5000 USD per
//! month, scaled by 10^18). The feed converts it to the distributed token at
//! the most recent unit price, which must be no older than the allowed lag.

use std::sync::Arc;

use parking_lot::RwLock;
use paymaster_core::constants::ONE_TOKEN;
use paymaster_core::error::OracleError;
use paymaster_core::traits::PriceOracle;
use paymaster_core::types::{Amount, Timestamp};
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Quote {
    price: Amount,
    updated_at: Timestamp,
}

#[derive(Debug)]
struct FeedState {
    fee_per_period: Amount,
    quote: Option<Quote>,
}

/// Shared handle to a fee schedule and the latest unit price.
#[derive(Debug, Clone)]
pub struct PriceFeed {
    inner: Arc<RwLock<FeedState>>,
    max_lag: u64,
}

impl PriceFeed {
    /// Feed with no unit price yet; every quote fails until one is set.
    pub fn new(fee_per_period: Amount, max_lag: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(FeedState {
                fee_per_period,
                quote: None,
            })),
            max_lag,
        }
    }

    /// Record the unit price observed at `at`.
    pub fn set_unit_price(&self, price: Amount, at: Timestamp) {
        self.inner.write().quote = Some(Quote { price, updated_at: at });
        info!(price = %price, at, "unit price updated");
    }

    pub fn set_fee_per_period(&self, fee: Amount) {
        self.inner.write().fee_per_period = fee;
    }

    pub fn fee_per_period(&self) -> Amount {
        self.inner.read().fee_per_period
    }

    /// Latest unit price and the time it was set.
    pub fn unit_price(&self) -> Option<(Amount, Timestamp)> {
        self.inner.read().quote.map(|q| (q.price, q.updated_at))
    }

    pub fn max_lag(&self) -> u64 {
        self.max_lag
    }
}

impl PriceOracle for PriceFeed {
    fn amount_for_periods(&self, periods: u32, now: Timestamp) -> Result<Amount, OracleError> {
        let inner = self.inner.read();
        let quote = inner.quote.ok_or(OracleError::PriceNotSet)?;
        if now.saturating_sub(quote.updated_at) > self.max_lag {
            return Err(OracleError::StalePrice {
                updated_at: quote.updated_at,
                now,
                max_lag: self.max_lag,
            });
        }
        if quote.price == 0 {
            return Err(OracleError::ZeroPrice);
        }
        // fee * ONE_TOKEN / price, split so the product stays in range
        let fee = inner.fee_per_period;
        let whole = (fee / quote.price)
            .checked_mul(ONE_TOKEN)
            .ok_or(OracleError::ArithmeticOverflow)?;
        let fraction = (fee % quote.price)
            .checked_mul(ONE_TOKEN)
            .ok_or(OracleError::ArithmeticOverflow)?
            / quote.price;
        let per_period = whole
            .checked_add(fraction)
            .ok_or(OracleError::ArithmeticOverflow)?;
        per_period
            .checked_mul(Amount::from(periods))
            .ok_or(OracleError::ArithmeticOverflow)
    }
}
