//! Scenario files and their replay through a [`SettlementEngine`].
//!
//! A scenario is a JSON document with the initial world (start time, admin,
//! price, funded accounts) and a list of steps. Each step either moves time
//! or calls one engine operation as the scenario admin (claims are made by
//! the recipient's own address).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use paymaster_core::constants::DEFAULT_ALLOWED_PRICE_LAG_SECS;
use paymaster_core::error::PaymasterError;
use paymaster_core::traits::{Clock, Custody};
use paymaster_core::types::{decimal, Address, Amount, Operation, RecipientId, SourceId, Timestamp};
use paymaster_engine::{
    EngineConfig, FastForwardClock, LedgerEvent, ManualClock, PriceFeed, RoleAuthority, SettlementEngine, Treasury,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Deserialize, Debug, Clone)]
pub struct Account {
    pub address: Address,
    #[serde(with = "decimal")]
    pub balance: Amount,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Scenario {
    pub start: DateTime<Utc>,
    pub admin: Address,
    /// Price of one period in quote units.
    #[serde(with = "decimal")]
    pub fee_per_period: Amount,
    /// Initial unit price of the distributed token in quote units.
    #[serde(with = "decimal")]
    pub unit_price: Amount,
    /// Seconds of scenario time per advanced second.
    #[serde(default = "default_speed")]
    pub speed: u64,
    #[serde(default)]
    pub accounts: Vec<Account>,
    pub steps: Vec<Step>,
}

fn default_speed() -> u64 {
    1
}

/// A scenario step; `expect_error` marks steps that must fail.
#[derive(Deserialize, Debug, Clone)]
pub struct Step {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default)]
    pub expect_error: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    Advance { seconds: u64 },
    AdvanceTo { at: DateTime<Utc> },
    Skip { seconds: u64 },
    SetPrice {
        #[serde(with = "decimal")]
        price: Amount,
    },
    RegisterSource { label: String },
    RemoveSource { label: String },
    Pay { payer: Address, label: String, periods: u32 },
    RegisterRecipient { id: RecipientId, address: Address },
    RemoveRecipient { id: RecipientId },
    SetResourceCount { id: RecipientId, count: u64 },
    SetActiveResourceCount { id: RecipientId, count: u64 },
    Claim { address: Address },
    ClaimFor { id: RecipientId, to: Address },
    ClearHistory { until: DateTime<Utc> },
    SetMaxReplenishmentPeriods { periods: u32 },
    SetVersion { version: String },
}

/// Final balances after a replay.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub now: Timestamp,
    #[serde(with = "decimal")]
    pub pool: Amount,
    pub balances: Vec<(Address, Amount)>,
    pub debts_begin: u64,
    pub debts_end: u64,
}

/// Parse a scenario document.
pub fn parse(json: &str) -> Result<Scenario> {
    serde_json::from_str(json).context("invalid scenario")
}

fn timestamp(at: &DateTime<Utc>) -> Result<Timestamp> {
    u64::try_from(at.timestamp()).with_context(|| format!("{at} is before the Unix epoch"))
}

/// Replay `scenario`, handing every batch of events to `sink`.
pub fn run<F>(scenario: &Scenario, config: EngineConfig, mut sink: F) -> Result<Summary>
where
    F: FnMut(&[LedgerEvent]) -> Result<()>,
{
    let start = timestamp(&scenario.start)?;
    let base = ManualClock::new(start);
    let clock = FastForwardClock::new(Arc::new(base.clone()));
    clock.set_multiplier(scenario.speed);

    let treasury = Treasury::new();
    for account in &scenario.accounts {
        treasury.mint(&account.address, account.balance)?;
    }
    let feed = PriceFeed::new(scenario.fee_per_period, DEFAULT_ALLOWED_PRICE_LAG_SECS);
    feed.set_unit_price(scenario.unit_price, start);

    let mut engine = SettlementEngine::new(
        config,
        Box::new(clock.clone()),
        Box::new(treasury.clone()),
        Box::new(feed.clone()),
        Box::new(RoleAuthority::new(scenario.admin)),
    );
    let admin = scenario.admin;

    for (index, step) in scenario.steps.iter().enumerate() {
        let outcome = apply(&mut engine, &base, &clock, &feed, &admin, &step.action);
        match (outcome, step.expect_error) {
            (Ok(()), false) => {}
            (Err(e), true) => warn!(step = index, "expected failure: {e}"),
            (Ok(()), true) => bail!("step {index} ({:?}) succeeded but was expected to fail", step.action),
            (Err(e), false) => {
                return Err(e).with_context(|| format!("step {index} ({:?}) failed", step.action));
            }
        }
        sink(&engine.drain_events())?;
    }

    let mut balances: Vec<(Address, Amount)> = scenario
        .accounts
        .iter()
        .map(|a| a.address)
        .chain(std::iter::once(admin))
        .map(|a| (a, treasury.balance_of(&a)))
        .collect();
    balances.sort_unstable();
    balances.dedup();

    let summary = Summary {
        now: clock.now(),
        pool: treasury.pool_balance(),
        balances,
        debts_begin: engine.debts_begin(),
        debts_end: engine.debts_end(),
    };
    info!(pool = %summary.pool, debts = summary.debts_end - summary.debts_begin, "scenario finished");
    Ok(summary)
}

fn apply(
    engine: &mut SettlementEngine,
    base: &ManualClock,
    clock: &FastForwardClock,
    feed: &PriceFeed,
    admin: &Address,
    action: &Action,
) -> Result<(), PaymasterError> {
    match action {
        Action::Advance { seconds } => base.advance(*seconds),
        Action::AdvanceTo { at } => {
            let target = u64::try_from(at.timestamp()).unwrap_or(0);
            let now = clock.now();
            if target > now {
                clock.skip(target - now);
            }
        }
        Action::Skip { seconds } => clock.skip(*seconds),
        Action::SetPrice { price } => {
            engine.authorize(admin, Operation::SetPrice)?;
            feed.set_unit_price(*price, clock.now());
        }
        Action::RegisterSource { label } => {
            engine.register_source(admin, label)?;
        }
        Action::RemoveSource { label } => {
            engine.remove_source(admin, &SourceId::from_label(label))?;
        }
        Action::Pay { payer, label, periods } => {
            engine.pay(payer, &SourceId::from_label(label), *periods)?;
        }
        Action::RegisterRecipient { id, address } => engine.register_recipient(admin, *id, *address)?,
        Action::RemoveRecipient { id } => engine.remove_recipient(admin, *id)?,
        Action::SetResourceCount { id, count } => engine.set_resource_count(admin, *id, *count)?,
        Action::SetActiveResourceCount { id, count } => engine.set_active_resource_count(admin, *id, *count)?,
        Action::Claim { address } => {
            engine.claim(address, address)?;
        }
        Action::ClaimFor { id, to } => {
            engine.claim_for(admin, *id, to)?;
        }
        Action::ClearHistory { until } => {
            engine.clear_history(admin, u64::try_from(until.timestamp()).unwrap_or(0))?;
        }
        Action::SetMaxReplenishmentPeriods { periods } => engine.set_max_replenishment_periods(admin, *periods)?,
        Action::SetVersion { version } => engine.set_version(admin, version)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../scenarios/two-validators.json");

    #[test]
    fn sample_scenario_parses() {
        let scenario = parse(SAMPLE).unwrap();
        assert!(!scenario.steps.is_empty());
        assert_eq!(scenario.speed, 1);
    }

    #[test]
    fn sample_scenario_settles_everything() {
        let scenario = parse(SAMPLE).unwrap();
        let mut events = Vec::new();
        let summary = run(&scenario, EngineConfig::default(), |batch| {
            events.extend_from_slice(batch);
            Ok(())
        })
        .unwrap();
        assert_eq!(summary.pool, 0);
        assert!(events.iter().any(|e| matches!(e, LedgerEvent::RewardClaimed { .. })));
        assert!(events.iter().any(|e| matches!(e, LedgerEvent::HistoryCleared { .. })));
    }

    #[test]
    fn unexpected_failure_aborts() {
        let scenario = parse(
            r#"{
                "start": "2024-01-10T00:00:00Z",
                "admin": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "fee_per_period": "5000000000000000000000",
                "unit_price": "2000000000000000000",
                "steps": [{ "op": "remove_recipient", "id": 9 }]
            }"#,
        )
        .unwrap();
        let err = run(&scenario, EngineConfig::default(), |_| Ok(())).unwrap_err();
        assert!(format!("{err:#}").contains("step 0"));
    }

    #[test]
    fn expected_failure_continues() {
        let scenario = parse(
            r#"{
                "start": "2024-01-10T00:00:00Z",
                "admin": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "fee_per_period": 1,
                "unit_price": 1,
                "steps": [
                    { "op": "remove_recipient", "id": 9, "expect_error": true },
                    { "op": "set_version", "version": "sim" }
                ]
            }"#,
        )
        .unwrap();
        let mut events = Vec::new();
        run(&scenario, EngineConfig::default(), |batch| {
            events.extend_from_slice(batch);
            Ok(())
        })
        .unwrap();
        assert_eq!(events, vec![LedgerEvent::VersionSet { version: "sim".to_string() }]);
    }

    #[test]
    fn speed_scales_advanced_time() {
        let scenario = parse(
            r#"{
                "start": "2024-01-10T00:00:00Z",
                "admin": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "fee_per_period": 1,
                "unit_price": 1,
                "speed": 60,
                "steps": [{ "op": "advance", "seconds": 10 }]
            }"#,
        )
        .unwrap();
        let summary = run(&scenario, EngineConfig::default(), |_| Ok(())).unwrap();
        assert_eq!(summary.now, 1_704_844_800 + 600);
    }
}
