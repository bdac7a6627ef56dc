//! Settlement engine.
//!
//! The [`SettlementEngine`] keeps the books of a reward pool:
//! - payment sources buy whole periods; each payment becomes a uniform income
//!   stream on the [`Timeline`]
//! - recipients hold active resource counts recorded in a [`Sequence`]
//! - a claim pays the recipient's pro-rata share of the income between its
//!   last claim and the start of the current period
//!
//! Income that cannot flow through the timeline is recorded as a [`Debt`]:
//! - income in a window with no active resources is credited into the
//!   current period instead of being lost
//! - a payment for a window that was already settled is owed to the
//!   recipients active in that window and paid at their next claim
//!
//! Every mutating operation validates, reads prices and moves tokens before
//! it changes any state, so a failed call leaves the engine untouched.
//!
//! Not thread-safe — callers should wrap in a `Mutex` if concurrent access
//! is needed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use paymaster_core::error::{CustodyError, PaymasterError, RecipientError, SettlementError, SourceError, TimelineError};
use paymaster_core::period::Period;
use paymaster_core::traits::{Authority, Clock, Custody, PriceOracle};
use paymaster_core::types::{Address, Amount, IncomeSegment, Operation, RecipientId, SourceId, Timestamp};
use paymaster_ledger::{Sequence, Timeline};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::debt::{Debt, DebtQueue};
use crate::events::LedgerEvent;

/// A stretch of income a payer funded, kept so source removal can refund it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Funding {
    pub payer: Address,
    pub from: Timestamp,
    pub to: Timestamp,
    pub value: Amount,
}

/// A payer-facing account that buys periods of income for the pool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PaymentSource {
    pub id: SourceId,
    pub label: String,
    /// Exclusive end of the funded periods; always a period boundary.
    pub paid_until: Timestamp,
    fundings: Vec<Funding>,
}

impl PaymentSource {
    /// Funded stretches not yet pruned by history clearing.
    pub fn fundings(&self) -> &[Funding] {
        &self.fundings
    }
}

/// A reward recipient (for example a validator with nodes).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub id: RecipientId,
    pub address: Address,
    pub resource_count: u64,
    pub active_resource_count: u64,
    pub removed_at: Option<Timestamp>,
    /// Income before this instant has been paid out.
    pub claimed_until: Timestamp,
    payouts: Vec<IncomeSegment>,
}

impl Recipient {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Amounts paid per claimed window, oldest first. Windows start at the
    /// previous `claimed_until`, so they never overlap.
    pub fn payouts(&self) -> &[IncomeSegment] {
        &self.payouts
    }

    /// Whether this recipient may still claim history the engine must keep.
    fn holds_history(&self) -> bool {
        self.removed_at.is_none_or(|at| self.claimed_until < at)
    }
}

/// Settled income owed to the recipients active over `[from, to)`.
#[derive(Debug)]
struct OwedIncome {
    from: Timestamp,
    to: Timestamp,
    amount: Amount,
    shares: BTreeMap<RecipientId, Amount>,
}

/// Where a payment's income ends up.
#[derive(Debug, Default)]
struct PaymentPlan {
    segments: Vec<Funding>,
    /// Settled parts with active resources in their window, by origin period.
    owed: BTreeMap<Timestamp, OwedIncome>,
    /// Settled parts nobody was active for, by origin period.
    unattributed: BTreeMap<Timestamp, Amount>,
}

/// The reward settlement ledger.
pub struct SettlementEngine {
    config: EngineConfig,
    clock: Box<dyn Clock>,
    custody: Box<dyn Custody>,
    oracle: Box<dyn PriceOracle>,
    authority: Box<dyn Authority>,
    sources: BTreeMap<SourceId, PaymentSource>,
    recipients: BTreeMap<RecipientId, Recipient>,
    by_address: HashMap<Address, RecipientId>,
    timeline: Timeline,
    /// Active resource counts per recipient.
    counts: Sequence<RecipientId>,
    debts: DebtQueue,
    /// Unclaimed shares of late income, by debt index.
    credits: BTreeMap<u64, BTreeMap<RecipientId, Amount>>,
    /// Windows before this instant were checked for unattributed income.
    scanned_until: Timestamp,
    events: Vec<LedgerEvent>,
}

impl SettlementEngine {
    /// Create an engine whose history starts at the current period.
    pub fn new(
        config: EngineConfig,
        clock: Box<dyn Clock>,
        custody: Box<dyn Custody>,
        oracle: Box<dyn PriceOracle>,
        authority: Box<dyn Authority>,
    ) -> Self {
        let start = config.period.start_of(clock.now());
        info!(start, version = %config.version, "settlement engine started");
        Self {
            debts: DebtQueue::new(config.debt_capacity),
            config,
            clock,
            custody,
            oracle,
            authority,
            sources: BTreeMap::new(),
            recipients: BTreeMap::new(),
            by_address: HashMap::new(),
            timeline: Timeline::starting_at(start),
            counts: Sequence::new(),
            credits: BTreeMap::new(),
            scanned_until: start,
            events: Vec::new(),
        }
    }

    fn period(&self) -> Period {
        self.config.period
    }

    /// Current time according to the engine's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Bounds of the period containing the current time.
    pub fn current_period(&self) -> (Timestamp, Timestamp) {
        let now = self.now();
        (self.period().start_of(now), self.period().next_boundary(now))
    }

    /// Fail unless `caller` may perform `operation`.
    pub fn authorize(&self, caller: &Address, operation: Operation) -> Result<(), PaymasterError> {
        self.authority.require(caller, operation).map_err(|e| {
            warn!(%caller, %operation, "unauthorized call rejected");
            e.into()
        })
    }

    fn emit(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    // ------------------------------------------------------------------
    // Payment sources
    // ------------------------------------------------------------------

    /// Register a source; its first funded period starts at the next boundary.
    pub fn register_source(&mut self, caller: &Address, label: &str) -> Result<SourceId, PaymasterError> {
        self.authorize(caller, Operation::RegisterSource)?;
        let id = SourceId::from_label(label);
        if self.sources.contains_key(&id) {
            return Err(SourceError::DuplicateSource(id).into());
        }
        let paid_until = self.period().next_boundary(self.now());
        self.sources.insert(
            id,
            PaymentSource {
                id,
                label: label.to_string(),
                paid_until,
                fundings: Vec::new(),
            },
        );
        info!(%id, label, paid_until, "payment source registered");
        self.emit(LedgerEvent::SourceRegistered {
            id,
            label: label.to_string(),
            paid_until,
        });
        Ok(id)
    }

    /// Remove a source, refunding every period that starts at or after the
    /// next boundary to the payer that funded it. Returns the total refund.
    pub fn remove_source(&mut self, caller: &Address, id: &SourceId) -> Result<Amount, PaymasterError> {
        self.authorize(caller, Operation::RemoveSource)?;
        let now = self.now();
        let cutoff = self.period().next_boundary(now);
        let source = self
            .sources
            .get(id)
            .ok_or(SourceError::SourceNotFound(*id))?;

        let future: Vec<Funding> = source
            .fundings
            .iter()
            .filter(|f| f.from >= cutoff)
            .copied()
            .collect();
        let mut refunds: BTreeMap<Address, Amount> = BTreeMap::new();
        let mut total: Amount = 0;
        for f in &future {
            let entry = refunds.entry(f.payer).or_default();
            *entry = entry.checked_add(f.value).ok_or(SettlementError::ArithmeticOverflow)?;
            total = total.checked_add(f.value).ok_or(SettlementError::ArithmeticOverflow)?;
        }
        let pool = self.custody.pool_balance();
        if pool < total {
            return Err(CustodyError::InsufficientFunds {
                account: Address::ZERO,
                have: pool,
                need: total,
            }
            .into());
        }

        for (payer, amount) in &refunds {
            self.custody.transfer_out(payer, *amount)?;
        }
        for f in &future {
            self.timeline.remove(f.from, f.to, f.value)?;
        }
        self.sources.remove(id);
        info!(%id, refunded = %total, "payment source removed");
        self.emit(LedgerEvent::SourceRemoved {
            id: *id,
            refunded: total,
            at: now,
        });
        Ok(total)
    }

    /// Buy `periods` more periods for a source, paid by `payer`.
    ///
    /// Returns the new `paid_until`. Parts of the bought periods that are
    /// already settled become debt: owed to the recipients active back then,
    /// or credited to the current period if nobody was.
    pub fn pay(&mut self, payer: &Address, id: &SourceId, periods: u32) -> Result<Timestamp, PaymasterError> {
        if periods == 0 {
            return Err(SourceError::ReplenishmentTooSmall.into());
        }
        let now = self.now();
        let period = self.period();
        let source = self
            .sources
            .get(id)
            .ok_or(SourceError::SourceNotFound(*id))?;
        let start = source.paid_until;
        let paid_until = period.advance(start, periods);
        let max = self.config.max_replenishment_periods;
        let ceiling = period.advance(period.next_boundary(now), max);
        if paid_until > ceiling {
            warn!(%id, periods, paid_until, ceiling, "replenishment rejected");
            return Err(SourceError::ReplenishmentTooLarge { periods, max }.into());
        }

        let amount = self.oracle.amount_for_periods(periods, now)?;
        if i128::try_from(amount).is_err() {
            return Err(SettlementError::ArithmeticOverflow.into());
        }
        let plan = self.plan_payment(*payer, start, periods, amount);
        self.ensure_debt_room(plan.owed.len() + plan.unattributed.len())?;

        self.custody.transfer_in(payer, amount)?;
        for s in &plan.segments {
            self.timeline.add(s.from, s.to, s.value)?;
        }
        self.record_owed(plan.owed)?;
        self.credit_debts(plan.unattributed, now)?;
        if let Some(source) = self.sources.get_mut(id) {
            source.paid_until = paid_until;
            source.fundings.extend(plan.segments);
        }

        info!(%id, %payer, periods, amount = %amount, paid_until, "source paid");
        self.emit(LedgerEvent::SourcePaid {
            id: *id,
            payer: *payer,
            periods,
            amount,
            paid_until,
        });
        Ok(paid_until)
    }

    /// Split `amount` into one segment per period starting at `start`, the
    /// integer remainder on the last second of the final period. Anything
    /// below the processed watermark is diverted to debt by origin period.
    fn plan_payment(&self, payer: Address, start: Timestamp, periods: u32, amount: Amount) -> PaymentPlan {
        let period = self.period();
        let processed = self.timeline.processed_until();
        let per_period = amount / Amount::from(periods);
        let remainder = amount % Amount::from(periods);
        let end = period.advance(start, periods);

        let mut pieces: Vec<(Timestamp, Timestamp, Amount)> = (0..periods)
            .map(|k| (period.advance(start, k), period.advance(start, k + 1), per_period))
            .collect();
        if remainder > 0 {
            pieces.push((end - 1, end, remainder));
        }

        let mut plan = PaymentPlan::default();
        for (from, to, value) in pieces {
            if value == 0 || to <= from {
                continue;
            }
            let late = if to <= processed {
                value
            } else if from < processed {
                mul_div(value, processed - from, to - from)
            } else {
                0
            };
            if late > 0 {
                self.allocate_late(period.start_of(from), from, to.min(processed), late, &mut plan);
            }
            if value > late {
                plan.segments.push(Funding {
                    payer,
                    from: from.max(processed),
                    to,
                    value: value - late,
                });
            }
        }
        plan
    }

    /// Spread `amount` uniformly over the settled stretch `[from, to)` and
    /// share each window by the active counts recorded for it.
    fn allocate_late(&self, origin: Timestamp, from: Timestamp, to: Timestamp, amount: Amount, plan: &mut PaymentPlan) {
        let mut cuts = vec![from];
        cuts.extend(
            self.counts
                .change_points(from, to)
                .into_iter()
                .filter(|t| *t > from),
        );
        cuts.push(to);

        let mut left = amount;
        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let piece = if b == to { left } else { mul_div(amount, b - a, to - from) };
            left -= piece;
            let total = self.counts.aggregate_at(a);
            if total == 0 {
                *plan.unattributed.entry(origin).or_default() += piece;
                continue;
            }
            let owed = plan.owed.entry(origin).or_insert_with(|| OwedIncome {
                from,
                to,
                amount: 0,
                shares: BTreeMap::new(),
            });
            owed.from = owed.from.min(from);
            owed.to = owed.to.max(to);
            for id in self.recipients.keys() {
                let mine = self.counts.value_at(id, a);
                if mine > 0 {
                    let share = mul_div(piece, mine, total);
                    *owed.shares.entry(*id).or_default() += share;
                    owed.amount += share;
                }
            }
        }
    }

    /// Record late income as debt claimable by the recipients it is owed to.
    fn record_owed(&mut self, owed: BTreeMap<Timestamp, OwedIncome>) -> Result<(), PaymasterError> {
        for (origin, income) in owed {
            let shares: BTreeMap<RecipientId, Amount> =
                income.shares.into_iter().filter(|(_, v)| *v > 0).collect();
            if shares.is_empty() {
                continue;
            }
            let index = self.debts.push(Debt {
                origin,
                credited_from: income.from,
                credited_to: income.to,
                amount: income.amount,
            })?;
            debug!(index, origin, amount = %income.amount, recipients = shares.len(), "late income owed");
            self.emit(LedgerEvent::DebtRecorded {
                index,
                origin,
                amount: income.amount,
                credited_to: income.to,
            });
            self.credits.insert(index, shares);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recipients
    // ------------------------------------------------------------------

    /// Register a recipient; it can claim income from the current period on.
    pub fn register_recipient(
        &mut self,
        caller: &Address,
        id: RecipientId,
        address: Address,
    ) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::RegisterRecipient)?;
        if self.recipients.contains_key(&id) {
            return Err(RecipientError::DuplicateId(id).into());
        }
        if self.by_address.contains_key(&address) {
            return Err(RecipientError::DuplicateAddress(address).into());
        }
        let claimed_until = self.period().start_of(self.now());
        self.recipients.insert(
            id,
            Recipient {
                id,
                address,
                resource_count: 0,
                active_resource_count: 0,
                removed_at: None,
                claimed_until,
                payouts: Vec::new(),
            },
        );
        self.by_address.insert(address, id);
        info!(id, %address, "recipient registered");
        self.emit(LedgerEvent::RecipientRegistered {
            id,
            address,
            claimed_until,
        });
        Ok(())
    }

    /// Stop a recipient from earning. Windows that already elapsed stay
    /// claimable.
    pub fn remove_recipient(&mut self, caller: &Address, id: RecipientId) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::RemoveRecipient)?;
        self.live_recipient(id)?;
        let now = self.now();
        self.counts.set(id, now, 0)?;
        if let Some(r) = self.recipients.get_mut(&id) {
            r.active_resource_count = 0;
            r.removed_at = Some(now);
        }
        info!(id, removed_at = now, "recipient marked as removed");
        self.emit(LedgerEvent::RecipientMarkedRemoved { id, removed_at: now });
        Ok(())
    }

    /// Set both the total and the active resource count of a recipient.
    pub fn set_resource_count(&mut self, caller: &Address, id: RecipientId, count: u64) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::SetResourceCount)?;
        self.live_recipient(id)?;
        self.update_counts(id, count, count)
    }

    /// Set how many of a recipient's resources are active (earning).
    pub fn set_active_resource_count(
        &mut self,
        caller: &Address,
        id: RecipientId,
        active: u64,
    ) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::SetResourceCount)?;
        let total = self.live_recipient(id)?.resource_count;
        if active > total {
            warn!(id, active, total, "active count above total rejected");
            return Err(RecipientError::ActiveExceedsTotal { active, total }.into());
        }
        self.update_counts(id, total, active)
    }

    fn update_counts(&mut self, id: RecipientId, total: u64, active: u64) -> Result<(), PaymasterError> {
        let now = self.now();
        self.counts.set(id, now, active)?;
        if let Some(r) = self.recipients.get_mut(&id) {
            r.resource_count = total;
            r.active_resource_count = active;
        }
        debug!(id, total, active, at = now, "resource count changed");
        self.emit(LedgerEvent::ResourceCountChanged {
            id,
            total,
            active,
            at: now,
        });
        Ok(())
    }

    fn live_recipient(&self, id: RecipientId) -> Result<&Recipient, RecipientError> {
        let r = self
            .recipients
            .get(&id)
            .ok_or(RecipientError::RecipientNotFound(id))?;
        match r.removed_at {
            Some(removed_at) => Err(RecipientError::Removed { id, removed_at }),
            None => Ok(r),
        }
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    /// Amount a claim by `id` would pay right now.
    pub fn reward_amount(&self, id: RecipientId) -> Result<Amount, PaymasterError> {
        let recipient = self
            .recipients
            .get(&id)
            .ok_or(RecipientError::RecipientNotFound(id))?;
        let (until, _) = self.current_period();
        self.entitlement(recipient, until)?
            .checked_add(self.owed_to(id)?)
            .ok_or_else(|| SettlementError::ArithmeticOverflow.into())
    }

    /// Claim for the recipient registered at `caller`, paying out to `to`.
    pub fn claim(&mut self, caller: &Address, to: &Address) -> Result<Amount, PaymasterError> {
        let id = *self
            .by_address
            .get(caller)
            .ok_or(RecipientError::UnknownAddress(*caller))?;
        self.settle(id, to)
    }

    /// Claim on behalf of recipient `id`, paying out to `to`.
    pub fn claim_for(&mut self, caller: &Address, id: RecipientId, to: &Address) -> Result<Amount, PaymasterError> {
        self.authorize(caller, Operation::ClaimFor)?;
        self.settle(id, to)
    }

    fn settle(&mut self, id: RecipientId, to: &Address) -> Result<Amount, PaymasterError> {
        let now = self.now();
        let until = self.period().start_of(now);
        let recipient = self
            .recipients
            .get(&id)
            .ok_or(RecipientError::RecipientNotFound(id))?;
        let from = recipient.claimed_until;
        let earned = self.entitlement(recipient, until)?;
        let amount = earned
            .checked_add(self.owed_to(id)?)
            .ok_or(SettlementError::ArithmeticOverflow)?;
        let unattributed = self.plan_unattributed(until)?;
        self.ensure_debt_room(unattributed.len())?;

        if amount > 0 {
            self.custody.transfer_out(to, amount)?;
        }
        self.absorb_unattributed(unattributed, until, now)?;
        if let Some(r) = self.recipients.get_mut(&id) {
            if until > from {
                if earned > 0 {
                    r.payouts.push(IncomeSegment { from, to: until, value: earned });
                }
                r.claimed_until = until;
            }
        }
        for shares in self.credits.values_mut() {
            shares.remove(&id);
        }
        self.credits.retain(|_, shares| !shares.is_empty());
        self.release_settled_debts();

        info!(id, %to, amount = %amount, until, "reward claimed");
        self.emit(LedgerEvent::RewardClaimed {
            id,
            to: *to,
            amount,
            until,
        });
        Ok(amount)
    }

    /// Share of income on `[claimed_until, until)` owed to `recipient`.
    fn entitlement(&self, recipient: &Recipient, until: Timestamp) -> Result<Amount, PaymasterError> {
        let from = recipient.claimed_until;
        if until <= from {
            return Ok(0);
        }
        let mut cuts = vec![from];
        cuts.extend(
            self.counts
                .change_points(from, until)
                .into_iter()
                .filter(|t| *t > from),
        );
        cuts.push(until);

        let mut owed: Amount = 0;
        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let mine = self.counts.value_at(&recipient.id, a);
            let total = self.counts.aggregate_at(a);
            if mine == 0 || total == 0 {
                continue;
            }
            let income = self.timeline.sum(a, b)?;
            let share = mul_div(income, mine, total);
            owed = owed
                .checked_add(share)
                .ok_or(SettlementError::ArithmeticOverflow)?;
        }
        Ok(owed)
    }

    /// Unclaimed late income owed to `id`.
    fn owed_to(&self, id: RecipientId) -> Result<Amount, SettlementError> {
        self.credits
            .values()
            .filter_map(|shares| shares.get(&id))
            .try_fold(0, |acc: Amount, v| acc.checked_add(*v).ok_or(SettlementError::ArithmeticOverflow))
    }

    /// Income on `[scanned_until, until)` that fell into windows with no
    /// active resources, grouped by origin period.
    fn plan_unattributed(&self, until: Timestamp) -> Result<Vec<(Timestamp, Amount)>, PaymasterError> {
        let from = self.scanned_until;
        if until <= from {
            return Ok(Vec::new());
        }
        let period = self.period();
        let mut cuts: BTreeSet<Timestamp> = self.counts.change_points(from, until).into_iter().collect();
        cuts.insert(from);
        cuts.insert(until);
        let mut boundary = period.next_boundary(from);
        while boundary < until {
            cuts.insert(boundary);
            boundary = period.next_boundary(boundary);
        }

        let mut owed: BTreeMap<Timestamp, Amount> = BTreeMap::new();
        for (a, b) in cuts.iter().zip(cuts.iter().skip(1)) {
            if self.counts.aggregate_at(*a) != 0 {
                continue;
            }
            let income = self.timeline.sum(*a, *b)?;
            if income > 0 {
                let entry = owed.entry(period.start_of(*a)).or_default();
                *entry = entry
                    .checked_add(income)
                    .ok_or(SettlementError::ArithmeticOverflow)?;
            }
        }
        Ok(owed.into_iter().collect())
    }

    /// Credit scanned debts and mark everything before `until` as settled.
    fn absorb_unattributed(
        &mut self,
        debts: Vec<(Timestamp, Amount)>,
        until: Timestamp,
        now: Timestamp,
    ) -> Result<(), PaymasterError> {
        self.credit_debts(debts, now)?;
        self.scanned_until = self.scanned_until.max(until);
        self.timeline.process(until)?;
        Ok(())
    }

    fn ensure_debt_room(&self, needed: usize) -> Result<(), SettlementError> {
        if needed > self.debts.remaining() {
            warn!(needed, capacity = self.debts.capacity(), "debt queue full");
            return Err(SettlementError::DebtQueueFull {
                capacity: self.debts.capacity(),
            });
        }
        Ok(())
    }

    /// Record debts and credit them into the period containing `now`.
    fn credit_debts<I>(&mut self, debts: I, now: Timestamp) -> Result<(), PaymasterError>
    where
        I: IntoIterator<Item = (Timestamp, Amount)>,
    {
        let credited_from = self.period().start_of(now);
        let credited_to = self.period().next_boundary(now);
        for (origin, amount) in debts {
            let index = self.debts.push(Debt {
                origin,
                credited_from,
                credited_to,
                amount,
            })?;
            self.timeline.add(credited_from, credited_to, amount)?;
            debug!(index, origin, amount = %amount, credited_to, "debt recorded");
            self.emit(LedgerEvent::DebtRecorded {
                index,
                origin,
                amount,
                credited_to,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Earliest claim boundary among recipients that may still claim
    /// retained history; the current period start if there are none.
    pub fn debt_watermark(&self) -> Timestamp {
        self.recipients
            .values()
            .filter(|r| r.holds_history())
            .map(|r| r.claimed_until)
            .min()
            .unwrap_or_else(|| self.current_period().0)
    }

    /// Latest instant history may be cleared up to: no recipient still
    /// claims from before it, every live source has paid for it, no late
    /// income from before it is unclaimed, and it is not in the future.
    pub fn clear_watermark(&self) -> Timestamp {
        let owed = self
            .credits
            .keys()
            .filter_map(|index| self.debts.get(*index))
            .map(|d| d.origin);
        self.sources
            .values()
            .map(|s| s.paid_until)
            .chain(owed)
            .fold(self.debt_watermark().min(self.current_period().0), Timestamp::min)
    }

    /// Drop head debts that nobody can still claim and whose window is
    /// behind every claim boundary.
    fn release_settled_debts(&mut self) -> usize {
        let watermark = self.debt_watermark();
        let credits = &self.credits;
        let released = self
            .debts
            .release_while(|index, debt| debt.credited_to <= watermark && !credits.contains_key(&index));
        if released > 0 {
            debug!(released, begin = self.debts.begin(), "debts released");
        }
        released
    }

    /// Drop history before `until` and garbage-collect settled removed
    /// recipients. Returns the new retained lower bound.
    pub fn clear_history(&mut self, caller: &Address, until: Timestamp) -> Result<Timestamp, PaymasterError> {
        self.authorize(caller, Operation::ClearHistory)?;
        let now = self.now();
        let current = self.period().start_of(now);
        let watermark = self.clear_watermark();
        if until > watermark {
            warn!(until, watermark, "clearing rejected: data still needed");
            return Err(SettlementError::ImportantDataRemoval { until, watermark }.into());
        }
        let unattributed = self.plan_unattributed(current)?;
        self.ensure_debt_room(unattributed.len())?;

        self.absorb_unattributed(unattributed, current, now)?;
        let cleared = self.timeline.clear(until)?;
        self.counts.clear(until);
        for r in self.recipients.values_mut() {
            r.payouts.retain(|p| p.to > until);
        }
        for s in self.sources.values_mut() {
            s.fundings.retain(|f| f.to > until);
        }
        let released = self.release_settled_debts();

        let credits = &self.credits;
        let settled: Vec<RecipientId> = self
            .recipients
            .values()
            .filter(|r| r.removed_at.is_some_and(|at| at <= until && r.claimed_until >= at))
            .filter(|r| !credits.values().any(|shares| shares.contains_key(&r.id)))
            .map(|r| r.id)
            .collect();
        for id in settled {
            self.counts.forget(&id)?;
            if let Some(r) = self.recipients.remove(&id) {
                self.by_address.remove(&r.address);
            }
            info!(id, "removed recipient dropped");
            self.emit(LedgerEvent::RecipientRemoved { id });
        }

        debug!(until = cleared, released, "history cleared");
        self.emit(LedgerEvent::HistoryCleared { until: cleared });
        Ok(cleared)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_max_replenishment_periods(&mut self, caller: &Address, periods: u32) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::Configure)?;
        if periods == 0 {
            return Err(SourceError::ReplenishmentTooSmall.into());
        }
        self.config.max_replenishment_periods = periods;
        info!(periods, "max replenishment periods set");
        self.emit(LedgerEvent::MaxReplenishmentPeriodsSet { periods });
        Ok(())
    }

    pub fn set_version(&mut self, caller: &Address, version: &str) -> Result<(), PaymasterError> {
        self.authorize(caller, Operation::Configure)?;
        self.config.version = version.to_string();
        info!(version, "version set");
        self.emit(LedgerEvent::VersionSet {
            version: version.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn source(&self, id: &SourceId) -> Option<&PaymentSource> {
        self.sources.get(id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &PaymentSource> {
        self.sources.values()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Labels of all sources, sorted.
    pub fn source_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.sources.values().map(|s| s.label.as_str()).collect();
        labels.sort_unstable();
        labels
    }

    pub fn source_paid_until(&self, id: &SourceId) -> Result<Timestamp, SourceError> {
        self.sources
            .get(id)
            .map(|s| s.paid_until)
            .ok_or(SourceError::SourceNotFound(*id))
    }

    pub fn recipient(&self, id: RecipientId) -> Option<&Recipient> {
        self.recipients.get(&id)
    }

    pub fn recipient_by_address(&self, address: &Address) -> Option<&Recipient> {
        self.by_address.get(address).and_then(|id| self.recipients.get(id))
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn resource_count(&self, id: RecipientId) -> Result<u64, RecipientError> {
        self.recipients
            .get(&id)
            .map(|r| r.resource_count)
            .ok_or(RecipientError::RecipientNotFound(id))
    }

    pub fn active_resource_count(&self, id: RecipientId) -> Result<u64, RecipientError> {
        self.recipients
            .get(&id)
            .map(|r| r.active_resource_count)
            .ok_or(RecipientError::RecipientNotFound(id))
    }

    /// Active resources of `id` at time `t`; 0 below the cleared bound.
    pub fn historical_active_count(&self, id: RecipientId, t: Timestamp) -> u64 {
        self.counts.value_at(&id, t)
    }

    /// Active resources of all recipients at time `t`.
    pub fn historical_total_active_count(&self, t: Timestamp) -> u64 {
        self.counts.aggregate_at(t)
    }

    /// Income credited to `[from, to)`.
    pub fn total_reward(&self, from: Timestamp, to: Timestamp) -> Result<Amount, TimelineError> {
        self.timeline.sum(from, to)
    }

    pub fn debts_begin(&self) -> u64 {
        self.debts.begin()
    }

    pub fn debts_end(&self) -> u64 {
        self.debts.end()
    }

    pub fn debt(&self, index: u64) -> Option<&Debt> {
        self.debts.get(index)
    }

    pub fn debts(&self) -> impl Iterator<Item = &Debt> {
        self.debts.iter()
    }

    pub fn history_start(&self) -> Timestamp {
        self.timeline.cleared_until()
    }

    pub fn pool_balance(&self) -> Amount {
        self.custody.pool_balance()
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Events since the last drain.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Take all buffered events.
    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("recipients", &self.recipients.len())
            .field("processed_until", &self.timeline.processed_until())
            .field("scanned_until", &self.scanned_until)
            .field("debts", &self.debts.len())
            .finish_non_exhaustive()
    }
}

/// `floor(value * num / den)` without overflow for `num <= den`.
fn mul_div(value: Amount, num: u64, den: u64) -> Amount {
    if den == 0 {
        return 0;
    }
    let (num, den) = (Amount::from(num), Amount::from(den));
    (value / den)
        .saturating_mul(num)
        .saturating_add((value % den) * num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, PriceFeed, RoleAuthority, Treasury};
    use paymaster_core::error::OracleError;
    use proptest::prelude::*;

    const ADMIN: Address = Address([0xAA; 20]);
    const PAYER: Address = Address([0xBB; 20]);
    const ALICE: Address = Address([0x01; 20]);
    const BOB: Address = Address([0x02; 20]);
    const START: Timestamp = 1_000;
    const FEE: Amount = 1_000;

    struct Fixture {
        engine: SettlementEngine,
        clock: ManualClock,
        treasury: Treasury,
        feed: PriceFeed,
    }

    /// 100-second periods, 1000 units per period, engine started at t=1000.
    fn fixture() -> Fixture {
        fixture_with(EngineConfig {
            period: Period::Fixed { seconds: 100 },
            ..EngineConfig::default()
        })
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let clock = ManualClock::new(START);
        let treasury = Treasury::new();
        treasury.mint(&PAYER, 1_000_000).unwrap();
        let feed = PriceFeed::new(FEE, u64::MAX);
        feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, START);
        let engine = SettlementEngine::new(
            config,
            Box::new(clock.clone()),
            Box::new(treasury.clone()),
            Box::new(feed.clone()),
            Box::new(RoleAuthority::new(ADMIN)),
        );
        Fixture { engine, clock, treasury, feed }
    }

    fn add_recipient(f: &mut Fixture, id: RecipientId, address: Address, count: u64) {
        f.engine.register_recipient(&ADMIN, id, address).unwrap();
        if count > 0 {
            f.engine.set_resource_count(&ADMIN, id, count).unwrap();
        }
    }

    // ------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------

    #[test]
    fn new_source_is_paid_until_next_boundary() {
        let mut f = fixture();
        f.clock.set(1_050);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        assert_eq!(f.engine.source_paid_until(&id).unwrap(), 1_100);
        assert_eq!(f.engine.source_labels(), vec!["schain-a"]);
        assert_eq!(f.engine.source_count(), 1);
    }

    #[test]
    fn duplicate_source_rejected() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        let err = f.engine.register_source(&ADMIN, "schain-a").unwrap_err();
        assert!(matches!(err, PaymasterError::Source(SourceError::DuplicateSource(d)) if d == id));
    }

    #[test]
    fn pay_extends_paid_until_and_funds_pool() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        assert_eq!(f.engine.pay(&PAYER, &id, 2).unwrap(), 1_300);
        assert_eq!(f.treasury.pool_balance(), 2 * FEE);
        assert_eq!(f.engine.total_reward(1_100, 1_300).unwrap(), 2 * FEE);
        assert_eq!(f.engine.total_reward(1_100, 1_200).unwrap(), FEE);
    }

    #[test]
    fn pay_zero_periods_rejected() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        assert!(matches!(
            f.engine.pay(&PAYER, &id, 0),
            Err(PaymasterError::Source(SourceError::ReplenishmentTooSmall))
        ));
    }

    #[test]
    fn replenishment_ceiling_counts_from_current_period() {
        let mut f = fixture_with(EngineConfig {
            period: Period::Fixed { seconds: 100 },
            max_replenishment_periods: 2,
            ..EngineConfig::default()
        });
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 2).unwrap();
        assert!(matches!(
            f.engine.pay(&PAYER, &id, 1),
            Err(PaymasterError::Source(SourceError::ReplenishmentTooLarge { periods: 1, max: 2 }))
        ));
        f.clock.set(1_100);
        assert_eq!(f.engine.pay(&PAYER, &id, 1).unwrap(), 1_400);
    }

    #[test]
    fn stale_price_leaves_state_unchanged() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        let feed = PriceFeed::new(FEE, 60);
        feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, 0);
        f.engine.oracle = Box::new(feed);
        let err = f.engine.pay(&PAYER, &id, 1).unwrap_err();
        assert!(matches!(err, PaymasterError::Oracle(OracleError::StalePrice { .. })));
        assert_eq!(f.engine.source_paid_until(&id).unwrap(), 1_100);
        assert_eq!(f.treasury.balance_of(&PAYER), 1_000_000);
    }

    #[test]
    fn unfunded_payer_leaves_state_unchanged() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        let err = f.engine.pay(&ALICE, &id, 1).unwrap_err();
        assert!(matches!(err, PaymasterError::Custody(CustodyError::InsufficientFunds { .. })));
        assert_eq!(f.engine.source_paid_until(&id).unwrap(), 1_100);
        assert_eq!(f.engine.total_reward(1_100, 1_200).unwrap(), 0);
    }

    #[test]
    fn per_period_remainder_lands_on_last_second() {
        let mut f = fixture();
        f.feed.set_fee_per_period(1_001);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 3).unwrap();
        // 1001 units per 100 s period: 10 per second, 1 left over on the
        // last second of each period
        assert_eq!(f.engine.total_reward(1_100, 1_400).unwrap(), 3_003);
        assert_eq!(f.engine.total_reward(1_199, 1_200).unwrap(), 11);
        assert_eq!(f.engine.total_reward(1_200, 1_299).unwrap(), 990);
        assert_eq!(f.engine.total_reward(1_399, 1_400).unwrap(), 11);
    }

    #[test]
    fn removing_source_refunds_future_periods() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 3).unwrap();
        f.clock.set(1_150);
        let refunded = f.engine.remove_source(&ADMIN, &id).unwrap();
        assert_eq!(refunded, 2 * FEE);
        assert_eq!(f.treasury.balance_of(&PAYER), 1_000_000 - FEE);
        assert_eq!(f.engine.total_reward(1_100, 1_200).unwrap(), FEE);
        assert_eq!(f.engine.total_reward(1_200, 1_400).unwrap(), 0);
        assert!(f.engine.source(&id).is_none());
    }

    #[test]
    fn removing_unknown_source_fails() {
        let mut f = fixture();
        let id = SourceId::from_label("missing");
        assert!(matches!(
            f.engine.remove_source(&ADMIN, &id),
            Err(PaymasterError::Source(SourceError::SourceNotFound(_)))
        ));
    }

    // ------------------------------------------------------------------
    // Recipients
    // ------------------------------------------------------------------

    #[test]
    fn duplicate_recipient_rejected() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 0);
        assert!(matches!(
            f.engine.register_recipient(&ADMIN, 1, BOB),
            Err(PaymasterError::Recipient(RecipientError::DuplicateId(1)))
        ));
        assert!(matches!(
            f.engine.register_recipient(&ADMIN, 2, ALICE),
            Err(PaymasterError::Recipient(RecipientError::DuplicateAddress(_)))
        ));
    }

    #[test]
    fn active_count_cannot_exceed_total() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 2);
        assert!(matches!(
            f.engine.set_active_resource_count(&ADMIN, 1, 3),
            Err(PaymasterError::Recipient(RecipientError::ActiveExceedsTotal { active: 3, total: 2 }))
        ));
        f.engine.set_active_resource_count(&ADMIN, 1, 1).unwrap();
        assert_eq!(f.engine.resource_count(1).unwrap(), 2);
        assert_eq!(f.engine.active_resource_count(1).unwrap(), 1);
    }

    #[test]
    fn removed_recipient_cannot_change_counts() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 2);
        f.clock.set(1_010);
        f.engine.remove_recipient(&ADMIN, 1).unwrap();
        assert!(matches!(
            f.engine.set_resource_count(&ADMIN, 1, 3),
            Err(PaymasterError::Recipient(RecipientError::Removed { id: 1, removed_at: 1_010 }))
        ));
        assert!(f.engine.remove_recipient(&ADMIN, 1).is_err());
        assert_eq!(f.engine.historical_active_count(1, 1_005), 2);
        assert_eq!(f.engine.historical_active_count(1, 1_010), 0);
    }

    #[test]
    fn same_instant_changes_collapse() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 2);
        f.engine.set_resource_count(&ADMIN, 1, 5).unwrap();
        assert_eq!(f.engine.historical_active_count(1, START), 5);
        assert_eq!(f.engine.historical_total_active_count(START), 5);
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    #[test]
    fn single_recipient_takes_full_period() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        f.clock.set(1_200);
        assert_eq!(f.engine.reward_amount(1).unwrap(), FEE);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
        assert_eq!(f.treasury.balance_of(&ALICE), FEE);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        assert_eq!(f.engine.recipient(1).unwrap().claimed_until, 1_200);
    }

    #[test]
    fn income_splits_by_active_count() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        add_recipient(&mut f, 2, BOB, 3);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        f.clock.set(1_250);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 250);
        assert_eq!(f.engine.claim_for(&ADMIN, 2, &BOB).unwrap(), 750);
        assert_eq!(f.treasury.pool_balance(), 0);
    }

    #[test]
    fn current_period_is_not_claimable() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        f.clock.set(1_199);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        f.clock.set(1_200);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
    }

    #[test]
    fn inactive_resources_stop_earning() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        add_recipient(&mut f, 2, BOB, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        f.clock.set(1_150);
        f.engine.set_active_resource_count(&ADMIN, 2, 0).unwrap();
        f.clock.set(1_200);
        // first half split evenly, second half all to ALICE
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 250 + 500);
        assert_eq!(f.engine.claim(&BOB, &BOB).unwrap(), 250);
    }

    #[test]
    fn unknown_caller_cannot_claim() {
        let mut f = fixture();
        assert!(matches!(
            f.engine.claim(&BOB, &BOB),
            Err(PaymasterError::Recipient(RecipientError::UnknownAddress(_)))
        ));
    }

    #[test]
    fn claim_for_requires_admin() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        assert!(matches!(
            f.engine.claim_for(&ALICE, 1, &ALICE),
            Err(PaymasterError::Settlement(SettlementError::Unauthorized { .. }))
        ));
    }

    #[test]
    fn income_without_active_resources_becomes_debt() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 0);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 2).unwrap();
        f.clock.set(1_200);
        f.engine.set_resource_count(&ADMIN, 1, 1).unwrap();
        f.clock.set(1_300);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
        assert_eq!(f.engine.debts_end() - f.engine.debts_begin(), 1);
        let debt = *f.engine.debt(0).unwrap();
        assert_eq!(debt.origin, 1_100);
        assert_eq!(debt.amount, FEE);
        assert_eq!((debt.credited_from, debt.credited_to), (1_300, 1_400));
        f.clock.set(1_400);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
        assert_eq!(f.treasury.pool_balance(), 0);
    }

    #[test]
    fn late_payment_is_claimable_at_once() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.clock.set(1_300);
        f.feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, 1_300);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        // overdue source pays for [1100, 1200), already settled
        f.engine.pay(&PAYER, &id, 1).unwrap();
        let debt = *f.engine.debt(0).unwrap();
        assert_eq!(debt.origin, 1_100);
        assert_eq!((debt.credited_from, debt.credited_to), (1_100, 1_200));
        assert_eq!(f.engine.reward_amount(1).unwrap(), FEE);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        assert_eq!((f.engine.debts_begin(), f.engine.debts_end()), (1, 1));
        assert_eq!(f.treasury.pool_balance(), 0);
    }

    #[test]
    fn late_payment_follows_counts_of_its_window() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        add_recipient(&mut f, 2, BOB, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.clock.set(1_150);
        f.engine.set_resource_count(&ADMIN, 2, 3).unwrap();
        f.clock.set(1_250);
        f.engine.set_resource_count(&ADMIN, 1, 0).unwrap();
        f.clock.set(1_300);
        f.feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, 1_300);
        f.engine.claim(&ALICE, &ALICE).unwrap();
        f.engine.claim(&BOB, &BOB).unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        // [1100, 1150) at 1:1, [1150, 1200) at 1:3
        assert_eq!(f.engine.reward_amount(1).unwrap(), 250 + 125);
        assert_eq!(f.engine.claim(&BOB, &BOB).unwrap(), 250 + 375);
        assert_eq!(f.engine.debts_begin(), 0);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 375);
        assert_eq!(f.engine.debts_begin(), 1);
    }

    #[test]
    fn late_payment_nobody_was_active_for_moves_to_current_period() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 0);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.clock.set(1_200);
        f.engine.set_resource_count(&ADMIN, 1, 1).unwrap();
        f.clock.set(1_300);
        f.feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, 1_300);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        f.engine.pay(&PAYER, &id, 1).unwrap();
        let debt = *f.engine.debt(0).unwrap();
        assert_eq!((debt.credited_from, debt.credited_to), (1_300, 1_400));
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 0);
        f.clock.set(1_400);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), FEE);
    }

    #[test]
    fn payout_windows_do_not_overlap() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 3).unwrap();
        for t in [1_150, 1_200, 1_250, 1_400] {
            f.clock.set(t);
            f.engine.claim(&ALICE, &ALICE).unwrap();
        }
        let windows: Vec<(Timestamp, Timestamp)> = f
            .engine
            .recipient(1)
            .unwrap()
            .payouts()
            .iter()
            .map(|p| (p.from, p.to))
            .collect();
        assert_eq!(windows, vec![(1_100, 1_200), (1_200, 1_400)]);
        f.engine.clear_history(&ADMIN, 1_200).unwrap();
        assert_eq!(f.engine.recipient(1).unwrap().payouts().len(), 1);
    }

    #[test]
    fn removed_recipient_keeps_elapsed_entitlement() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        add_recipient(&mut f, 2, BOB, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 1).unwrap();
        f.clock.set(1_150);
        f.engine.remove_recipient(&ADMIN, 2).unwrap();
        f.clock.set(1_200);
        assert_eq!(f.engine.claim(&BOB, &BOB).unwrap(), 250);
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 750);
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    #[test]
    fn clear_waits_for_removed_recipient_to_claim() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        add_recipient(&mut f, 2, BOB, 1);
        f.clock.set(1_150);
        f.engine.remove_recipient(&ADMIN, 2).unwrap();
        f.clock.set(1_200);
        f.engine.claim(&ALICE, &ALICE).unwrap();
        assert!(matches!(
            f.engine.clear_history(&ADMIN, 1_150),
            Err(PaymasterError::Settlement(SettlementError::ImportantDataRemoval { until: 1_150, watermark: 1_000 }))
        ));
        f.engine.claim(&BOB, &BOB).unwrap();
        assert_eq!(f.engine.clear_history(&ADMIN, 1_150).unwrap(), 1_150);
        assert!(f.engine.recipient(2).is_none());
        assert!(f.engine.recipient_by_address(&BOB).is_none());
        let events = f.engine.drain_events();
        assert!(events.contains(&LedgerEvent::RecipientRemoved { id: 2 }));
        assert_eq!(events.last(), Some(&LedgerEvent::HistoryCleared { until: 1_150 }));
    }

    #[test]
    fn cleared_history_reads_as_zero() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 2).unwrap();
        f.clock.set(1_300);
        f.engine.claim(&ALICE, &ALICE).unwrap();
        f.engine.clear_history(&ADMIN, 1_200).unwrap();
        assert_eq!(f.engine.total_reward(0, 1_200).unwrap(), 0);
        assert_eq!(f.engine.total_reward(1_200, 1_300).unwrap(), FEE);
        assert_eq!(f.engine.historical_active_count(1, 1_100), 0);
        assert_eq!(f.engine.historical_active_count(1, 1_250), 1);
        assert_eq!(f.engine.history_start(), 1_200);
    }

    #[test]
    fn clear_cannot_pass_current_period() {
        let mut f = fixture();
        f.clock.set(1_250);
        assert!(matches!(
            f.engine.clear_history(&ADMIN, 1_201),
            Err(PaymasterError::Settlement(SettlementError::ImportantDataRemoval { watermark: 1_200, .. }))
        ));
    }

    #[test]
    fn clear_waits_for_sources_to_pay() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 1);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.clock.set(1_300);
        f.feed.set_unit_price(paymaster_core::constants::ONE_TOKEN, 1_300);
        f.engine.claim(&ALICE, &ALICE).unwrap();
        assert!(matches!(
            f.engine.clear_history(&ADMIN, 1_300),
            Err(PaymasterError::Settlement(SettlementError::ImportantDataRemoval { watermark: 1_100, .. }))
        ));
        // paid, but the late share is still unclaimed
        f.engine.pay(&PAYER, &id, 2).unwrap();
        assert_eq!(f.engine.clear_watermark(), 1_100);
        assert!(f.engine.clear_history(&ADMIN, 1_300).is_err());
        assert_eq!(f.engine.claim(&ALICE, &ALICE).unwrap(), 2 * FEE);
        assert_eq!(f.engine.clear_history(&ADMIN, 1_300).unwrap(), 1_300);
        assert_eq!(f.engine.total_reward(0, 1_300).unwrap(), 0);
    }

    #[test]
    fn removing_a_source_unblocks_clearing() {
        let mut f = fixture();
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.clock.set(1_300);
        assert_eq!(f.engine.clear_watermark(), 1_100);
        f.engine.remove_source(&ADMIN, &id).unwrap();
        assert_eq!(f.engine.clear_watermark(), 1_300);
    }

    #[test]
    fn clear_releases_redistributed_debts() {
        let mut f = fixture();
        add_recipient(&mut f, 1, ALICE, 0);
        let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
        f.engine.pay(&PAYER, &id, 2).unwrap();
        f.clock.set(1_200);
        f.engine.set_resource_count(&ADMIN, 1, 1).unwrap();
        f.engine.claim(&ALICE, &ALICE).unwrap();
        assert_eq!(f.engine.debts_end(), 1);
        f.clock.set(1_300);
        f.engine.claim(&ALICE, &ALICE).unwrap();
        f.engine.clear_history(&ADMIN, 1_300).unwrap();
        assert_eq!(f.engine.debts_begin(), 1);
        assert!(f.engine.debt(0).is_none());
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    #[test]
    fn version_and_limits_are_admin_only() {
        let mut f = fixture();
        assert!(f.engine.set_version(&ALICE, "x").is_err());
        f.engine.set_version(&ADMIN, "paymaster-2").unwrap();
        assert_eq!(f.engine.version(), "paymaster-2");
        f.engine.set_max_replenishment_periods(&ADMIN, 3).unwrap();
        assert_eq!(f.engine.config().max_replenishment_periods, 3);
        let events = f.engine.drain_events();
        assert_eq!(
            events,
            vec![
                LedgerEvent::VersionSet { version: "paymaster-2".to_string() },
                LedgerEvent::MaxReplenishmentPeriodsSet { periods: 3 },
            ]
        );
        assert!(f.engine.events().is_empty());
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn claim_windows_add_up(
            changes in proptest::collection::vec((1u64..300, 0u64..4), 0..8),
            stops in proptest::collection::vec(1u64..400, 0..5),
        ) {
            // BOB's count moves at `changes`; ALICE claims at `stops` in one
            // run and only at the end in the other
            let run = |stops: &[u64]| -> (Amount, Amount) {
                let mut f = fixture();
                add_recipient(&mut f, 1, ALICE, 1);
                add_recipient(&mut f, 2, BOB, 1);
                let id = f.engine.register_source(&ADMIN, "schain-a").unwrap();
                f.engine.pay(&PAYER, &id, 3).unwrap();

                let mut timeline: Vec<(u64, Option<u64>)> = changes
                    .iter()
                    .map(|(t, count)| (*t, Some(*count)))
                    .chain(stops.iter().map(|t| (*t, None)))
                    .collect();
                timeline.sort();
                for (t, action) in timeline {
                    f.clock.set(START + t);
                    match action {
                        Some(count) => f.engine.set_resource_count(&ADMIN, 2, count).unwrap(),
                        None => {
                            f.engine.claim(&ALICE, &ALICE).unwrap();
                        }
                    }
                }
                f.clock.set(1_500);
                let alice = f.treasury.balance_of(&ALICE) + f.engine.claim(&ALICE, &ALICE).unwrap();
                f.engine.claim(&BOB, &BOB).unwrap();
                (alice, f.treasury.pool_balance())
            };

            let (split, _) = run(&stops);
            let (whole, pool) = run(&[]);
            prop_assert!(split <= whole);
            prop_assert!(whole - split <= stops.len() as Amount + 1);
            prop_assert!(pool <= 2 * (changes.len() as Amount + 3));
        }
    }

    #[test]
    fn mul_div_is_exact_floor() {
        assert_eq!(mul_div(10, 1, 3), 3);
        assert_eq!(mul_div(Amount::MAX, 1, 1), Amount::MAX);
        assert_eq!(mul_div(Amount::MAX, 2, 3), Amount::MAX / 3 * 2);
        assert_eq!(mul_div(5, 0, 0), 0);
    }
}
