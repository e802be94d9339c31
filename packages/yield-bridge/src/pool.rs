//! Yield pool ledger
//!
//! Holds deposited principal per depositor and accrues simple interest in
//! whole periods. Liquidity is the pool's cash: deposits plus owner-seeded
//! reserve, minus everything paid out. Yield that has accrued but not been
//! paid is a liability that only becomes payable when cash covers it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::types::{Address, Amount, BPS_DENOMINATOR};

/// Default yield rate (5%)
pub const DEFAULT_YIELD_RATE_BPS: u32 = 500;

/// Default accrual period (one year)
pub const DEFAULT_ACCRUAL_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub address: Address,
    pub owner: Address,
    pub yield_rate_bps: u32,
    pub accrual_period_secs: u64,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if u128::from(self.yield_rate_bps) > BPS_DENOMINATOR {
            return Err(BridgeError::InvalidAmount {
                reason: format!(
                    "yield rate {} bps exceeds {}",
                    self.yield_rate_bps, BPS_DENOMINATOR
                ),
            });
        }
        if self.accrual_period_secs == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "accrual period must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A depositor's stake in the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub principal: Amount,
    pub accrued_yield: Amount,
    /// Start of the current, not yet settled, accrual period
    pub last_accrual: u64,
}

impl Position {
    pub fn balance(&self) -> Amount {
        self.principal.saturating_add(self.accrued_yield)
    }
}

/// Aggregate pool accounting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub total_deposits: Amount,
    /// Principal paid out
    pub total_withdrawn: Amount,
    pub total_yield_accrued: Amount,
    pub total_yield_paid: Amount,
    pub total_liquidity_added: Amount,
    pub yield_rate_bps: u32,
}

impl PoolState {
    /// Cash on hand. `None` if payouts ever exceeded inflows.
    pub fn checked_liquidity(&self) -> Option<Amount> {
        self.total_deposits
            .checked_add(self.total_liquidity_added)?
            .checked_sub(self.total_withdrawn)?
            .checked_sub(self.total_yield_paid)
    }

    pub fn liquidity(&self) -> Amount {
        self.checked_liquidity().unwrap_or(0)
    }

    pub fn outstanding_yield(&self) -> Amount {
        self.total_yield_accrued
            .saturating_sub(self.total_yield_paid)
    }
}

/// Read-only pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_deposits: Amount,
    pub total_withdrawn: Amount,
    pub total_yield_accrued: Amount,
    pub total_yield_paid: Amount,
    pub total_liquidity_added: Amount,
    pub outstanding_yield: Amount,
    pub yield_rate_bps: u32,
    pub liquidity: Amount,
}

/// Split of a successful pool withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub released: Amount,
    pub principal_portion: Amount,
    pub yield_portion: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldPool {
    config: PoolConfig,
    state: PoolState,
    positions: BTreeMap<Address, Position>,
}

impl YieldPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let state = PoolState {
            yield_rate_bps: config.yield_rate_bps,
            ..Default::default()
        };
        Ok(Self {
            config,
            state,
            positions: BTreeMap::new(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.config.address
    }

    pub fn owner(&self) -> &Address {
        &self.config.owner
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> &PoolState {
        &self.state
    }

    pub fn depositors(&self) -> impl Iterator<Item = &Address> {
        self.positions.keys()
    }

    /// Yield owed for whole periods elapsed since `last_accrual`
    ///
    /// Returns the yield and the number of periods it covers. The yield is
    /// `None` when it does not fit in an [`Amount`].
    fn pending_accrual(&self, position: &Position, now: u64) -> (Option<Amount>, u64) {
        let elapsed = now.saturating_sub(position.last_accrual);
        let periods = elapsed / self.config.accrual_period_secs;
        if periods == 0 || position.principal == 0 {
            return (Some(0), periods);
        }
        let pending = position
            .principal
            .checked_mul(u128::from(self.config.yield_rate_bps))
            .map(|scaled| scaled / BPS_DENOMINATOR)
            .and_then(|per_period| per_period.checked_mul(u128::from(periods)));
        (pending, periods)
    }

    /// Position with accrual up to `now` applied, without mutating
    pub fn position(&self, depositor: &Address, now: u64) -> Position {
        let Some(stored) = self.positions.get(depositor) else {
            return Position::default();
        };
        let (pending, periods) = self.pending_accrual(stored, now);
        Position {
            principal: stored.principal,
            accrued_yield: stored
                .accrued_yield
                .saturating_add(pending.unwrap_or(Amount::MAX)),
            last_accrual: stored.last_accrual + periods * self.config.accrual_period_secs,
        }
    }

    /// Like [`YieldPool::position`], but fails instead of saturating
    pub fn checked_position(&self, depositor: &Address, now: u64) -> Result<Position> {
        let Some(stored) = self.positions.get(depositor) else {
            return Ok(Position::default());
        };
        let (pending, periods) = self.pending_accrual(stored, now);
        let accrued_yield = pending
            .and_then(|pending| stored.accrued_yield.checked_add(pending))
            .ok_or(BridgeError::Overflow)?;
        Ok(Position {
            principal: stored.principal,
            accrued_yield,
            last_accrual: stored.last_accrual + periods * self.config.accrual_period_secs,
        })
    }

    /// Settle the depositor's accrual up to `now`
    pub fn accrue(&mut self, depositor: &Address, now: u64) -> Result<Position> {
        let period = self.config.accrual_period_secs;
        let Some(stored) = self.positions.get(depositor).copied() else {
            return Ok(Position::default());
        };
        let (pending, periods) = self.pending_accrual(&stored, now);
        if periods == 0 {
            return Ok(stored);
        }
        let pending = pending.ok_or(BridgeError::Overflow)?;

        let updated = Position {
            principal: stored.principal,
            accrued_yield: stored
                .accrued_yield
                .checked_add(pending)
                .ok_or(BridgeError::Overflow)?,
            last_accrual: stored.last_accrual + periods * period,
        };
        self.state.total_yield_accrued = self
            .state
            .total_yield_accrued
            .checked_add(pending)
            .ok_or(BridgeError::Overflow)?;
        self.positions.insert(depositor.clone(), updated);

        if pending > 0 {
            debug!(
                depositor = %depositor,
                periods = periods,
                accrued = pending,
                "Settled yield accrual"
            );
        }
        Ok(updated)
    }

    /// Add principal for a depositor, settling prior accrual first
    pub fn deposit(&mut self, depositor: &Address, amount: Amount, now: u64) -> Result<()> {
        if amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "deposit amount must be greater than 0".to_string(),
            });
        }

        let mut position = self.accrue(depositor, now)?;
        let new_total = self
            .state
            .total_deposits
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;

        if position.principal == 0 {
            position.last_accrual = now;
        }
        position.principal = position
            .principal
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;

        self.positions.insert(depositor.clone(), position);
        self.state.total_deposits = new_total;

        debug!(
            depositor = %depositor,
            amount = amount,
            principal = position.principal,
            "Pool deposit"
        );
        Ok(())
    }

    /// Pay out `amount` to a depositor, yield first
    ///
    /// Fails without touching state if the position or the pool's cash is short.
    pub fn withdraw(&mut self, depositor: &Address, amount: Amount, now: u64) -> Result<Withdrawal> {
        if amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "withdraw amount must be greater than 0".to_string(),
            });
        }

        let view = self.position(depositor, now);
        if amount > view.balance() {
            return Err(BridgeError::ExceedsPosition {
                requested: amount,
                available: view.balance(),
            });
        }
        let liquidity = self.state.liquidity();
        if amount > liquidity {
            return Err(BridgeError::InsufficientLiquidity {
                requested: amount,
                available: liquidity,
            });
        }

        let mut position = self.accrue(depositor, now)?;
        let yield_portion = amount.min(position.accrued_yield);
        let principal_portion = amount - yield_portion;

        position.accrued_yield -= yield_portion;
        position.principal -= principal_portion;
        self.positions.insert(depositor.clone(), position);

        self.state.total_yield_paid += yield_portion;
        self.state.total_withdrawn += principal_portion;

        debug!(
            depositor = %depositor,
            amount = amount,
            principal_portion = principal_portion,
            yield_portion = yield_portion,
            "Pool withdrawal"
        );
        Ok(Withdrawal {
            released: amount,
            principal_portion,
            yield_portion,
        })
    }

    /// Seed the pool with reserve cash (owner only)
    pub fn add_liquidity(&mut self, caller: &Address, amount: Amount) -> Result<()> {
        if caller != &self.config.owner {
            return Err(BridgeError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        if amount == 0 {
            return Err(BridgeError::InvalidAmount {
                reason: "liquidity amount must be greater than 0".to_string(),
            });
        }
        self.state.total_liquidity_added = self
            .state
            .total_liquidity_added
            .checked_add(amount)
            .ok_or(BridgeError::Overflow)?;

        info!(
            amount = amount,
            liquidity = self.state.liquidity(),
            "Liquidity added"
        );
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            total_deposits: self.state.total_deposits,
            total_withdrawn: self.state.total_withdrawn,
            total_yield_accrued: self.state.total_yield_accrued,
            total_yield_paid: self.state.total_yield_paid,
            total_liquidity_added: self.state.total_liquidity_added,
            outstanding_yield: self.state.outstanding_yield(),
            yield_rate_bps: self.state.yield_rate_bps,
            liquidity: self.state.liquidity(),
        }
    }

    pub fn user_deposit(&self, depositor: &Address) -> Amount {
        self.positions
            .get(depositor)
            .map(|p| p.principal)
            .unwrap_or(0)
    }

    pub fn user_yield_earned(&self, depositor: &Address, now: u64) -> Amount {
        self.position(depositor, now).accrued_yield
    }

    /// Verify the aggregates reconcile with the per-depositor positions
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.state.checked_liquidity().is_none() {
            return Err("payouts exceed pool inflows".to_string());
        }

        let principal: Amount = self.positions.values().map(|p| p.principal).sum();
        let expected_principal = self
            .state
            .total_deposits
            .saturating_sub(self.state.total_withdrawn);
        if principal != expected_principal {
            return Err(format!(
                "principal {} does not match deposits minus withdrawals {}",
                principal, expected_principal
            ));
        }

        let accrued: Amount = self.positions.values().map(|p| p.accrued_yield).sum();
        if accrued != self.state.outstanding_yield() {
            return Err(format!(
                "accrued yield {} does not match outstanding yield {}",
                accrued,
                self.state.outstanding_yield()
            ));
        }
        Ok(())
    }
}
