//! Read-through cache of validator records from the staking collaborator.
//!
//! Used when pricing staked balances (fee-discount tiers live outside this crate). One
//! cache is built per call tree and dropped afterwards. Readers share the lock; a miss
//! upgrades to the write lock, re-checks, then loads from the registry.

use crate::types::Address;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRecord {
    pub operator: Address,
    pub tokens: Decimal,
    pub delegator_shares: Decimal,
    pub bonded: bool,
}

impl ValidatorRecord {
    pub fn tokens_from_shares(&self, shares: Decimal) -> Decimal {
        if self.delegator_shares.is_zero() {
            return Decimal::ZERO;
        }
        shares * self.tokens / self.delegator_shares
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub validator: Address,
    pub shares: Decimal,
}

pub trait StakingRegistry: Sync {
    fn validator(&self, operator: &Address) -> Option<ValidatorRecord>;
    fn delegations(&self, delegator: &Address) -> Vec<Delegation>;
}

pub struct ValidatorCache<'a, R: StakingRegistry + ?Sized> {
    registry: &'a R,
    validators: RwLock<HashMap<Address, Option<ValidatorRecord>>>,
}

impl<'a, R: StakingRegistry + ?Sized> ValidatorCache<'a, R> {
    pub fn new(registry: &'a R) -> Self {
        Self {
            registry,
            validators: RwLock::new(HashMap::new()),
        }
    }

    pub fn validator(&self, operator: &Address) -> Option<ValidatorRecord> {
        if let Ok(cached) = self.validators.read() {
            if let Some(record) = cached.get(operator) {
                return record.clone();
            }
        }

        let Ok(mut cached) = self.validators.write() else {
            return self.registry.validator(operator);
        };
        // another writer may have filled it while we waited
        cached
            .entry(*operator)
            .or_insert_with(|| self.registry.validator(operator))
            .clone()
    }

    /// Token value of everything `delegator` has delegated to bonded validators.
    pub fn staked_amount(&self, delegator: &Address) -> Decimal {
        self.registry
            .delegations(delegator)
            .iter()
            .filter_map(|d| {
                let validator = self.validator(&d.validator)?;
                validator.bonded.then(|| validator.tokens_from_shares(d.shares))
            })
            .sum()
    }

    pub fn cached_len(&self) -> usize {
        self.validators.read().map_or(0, |c| c.len())
    }
}

/// Fixed registry for simulations and tests. counts lookups so cache hits are visible.
#[derive(Debug, Default)]
pub struct StaticStakingRegistry {
    validators: HashMap<Address, ValidatorRecord>,
    delegations: HashMap<Address, Vec<Delegation>>,
    lookups: AtomicUsize,
}

impl StaticStakingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(mut self, record: ValidatorRecord) -> Self {
        self.validators.insert(record.operator, record);
        self
    }

    pub fn with_delegation(mut self, delegator: Address, delegation: Delegation) -> Self {
        self.delegations.entry(delegator).or_default().push(delegation);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl StakingRegistry for StaticStakingRegistry {
    fn validator(&self, operator: &Address) -> Option<ValidatorRecord> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.validators.get(operator).cloned()
    }

    fn delegations(&self, delegator: &Address) -> Vec<Delegation> {
        self.delegations.get(delegator).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::thread;

    fn registry() -> StaticStakingRegistry {
        let delegator = Address([9; 20]);
        StaticStakingRegistry::new()
            .with_validator(ValidatorRecord {
                operator: Address([1; 20]),
                tokens: dec!(1000),
                delegator_shares: dec!(500),
                bonded: true,
            })
            .with_validator(ValidatorRecord {
                operator: Address([2; 20]),
                tokens: dec!(100),
                delegator_shares: dec!(100),
                bonded: false,
            })
            .with_delegation(delegator, Delegation { validator: Address([1; 20]), shares: dec!(10) })
            .with_delegation(delegator, Delegation { validator: Address([2; 20]), shares: dec!(50) })
            .with_delegation(delegator, Delegation { validator: Address([3; 20]), shares: dec!(1) })
    }

    #[test]
    fn staked_amount_counts_bonded_only() {
        let registry = registry();
        let cache = ValidatorCache::new(&registry);
        assert_eq!(cache.staked_amount(&Address([9; 20])), dec!(20));
        assert_eq!(cache.staked_amount(&Address([8; 20])), Decimal::ZERO);
    }

    #[test]
    fn misses_are_cached_too() {
        let registry = registry();
        let cache = ValidatorCache::new(&registry);
        cache.staked_amount(&Address([9; 20]));
        cache.staked_amount(&Address([9; 20]));
        assert_eq!(registry.lookups(), 3);
        assert_eq!(cache.cached_len(), 3);
    }

    #[test]
    fn concurrent_readers_load_once() {
        let registry = registry();
        let cache = ValidatorCache::new(&registry);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        assert!(cache.validator(&Address([1; 20])).is_some());
                    }
                });
            }
        });
        assert_eq!(registry.lookups(), 1);
    }
}
