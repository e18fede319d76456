// 2.4: the ledger's view of the host key/value stores.
// one committed store (survives blocks) and one transient store (wiped at every block
// boundary). both are ordered byte maps; all the exchange ever needs is point lookups,
// prefix scans and bounded range scans.
//
// rollback scopes are journals, not copies: each open checkpoint records the prior value of
// the first write to every key it touches, so undoing a scope costs what the scope wrote.
//
// iterators borrow the store, so nothing can write while a scan is open. callers collect
// what they need, drop the iterator, then mutate. every handle is counted so a leak shows
// up in tests instead of silently pinning store state.

use crate::gas::{GasMeter, KvGasConfig};
use crate::keys::{add_bit_to_prefix, decode_signed_dec, decode_unsigned_dec, encode_signed_dec, encode_unsigned_dec};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Raised only for data the ledger wrote itself. never a user error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("corrupted record at key {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("failed to encode record for key {key}: {reason}")]
    Encode { key: String, reason: String },
}

impl StoreError {
    pub fn corrupted(key: &[u8], reason: impl ToString) -> Self {
        Self::Corrupted {
            key: hex::encode(key),
            reason: reason.to_string(),
        }
    }
}

pub trait KvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn set(&mut self, key: &[u8], value: Vec<u8>);

    fn delete(&mut self, key: &[u8]);

    /// Half-open `[start, end)` scan in ascending byte order, or descending when `reverse`.
    /// `None` bounds are unbounded.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>, reverse: bool) -> StoreIter<'_>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Live handle over a range. Dropping it releases the handle, whichever way the
/// consuming code exits.
pub struct StoreIter<'a> {
    inner: Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>,
    open: Arc<AtomicUsize>,
    meter: Option<(&'a GasMeter, u64)>,
}

impl<'a> StoreIter<'a> {
    fn new(
        inner: Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>,
        open: Arc<AtomicUsize>,
        meter: Option<(&'a GasMeter, u64)>,
    ) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self { inner, open, meter }
    }
}

impl<'a> Iterator for StoreIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        if let Some((meter, cost)) = self.meter {
            meter.charge(cost + item.1.len() as u64, "iter next");
        }
        Some(item)
    }
}

impl Drop for StoreIter<'_> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Prior values of the keys written since a scope opened; `None` means the key was absent.
type Journal = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct MemStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    open_iterators: Arc<AtomicUsize>,
    scopes: Vec<Journal>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        let data = std::mem::take(&mut self.data);
        if let Some(journal) = self.scopes.last_mut() {
            for (key, value) in data {
                journal.entry(key).or_insert(Some(value));
            }
        }
    }

    pub fn open_iterators(&self) -> usize {
        self.open_iterators.load(Ordering::SeqCst)
    }

    fn range_iter<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
        meter: Option<(&'a GasMeter, u64)>,
    ) -> StoreIter<'a> {
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));

        // BTreeMap::range panics on an inverted range; an empty scan is the right answer
        let inverted = matches!((start, end), (Some(s), Some(e)) if s >= e);
        let inner: Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a> = if inverted {
            Box::new(std::iter::empty())
        } else {
            let range = self
                .data
                .range::<Vec<u8>, _>((lower, upper))
                .map(|(k, v)| (k.as_slice(), v.as_slice()));
            if reverse {
                Box::new(range.rev())
            } else {
                Box::new(range)
            }
        };

        StoreIter::new(inner, Arc::clone(&self.open_iterators), meter)
    }

    fn record(&mut self, key: &[u8], prior: Option<Vec<u8>>) {
        if let Some(journal) = self.scopes.last_mut() {
            if !journal.contains_key(key) {
                journal.insert(key.to_vec(), prior);
            }
        }
    }

    fn open_scope(&mut self) -> usize {
        self.scopes.push(Journal::new());
        self.scopes.len()
    }

    /// Closes the scope opened at `depth` and any left open inside it. Kept scopes fold
    /// into their parent, where an older prior for the same key wins.
    fn close_scope(&mut self, depth: usize, keep: bool) {
        while self.scopes.len() >= depth {
            let Some(journal) = self.scopes.pop() else {
                break;
            };
            if keep {
                if let Some(parent) = self.scopes.last_mut() {
                    for (key, prior) in journal {
                        parent.entry(key).or_insert(prior);
                    }
                }
                continue;
            }
            for (key, prior) in journal {
                match prior {
                    Some(value) => {
                        self.data.insert(key, value);
                    }
                    None => {
                        self.data.remove(&key);
                    }
                }
            }
        }
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        let prior = self.data.insert(key.to_vec(), value);
        self.record(key, prior);
    }

    fn delete(&mut self, key: &[u8]) {
        if let Some(prior) = self.data.remove(key) {
            self.record(key, Some(prior));
        }
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>, reverse: bool) -> StoreIter<'_> {
        self.range_iter(start, end, reverse, None)
    }
}

/// Scoped iteration. The handle is released on every exit path: normal end, early stop,
/// an error from the callback, or a panic unwinding through it.
pub fn iterate_safe<S, E, F>(
    store: &S,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    reverse: bool,
    mut callback: F,
) -> Result<(), E>
where
    S: KvStore + ?Sized,
    F: FnMut(&[u8], &[u8]) -> Result<bool, E>,
{
    let iter = store.iterator(start, end, reverse);
    for (key, value) in iter {
        if callback(key, value)? {
            break;
        }
    }
    Ok(())
}

/// Every key starting with `prefix`.
pub fn iterate_prefix<S, E, F>(store: &S, prefix: &[u8], reverse: bool, callback: F) -> Result<(), E>
where
    S: KvStore + ?Sized,
    F: FnMut(&[u8], &[u8]) -> Result<bool, E>,
{
    let end = add_bit_to_prefix(prefix);
    iterate_safe(store, Some(prefix), end.as_deref(), reverse, callback)
}

/// Keys under `prefix` with the prefix stripped, paired with their values.
pub fn collect_prefix<S: KvStore + ?Sized>(store: &S, prefix: &[u8], reverse: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let _ = iterate_prefix::<_, (), _>(store, prefix, reverse, |k, v| {
        out.push((k[prefix.len()..].to_vec(), v.to_vec()));
        Ok(false)
    });
    out
}

// 2.5: record codec. values are JSON; keys never are.

pub fn marshal<T: Serialize>(key: &[u8], record: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::Encode {
        key: hex::encode(key),
        reason: e.to_string(),
    })
}

pub fn unmarshal<T: DeserializeOwned>(key: &[u8], raw: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(raw).map_err(|e| StoreError::corrupted(key, e))
}

pub fn get_record<S: KvStore + ?Sized, T: DeserializeOwned>(store: &S, key: &[u8]) -> Result<Option<T>, StoreError> {
    match store.get(key) {
        Some(raw) => unmarshal(key, &raw).map(Some),
        None => Ok(None),
    }
}

pub fn set_record<S: KvStore + ?Sized, T: Serialize>(store: &mut S, key: &[u8], record: &T) -> Result<(), StoreError> {
    let raw = marshal(key, record)?;
    store.set(key, raw);
    Ok(())
}

pub fn get_unsigned_dec<S: KvStore + ?Sized>(store: &S, key: &[u8]) -> Result<Decimal, StoreError> {
    match store.get(key) {
        Some(raw) => decode_unsigned_dec(&raw).map_err(|e| StoreError::corrupted(key, e)),
        None => Ok(Decimal::ZERO),
    }
}

/// Zero deletes the entry; absent reads back as zero.
pub fn set_unsigned_dec<S: KvStore + ?Sized>(store: &mut S, key: &[u8], value: Decimal) {
    if value.is_zero() {
        store.delete(key);
    } else {
        store.set(key, encode_unsigned_dec(value).to_vec());
    }
}

pub fn get_signed_dec<S: KvStore + ?Sized>(store: &S, key: &[u8]) -> Result<Decimal, StoreError> {
    match store.get(key) {
        Some(raw) => decode_signed_dec(&raw).map_err(|e| StoreError::corrupted(key, e)),
        None => Ok(Decimal::ZERO),
    }
}

pub fn set_signed_dec<S: KvStore + ?Sized>(store: &mut S, key: &[u8], value: Decimal) {
    if value.is_zero() {
        store.delete(key);
    } else {
        store.set(key, encode_signed_dec(value).to_vec());
    }
}

/// An open rollback scope over both stores. Every checkpoint must end in exactly one of
/// [`Ledger::rollback_to`] or [`Ledger::discard_checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Checkpoint(usize);

/// Committed + transient stores with gas metering on the committed side.
#[derive(Debug)]
pub struct Ledger {
    committed: MemStore,
    transient: MemStore,
    gas: GasMeter,
    gas_config: KvGasConfig,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            committed: MemStore::new(),
            transient: MemStore::new(),
            gas: GasMeter::infinite(),
            gas_config: KvGasConfig::default(),
        }
    }

    pub fn transient(&self) -> &MemStore {
        &self.transient
    }

    pub fn transient_mut(&mut self) -> &mut MemStore {
        &mut self.transient
    }

    pub fn committed(&self) -> &MemStore {
        &self.committed
    }

    pub fn clear_transient(&mut self) {
        self.transient.clear();
    }

    pub fn gas(&self) -> &GasMeter {
        &self.gas
    }

    /// Swap in a new meter and hand back the old one.
    pub fn replace_gas_meter(&mut self, meter: GasMeter) -> GasMeter {
        std::mem::replace(&mut self.gas, meter)
    }

    pub fn set_gas_config(&mut self, config: KvGasConfig) {
        self.gas_config = config;
    }

    pub fn open_iterators(&self) -> usize {
        self.committed.open_iterators() + self.transient.open_iterators()
    }

    /// Opens a scope whose writes can be undone. Scopes nest.
    pub fn checkpoint(&mut self) -> Checkpoint {
        let depth = self.committed.open_scope();
        self.transient.open_scope();
        Checkpoint(depth)
    }

    /// Undoes every write made since `checkpoint`, inner scopes included.
    pub fn rollback_to(&mut self, checkpoint: Checkpoint) {
        self.committed.close_scope(checkpoint.0, false);
        self.transient.close_scope(checkpoint.0, false);
    }

    /// Keeps the scope's writes. Inside another scope they stay undoable by that one.
    pub fn discard_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.committed.close_scope(checkpoint.0, true);
        self.transient.close_scope(checkpoint.0, true);
    }

    pub fn open_checkpoints(&self) -> usize {
        self.committed.scopes.len()
    }
}

impl KvStore for Ledger {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let value = self.committed.get(key);
        let len = value.as_ref().map_or(0, Vec::len) as u64;
        self.gas
            .charge(self.gas_config.read_cost_flat + self.gas_config.read_cost_per_byte * len, "read");
        value
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) {
        let len = (key.len() + value.len()) as u64;
        self.gas
            .charge(self.gas_config.write_cost_flat + self.gas_config.write_cost_per_byte * len, "write");
        self.committed.set(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.gas.charge(self.gas_config.delete_cost, "delete");
        self.committed.delete(key);
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>, reverse: bool) -> StoreIter<'_> {
        self.committed
            .range_iter(start, end, reverse, Some((&self.gas, self.gas_config.iter_next_cost_flat)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(keys: &[&[u8]]) -> MemStore {
        let mut store = MemStore::new();
        for k in keys {
            store.set(k, k.to_vec());
        }
        store
    }

    #[test]
    fn range_is_half_open() {
        let store = store_with(&[&[1], &[2], &[3], &[4]]);
        let keys: Vec<Vec<u8>> = store.iterator(Some(&[2]), Some(&[4]), false).map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![vec![2], vec![3]]);

        let rev: Vec<Vec<u8>> = store.iterator(Some(&[2]), Some(&[4]), true).map(|(k, _)| k.to_vec()).collect();
        assert_eq!(rev, vec![vec![3], vec![2]]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let store = store_with(&[&[1], &[2]]);
        assert_eq!(store.iterator(Some(&[5]), Some(&[1]), false).count(), 0);
        assert_eq!(store.open_iterators(), 0);
    }

    #[test]
    fn prefix_scan_stops_at_prefix_end() {
        let store = store_with(&[&[1, 0], &[1, 255], &[2, 0]]);
        let got = collect_prefix(&store, &[1], false);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, vec![0]);
    }

    #[test]
    fn iterator_released_on_callback_error() {
        let store = store_with(&[&[1], &[2], &[3]]);
        let res: Result<(), &str> = iterate_safe(&store, None, None, false, |k, _| {
            if k == [2] {
                Err("boom")
            } else {
                Ok(false)
            }
        });
        assert_eq!(res, Err("boom"));
        assert_eq!(store.open_iterators(), 0);
    }

    #[test]
    fn iterator_released_on_panic() {
        let store = store_with(&[&[1], &[2]]);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), ()> = iterate_safe(&store, None, None, false, |_, _| panic!("callback panicked"));
        }));
        assert!(outcome.is_err());
        assert_eq!(store.open_iterators(), 0);
    }

    #[test]
    fn zero_decimal_deletes() {
        let mut store = MemStore::new();
        set_signed_dec(&mut store, b"k", Decimal::new(-5, 1));
        assert_eq!(get_signed_dec(&store, b"k").unwrap(), Decimal::new(-5, 1));
        set_signed_dec(&mut store, b"k", Decimal::ZERO);
        assert!(!store.has(b"k"));
        assert_eq!(get_signed_dec(&store, b"k").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn corrupted_record_is_reported() {
        let mut store = MemStore::new();
        store.set(b"k", b"not json".to_vec());
        let res: Result<Option<u32>, _> = get_record(&store, b"k");
        assert!(matches!(res, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn rollback_restores_both_stores() {
        let mut ledger = Ledger::new();
        ledger.set(b"a", vec![1]);
        ledger.transient_mut().set(b"t", vec![1]);
        let checkpoint = ledger.checkpoint();

        ledger.set(b"b", vec![2]);
        ledger.set(b"a", vec![9]);
        ledger.transient_mut().delete(b"t");
        ledger.rollback_to(checkpoint);

        assert_eq!(ledger.committed().get(b"a"), Some(vec![1]));
        assert!(!ledger.has(b"b"));
        assert!(ledger.transient().has(b"t"));
        assert_eq!(ledger.open_checkpoints(), 0);
    }

    #[test]
    fn nested_checkpoints_undo_only_their_own_writes() {
        let mut ledger = Ledger::new();
        ledger.set(b"a", vec![1]);
        let outer = ledger.checkpoint();
        ledger.set(b"a", vec![2]);
        ledger.set(b"b", vec![2]);

        let inner = ledger.checkpoint();
        ledger.set(b"a", vec![3]);
        ledger.delete(b"b");
        ledger.transient_mut().set(b"t", vec![3]);
        ledger.rollback_to(inner);
        assert_eq!(ledger.committed().get(b"a"), Some(vec![2]));
        assert_eq!(ledger.committed().get(b"b"), Some(vec![2]));
        assert!(!ledger.transient().has(b"t"));

        // a kept inner scope is still undone by the outer one
        let inner = ledger.checkpoint();
        ledger.set(b"a", vec![4]);
        ledger.set(b"c", vec![4]);
        ledger.discard_checkpoint(inner);
        assert_eq!(ledger.committed().get(b"c"), Some(vec![4]));
        ledger.rollback_to(outer);

        assert_eq!(ledger.committed().get(b"a"), Some(vec![1]));
        assert!(!ledger.has(b"b"));
        assert!(!ledger.has(b"c"));
        assert_eq!(ledger.open_checkpoints(), 0);
    }

    #[test]
    fn kept_writes_outlive_the_checkpoint() {
        let mut ledger = Ledger::new();
        let checkpoint = ledger.checkpoint();
        ledger.set(b"a", vec![1]);
        ledger.transient_mut().set(b"t", vec![1]);
        ledger.transient_mut().clear();
        ledger.discard_checkpoint(checkpoint);

        assert!(ledger.has(b"a"));
        assert!(ledger.transient().is_empty());
        assert_eq!(ledger.open_checkpoints(), 0);
    }

    #[test]
    fn cleared_transient_comes_back_on_rollback() {
        let mut ledger = Ledger::new();
        ledger.transient_mut().set(b"x", vec![1]);
        ledger.transient_mut().set(b"y", vec![2]);
        let checkpoint = ledger.checkpoint();
        ledger.clear_transient();
        ledger.transient_mut().set(b"z", vec![3]);
        ledger.rollback_to(checkpoint);

        assert_eq!(ledger.transient().get(b"x"), Some(vec![1]));
        assert_eq!(ledger.transient().get(b"y"), Some(vec![2]));
        assert!(!ledger.transient().has(b"z"));
    }

    #[test]
    fn ledger_charges_gas() {
        let mut ledger = Ledger::new();
        ledger.replace_gas_meter(GasMeter::new(1_000_000));
        ledger.set(b"key", vec![0; 10]);
        let after_write = ledger.gas().consumed();
        assert_eq!(after_write, 2000 + 30 * 13);
        let _ = ledger.get(b"key");
        assert_eq!(ledger.gas().consumed(), after_write + 1000 + 3 * 10);
    }
}
