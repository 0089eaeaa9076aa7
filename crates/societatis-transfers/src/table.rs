//! Multi-index record table.
//!
//! One primary map keyed by [`TransferId`] plus auxiliary indices by output
//! descriptor, containing transaction and (for spent records) spending
//! transaction. Every insert and remove updates all indices together.

use crate::descriptor::SpentOutputDescriptor;
use crate::records::{OutputRecord, SpentOutputRecord};
use societatis_types::Hash;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Record identity. Allocated once per output and kept when the output moves
/// between tables, so id order is supply order.
pub type TransferId = u64;

/// Lookup keys a record exposes to its table.
pub trait Indexed {
    fn descriptor(&self) -> SpentOutputDescriptor;
    fn transaction_hash(&self) -> Hash;
    fn spending_transaction_hash(&self) -> Option<Hash> {
        None
    }
}

impl Indexed for OutputRecord {
    fn descriptor(&self) -> SpentOutputDescriptor {
        SpentOutputDescriptor::from_output(self)
    }

    fn transaction_hash(&self) -> Hash {
        self.transaction_hash
    }
}

impl Indexed for SpentOutputRecord {
    fn descriptor(&self) -> SpentOutputDescriptor {
        SpentOutputDescriptor::from_output(&self.output)
    }

    fn transaction_hash(&self) -> Hash {
        self.output.transaction_hash
    }

    fn spending_transaction_hash(&self) -> Option<Hash> {
        Some(self.spending_transaction_hash)
    }
}

#[derive(Debug, Clone)]
pub struct TransferTable<T> {
    records: BTreeMap<TransferId, T>,
    by_descriptor: HashMap<SpentOutputDescriptor, BTreeSet<TransferId>>,
    by_transaction: HashMap<Hash, BTreeSet<TransferId>>,
    by_spending_transaction: HashMap<Hash, BTreeSet<TransferId>>,
}

impl<T> Default for TransferTable<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_descriptor: HashMap::new(),
            by_transaction: HashMap::new(),
            by_spending_transaction: HashMap::new(),
        }
    }
}

fn link<K: std::hash::Hash + Eq>(map: &mut HashMap<K, BTreeSet<TransferId>>, key: K, id: TransferId) {
    map.entry(key).or_default().insert(id);
}

fn unlink<K: std::hash::Hash + Eq>(map: &mut HashMap<K, BTreeSet<TransferId>>, key: &K, id: TransferId) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

fn lookup<'a, K: std::hash::Hash + Eq>(
    map: &'a HashMap<K, BTreeSet<TransferId>>,
    key: &K,
) -> impl Iterator<Item = TransferId> + 'a {
    map.get(key).into_iter().flat_map(|ids| ids.iter().copied())
}

impl<T: Indexed> TransferTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: TransferId) -> Option<&T> {
        self.records.get(&id)
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (TransferId, &T)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Insert a record. An existing record with the same id is replaced.
    pub fn insert(&mut self, id: TransferId, record: T) {
        self.remove(id);
        link(&mut self.by_descriptor, record.descriptor(), id);
        link(&mut self.by_transaction, record.transaction_hash(), id);
        if let Some(spending) = record.spending_transaction_hash() {
            link(&mut self.by_spending_transaction, spending, id);
        }
        self.records.insert(id, record);
    }

    pub fn remove(&mut self, id: TransferId) -> Option<T> {
        let record = self.records.remove(&id)?;
        unlink(&mut self.by_descriptor, &record.descriptor(), id);
        unlink(&mut self.by_transaction, &record.transaction_hash(), id);
        if let Some(spending) = record.spending_transaction_hash() {
            unlink(&mut self.by_spending_transaction, &spending, id);
        }
        Some(record)
    }

    /// Apply `f` to a record, re-indexing it afterwards.
    pub fn modify<F: FnOnce(&mut T)>(&mut self, id: TransferId, f: F) -> bool {
        match self.remove(id) {
            Some(mut record) => {
                f(&mut record);
                self.insert(id, record);
                true
            }
            None => false,
        }
    }

    pub fn ids_by_descriptor(&self, descriptor: &SpentOutputDescriptor) -> Vec<TransferId> {
        lookup(&self.by_descriptor, descriptor).collect()
    }

    pub fn has_descriptor(&self, descriptor: &SpentOutputDescriptor) -> bool {
        self.by_descriptor.contains_key(descriptor)
    }

    pub fn ids_by_transaction(&self, hash: &Hash) -> Vec<TransferId> {
        lookup(&self.by_transaction, hash).collect()
    }

    pub fn ids_by_spending_transaction(&self, hash: &Hash) -> Vec<TransferId> {
        lookup(&self.by_spending_transaction, hash).collect()
    }

    /// Remove and return every record contained in transaction `hash`.
    pub fn remove_transaction(&mut self, hash: &Hash) -> Vec<(TransferId, T)> {
        self.ids_by_transaction(hash)
            .into_iter()
            .filter_map(|id| self.remove(id).map(|r| (id, r)))
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether every auxiliary index agrees with the primary map.
    pub fn indices_consistent(&self) -> bool {
        let mut expected = Self::default();
        for (id, record) in &self.records {
            link(&mut expected.by_descriptor, record.descriptor(), *id);
            link(&mut expected.by_transaction, record.transaction_hash(), *id);
            if let Some(spending) = record.spending_transaction_hash() {
                link(&mut expected.by_spending_transaction, spending, *id);
            }
        }
        expected.by_descriptor == self.by_descriptor
            && expected.by_transaction == self.by_transaction
            && expected.by_spending_transaction == self.by_spending_transaction
    }
}
