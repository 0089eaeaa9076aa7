//! One subscribed account: its transfer index plus observers.

use crate::container::{RepairReport, TransfersContainer};
use crate::error::{SyncErrorKind, TransfersError};
use crate::observer::{ObserverList, TransfersObserver};
use crate::records::{RelevantOutput, TransactionBlockInfo};
use crate::transaction::TransactionReader;
use serde::{Deserialize, Serialize};
use societatis_types::{AccountKeys, AccountPublicAddress, Currency, Hash};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Point in the chain where scanning for an account begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationStart {
    pub timestamp: u64,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSubscription {
    pub keys: AccountKeys,
    pub sync_start: SynchronizationStart,
    pub transaction_spendable_age: u32,
    pub safe_transaction_spendable_age: u32,
}

impl AccountSubscription {
    /// Subscription with the currency's default spendable ages.
    pub fn new(keys: AccountKeys, sync_start: SynchronizationStart, currency: &Currency) -> Self {
        Self {
            keys,
            sync_start,
            transaction_spendable_age: currency.transaction_spendable_age,
            safe_transaction_spendable_age: currency.safe_transaction_spendable_age,
        }
    }
}

pub struct TransfersSubscription {
    subscription: AccountSubscription,
    container: TransfersContainer,
    observers: ObserverList<dyn TransfersObserver>,
    /// Hashes reported through `on_transaction_updated` and not yet deleted.
    /// Held across every index mutation and its announcement, so observers
    /// of this account must not mutate it from a callback.
    announced: Mutex<HashSet<Hash>>,
}

impl TransfersSubscription {
    pub fn new(currency: Arc<Currency>, subscription: AccountSubscription) -> Self {
        let container = TransfersContainer::new(
            currency,
            subscription.transaction_spendable_age,
            subscription.safe_transaction_spendable_age,
        );
        Self {
            subscription,
            container,
            observers: ObserverList::new(),
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn address(&self) -> AccountPublicAddress {
        self.subscription.keys.address
    }

    pub fn keys(&self) -> &AccountKeys {
        &self.subscription.keys
    }

    pub fn sync_start(&self) -> SynchronizationStart {
        self.subscription.sync_start
    }

    pub fn container(&self) -> &TransfersContainer {
        &self.container
    }

    pub fn add_observer(&self, observer: Arc<dyn TransfersObserver>) -> bool {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn TransfersObserver>) -> bool {
        self.observers.remove(observer)
    }

    fn announced(&self) -> MutexGuard<'_, HashSet<Hash>> {
        self.announced.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_updated(&self, announced: &mut HashSet<Hash>, hash: &Hash) {
        announced.insert(*hash);
        let address = self.address();
        self.observers
            .notify(|o| o.on_transaction_updated(&address, hash));
    }

    fn notify_deleted(&self, announced: &mut HashSet<Hash>, hash: &Hash) {
        if !announced.remove(hash) {
            return;
        }
        let address = self.address();
        self.observers
            .notify(|o| o.on_transaction_deleted(&address, hash));
    }

    pub(crate) fn report_error(&self, height: u32, error: SyncErrorKind) {
        let address = self.address();
        self.observers.notify(|o| o.on_error(&address, height, error));
    }

    // ─── Chain events ───────────────────────────────────────────────────────

    /// Confirmed blocks below the subscription's start height are ignored.
    pub(crate) fn submit_transaction<R: TransactionReader + ?Sized>(
        &self,
        block: &TransactionBlockInfo,
        tx: &R,
        outputs: &[RelevantOutput],
    ) -> Result<bool, TransfersError> {
        if block.is_confirmed() && block.height < self.subscription.sync_start.height {
            log::debug!(
                "skipping transaction {} below sync start {}",
                tx.hash(),
                self.subscription.sync_start.height
            );
            return Ok(false);
        }
        let mut announced = self.announced();
        let changed = self.container.submit_transaction(block, tx, outputs)?;
        if changed {
            self.notify_updated(&mut announced, &tx.hash());
        }
        Ok(changed)
    }

    pub(crate) fn confirm_transaction(
        &self,
        block: &TransactionBlockInfo,
        hash: &Hash,
        global_indices: &[u32],
    ) -> Result<bool, TransfersError> {
        let mut announced = self.announced();
        let changed = self.container.confirm_transaction(block, hash, global_indices)?;
        if changed {
            self.notify_updated(&mut announced, hash);
        }
        Ok(changed)
    }

    pub(crate) fn delete_unconfirmed_transaction(&self, hash: &Hash) -> bool {
        let mut announced = self.announced();
        let deleted = self.container.delete_unconfirmed_transaction(hash);
        if deleted {
            self.notify_deleted(&mut announced, hash);
        }
        deleted
    }

    /// Roll the index back and announce each removed hash, bracketed by
    /// `begin` and `end`, before any other mutation of this account runs.
    pub(crate) fn rollback<B, E>(&self, height: u32, begin: B, end: E) -> Vec<Hash>
    where
        B: Fn(&Hash),
        E: Fn(&Hash),
    {
        let mut announced = self.announced();
        let removed = self.container.rollback(height);
        for hash in &removed {
            begin(hash);
            self.notify_deleted(&mut announced, hash);
            end(hash);
        }
        removed
    }

    pub fn mark_transaction_safe(&self, hash: &Hash) -> bool {
        self.container.mark_transaction_safe(hash)
    }

    /// Restore the index. Every restored transaction counts as announced.
    pub(crate) fn load_bytes(&self, data: &[u8]) -> Result<RepairReport, TransfersError> {
        let mut announced = self.announced();
        let result = self.container.load_bytes(data);
        announced.clear();
        if result.is_ok() {
            announced.extend(
                self.container
                    .transactions()
                    .into_iter()
                    .map(|tx| tx.transaction_hash),
            );
        }
        result
    }
}

impl std::fmt::Debug for TransfersSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransfersSubscription")
            .field("address", &self.subscription.keys.address)
            .field("sync_start", &self.subscription.sync_start)
            .field("container", &self.container)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use societatis_types::{KeyImage, Network, PublicKey, SecretKey};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, Hash)>>,
    }

    impl TransfersObserver for Recorder {
        fn on_transaction_updated(&self, _address: &AccountPublicAddress, hash: &Hash) {
            self.events.lock().unwrap().push(("updated", *hash));
        }

        fn on_transaction_deleted(&self, _address: &AccountPublicAddress, hash: &Hash) {
            self.events.lock().unwrap().push(("deleted", *hash));
        }
    }

    fn subscription(start_height: u32) -> TransfersSubscription {
        let currency = Currency::for_network(Network::Testnet);
        let keys = AccountKeys::tracking(
            AccountPublicAddress::new(PublicKey::new([1; 32]), PublicKey::new([2; 32])),
            SecretKey::new([3; 32]),
        );
        let sub = AccountSubscription::new(
            keys,
            SynchronizationStart {
                timestamp: 0,
                height: start_height,
            },
            &currency,
        );
        TransfersSubscription::new(Arc::new(currency), sub)
    }

    fn payment(n: u8) -> (Transaction, Vec<RelevantOutput>) {
        let tx = Transaction::new(Hash::new([n; 32]), PublicKey::NULL)
            .with_key_output(10, PublicKey::new([n; 32]));
        let outs = vec![RelevantOutput::key(10, 0, PublicKey::new([n; 32]), KeyImage::new([n; 32]))];
        (tx, outs)
    }

    #[test]
    fn test_ages_from_currency() {
        let sub = subscription(0);
        assert_eq!(sub.container().transaction_spendable_age(), 1);
        assert_eq!(sub.container().safe_transaction_spendable_age(), 4);
    }

    #[test]
    fn test_blocks_before_start_skipped() {
        let sub = subscription(100);
        let (tx, outs) = payment(1);
        let outs: Vec<_> = outs.into_iter().map(|o| o.with_global_index(0)).collect();
        assert!(!sub
            .submit_transaction(&TransactionBlockInfo::new(99, 0, 0), &tx, &outs)
            .unwrap());
        assert!(sub
            .submit_transaction(&TransactionBlockInfo::new(100, 0, 0), &tx, &outs)
            .unwrap());
    }

    #[test]
    fn test_delete_only_after_update() {
        let sub = subscription(0);
        let recorder = Arc::new(Recorder::default());
        sub.add_observer(recorder.clone());

        let (tx, outs) = payment(1);
        sub.submit_transaction(&TransactionBlockInfo::unconfirmed(), &tx, &outs)
            .unwrap();
        assert!(sub.delete_unconfirmed_transaction(&tx.hash));
        assert!(!sub.delete_unconfirmed_transaction(&tx.hash));
        // Never announced, so its rollback is silent.
        let (tx2, outs2) = payment(2);
        let outs2: Vec<_> = outs2.into_iter().map(|o| o.with_global_index(0)).collect();
        sub.container()
            .submit_transaction(&TransactionBlockInfo::new(5, 0, 0), &tx2, &outs2)
            .unwrap();
        assert_eq!(sub.rollback(5, |_| {}, |_| {}), vec![tx2.hash]);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec![("updated", tx.hash), ("deleted", tx.hash)]);
    }

    #[test]
    fn test_loaded_transactions_count_as_announced() {
        let source = subscription(0);
        let (tx, outs) = payment(1);
        source
            .submit_transaction(&TransactionBlockInfo::unconfirmed(), &tx, &outs)
            .unwrap();

        let sub = subscription(0);
        let recorder = Arc::new(Recorder::default());
        sub.add_observer(recorder.clone());
        sub.load_bytes(&source.container().to_bytes()).unwrap();
        assert!(sub.delete_unconfirmed_transaction(&tx.hash));
        assert_eq!(
            recorder.events.lock().unwrap().clone(),
            vec![("deleted", tx.hash)]
        );
    }
}
