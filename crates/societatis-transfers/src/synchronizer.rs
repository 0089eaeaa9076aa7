//! Subscription registry and the entry points the network layer drives.
//!
//! The synchronizer owns one [`TransfersSubscription`] per account. Chain
//! events arrive already fetched; each is applied to the affected index and
//! then announced to observers, synchronously and in registration order.

use crate::container::RepairReport;
use crate::error::{SyncErrorKind, TransfersError};
use crate::observer::{ObserverList, SynchronizerObserver};
use crate::records::{RelevantOutput, TransactionBlockInfo};
use crate::snapshot::{self, Reader, Writer};
use crate::subscription::{AccountSubscription, TransfersSubscription};
use crate::transaction::TransactionReader;
use societatis_types::{AccountPublicAddress, Currency, Hash, PublicKey};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const SYNCHRONIZER_STATE_VERSION: u32 = 1;

/// A block as reported by the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Hash,
    pub timestamp: u64,
}

pub struct TransfersSynchronizer {
    currency: Arc<Currency>,
    subscriptions: Mutex<BTreeMap<AccountPublicAddress, Arc<TransfersSubscription>>>,
    /// Block hashes by height, per view key.
    known_blocks: Mutex<HashMap<PublicKey, BTreeMap<u32, Hash>>>,
    observers: ObserverList<dyn SynchronizerObserver>,
}

impl TransfersSynchronizer {
    pub fn new(currency: Arc<Currency>) -> Self {
        Self {
            currency,
            subscriptions: Mutex::new(BTreeMap::new()),
            known_blocks: Mutex::new(HashMap::new()),
            observers: ObserverList::new(),
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    fn subs(&self) -> MutexGuard<'_, BTreeMap<AccountPublicAddress, Arc<TransfersSubscription>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<PublicKey, BTreeMap<u32, Hash>>> {
        self.known_blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require(&self, address: &AccountPublicAddress) -> Result<Arc<TransfersSubscription>, TransfersError> {
        self.subscription(address)
            .ok_or(TransfersError::UnknownSubscription)
    }

    /// Subscriptions sharing a view key, in address order.
    fn by_view_key(&self, view_public_key: &PublicKey) -> Vec<Arc<TransfersSubscription>> {
        self.subs()
            .values()
            .filter(|s| s.address().view_public_key == *view_public_key)
            .cloned()
            .collect()
    }

    // ─── Subscriptions ──────────────────────────────────────────────────────

    pub fn add_subscription(
        &self,
        subscription: AccountSubscription,
    ) -> Result<Arc<TransfersSubscription>, TransfersError> {
        let address = subscription.keys.address;
        let mut subs = self.subs();
        if subs.contains_key(&address) {
            return Err(TransfersError::SubscriptionExists);
        }
        let handle = Arc::new(TransfersSubscription::new(self.currency.clone(), subscription));
        subs.insert(address, handle.clone());
        log::info!(
            "subscribed account {} from height {}",
            address.spend_public_key,
            handle.sync_start().height
        );
        Ok(handle)
    }

    pub fn remove_subscription(&self, address: &AccountPublicAddress) -> bool {
        let mut subs = self.subs();
        if subs.remove(address).is_none() {
            return false;
        }
        let view_key_in_use = subs
            .keys()
            .any(|a| a.view_public_key == address.view_public_key);
        drop(subs);
        if !view_key_in_use {
            self.blocks().remove(&address.view_public_key);
        }
        log::info!("unsubscribed account {}", address.spend_public_key);
        true
    }

    pub fn subscriptions(&self) -> Vec<AccountPublicAddress> {
        self.subs().keys().copied().collect()
    }

    pub fn subscription(&self, address: &AccountPublicAddress) -> Option<Arc<TransfersSubscription>> {
        self.subs().get(address).cloned()
    }

    pub fn add_observer(&self, observer: Arc<dyn SynchronizerObserver>) -> bool {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn SynchronizerObserver>) -> bool {
        self.observers.remove(observer)
    }

    // ─── Chain events ───────────────────────────────────────────────────────

    fn on_failure(&self, sub: &TransfersSubscription, height: u32, error: &TransfersError) {
        log::warn!("account {}: {}", sub.address().spend_public_key, error);
        sub.report_error(height, SyncErrorKind::from(error));
    }

    pub fn submit_transaction<R: TransactionReader + ?Sized>(
        &self,
        address: &AccountPublicAddress,
        block: &TransactionBlockInfo,
        tx: &R,
        outputs: &[RelevantOutput],
    ) -> Result<bool, TransfersError> {
        let sub = self.require(address)?;
        match sub.submit_transaction(block, tx, outputs) {
            Ok(changed) => {
                if changed {
                    let hash = tx.hash();
                    self.observers.notify(|o| {
                        o.on_transaction_updated(&address.view_public_key, &hash, &[*address])
                    });
                }
                Ok(changed)
            }
            Err(e) => {
                self.on_failure(&sub, block.height, &e);
                Err(e)
            }
        }
    }

    pub fn confirm_transaction(
        &self,
        address: &AccountPublicAddress,
        block: &TransactionBlockInfo,
        hash: &Hash,
        global_indices: &[u32],
    ) -> Result<bool, TransfersError> {
        let sub = self.require(address)?;
        match sub.confirm_transaction(block, hash, global_indices) {
            Ok(changed) => {
                if changed {
                    self.observers.notify(|o| {
                        o.on_transaction_updated(&address.view_public_key, hash, &[*address])
                    });
                }
                Ok(changed)
            }
            Err(e) => {
                self.on_failure(&sub, block.height, &e);
                Err(e)
            }
        }
    }

    /// Drop an unconfirmed transaction (e.g. evicted from the pool) from every
    /// subscription sharing `view_public_key`. Returns whether any had it.
    pub fn delete_unconfirmed_transaction(&self, view_public_key: &PublicKey, hash: &Hash) -> bool {
        let subs = self.by_view_key(view_public_key);
        if !subs
            .iter()
            .any(|s| s.container().unconfirmed_transactions().contains(hash))
        {
            return false;
        }
        self.observers
            .notify(|o| o.on_transaction_delete_begin(view_public_key, hash));
        let mut deleted = false;
        for sub in &subs {
            deleted |= sub.delete_unconfirmed_transaction(hash);
        }
        self.observers
            .notify(|o| o.on_transaction_delete_end(view_public_key, hash));
        deleted
    }

    /// New blocks starting at `start_height` were processed for every
    /// subscription sharing `view_public_key`.
    pub fn add_blocks(&self, view_public_key: &PublicKey, start_height: u32, blocks: &[BlockInfo]) {
        let Some(last) = blocks.last() else {
            return;
        };
        let Some(top) = u32::try_from(blocks.len() - 1)
            .ok()
            .and_then(|span| start_height.checked_add(span))
        else {
            log::warn!(
                "{} blocks from height {} run past the last representable height",
                blocks.len(),
                start_height
            );
            return;
        };
        for sub in self.by_view_key(view_public_key) {
            if !sub.container().advance_to_block(top, last.timestamp) {
                log::warn!(
                    "account {}: block {} is below current height {}",
                    sub.address().spend_public_key,
                    top,
                    sub.container().current_height()
                );
            }
        }
        {
            let mut known = self.blocks();
            let chain = known.entry(*view_public_key).or_default();
            for (height, block) in (start_height..=top).zip(blocks) {
                chain.insert(height, block.hash);
            }
        }
        let hashes: Vec<Hash> = blocks.iter().map(|b| b.hash).collect();
        self.observers
            .notify(|o| o.on_blocks_added(view_public_key, &hashes));
    }

    /// The chain was reorganized: everything at or above `height` is gone.
    pub fn detach(&self, view_public_key: &PublicKey, height: u32) {
        self.observers
            .notify(|o| o.on_blockchain_detach(view_public_key, height));
        for sub in self.by_view_key(view_public_key) {
            sub.rollback(
                height,
                |hash| {
                    self.observers
                        .notify(|o| o.on_transaction_delete_begin(view_public_key, hash))
                },
                |hash| {
                    self.observers
                        .notify(|o| o.on_transaction_delete_end(view_public_key, hash))
                },
            );
        }
        if let Some(chain) = self.blocks().get_mut(view_public_key) {
            chain.retain(|h, _| *h < height);
        }
    }

    /// Report a network-layer failure at `height`. Nothing is retried here.
    pub fn report_error(&self, view_public_key: &PublicKey, height: u32, error: SyncErrorKind) {
        for sub in self.by_view_key(view_public_key) {
            sub.report_error(height, error);
        }
    }

    /// Block hashes reported through [`add_blocks`](Self::add_blocks), in
    /// height order.
    pub fn view_key_known_blocks(&self, view_public_key: &PublicKey) -> Vec<Hash> {
        self.blocks()
            .get(view_public_key)
            .map(|chain| chain.values().copied().collect())
            .unwrap_or_default()
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    /// Write every subscription's index and the known block hashes.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), TransfersError> {
        let subs: Vec<Arc<TransfersSubscription>> = self.subs().values().cloned().collect();
        let mut w = Writer::new();
        w.write_varint(SYNCHRONIZER_STATE_VERSION as u64);
        w.write_varint(subs.len() as u64);
        for sub in &subs {
            let address = sub.address();
            w.write_key(address.spend_public_key.as_bytes());
            w.write_key(address.view_public_key.as_bytes());
            w.write_bytes(&sub.container().to_bytes());
        }
        let known = self.blocks();
        let mut keys: Vec<&PublicKey> = known.keys().collect();
        keys.sort();
        w.write_varint(keys.len() as u64);
        for key in keys {
            w.write_key(key.as_bytes());
            let chain = &known[key];
            w.write_varint(chain.len() as u64);
            for (height, hash) in chain {
                w.write_varint(*height as u64);
                w.write_key(hash.as_bytes());
            }
        }
        drop(known);
        writer.write_all(&w.into_inner())?;
        writer.flush()?;
        Ok(())
    }

    /// Restore state saved by [`save`](Self::save). Indexes of accounts that
    /// are not subscribed are skipped. Returns the repair report per loaded
    /// account.
    pub fn load<R: Read>(
        &self,
        reader: &mut R,
    ) -> Result<Vec<(AccountPublicAddress, RepairReport)>, TransfersError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let mut r = Reader::new(&data);

        let version = r.read_u32()?;
        if version != SYNCHRONIZER_STATE_VERSION {
            return Err(TransfersError::UnsupportedSnapshotVersion(version));
        }

        let mut stored = Vec::new();
        for _ in 0..r.read_count()? {
            let address = AccountPublicAddress::new(
                PublicKey::new(r.read_key()?),
                PublicKey::new(r.read_key()?),
            );
            stored.push((address, r.read_bytes()?));
        }
        let mut chains = HashMap::new();
        for _ in 0..r.read_count()? {
            let key = PublicKey::new(r.read_key()?);
            let mut chain = BTreeMap::new();
            for _ in 0..r.read_count()? {
                let height = r.read_u32()?;
                chain.insert(height, Hash::new(r.read_key()?));
            }
            chains.insert(key, chain);
        }
        if r.remaining() != 0 {
            return Err(TransfersError::Snapshot(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }

        // Every payload must decode before any account is replaced.
        let mut targets = Vec::new();
        for (address, bytes) in stored {
            match self.subscription(&address) {
                Some(sub) => {
                    snapshot::decode(&bytes)?;
                    targets.push((address, sub, bytes));
                }
                None => log::warn!(
                    "saved state for unsubscribed account {} skipped",
                    address.spend_public_key
                ),
            }
        }
        let mut reports = Vec::new();
        for (address, sub, bytes) in targets {
            reports.push((address, sub.load_bytes(&bytes)?));
        }
        let subscribed: Vec<PublicKey> = self
            .subscriptions()
            .into_iter()
            .map(|a| a.view_public_key)
            .collect();
        chains.retain(|key, _| subscribed.contains(key));
        *self.blocks() = chains;
        Ok(reports)
    }
}

impl std::fmt::Debug for TransfersSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransfersSynchronizer")
            .field("subscriptions", &self.subscriptions())
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SynchronizationStart;
    use societatis_types::{AccountKeys, Network, SecretKey};

    fn account(spend: u8, view: u8) -> AccountSubscription {
        let currency = Currency::for_network(Network::Testnet);
        AccountSubscription::new(
            AccountKeys::tracking(
                AccountPublicAddress::new(PublicKey::new([spend; 32]), PublicKey::new([view; 32])),
                SecretKey::new([0; 32]),
            ),
            SynchronizationStart::default(),
            &currency,
        )
    }

    fn synchronizer() -> TransfersSynchronizer {
        TransfersSynchronizer::new(Arc::new(Currency::for_network(Network::Testnet)))
    }

    #[test]
    fn test_subscription_registry() {
        let sync = synchronizer();
        let a = account(1, 9);
        let address = a.keys.address;
        sync.add_subscription(a.clone()).unwrap();
        assert!(matches!(
            sync.add_subscription(a),
            Err(TransfersError::SubscriptionExists)
        ));
        assert_eq!(sync.subscriptions(), vec![address]);
        assert!(sync.subscription(&address).is_some());
        assert!(sync.remove_subscription(&address));
        assert!(!sync.remove_subscription(&address));
        assert!(sync.subscription(&address).is_none());
    }

    #[test]
    fn test_known_blocks() {
        let sync = synchronizer();
        let a = account(1, 9);
        let vk = a.keys.address.view_public_key;
        let handle = sync.add_subscription(a).unwrap();

        let blocks: Vec<BlockInfo> = (0..4u8)
            .map(|i| BlockInfo {
                hash: Hash::new([i; 32]),
                timestamp: 1_000 + i as u64,
            })
            .collect();
        sync.add_blocks(&vk, 10, &blocks);
        assert_eq!(handle.container().current_height(), 13);
        assert_eq!(sync.view_key_known_blocks(&vk).len(), 4);

        sync.detach(&vk, 12);
        assert_eq!(
            sync.view_key_known_blocks(&vk),
            vec![Hash::new([0; 32]), Hash::new([1; 32])]
        );
        assert_eq!(handle.container().current_height(), 11);
    }

    #[test]
    fn test_unknown_subscription() {
        let sync = synchronizer();
        let address = account(1, 9).keys.address;
        let tx = crate::Transaction::new(Hash::NULL, PublicKey::NULL);
        assert!(matches!(
            sync.submit_transaction(&address, &TransactionBlockInfo::unconfirmed(), &tx, &[]),
            Err(TransfersError::UnknownSubscription)
        ));
    }

    fn blocks(n: u8) -> Vec<BlockInfo> {
        (0..n)
            .map(|i| BlockInfo {
                hash: Hash::new([i; 32]),
                timestamp: 1_000 + i as u64,
            })
            .collect()
    }

    #[test]
    fn test_blocks_past_last_height_ignored() {
        let sync = synchronizer();
        let a = account(1, 9);
        let vk = a.keys.address.view_public_key;
        let handle = sync.add_subscription(a).unwrap();
        sync.add_blocks(&vk, 5, &blocks(1));

        sync.add_blocks(&vk, u32::MAX, &blocks(2));
        assert_eq!(handle.container().current_height(), 5);
        assert_eq!(sync.view_key_known_blocks(&vk), vec![Hash::new([0; 32])]);

        sync.add_blocks(&vk, u32::MAX - 1, &blocks(2));
        assert_eq!(handle.container().current_height(), u32::MAX);
        assert_eq!(sync.view_key_known_blocks(&vk).len(), 3);
    }

    #[test]
    fn test_load_is_all_or_nothing() {
        let sync = synchronizer();
        let first = account(1, 9);
        let second = account(2, 9);
        let vk = first.keys.address.view_public_key;
        let handle = sync.add_subscription(first.clone()).unwrap();
        sync.add_subscription(second.clone()).unwrap();
        let key = PublicKey::new([5; 32]);
        let tx = crate::Transaction::new(Hash::new([5; 32]), key).with_key_output(10, key);
        let outs = [RelevantOutput::key(10, 0, key, societatis_types::KeyImage::new([5; 32]))];
        sync.submit_transaction(&first.keys.address, &TransactionBlockInfo::unconfirmed(), &tx, &outs)
            .unwrap();
        sync.add_blocks(&vk, 3, &blocks(1));

        // A valid payload for the first account, a broken one for the second.
        let mut w = Writer::new();
        w.write_varint(SYNCHRONIZER_STATE_VERSION as u64);
        w.write_varint(2);
        let empty = crate::TransfersContainer::with_default_ages(sync.currency.clone()).to_bytes();
        for (address, payload) in [
            (first.keys.address, empty),
            (second.keys.address, vec![1, 5, 0xFF]),
        ] {
            w.write_key(address.spend_public_key.as_bytes());
            w.write_key(address.view_public_key.as_bytes());
            w.write_bytes(&payload);
        }
        w.write_varint(0);

        assert!(sync.load(&mut w.into_inner().as_slice()).is_err());
        assert_eq!(handle.container().transaction_count(), 1);
        assert_eq!(sync.view_key_known_blocks(&vk), vec![Hash::new([0; 32])]);
    }
}
