//! Synchronizer-level scenarios: notification ordering across subscriptions
//! sharing a view key, channel forwarding and persistence to disk.

use societatis_transfers::{
    AccountSubscription, BlockInfo, ErrorKind, EventForwarder, RelevantOutput, SyncErrorKind,
    SynchronizationStart, SynchronizerObserver, Transaction, TransactionBlockInfo, TransferFlags,
    TransfersEvent, TransfersObserver, TransfersSynchronizer,
};
use societatis_types::{
    AccountKeys, AccountPublicAddress, Currency, Hash, KeyImage, Network, PublicKey, SecretKey,
};
use std::collections::HashSet;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const VIEW: u8 = 9;

fn h(n: u8) -> Hash {
    Hash::new([n; 32])
}

fn currency() -> Arc<Currency> {
    Arc::new(Currency::for_network(Network::Testnet))
}

fn account(spend: u8) -> AccountSubscription {
    AccountSubscription::new(
        AccountKeys::tracking(
            AccountPublicAddress::new(PublicKey::new([spend; 32]), PublicKey::new([VIEW; 32])),
            SecretKey::new([VIEW; 32]),
        ),
        SynchronizationStart::default(),
        &currency(),
    )
}

fn view_key() -> PublicKey {
    PublicKey::new([VIEW; 32])
}

fn block(height: u32) -> TransactionBlockInfo {
    TransactionBlockInfo::new(height, 1_700_000_000 + height as u64 * 120, 0)
}

/// Transaction `n` paying `amount` on a one-time key derived from `n`.
fn payment(n: u8, amount: u64) -> (Transaction, Vec<RelevantOutput>) {
    let key = PublicKey::new([n.wrapping_add(50); 32]);
    let tx = Transaction::new(h(n), PublicKey::new([n; 32])).with_key_output(amount, key);
    (tx, vec![RelevantOutput::key(amount, 0, key, KeyImage::new([n; 32]))])
}

/// Records every callback from both observer interfaces into one log.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl SynchronizerObserver for Recorder {
    fn on_blocks_added(&self, _view_public_key: &PublicKey, block_hashes: &[Hash]) {
        self.push(format!("blocks {}", block_hashes.len()));
    }

    fn on_blockchain_detach(&self, _view_public_key: &PublicKey, height: u32) {
        self.push(format!("detach {}", height));
    }

    fn on_transaction_delete_begin(&self, _view_public_key: &PublicKey, hash: &Hash) {
        self.push(format!("begin {}", hash.0[0]));
    }

    fn on_transaction_delete_end(&self, _view_public_key: &PublicKey, hash: &Hash) {
        self.push(format!("end {}", hash.0[0]));
    }

    fn on_transaction_updated(
        &self,
        _view_public_key: &PublicKey,
        hash: &Hash,
        addresses: &[AccountPublicAddress],
    ) {
        self.push(format!("updated {} for {}", hash.0[0], addresses.len()));
    }
}

impl TransfersObserver for Recorder {
    fn on_error(&self, address: &AccountPublicAddress, height: u32, error: SyncErrorKind) {
        self.push(format!("error {} at {}: {}", address.spend_public_key.0[0], height, error));
    }

    fn on_transaction_updated(&self, address: &AccountPublicAddress, hash: &Hash) {
        self.push(format!("sub {} updated {}", address.spend_public_key.0[0], hash.0[0]));
    }

    fn on_transaction_deleted(&self, address: &AccountPublicAddress, hash: &Hash) {
        self.push(format!("sub {} deleted {}", address.spend_public_key.0[0], hash.0[0]));
    }
}

#[test]
fn detach_brackets_each_deletion() {
    let sync = TransfersSynchronizer::new(currency());
    let sub = sync.add_subscription(account(1)).unwrap();
    let address = sub.address();
    let recorder = Arc::new(Recorder::default());
    sync.add_observer(recorder.clone());
    sub.add_observer(recorder.clone());

    let (t1, o1) = payment(1, 100);
    let o1: Vec<_> = o1.into_iter().map(|o| o.with_global_index(3)).collect();
    assert!(sync.submit_transaction(&address, &block(10), &t1, &o1).unwrap());
    let (t2, o2) = payment(2, 40);
    assert!(sync
        .submit_transaction(&address, &TransactionBlockInfo::unconfirmed(), &t2, &o2)
        .unwrap());
    assert_eq!(
        recorder.take(),
        vec!["sub 1 updated 1", "updated 1 for 1", "sub 1 updated 2", "updated 2 for 1"]
    );

    sync.detach(&view_key(), 10);
    assert_eq!(recorder.take(), vec!["detach 10", "begin 1", "sub 1 deleted 1", "end 1"]);
    assert_eq!(sub.container().unconfirmed_transactions(), vec![h(2)]);
    assert_eq!(sub.container().balance(TransferFlags::ALL_AVAILABLE), 0);
}

#[test]
fn pool_eviction_reaches_every_account_on_the_view_key() {
    let sync = TransfersSynchronizer::new(currency());
    let a = sync.add_subscription(account(1)).unwrap();
    let b = sync.add_subscription(account(2)).unwrap();
    let recorder = Arc::new(Recorder::default());
    sync.add_observer(recorder.clone());
    a.add_observer(recorder.clone());
    b.add_observer(recorder.clone());

    let (tx, outs) = payment(7, 5);
    for sub in [&a, &b] {
        sync.submit_transaction(&sub.address(), &TransactionBlockInfo::unconfirmed(), &tx, &outs)
            .unwrap();
    }
    recorder.take();

    assert!(sync.delete_unconfirmed_transaction(&view_key(), &h(7)));
    assert_eq!(
        recorder.take(),
        vec!["begin 7", "sub 1 deleted 7", "sub 2 deleted 7", "end 7"]
    );
    assert!(!sync.delete_unconfirmed_transaction(&view_key(), &h(7)));
    assert!(recorder.take().is_empty());
}

#[test]
fn index_failures_are_reported_to_the_account() {
    let sync = TransfersSynchronizer::new(currency());
    let sub = sync.add_subscription(account(1)).unwrap();
    let recorder = Arc::new(Recorder::default());
    sub.add_observer(recorder.clone());

    let (tx, outs) = payment(1, 100);
    sync.submit_transaction(&sub.address(), &TransactionBlockInfo::unconfirmed(), &tx, &outs)
        .unwrap();
    recorder.take();

    // Same hash, different amount.
    let (tx, outs) = payment(1, 101);
    assert!(sync
        .submit_transaction(&sub.address(), &TransactionBlockInfo::unconfirmed(), &tx, &outs)
        .is_err());
    let expected = format!(
        "error 1 at {}: {}",
        u32::MAX,
        SyncErrorKind::Transfers(ErrorKind::DataInconsistency)
    );
    assert_eq!(recorder.take(), vec![expected]);

    sync.report_error(&view_key(), 55, SyncErrorKind::NodeBusy);
    assert_eq!(recorder.take(), vec!["error 1 at 55: Node is busy"]);
}

/// Tracks which hashes an account observer currently believes are indexed.
#[derive(Default)]
struct LiveSet {
    live: Mutex<HashSet<Hash>>,
    unmatched_deletes: AtomicUsize,
}

impl TransfersObserver for LiveSet {
    fn on_transaction_updated(&self, _address: &AccountPublicAddress, hash: &Hash) {
        self.live.lock().unwrap().insert(*hash);
    }

    fn on_transaction_deleted(&self, _address: &AccountPublicAddress, hash: &Hash) {
        if !self.live.lock().unwrap().remove(hash) {
            self.unmatched_deletes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn concurrent_detach_keeps_account_observers_in_step() {
    let sync = TransfersSynchronizer::new(currency());
    let sub = sync.add_subscription(account(1)).unwrap();
    let address = sub.address();
    let live = Arc::new(LiveSet::default());
    sub.add_observer(live.clone());

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..300u16 {
                let mut bytes = [0xAA; 32];
                bytes[..2].copy_from_slice(&i.to_le_bytes());
                let key = PublicKey::new(bytes);
                let tx = Transaction::new(Hash::new(bytes), key).with_key_output(1, key);
                let outs = [RelevantOutput::key(1, 0, key, KeyImage::new(bytes))
                    .with_global_index(i as u32)];
                let height = sub.container().current_height() + 1;
                // Losing a race with detach only yields a height error.
                let _ = sync.submit_transaction(&address, &block(height), &tx, &outs);
            }
        });
        scope.spawn(|| {
            for _ in 0..300 {
                let top = sub.container().current_height();
                sync.detach(&view_key(), top);
            }
        });
    });

    let indexed: HashSet<Hash> = sub
        .container()
        .transactions()
        .into_iter()
        .map(|tx| tx.transaction_hash)
        .collect();
    assert_eq!(*live.live.lock().unwrap(), indexed);
    assert_eq!(live.unmatched_deletes.load(Ordering::SeqCst), 0);
    sub.container().check_invariants().unwrap();
}

#[test]
fn removing_last_account_forgets_view_key_blocks() {
    let sync = TransfersSynchronizer::new(currency());
    let a = sync.add_subscription(account(1)).unwrap().address();
    let b = sync.add_subscription(account(2)).unwrap().address();
    sync.add_blocks(
        &view_key(),
        0,
        &[BlockInfo {
            hash: h(200),
            timestamp: 1,
        }],
    );

    assert!(sync.remove_subscription(&a));
    assert_eq!(sync.view_key_known_blocks(&view_key()), vec![h(200)]);
    assert!(sync.remove_subscription(&b));
    assert!(sync.view_key_known_blocks(&view_key()).is_empty());
}

#[tokio::test]
async fn forwarder_delivers_events_in_order() {
    let sync = TransfersSynchronizer::new(currency());
    let sub = sync.add_subscription(account(1)).unwrap();
    let (forwarder, mut rx) = EventForwarder::channel();
    sync.add_observer(forwarder.clone());
    sub.add_observer(forwarder.clone());

    let (tx, outs) = payment(3, 10);
    let outs: Vec<_> = outs.into_iter().map(|o| o.with_global_index(0)).collect();
    sync.submit_transaction(&sub.address(), &block(4), &tx, &outs)
        .unwrap();
    sync.add_blocks(
        &view_key(),
        4,
        &[BlockInfo {
            hash: h(44),
            timestamp: 2,
        }],
    );
    sync.detach(&view_key(), 4);

    let expected = vec![
        TransfersEvent::SubscriptionTransactionUpdated {
            address: sub.address(),
            hash: h(3),
        },
        TransfersEvent::TransactionUpdated {
            view_public_key: view_key(),
            hash: h(3),
            addresses: vec![sub.address()],
        },
        TransfersEvent::BlocksAdded {
            view_public_key: view_key(),
            block_hashes: vec![h(44)],
        },
        TransfersEvent::BlockchainDetach {
            view_public_key: view_key(),
            height: 4,
        },
        TransfersEvent::TransactionDeleteBegin {
            view_public_key: view_key(),
            hash: h(3),
        },
        TransfersEvent::SubscriptionTransactionDeleted {
            address: sub.address(),
            hash: h(3),
        },
        TransfersEvent::TransactionDeleteEnd {
            view_public_key: view_key(),
            hash: h(3),
        },
    ];
    for want in expected {
        assert_eq!(rx.recv().await, Some(want));
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn save_and_load_through_a_file() {
    let sync = TransfersSynchronizer::new(currency());
    let sub = sync.add_subscription(account(1)).unwrap();
    let (t1, o1) = payment(1, 100);
    let o1: Vec<_> = o1.into_iter().map(|o| o.with_global_index(8)).collect();
    sync.submit_transaction(&sub.address(), &block(20), &t1, &o1)
        .unwrap();
    let (t2, o2) = payment(2, 30);
    sync.submit_transaction(&sub.address(), &TransactionBlockInfo::unconfirmed(), &t2, &o2)
        .unwrap();
    sync.add_blocks(
        &view_key(),
        20,
        &[
            BlockInfo {
                hash: h(120),
                timestamp: 10,
            },
            BlockInfo {
                hash: h(121),
                timestamp: 130,
            },
        ],
    );
    sub.mark_transaction_safe(&h(1));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transfers.bin");
    sync.save(&mut File::create(&path).unwrap()).unwrap();

    // Account 2 was never saved; its index stays empty.
    let restored = TransfersSynchronizer::new(currency());
    let loaded = restored.add_subscription(account(1)).unwrap();
    let other = restored.add_subscription(account(2)).unwrap();
    let reports = restored.load(&mut File::open(&path).unwrap()).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, sub.address());
    assert!(reports[0].1.is_clean());

    let (before, after) = (sub.container(), loaded.container());
    assert_eq!(after.current_height(), before.current_height());
    assert_eq!(after.current_height(), 21);
    for flags in [TransferFlags::ALL, TransferFlags::ALL_AVAILABLE, TransferFlags::KEY_UNLOCKED] {
        assert_eq!(after.balance(flags), before.balance(flags));
    }
    assert_eq!(after.safe_transactions(), vec![h(1)]);
    assert_eq!(other.container().transfer_count(), 0);
    assert_eq!(restored.view_key_known_blocks(&view_key()), vec![h(120), h(121)]);

    // Loaded transactions were already announced, so deletion is reported.
    let recorder = Arc::new(Recorder::default());
    loaded.add_observer(recorder.clone());
    assert!(restored.delete_unconfirmed_transaction(&view_key(), &h(2)));
    assert_eq!(recorder.take(), vec!["sub 1 deleted 2"]);
}

#[test]
fn load_rejects_unknown_version() {
    let sync = TransfersSynchronizer::new(currency());
    sync.add_subscription(account(1)).unwrap();
    let err = sync.load(&mut [7u8, 0, 0].as_slice()).unwrap_err();
    assert!(matches!(
        err,
        societatis_transfers::TransfersError::UnsupportedSnapshotVersion(7)
    ));
}
