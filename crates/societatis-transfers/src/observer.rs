//! Observer registration and change notifications.
//!
//! Dispatch is synchronous and in registration order. The listener list is
//! snapshotted before each dispatch, so a listener may add or remove
//! listeners without affecting the notification in progress.

use crate::error::SyncErrorKind;
use societatis_types::{AccountPublicAddress, Hash, PublicKey};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

// =============================================================================
// Observer List
// =============================================================================

pub struct ObserverList<O: ?Sized> {
    observers: Mutex<Vec<Arc<O>>>,
}

impl<O: ?Sized> Default for ObserverList<O> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<O: ?Sized> ObserverList<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. Returns false if it is already registered.
    pub fn add(&self, observer: Arc<O>) -> bool {
        let mut list = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        if list.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            return false;
        }
        list.push(observer);
        true
    }

    pub fn remove(&self, observer: &Arc<O>) -> bool {
        let mut list = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|o| !Arc::ptr_eq(o, observer));
        list.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify<F: FnMut(&O)>(&self, mut f: F) {
        let snapshot: Vec<Arc<O>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &snapshot {
            f(observer);
        }
    }
}

// =============================================================================
// Observer Traits
// =============================================================================

/// Per-subscription notifications.
///
/// `on_transaction_deleted` only fires for hashes that were previously
/// reported through `on_transaction_updated`.
pub trait TransfersObserver: Send + Sync {
    fn on_error(&self, _address: &AccountPublicAddress, _height: u32, _error: SyncErrorKind) {}

    fn on_transaction_updated(&self, _address: &AccountPublicAddress, _hash: &Hash) {}

    fn on_transaction_deleted(&self, _address: &AccountPublicAddress, _hash: &Hash) {}
}

/// Synchronizer-wide notifications, keyed by the accounts' view public key.
pub trait SynchronizerObserver: Send + Sync {
    fn on_blocks_added(&self, _view_public_key: &PublicKey, _block_hashes: &[Hash]) {}

    fn on_blockchain_detach(&self, _view_public_key: &PublicKey, _height: u32) {}

    fn on_transaction_delete_begin(&self, _view_public_key: &PublicKey, _hash: &Hash) {}

    fn on_transaction_delete_end(&self, _view_public_key: &PublicKey, _hash: &Hash) {}

    fn on_transaction_updated(
        &self,
        _view_public_key: &PublicKey,
        _hash: &Hash,
        _addresses: &[AccountPublicAddress],
    ) {
    }
}

// =============================================================================
// Channel Forwarding
// =============================================================================

/// Notification as a value, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransfersEvent {
    BlocksAdded {
        view_public_key: PublicKey,
        block_hashes: Vec<Hash>,
    },
    BlockchainDetach {
        view_public_key: PublicKey,
        height: u32,
    },
    TransactionDeleteBegin {
        view_public_key: PublicKey,
        hash: Hash,
    },
    TransactionDeleteEnd {
        view_public_key: PublicKey,
        hash: Hash,
    },
    TransactionUpdated {
        view_public_key: PublicKey,
        hash: Hash,
        addresses: Vec<AccountPublicAddress>,
    },
    SubscriptionTransactionUpdated {
        address: AccountPublicAddress,
        hash: Hash,
    },
    SubscriptionTransactionDeleted {
        address: AccountPublicAddress,
        hash: Hash,
    },
    Error {
        address: AccountPublicAddress,
        height: u32,
        error: SyncErrorKind,
    },
}

/// Observer that turns every callback into a [`TransfersEvent`] on a tokio
/// channel. Register it as a synchronizer and/or subscription observer.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: UnboundedSender<TransfersEvent>,
}

impl EventForwarder {
    pub fn new(tx: UnboundedSender<TransfersEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Arc<Self>, UnboundedReceiver<TransfersEvent>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    fn forward(&self, event: TransfersEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("event receiver dropped");
        }
    }
}

impl SynchronizerObserver for EventForwarder {
    fn on_blocks_added(&self, view_public_key: &PublicKey, block_hashes: &[Hash]) {
        self.forward(TransfersEvent::BlocksAdded {
            view_public_key: *view_public_key,
            block_hashes: block_hashes.to_vec(),
        });
    }

    fn on_blockchain_detach(&self, view_public_key: &PublicKey, height: u32) {
        self.forward(TransfersEvent::BlockchainDetach {
            view_public_key: *view_public_key,
            height,
        });
    }

    fn on_transaction_delete_begin(&self, view_public_key: &PublicKey, hash: &Hash) {
        self.forward(TransfersEvent::TransactionDeleteBegin {
            view_public_key: *view_public_key,
            hash: *hash,
        });
    }

    fn on_transaction_delete_end(&self, view_public_key: &PublicKey, hash: &Hash) {
        self.forward(TransfersEvent::TransactionDeleteEnd {
            view_public_key: *view_public_key,
            hash: *hash,
        });
    }

    fn on_transaction_updated(
        &self,
        view_public_key: &PublicKey,
        hash: &Hash,
        addresses: &[AccountPublicAddress],
    ) {
        self.forward(TransfersEvent::TransactionUpdated {
            view_public_key: *view_public_key,
            hash: *hash,
            addresses: addresses.to_vec(),
        });
    }
}

impl TransfersObserver for EventForwarder {
    fn on_error(&self, address: &AccountPublicAddress, height: u32, error: SyncErrorKind) {
        self.forward(TransfersEvent::Error {
            address: *address,
            height,
            error,
        });
    }

    fn on_transaction_updated(&self, address: &AccountPublicAddress, hash: &Hash) {
        self.forward(TransfersEvent::SubscriptionTransactionUpdated {
            address: *address,
            hash: *hash,
        });
    }

    fn on_transaction_deleted(&self, address: &AccountPublicAddress, hash: &Hash) {
        self.forward(TransfersEvent::SubscriptionTransactionDeleted {
            address: *address,
            hash: *hash,
        });
    }
}
