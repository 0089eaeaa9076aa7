//! Per-account transfer index for the Societatis wallet synchronizer.
//!
//! The [`TransfersContainer`] tracks which outputs belong to an account and
//! whether each is unconfirmed, available (locked or unlocked) or spent, and
//! keeps that classification consistent across chain reorganizations and
//! snapshot reloads. [`TransfersSynchronizer`] owns one container per
//! subscribed account and fans chain events out to observers.

pub mod container;
pub mod descriptor;
pub mod error;
pub mod flags;
pub mod observer;
pub mod records;
pub mod snapshot;
pub mod subscription;
pub mod synchronizer;
pub mod table;
pub mod transaction;

pub use container::{RepairReport, TransfersContainer};
pub use descriptor::SpentOutputDescriptor;
pub use error::{ErrorKind, SyncErrorKind, TransfersError};
pub use flags::TransferFlags;
pub use observer::{
    EventForwarder, ObserverList, SynchronizerObserver, TransfersEvent, TransfersObserver,
};
pub use records::{
    OutputRecord, OutputTarget, RelevantOutput, SpentOutputRecord, TransactionBlockInfo,
    TransactionDetails, TransactionInformation,
};
pub use snapshot::Snapshot;
pub use subscription::{AccountSubscription, SynchronizationStart, TransfersSubscription};
pub use synchronizer::{BlockInfo, TransfersSynchronizer};
pub use transaction::{
    Transaction, TransactionInput, TransactionOutput, TransactionOutputTarget, TransactionReader,
};
