//! Transfer index error types.

use societatis_types::Hash;
use thiserror::Error;

/// Coarse classification of a [`TransfersError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Upstream input contradicts what the index already recorded.
    DataInconsistency,
    /// A persisted snapshot is malformed or cannot be reconciled.
    SnapshotCorruption,
    /// Subscription bookkeeping at the synchronizer boundary.
    Subscription,
}

#[derive(Debug, Error)]
pub enum TransfersError {
    #[error("transaction {0} already recorded with different outputs")]
    ConflictingTransaction(Hash),

    #[error("output {index} of transaction {hash} does not match the transaction: {reason}")]
    OutputMismatch {
        hash: Hash,
        index: u32,
        reason: String,
    },

    #[error("transaction {hash} has {expected} recorded outputs, got {actual} global indices")]
    GlobalIndexCountMismatch {
        hash: Hash,
        expected: usize,
        actual: usize,
    },

    #[error("multisignature transfer (amount {amount}, global index {global_index}) already exists")]
    TransferAlreadyExists { amount: u64, global_index: u32 },

    #[error("input {input} of transaction {hash} spends an already spent output")]
    AlreadySpent { hash: Hash, input: usize },

    #[error("input {input} of transaction {hash} has no matching output of amount {amount}")]
    InputAmountMismatch {
        hash: Hash,
        input: usize,
        amount: u64,
    },

    #[error("block height {height} is below current height {current}")]
    BlockBelowCurrentHeight { height: u32, current: u32 },

    #[error("transaction {hash} spends an output of unconfirmed transaction {origin}")]
    UnconfirmedOrigin { hash: Hash, origin: Hash },

    #[error("confirmation requires a block height, got the unconfirmed sentinel")]
    UnconfirmedBlockInfo,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("unsupported snapshot version: {0}")]
    UnsupportedSnapshotVersion(u32),

    #[error("snapshot could not be reconciled: {0}")]
    Unreconcilable(String),

    #[error("subscription already exists")]
    SubscriptionExists,

    #[error("unknown subscription")]
    UnknownSubscription,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransfersError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConflictingTransaction(_)
            | Self::OutputMismatch { .. }
            | Self::GlobalIndexCountMismatch { .. }
            | Self::TransferAlreadyExists { .. }
            | Self::AlreadySpent { .. }
            | Self::InputAmountMismatch { .. }
            | Self::BlockBelowCurrentHeight { .. }
            | Self::UnconfirmedOrigin { .. }
            | Self::UnconfirmedBlockInfo => ErrorKind::DataInconsistency,
            Self::Snapshot(_)
            | Self::UnsupportedSnapshotVersion(_)
            | Self::Unreconcilable(_)
            | Self::Io(_) => ErrorKind::SnapshotCorruption,
            Self::SubscriptionExists | Self::UnknownSubscription => ErrorKind::Subscription,
        }
    }
}

/// Error codes reported to observers through `on_error`.
///
/// The node-side codes come from the network layer; `Transfers` wraps a
/// failure of the index itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SyncErrorKind {
    #[error("Object was not initialized")]
    NotInitialized,

    #[error("Object has been already initialized")]
    AlreadyInitialized,

    #[error("Network error")]
    NetworkError,

    #[error("Node is busy")]
    NodeBusy,

    #[error("Internal node error")]
    InternalNodeError,

    #[error("Error in request parameters")]
    RequestError,

    #[error("Can't connect to daemon")]
    ConnectError,

    #[error("Transfer index error: {0:?}")]
    Transfers(ErrorKind),
}

impl From<&TransfersError> for SyncErrorKind {
    fn from(e: &TransfersError) -> Self {
        Self::Transfers(e.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            TransfersError::ConflictingTransaction(Hash::NULL).kind(),
            ErrorKind::DataInconsistency
        );
        assert_eq!(
            TransfersError::UnsupportedSnapshotVersion(9).kind(),
            ErrorKind::SnapshotCorruption
        );
        assert_eq!(TransfersError::UnknownSubscription.kind(), ErrorKind::Subscription);
    }

    #[test]
    fn test_sync_error_messages() {
        assert_eq!(SyncErrorKind::NodeBusy.to_string(), "Node is busy");
        assert_eq!(SyncErrorKind::ConnectError.to_string(), "Can't connect to daemon");
        let wrapped = SyncErrorKind::from(&TransfersError::UnconfirmedBlockInfo);
        assert_eq!(wrapped, SyncErrorKind::Transfers(ErrorKind::DataInconsistency));
    }
}
