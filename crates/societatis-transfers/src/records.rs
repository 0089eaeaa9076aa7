//! Value types stored by the transfer index.
//!
//! Records are copied in on insert and never reference caller data.

use crate::descriptor::SpentOutputDescriptor;
use serde::{Deserialize, Serialize};
use societatis_types::{
    Hash, KeyImage, OutputType, PublicKey, UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX,
    UNCONFIRMED_TRANSACTION_HEIGHT,
};

// =============================================================================
// Block Info
// =============================================================================

/// Where a transaction was included, or the unconfirmed sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBlockInfo {
    pub height: u32,
    pub timestamp: u64,
    pub transaction_index: u32,
}

impl TransactionBlockInfo {
    pub fn new(height: u32, timestamp: u64, transaction_index: u32) -> Self {
        Self {
            height,
            timestamp,
            transaction_index,
        }
    }

    pub fn unconfirmed() -> Self {
        Self::new(UNCONFIRMED_TRANSACTION_HEIGHT, 0, 0)
    }

    pub fn is_confirmed(&self) -> bool {
        self.height != UNCONFIRMED_TRANSACTION_HEIGHT
    }
}

impl Default for TransactionBlockInfo {
    fn default() -> Self {
        Self::unconfirmed()
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Account-specific part of an output target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum OutputTarget {
    Key {
        output_key: PublicKey,
        key_image: KeyImage,
    },
    Multisignature { required_signatures: u32 },
}

/// An output the caller identified as belonging to the account.
///
/// `global_output_index` is required for confirmed submissions and ignored
/// for unconfirmed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevantOutput {
    pub amount: u64,
    pub global_output_index: u32,
    pub output_in_transaction: u32,
    pub target: OutputTarget,
}

impl RelevantOutput {
    pub fn key(amount: u64, output_in_transaction: u32, output_key: PublicKey, key_image: KeyImage) -> Self {
        Self {
            amount,
            global_output_index: UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX,
            output_in_transaction,
            target: OutputTarget::Key {
                output_key,
                key_image,
            },
        }
    }

    pub fn multisignature(amount: u64, output_in_transaction: u32, required_signatures: u32) -> Self {
        Self {
            amount,
            global_output_index: UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX,
            output_in_transaction,
            target: OutputTarget::Multisignature {
                required_signatures,
            },
        }
    }

    pub fn with_global_index(mut self, global_output_index: u32) -> Self {
        self.global_output_index = global_output_index;
        self
    }
}

/// A stored account output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub amount: u64,
    pub global_output_index: u32,
    pub output_in_transaction: u32,
    pub transaction_hash: Hash,
    pub transaction_public_key: PublicKey,
    pub target: OutputTarget,
    pub unlock_time: u64,
    pub block: TransactionBlockInfo,
    pub visible: bool,
}

impl OutputRecord {
    pub fn output_type(&self) -> OutputType {
        match self.target {
            OutputTarget::Key { .. } => OutputType::Key,
            OutputTarget::Multisignature { .. } => OutputType::Multisignature,
        }
    }

    pub fn key_image(&self) -> Option<KeyImage> {
        match self.target {
            OutputTarget::Key { key_image, .. } => Some(key_image),
            OutputTarget::Multisignature { .. } => None,
        }
    }

    pub fn descriptor(&self) -> SpentOutputDescriptor {
        SpentOutputDescriptor::from_output(self)
    }

    pub fn is_confirmed(&self) -> bool {
        self.block.is_confirmed()
    }

    /// `(transaction hash, position)` names one output of the chain.
    pub fn position(&self) -> (Hash, u32) {
        (self.transaction_hash, self.output_in_transaction)
    }
}

/// An output together with the input that spent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpentOutputRecord {
    pub output: OutputRecord,
    pub spending_block: TransactionBlockInfo,
    pub spending_transaction_hash: Hash,
    pub input_in_transaction: u32,
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInformation {
    pub transaction_hash: Hash,
    pub public_key: PublicKey,
    pub block_height: u32,
    pub timestamp: u64,
    pub transaction_index: u32,
    pub unlock_time: u64,
    pub total_amount_in: u64,
    pub total_amount_out: u64,
    #[serde(with = "hex")]
    pub extra: Vec<u8>,
    pub payment_id: Option<Hash>,
    /// Has a generating input; its outputs mature over the mined-money window.
    pub coinbase: bool,
}

impl TransactionInformation {
    pub fn is_confirmed(&self) -> bool {
        self.block_height != UNCONFIRMED_TRANSACTION_HEIGHT
    }

    pub fn block(&self) -> TransactionBlockInfo {
        TransactionBlockInfo::new(self.block_height, self.timestamp, self.transaction_index)
    }

    pub(crate) fn set_block(&mut self, block: &TransactionBlockInfo) {
        self.block_height = block.height;
        self.timestamp = block.timestamp;
        self.transaction_index = block.transaction_index;
    }
}

/// Transaction metadata plus this account's share of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetails {
    #[serde(flatten)]
    pub info: TransactionInformation,
    /// Sum of this account's outputs spent by the transaction.
    pub amount_in: u64,
    /// Sum of this account's outputs created by the transaction.
    pub amount_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_info_sentinel() {
        assert!(!TransactionBlockInfo::unconfirmed().is_confirmed());
        assert!(!TransactionBlockInfo::default().is_confirmed());
        assert!(TransactionBlockInfo::new(0, 0, 0).is_confirmed());
    }

    #[test]
    fn test_record_descriptor_follows_kind() {
        let mut rec = OutputRecord {
            amount: 50,
            global_output_index: 12,
            output_in_transaction: 0,
            transaction_hash: Hash::new([1; 32]),
            transaction_public_key: PublicKey::NULL,
            target: OutputTarget::Multisignature {
                required_signatures: 2,
            },
            unlock_time: 0,
            block: TransactionBlockInfo::new(5, 0, 0),
            visible: true,
        };
        assert_eq!(
            rec.descriptor(),
            SpentOutputDescriptor::from_multisignature(50, 12)
        );
        assert_eq!(rec.key_image(), None);

        rec.target = OutputTarget::Key {
            output_key: PublicKey::NULL,
            key_image: KeyImage::new([3; 32]),
        };
        assert_eq!(
            rec.descriptor(),
            SpentOutputDescriptor::from_key_image(KeyImage::new([3; 32]))
        );
        assert_eq!(rec.output_type(), OutputType::Key);
    }
}
