//! Read-only transaction view consumed by the transfer index.
//!
//! The index only reads what it needs from a [`TransactionReader`] during a
//! call and copies it; nothing borrowed from the reader outlives the call.

use serde::{Deserialize, Serialize};
use societatis_types::{Hash, KeyImage, OutputType, PublicKey};

// =============================================================================
// Inputs / Outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum TransactionInput {
    /// Coinbase input.
    Generating { height: u32 },
    Key {
        amount: u64,
        key_image: KeyImage,
        output_offsets: Vec<u32>,
    },
    Multisignature {
        amount: u64,
        output_index: u32,
        signature_count: u32,
    },
}

impl TransactionInput {
    pub fn amount(&self) -> u64 {
        match self {
            Self::Generating { .. } => 0,
            Self::Key { amount, .. } | Self::Multisignature { amount, .. } => *amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum TransactionOutputTarget {
    Key { key: PublicKey },
    Multisignature {
        keys: Vec<PublicKey>,
        required_signatures: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutput {
    pub amount: u64,
    pub target: TransactionOutputTarget,
}

impl TransactionOutput {
    pub fn output_type(&self) -> OutputType {
        match self.target {
            TransactionOutputTarget::Key { .. } => OutputType::Key,
            TransactionOutputTarget::Multisignature { .. } => OutputType::Multisignature,
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Read access to a parsed transaction.
pub trait TransactionReader {
    fn hash(&self) -> Hash;
    fn public_key(&self) -> PublicKey;
    fn unlock_time(&self) -> u64;
    fn extra(&self) -> &[u8];
    fn payment_id(&self) -> Option<Hash>;
    fn inputs(&self) -> &[TransactionInput];
    fn outputs(&self) -> &[TransactionOutput];

    fn input_total_amount(&self) -> u64 {
        self.inputs()
            .iter()
            .fold(0u64, |acc, i| acc.saturating_add(i.amount()))
    }

    fn output_total_amount(&self) -> u64 {
        self.outputs()
            .iter()
            .fold(0u64, |acc, o| acc.saturating_add(o.amount))
    }
}

/// Owned transaction, already parsed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: Hash,
    pub public_key: PublicKey,
    pub unlock_time: u64,
    #[serde(with = "hex")]
    pub extra: Vec<u8>,
    pub payment_id: Option<Hash>,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
}

impl Transaction {
    pub fn new(hash: Hash, public_key: PublicKey) -> Self {
        Self {
            hash,
            public_key,
            ..Default::default()
        }
    }

    pub fn with_unlock_time(mut self, unlock_time: u64) -> Self {
        self.unlock_time = unlock_time;
        self
    }

    pub fn with_input(mut self, input: TransactionInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_key_input(self, amount: u64, key_image: KeyImage) -> Self {
        self.with_input(TransactionInput::Key {
            amount,
            key_image,
            output_offsets: Vec::new(),
        })
    }

    pub fn with_key_output(mut self, amount: u64, key: PublicKey) -> Self {
        self.outputs.push(TransactionOutput {
            amount,
            target: TransactionOutputTarget::Key { key },
        });
        self
    }

    pub fn with_multisignature_output(
        mut self,
        amount: u64,
        keys: Vec<PublicKey>,
        required_signatures: u32,
    ) -> Self {
        self.outputs.push(TransactionOutput {
            amount,
            target: TransactionOutputTarget::Multisignature {
                keys,
                required_signatures,
            },
        });
        self
    }
}

impl TransactionReader for Transaction {
    fn hash(&self) -> Hash {
        self.hash
    }

    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn unlock_time(&self) -> u64 {
        self.unlock_time
    }

    fn extra(&self) -> &[u8] {
        &self.extra
    }

    fn payment_id(&self) -> Option<Hash> {
        self.payment_id
    }

    fn inputs(&self) -> &[TransactionInput] {
        &self.inputs
    }

    fn outputs(&self) -> &[TransactionOutput] {
        &self.outputs
    }
}
