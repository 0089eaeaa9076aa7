//! Output identity used to match an output with the input that spends it.

use crate::records::{OutputRecord, OutputTarget};
use societatis_types::KeyImage;

/// Identity of a spendable output.
///
/// Key outputs are identified by their key image. Multisignature outputs
/// carry no key image and are identified by `(amount, global_output_index)`,
/// which only exists once the output is confirmed. Variants never compare
/// equal to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpentOutputDescriptor {
    #[default]
    Invalid,
    KeyImage(KeyImage),
    Multisignature { amount: u64, global_output_index: u32 },
}

impl SpentOutputDescriptor {
    pub fn from_output(output: &OutputRecord) -> Self {
        match output.target {
            OutputTarget::Key { key_image, .. } => Self::KeyImage(key_image),
            OutputTarget::Multisignature { .. } => Self::Multisignature {
                amount: output.amount,
                global_output_index: output.global_output_index,
            },
        }
    }

    pub fn from_key_image(key_image: KeyImage) -> Self {
        Self::KeyImage(key_image)
    }

    pub fn from_multisignature(amount: u64, global_output_index: u32) -> Self {
        Self::Multisignature {
            amount,
            global_output_index,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }

    pub fn key_image(&self) -> Option<&KeyImage> {
        match self {
            Self::KeyImage(ki) => Some(ki),
            _ => None,
        }
    }
}
