//! Query filter flags: output kind x output state.

use bitflags::bitflags;
use societatis_types::OutputType;
use std::str::FromStr;

bitflags! {
    /// Selects outputs by kind and state. A record matches when both its
    /// kind bit and its current state bit are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferFlags: u32 {
        const STATE_UNCONFIRMED = 1 << 0;
        const STATE_LOCKED = 1 << 1;
        const STATE_UNLOCKED = 1 << 2;
        const STATE_SPENT = 1 << 3;

        const TYPE_KEY = 1 << 8;
        const TYPE_MULTISIGNATURE = 1 << 9;

        const STATE_ALL_AVAILABLE = Self::STATE_LOCKED.bits() | Self::STATE_UNLOCKED.bits();
        const STATE_ALL = Self::STATE_UNCONFIRMED.bits()
            | Self::STATE_ALL_AVAILABLE.bits()
            | Self::STATE_SPENT.bits();
        const TYPE_ALL = Self::TYPE_KEY.bits() | Self::TYPE_MULTISIGNATURE.bits();

        const ALL = Self::STATE_ALL.bits() | Self::TYPE_ALL.bits();
        const ALL_AVAILABLE = Self::STATE_ALL_AVAILABLE.bits() | Self::TYPE_ALL.bits();
        const KEY_UNLOCKED = Self::STATE_UNLOCKED.bits() | Self::TYPE_KEY.bits();
    }
}

impl TransferFlags {
    /// Kind bit for an output type.
    pub fn for_output_type(output_type: OutputType) -> Self {
        match output_type {
            OutputType::Key => Self::TYPE_KEY,
            OutputType::Multisignature => Self::TYPE_MULTISIGNATURE,
        }
    }

    /// Kind bits only.
    pub fn kinds(self) -> Self {
        self & Self::TYPE_ALL
    }

    /// State bits only.
    pub fn states(self) -> Self {
        self & Self::STATE_ALL
    }
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self::KEY_UNLOCKED
    }
}

/// Parses a comma-separated list of names, e.g. `key,unlocked,locked`.
///
/// A list naming only kinds selects every state and vice versa.
impl FromStr for TransferFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let mut flags = Self::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            flags |= match name.to_lowercase().as_str() {
                "key" => Self::TYPE_KEY,
                "multisig" | "multisignature" => Self::TYPE_MULTISIGNATURE,
                "unconfirmed" => Self::STATE_UNCONFIRMED,
                "locked" => Self::STATE_LOCKED,
                "unlocked" => Self::STATE_UNLOCKED,
                "available" => Self::STATE_ALL_AVAILABLE,
                "spent" => Self::STATE_SPENT,
                "all" => Self::ALL,
                other => return Err(format!("unknown transfer flag: {}", other)),
            };
        }
        if flags.is_empty() {
            return Err("no transfer flags given".into());
        }
        if flags.kinds().is_empty() {
            flags |= Self::TYPE_ALL;
        }
        if flags.states().is_empty() {
            flags |= Self::STATE_ALL;
        }
        Ok(flags)
    }
}
