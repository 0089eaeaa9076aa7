//! Societatis network identifiers and wallet-side sentinel values.
//!
//! Reference: cryptonote_config.h, IWallet.h

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Network Types
// =============================================================================

/// Network type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Stagenet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Stagenet => write!(f, "stagenet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "stagenet" | "stage" => Ok(Self::Stagenet),
            _ => Err(format!("unknown network: {} (use mainnet, testnet, or stagenet)", s)),
        }
    }
}

// =============================================================================
// Wallet Sentinels
// =============================================================================

/// Block height recorded for transactions that are not yet in a block.
pub const UNCONFIRMED_TRANSACTION_HEIGHT: u32 = u32::MAX;

/// Global output index recorded for outputs of unconfirmed transactions.
pub const UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX: u32 = u32::MAX;

// =============================================================================
// Output Kinds
// =============================================================================

/// Output target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum OutputType {
    /// Spendable with a single one-time key; spent by revealing a key image.
    Key = 0,
    /// M-of-N output; spent by referencing (amount, global index).
    Multisignature = 1,
}

impl OutputType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Key),
            1 => Some(Self::Multisignature),
            _ => None,
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key => write!(f, "KEY"),
            Self::Multisignature => write!(f, "MULTISIGNATURE"),
        }
    }
}
