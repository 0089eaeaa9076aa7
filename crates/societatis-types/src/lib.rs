//! Core types and constants for the Societatis wallet.
//!
//! This crate provides the foundational types shared by the wallet crates:
//! fixed-size hashes and keys, account addresses, network identifiers and
//! the protocol parameters used for unlock-time evaluation.

pub mod address;
pub mod consensus;
pub mod constants;
pub mod hash;

pub use address::{AccountKeys, AccountPublicAddress};
pub use consensus::Currency;
pub use constants::{
    Network, OutputType, UNCONFIRMED_TRANSACTION_GLOBAL_OUTPUT_INDEX,
    UNCONFIRMED_TRANSACTION_HEIGHT,
};
pub use hash::{Hash, KeyImage, PublicKey, SecretKey};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
