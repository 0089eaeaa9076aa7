//! Protocol constants and unlock-time rules.
//!
//! [`Currency`] is the read-only parameter set the wallet index consults when
//! deciding whether an output may be spent. It is built from a per-network
//! preset and individual values can be overridden with the `with_*` methods.
//!
//! Reference: cryptonote_config.h, Currency.cpp

use crate::constants::Network;
use serde::{Deserialize, Serialize};

// =============================================================================
// Core Constants
// =============================================================================

/// Unlock values below this are block heights, at or above are unix timestamps.
pub const MAX_BLOCK_NUMBER: u64 = 500_000_000;

/// Target seconds between blocks.
pub const DIFFICULTY_TARGET: u64 = 120;

/// Blocks before a coinbase output may be spent.
pub const MINED_MONEY_UNLOCK_WINDOW: u32 = 10;

/// Default blocks after inclusion before an output counts as unlocked.
pub const DEFAULT_TX_SPENDABLE_AGE: u32 = 10;

/// Default blocks after inclusion before an output counts as safely unlocked.
pub const DEFAULT_SAFE_TX_SPENDABLE_AGE: u32 = 40;

/// Tolerance for timestamp-based unlock times (seconds).
pub const LOCKED_TX_ALLOWED_DELTA_SECONDS: u64 = DIFFICULTY_TARGET;

// =============================================================================
// Currency
// =============================================================================

/// Protocol parameters used for unlock evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub network: Network,
    pub max_block_number: u64,
    pub difficulty_target: u64,
    pub locked_tx_allowed_delta_seconds: u64,
    pub mined_money_unlock_window: u32,
    pub transaction_spendable_age: u32,
    pub safe_transaction_spendable_age: u32,
}

impl Currency {
    /// Parameters for the given network.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                max_block_number: MAX_BLOCK_NUMBER,
                difficulty_target: DIFFICULTY_TARGET,
                locked_tx_allowed_delta_seconds: LOCKED_TX_ALLOWED_DELTA_SECONDS,
                mined_money_unlock_window: MINED_MONEY_UNLOCK_WINDOW,
                transaction_spendable_age: DEFAULT_TX_SPENDABLE_AGE,
                safe_transaction_spendable_age: DEFAULT_SAFE_TX_SPENDABLE_AGE,
            },
            // Test networks run with short windows so wallets unlock quickly.
            Network::Testnet | Network::Stagenet => Self {
                network,
                max_block_number: MAX_BLOCK_NUMBER,
                difficulty_target: DIFFICULTY_TARGET,
                locked_tx_allowed_delta_seconds: LOCKED_TX_ALLOWED_DELTA_SECONDS,
                mined_money_unlock_window: 2,
                transaction_spendable_age: 1,
                safe_transaction_spendable_age: 4,
            },
        }
    }

    pub fn with_spendable_age(mut self, age: u32) -> Self {
        self.transaction_spendable_age = age;
        self
    }

    pub fn with_safe_spendable_age(mut self, age: u32) -> Self {
        self.safe_transaction_spendable_age = age;
        self
    }

    pub fn with_difficulty_target(mut self, seconds: u64) -> Self {
        self.difficulty_target = seconds;
        self
    }

    /// Whether `unlock_time` is interpreted as a block height.
    pub fn is_height_unlock(&self, unlock_time: u64) -> bool {
        unlock_time < self.max_block_number
    }

    /// Estimate chain time at `current_height` from the newest known block.
    pub fn estimate_chain_time(
        &self,
        last_block_timestamp: u64,
        last_block_height: u32,
        current_height: u32,
    ) -> u64 {
        let ahead = current_height.saturating_sub(last_block_height) as u64;
        last_block_timestamp.saturating_add(ahead.saturating_mul(self.difficulty_target))
    }

    /// Check whether an output's unlock time has passed.
    ///
    /// Height-based values unlock once `current_height >= unlock_time + maturity_window`.
    /// Timestamp-based values unlock once the estimated chain time (plus the
    /// allowed delta) reaches the value.
    pub fn is_unlock_time_passed(
        &self,
        unlock_time: u64,
        maturity_window: u32,
        current_height: u32,
        chain_time: u64,
    ) -> bool {
        if self.is_height_unlock(unlock_time) {
            current_height as u64 >= unlock_time + maturity_window as u64
        } else {
            chain_time.saturating_add(self.locked_tx_allowed_delta_seconds) >= unlock_time
        }
    }

    /// Full spendability rule for a confirmed output: it must be
    /// `maturity_window` blocks deep and its unlock time must have passed.
    pub fn is_output_unlocked(
        &self,
        unlock_time: u64,
        block_height: u32,
        maturity_window: u32,
        current_height: u32,
        chain_time: u64,
    ) -> bool {
        (current_height as u64) >= block_height as u64 + maturity_window as u64
            && self.is_unlock_time_passed(unlock_time, maturity_window, current_height, chain_time)
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}
