//! Account public address and key material carried by subscriptions.
//!
//! Base58 address encoding is deliberately absent; accounts are identified
//! by their raw public key pair.

use crate::hash::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

/// Public spend/view key pair identifying an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPublicAddress {
    pub spend_public_key: PublicKey,
    pub view_public_key: PublicKey,
}

impl AccountPublicAddress {
    pub fn new(spend_public_key: PublicKey, view_public_key: PublicKey) -> Self {
        Self {
            spend_public_key,
            view_public_key,
        }
    }
}

/// Keys handed to the synchronizer for one account.
///
/// The spend secret is absent for tracking (view-only) accounts.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKeys {
    pub address: AccountPublicAddress,
    pub view_secret_key: SecretKey,
    pub spend_secret_key: Option<SecretKey>,
}

impl AccountKeys {
    /// Keys for a view-only account.
    pub fn tracking(address: AccountPublicAddress, view_secret_key: SecretKey) -> Self {
        Self {
            address,
            view_secret_key,
            spend_secret_key: None,
        }
    }

    pub fn can_spend(&self) -> bool {
        self.spend_secret_key.is_some()
    }
}

impl std::fmt::Debug for AccountKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeys")
            .field("address", &self.address)
            .field("can_spend", &self.can_spend())
            .finish_non_exhaustive()
    }
}
