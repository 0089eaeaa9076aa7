//! Fixed-size 32-byte identifiers: hashes, keys and key images.
//!
//! All of these are plain owned byte arrays. They render and parse as
//! lowercase hex and serialize through serde as hex strings.

use crate::TypesError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size in bytes of every identifier in this module.
pub const KEY_SIZE: usize = 32;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; KEY_SIZE]);

        impl $name {
            /// All-zero value.
            pub const NULL: Self = Self([0u8; KEY_SIZE]);

            pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == [0u8; KEY_SIZE]
            }

            /// Parse from a byte slice that must be exactly 32 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
                let arr: [u8; KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| TypesError::InvalidLength {
                        expected: KEY_SIZE,
                        actual: bytes.len(),
                    })?;
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl From<[u8; KEY_SIZE]> for $name {
            fn from(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, TypesError> {
                let bytes = hex::decode(s).map_err(|e| TypesError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes! {
    /// A transaction or block hash.
    Hash
}

fixed_bytes! {
    /// A curve point used as a public key (view key, spend key, one-time output key).
    PublicKey
}

fixed_bytes! {
    /// A secret scalar. Never printed by `Display` consumers in this workspace.
    SecretKey
}

fixed_bytes! {
    /// The unique per-output spend token revealed when an output is spent.
    KeyImage
}
