//! Opaque, fixed-length byte containers for post-quantum (Dilithium) keys and signatures.
//!
//! No cryptography happens here: the bytes are carried from the deposit contract into the deposit
//! tree and the beacon state exactly as they were logged.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ssz::DecodeError;
use std::fmt;

/// Length of a Dilithium public key.
pub const PUBLIC_KEY_BYTES_LEN: usize = 2592;
/// Length of a Dilithium signature.
pub const SIGNATURE_BYTES_LEN: usize = 4595;

macro_rules! fixed_bytes_struct {
    ($name: ident, $byte_size: expr, $type_str: expr) => {
        #[doc = concat!("Stores the raw bytes of a ", $type_str, " without validating them.")]
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            bytes: Box<[u8; $byte_size]>,
        }

        impl $name {
            pub fn empty() -> Self {
                Self {
                    bytes: Box::new([0; $byte_size]),
                }
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.bytes[..]
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
                if bytes.len() != $byte_size {
                    return Err(DecodeError::InvalidByteLength {
                        len: bytes.len(),
                        expected: $byte_size,
                    });
                }
                let mut array = Box::new([0; $byte_size]);
                array.copy_from_slice(bytes);
                Ok(Self { bytes: array })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "0x{}…", hex::encode(&self.bytes[..4]))
            }
        }

        impl ssz::Encode for $name {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $byte_size
            }

            fn ssz_bytes_len(&self) -> usize {
                $byte_size
            }

            fn ssz_append(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.bytes[..])
            }
        }

        impl ssz::Decode for $name {
            fn is_ssz_fixed_len() -> bool {
                true
            }

            fn ssz_fixed_len() -> usize {
                $byte_size
            }

            fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
                Self::from_bytes(bytes)
            }
        }

        impl tree_hash::TreeHash for $name {
            fn tree_hash_type() -> tree_hash::TreeHashType {
                tree_hash::TreeHashType::Vector
            }

            fn tree_hash_packed_encoding(&self) -> tree_hash::PackedEncoding {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_packing_factor() -> usize {
                unreachable!("Vector should never be packed.")
            }

            fn tree_hash_root(&self) -> tree_hash::Hash256 {
                tree_hash::merkle_root(&self.bytes[..], 0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&format!("0x{}", hex::encode(&self.bytes[..])))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let string = String::deserialize(deserializer)?;
                let stripped = string
                    .strip_prefix("0x")
                    .ok_or_else(|| D::Error::custom("missing 0x prefix"))?;
                let bytes = hex::decode(stripped)
                    .map_err(|e| D::Error::custom(format!("invalid hex: {:?}", e)))?;
                $name::from_bytes(&bytes)
                    .map_err(|e| D::Error::custom(format!("invalid length: {:?}", e)))
            }
        }
    };
}

fixed_bytes_struct!(PublicKeyBytes, PUBLIC_KEY_BYTES_LEN, "Dilithium public key");
fixed_bytes_struct!(SignatureBytes, SIGNATURE_BYTES_LEN, "Dilithium signature");
