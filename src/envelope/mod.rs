//! The wire envelope for one encrypted field value: a DEK id paired with AEAD
//! ciphertext, serialized as a BSON `Binary` of subtype 6 — the same subtype
//! MongoDB's own client-side field-level encryption uses for ciphertext blobs
//! (§6, the payload-field sibling of the wrapped-key `keyMaterial` format).

use crate::error::{Error, Result};
use bson::{spec::BinarySubtype, Binary};
use uuid::Uuid;

/// One encrypted field value: the DEK id it was wrapped under, plus AEAD
/// ciphertext framed as `nonce || ciphertext || tag`, matching
/// [`crate::crypto::Aes256GcmAead`]'s output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub key_id: Uuid,
    pub ciphertext: Vec<u8>,
}

impl EncryptedValue {
    /// Encodes into the BSON `Binary` placed at the field's position in the
    /// document.
    pub fn encode(&self) -> Binary {
        let mut bytes = Vec::with_capacity(16 + self.ciphertext.len());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        Binary {
            subtype: BinarySubtype::Encrypted,
            bytes,
        }
    }

    /// Decodes a ciphertext blob previously produced by [`EncryptedValue::encode`].
    pub fn decode(bin: &Binary) -> Result<Self> {
        if bin.subtype != BinarySubtype::Encrypted {
            return Err(Error::Bson(format!(
                "expected binary subtype 6 (encrypted), got {:?}",
                bin.subtype
            )));
        }
        if bin.bytes.len() < 16 {
            return Err(Error::Bson(
                "encrypted binary too short to contain a key id".into(),
            ));
        }
        let key_id = Uuid::from_slice(&bin.bytes[..16])
            .map_err(|e| Error::Bson(format!("invalid key id in encrypted binary: {}", e)))?;
        Ok(EncryptedValue {
            key_id,
            ciphertext: bin.bytes[16..].to_vec(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let value = EncryptedValue {
            key_id: Uuid::new_v4(),
            ciphertext: vec![1, 2, 3, 4],
        };
        let decoded = EncryptedValue::decode(&value.encode()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_wrong_subtype() {
        let bin = Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![0; 20],
        };
        assert!(EncryptedValue::decode(&bin).is_err());
    }

    #[test]
    fn rejects_binary_too_short_for_a_key_id() {
        let bin = Binary {
            subtype: BinarySubtype::Encrypted,
            bytes: vec![0; 4],
        };
        assert!(EncryptedValue::decode(&bin).is_err());
    }
}
