//! Field-path marking model and the document walk that applies per-field
//! encryption and decryption (§3 "operation-specific payload", §4.4 markings).
//!
//! Neither direction touches BSON parsing itself — that's the `bson` crate's
//! job — this module only knows which fields to touch and how to wrap/unwrap
//! a single value through [`crate::envelope::EncryptedValue`].

use crate::broker::KeyBroker;
use crate::crypto::{AeadImpl, Aes256GcmAead};
use crate::envelope::EncryptedValue;
use crate::error::{Error, Result};
use bson::{spec::BinarySubtype, Bson, Document};
use uuid::Uuid;

/// How a field's DEK was identified, either directly or via the broker's
/// alt-name unification (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReference {
    Id(Uuid),
    AltName(String),
}

impl KeyReference {
    /// Registers this reference as a broker request (§4.3 "request a key").
    pub fn request(&self, broker: &mut KeyBroker) -> Result<()> {
        match self {
            KeyReference::Id(id) => broker.request_by_id(*id),
            KeyReference::AltName(name) => broker.request_by_altname(name.clone()),
        }
    }

    fn lookup<'a>(&self, broker: &'a KeyBroker) -> Result<&'a [u8]> {
        match self {
            KeyReference::Id(id) => broker.lookup(*id),
            KeyReference::AltName(name) => broker.lookup_by_altname(name),
        }
    }

    fn resolved_id(&self, broker: &KeyBroker) -> Result<Uuid> {
        match self {
            KeyReference::Id(id) => Ok(*id),
            KeyReference::AltName(name) => broker.id_for_altname(name),
        }
    }
}

/// One field the operation must encrypt: a dotted path plus the DEK it goes
/// under. Built directly by explicit-encrypt callers, or parsed out of server
/// markings by the auto-encrypt variant.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub path: String,
    pub key: KeyReference,
}

impl FieldSpec {
    /// Parses one marking record as fed to `mongo_feed_markings` (§4.4): a
    /// document naming the field path and the DEK it should be encrypted
    /// under, by id or alt-name.
    pub fn parse_marking(doc: &Document) -> Result<Self> {
        let path = match doc.get("path") {
            Some(Bson::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(Error::Bson("marking missing non-empty path".into())),
        };

        let key = match (doc.get("keyId"), doc.get("keyAltName")) {
            (Some(Bson::Binary(b)), _) => KeyReference::Id(
                Uuid::from_slice(&b.bytes)
                    .map_err(|e| Error::Bson(format!("marking has invalid keyId: {}", e)))?,
            ),
            (None, Some(Bson::String(name))) if !name.is_empty() => {
                KeyReference::AltName(name.clone())
            }
            _ => return Err(Error::Bson("marking missing keyId or keyAltName".into())),
        };

        Ok(FieldSpec { path, key })
    }
}

fn navigate_mut<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Bson> {
    let mut segments = path.split('.');
    let first = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Client("field path must not be empty".into()))?;

    let mut current = doc
        .get_mut(first)
        .ok_or_else(|| Error::Client(format!("field not found: {}", path)))?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner
                .get_mut(segment)
                .ok_or_else(|| Error::Client(format!("field not found: {}", path)))?,
            _ => {
                return Err(Error::Client(format!(
                    "field path segment is not a document: {}",
                    path
                )))
            }
        };
    }
    Ok(current)
}

/// Wraps `value` in a canonical single-field document so arbitrary BSON
/// values (not just documents) can be passed through the AEAD as bytes.
fn wrap_value(value: Bson) -> Result<Vec<u8>> {
    let wrapper = bson::doc! { "v": value };
    let mut bytes = Vec::new();
    wrapper
        .to_writer(&mut bytes)
        .map_err(|e| Error::Bson(e.to_string()))?;
    Ok(bytes)
}

fn unwrap_value(plaintext: &[u8]) -> Result<Bson> {
    let wrapper =
        Document::from_reader(plaintext).map_err(|e| Error::Bson(e.to_string()))?;
    wrapper
        .get("v")
        .cloned()
        .ok_or_else(|| Error::Bson("decrypted envelope missing v".into()))
}

/// Encrypts every field named in `specs`, in place, using DEKs resolved from
/// `broker` (which must be in `kms-complete`).
pub fn encrypt_fields(payload: &mut Document, specs: &[FieldSpec], broker: &KeyBroker) -> Result<()> {
    let aead = Aes256GcmAead::new();
    for spec in specs {
        let key_id = spec.key.resolved_id(broker)?;
        let dek = spec.key.lookup(broker)?;
        let slot = navigate_mut(payload, &spec.path)?;
        let value = std::mem::replace(slot, Bson::Null);
        let plaintext = wrap_value(value)?;
        let ciphertext = aead.encrypt(&plaintext, dek)?;
        *slot = Bson::Binary(EncryptedValue { key_id, ciphertext }.encode());
    }
    Ok(())
}

fn decrypt_bson(value: &mut Bson, broker: &KeyBroker, aead: &Aes256GcmAead) -> Result<()> {
    match value {
        Bson::Binary(b) if b.subtype == BinarySubtype::Encrypted => {
            let enc = EncryptedValue::decode(b)?;
            let dek = broker.lookup(enc.key_id)?;
            let plaintext = aead.decrypt(&enc.ciphertext, dek)?;
            *value = unwrap_value(&plaintext)?;
        }
        Bson::Document(doc) => {
            for (_, v) in doc.iter_mut() {
                decrypt_bson(v, broker, aead)?;
            }
        }
        Bson::Array(arr) => {
            for v in arr.iter_mut() {
                decrypt_bson(v, broker, aead)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decrypts every encrypted binary (subtype 6) found anywhere in `payload`,
/// recursing through nested documents and arrays, using DEKs resolved from
/// `broker` (which must be in `kms-complete`).
pub fn decrypt_fields(payload: &mut Document, broker: &KeyBroker) -> Result<()> {
    let aead = Aes256GcmAead::new();
    for (_, v) in payload.iter_mut() {
        decrypt_bson(v, broker, &aead)?;
    }
    Ok(())
}

fn collect_ids(value: &Bson, ids: &mut Vec<Uuid>) -> Result<()> {
    match value {
        Bson::Binary(b) if b.subtype == BinarySubtype::Encrypted => {
            let enc = EncryptedValue::decode(b)?;
            if !ids.contains(&enc.key_id) {
                ids.push(enc.key_id);
            }
        }
        Bson::Document(doc) => {
            for (_, v) in doc.iter() {
                collect_ids(v, ids)?;
            }
        }
        Bson::Array(arr) => {
            for v in arr {
                collect_ids(v, ids)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Finds every distinct DEK id referenced by encrypted binaries in `payload`,
/// used by the decrypt variant to seed its key requests at construction.
pub fn collect_encrypted_key_ids(payload: &Document) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    for (_, v) in payload.iter() {
        collect_ids(v, &mut ids)?;
    }
    Ok(ids)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::key::CryptoKey;
    use crate::kms::KmsCredentials;
    use bson::doc;

    fn broker_with_local_dek(id: Uuid, dek: &[u8]) -> KeyBroker {
        let master_key = vec![5_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(dek, &master_key).unwrap();
        let creds = KmsCredentials::new().with_local_key(CryptoKey::new(master_key));
        let mut broker = KeyBroker::new(true, creds);
        broker.request_by_id(id).unwrap();
        broker.filter().unwrap();
        broker
            .add_doc(&doc! {
                "_id": bson::Binary { subtype: bson::spec::BinarySubtype::Uuid, bytes: id.as_bytes().to_vec() },
                "keyAltNames": Vec::<String>::new(),
                "masterKey": { "provider": "local" },
                "keyMaterial": bson::Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: wrapped },
                "creationDate": 0_i64,
                "updateDate": 0_i64,
                "status": 0_i32,
                "version": 1_i32,
            })
            .unwrap();
        broker.done_adding_docs().unwrap();
        broker.kms_done().unwrap();
        broker
    }

    #[test]
    fn encrypt_then_decrypt_round_trips_a_field() {
        let id = Uuid::new_v4();
        let broker = broker_with_local_dek(id, b"thirty-two-byte-dek-material!!!!");

        let mut payload = doc! { "ssn": "123-45-6789", "other": 1_i32 };
        let specs = vec![FieldSpec {
            path: "ssn".to_string(),
            key: KeyReference::Id(id),
        }];
        encrypt_fields(&mut payload, &specs, &broker).unwrap();
        assert!(matches!(payload.get("ssn"), Some(Bson::Binary(_))));

        decrypt_fields(&mut payload, &broker).unwrap();
        assert_eq!(payload.get_str("ssn").unwrap(), "123-45-6789");
        assert_eq!(payload.get_i32("other").unwrap(), 1);
    }

    #[test]
    fn encrypts_a_nested_field() {
        let id = Uuid::new_v4();
        let broker = broker_with_local_dek(id, b"thirty-two-byte-dek-material!!!!");

        let mut payload = doc! { "address": { "zip": "90210" } };
        let specs = vec![FieldSpec {
            path: "address.zip".to_string(),
            key: KeyReference::Id(id),
        }];
        encrypt_fields(&mut payload, &specs, &broker).unwrap();
        let nested = payload.get_document("address").unwrap();
        assert!(matches!(nested.get("zip"), Some(Bson::Binary(_))));
    }

    #[test]
    fn collect_ids_finds_nested_and_array_ciphertexts() {
        let id = Uuid::new_v4();
        let enc = EncryptedValue {
            key_id: id,
            ciphertext: vec![1, 2, 3],
        };
        let payload = doc! {
            "top": Bson::Binary(enc.encode()),
            "nested": { "inner": Bson::Binary(enc.encode()) },
            "arr": [Bson::Binary(enc.encode())],
        };
        let ids = collect_encrypted_key_ids(&payload).unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn missing_field_path_is_an_error() {
        let id = Uuid::new_v4();
        let broker = broker_with_local_dek(id, b"thirty-two-byte-dek-material!!!!");
        let mut payload = doc! { "a": 1_i32 };
        let specs = vec![FieldSpec {
            path: "missing".to_string(),
            key: KeyReference::Id(id),
        }];
        assert!(encrypt_fields(&mut payload, &specs, &broker).is_err());
    }
}
