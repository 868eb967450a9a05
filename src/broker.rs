//! The key broker: aggregates key requests, ingests key documents, drives
//! KMS subcontexts to unwrap each DEK, and yields unwrapped DEKs by id or
//! alt-name (§4.3).
//!
//! Entries live in an arena (`Vec<BrokerEntry>`) addressed by integer id;
//! `HashMap`s from UUID and alt-name map onto that same id space, mirroring
//! the arena-plus-lookup-table shape the host library uses for its own
//! key cache (see [`crate::key`]).

use crate::doc::{build_key_filter, KeyDocument};
use crate::error::{Error, Result, StatusKind};
use crate::kek::KekDescriptor;
use crate::key::CryptoKey;
use crate::kms::{local, KmsCredentials, KmsSubcontext};
use bson::Document;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrokerState {
    CollectingRequests,
    RequestsFrozen,
    AddingDocs,
    DocsFrozen,
    KmsRunning,
    KmsComplete,
}

enum EntryResolution {
    Unresolved,
    Resolved {
        kek: KekDescriptor,
        wrapped: Vec<u8>,
    },
    LocalUnwrapped(CryptoKey),
    AwaitingKms(usize), // index into `subcontexts`
    Unwrapped(CryptoKey),
    /// Resolution failed before any KMS round started (bad local master key,
    /// corrupt `keyMaterial`, missing provider credentials). Carries the
    /// classification and message so `kms_done` can surface the real cause
    /// instead of a generic "unresolved key" error at lookup time.
    Failed { kind: StatusKind, message: String },
    /// An alt-name request that turned out to name the same key as another
    /// entry already under direct id request; the other entry carries the
    /// resolution and this one is inert from here on.
    Merged(usize),
}

struct BrokerEntry {
    id: Option<Uuid>,
    alt_names: Vec<String>,
    resolution: EntryResolution,
}

/// Coordinates resolution of a set of DEK requests into unwrapped key
/// material, one operation at a time.
pub struct KeyBroker {
    state: BrokerState,
    strict: bool,
    entries: Vec<BrokerEntry>,
    by_id: HashMap<Uuid, usize>,
    by_name: HashMap<String, usize>,
    subcontexts: Vec<KmsSubcontext>,
    credentials: KmsCredentials,
}

impl KeyBroker {
    /// Builds a broker. `strict` controls whether `done_adding_docs` fails
    /// when a request goes unresolved (§4.3, §9 open question).
    pub fn new(strict: bool, credentials: KmsCredentials) -> Self {
        Self {
            state: BrokerState::CollectingRequests,
            strict,
            entries: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            subcontexts: Vec::new(),
            credentials,
        }
    }

    fn require_state(&self, expected: BrokerState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::Client(format!(
                "wrong state: broker operation {} is not valid in the current state",
                op
            )));
        }
        Ok(())
    }

    /// Requests a key by id. Duplicate requests for the same id collapse
    /// onto the same entry.
    pub fn request_by_id(&mut self, id: Uuid) -> Result<()> {
        self.require_state(BrokerState::CollectingRequests, "request_by_id")?;
        if self.by_id.contains_key(&id) {
            return Ok(());
        }
        let entry_id = self.entries.len();
        self.entries.push(BrokerEntry {
            id: Some(id),
            alt_names: Vec::new(),
            resolution: EntryResolution::Unresolved,
        });
        self.by_id.insert(id, entry_id);
        Ok(())
    }

    /// Requests a key by alt-name. Duplicate requests for the same name
    /// collapse onto the same entry.
    pub fn request_by_altname(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_state(BrokerState::CollectingRequests, "request_by_altname")?;
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Ok(());
        }
        let entry_id = self.entries.len();
        self.entries.push(BrokerEntry {
            id: None,
            alt_names: vec![name.clone()],
            resolution: EntryResolution::Unresolved,
        });
        self.by_name.insert(name, entry_id);
        Ok(())
    }

    /// Moves to `requests-frozen` and emits the `$or` filter document
    /// describing every outstanding request.
    pub fn filter(&mut self) -> Result<Document> {
        self.require_state(BrokerState::CollectingRequests, "filter")?;
        self.state = BrokerState::RequestsFrozen;

        let ids: Vec<Uuid> = self.by_id.keys().copied().collect();
        let names: Vec<String> = self.by_name.keys().cloned().collect();
        Ok(build_key_filter(&ids, &names))
    }

    fn unify(&mut self, name: &str, doc_id: Uuid) {
        let name_entry = self.by_name.get(name).copied();
        let id_entry = self.by_id.get(&doc_id).copied();

        match (name_entry, id_entry) {
            (Some(n), Some(i)) if n != i => {
                // Alt-name request resolves to an id already under direct
                // request: fold the name-request into the id-entry, don't
                // spawn a second KMS exchange. Retire the orphaned entry so
                // it doesn't read as still-outstanding in done_adding_docs.
                if let Some(entry) = self.entries.get_mut(n) {
                    entry.resolution = EntryResolution::Merged(i);
                }
                self.by_name.insert(name.to_string(), i);
            }
            (Some(_), None) => {
                self.by_id.insert(doc_id, name_entry.expect("checked Some"));
            }
            _ => {}
        }
    }

    /// Ingests one candidate key document in `adding-docs`.
    pub fn add_doc(&mut self, doc: &Document) -> Result<()> {
        self.require_state(BrokerState::RequestsFrozen, "add_doc")
            .or_else(|_| self.require_state(BrokerState::AddingDocs, "add_doc"))?;
        self.state = BrokerState::AddingDocs;

        let parsed = KeyDocument::parse(doc)?;

        for name in &parsed.key_alt_names {
            self.unify(name, parsed.id);
        }

        let matched_by_id = self.by_id.get(&parsed.id).copied();
        let matched_by_name = parsed
            .key_alt_names
            .iter()
            .find_map(|n| self.by_name.get(n).copied());

        let entry_id = match matched_by_id.or(matched_by_name) {
            Some(id) => id,
            None => {
                return Err(Error::Client(format!(
                    "key document {} does not match any outstanding request",
                    parsed.id
                )))
            }
        };

        self.by_id.insert(parsed.id, entry_id);
        let entry = &mut self.entries[entry_id];
        entry.id = Some(parsed.id);
        for name in &parsed.key_alt_names {
            if !entry.alt_names.contains(name) {
                entry.alt_names.push(name.clone());
            }
        }

        // Idempotent: re-ingesting the same document for an already-resolved
        // entry is a no-op rather than a second resolution.
        if matches!(entry.resolution, EntryResolution::Unresolved) {
            entry.resolution = EntryResolution::Resolved {
                kek: parsed.master_key,
                wrapped: parsed.key_material,
            };
        }

        Ok(())
    }

    /// Transitions to `docs-frozen`, spawning a KMS subcontext (or
    /// completing synchronously) for every resolved entry.
    pub fn done_adding_docs(&mut self) -> Result<()> {
        if self.state != BrokerState::RequestsFrozen && self.state != BrokerState::AddingDocs {
            return Err(Error::Client(
                "wrong state: done_adding_docs requires an open ingest phase".into(),
            ));
        }

        let unresolved: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matches!(e.resolution, EntryResolution::Unresolved))
            .map(|e| {
                e.id.map(|id| id.to_string())
                    .or_else(|| e.alt_names.first().cloned())
                    .unwrap_or_else(|| "<unknown>".into())
            })
            .collect();

        if !unresolved.is_empty() && self.strict {
            return Err(Error::Client(format!(
                "unresolved key request(s): {}",
                unresolved.join(", ")
            )));
        }

        for entry in &mut self.entries {
            let (kek, wrapped) = match &entry.resolution {
                EntryResolution::Resolved { kek, wrapped } => (kek.clone(), wrapped.clone()),
                _ => continue,
            };

            match &kek {
                KekDescriptor::Local => {
                    let master_key = self
                        .credentials
                        .local_key
                        .as_ref()
                        .map(|k| k.as_bytes().to_vec())
                        .unwrap_or_default();
                    match local::unwrap(&wrapped, &master_key) {
                        Ok(bytes) => {
                            entry.resolution = EntryResolution::LocalUnwrapped(CryptoKey::new(bytes))
                        }
                        Err(e) => {
                            entry.resolution = EntryResolution::Failed {
                                kind: e.status_kind(),
                                message: e.to_string(),
                            }
                        }
                    }
                }
                _ => match KmsSubcontext::build(&kek, &wrapped, &self.credentials) {
                    Ok(ctx) => {
                        let idx = self.subcontexts.len();
                        log::debug!(
                            "broker spawning {} KMS subcontext for entry {:?}",
                            kek.provider_name(),
                            entry.id
                        );
                        self.subcontexts.push(ctx);
                        entry.resolution = EntryResolution::AwaitingKms(idx);
                    }
                    Err(e) => {
                        entry.resolution = EntryResolution::Failed {
                            kind: e.status_kind(),
                            message: e.to_string(),
                        }
                    }
                },
            }
        }

        self.state = BrokerState::KmsRunning;
        Ok(())
    }

    /// Returns one incomplete subcontext, or `None` if every subcontext has
    /// completed. Iteration order is insertion order; callers must not
    /// depend on that (§9).
    pub fn next_kms(&mut self) -> Option<&mut KmsSubcontext> {
        if self.state != BrokerState::KmsRunning {
            return None;
        }
        self.subcontexts.iter_mut().find(|c| !c.is_complete())
    }

    /// Asserts all subcontexts are complete, folding unwrapped key material
    /// back into the owning entries and moving to `kms-complete`.
    pub fn kms_done(&mut self) -> Result<()> {
        if self.state != BrokerState::KmsRunning {
            return Err(Error::Client(
                "wrong state: kms_done requires an active KMS round".into(),
            ));
        }

        if let Some(ctx) = self.subcontexts.iter().find(|c| !c.is_complete()) {
            let _ = ctx;
            return Err(Error::Client(
                "cannot finish: one or more KMS subcontexts are still incomplete".into(),
            ));
        }

        for ctx in &self.subcontexts {
            if !ctx.status().is_ok() {
                return Err(Error::Kms(ctx.status().message().to_string()));
            }
        }

        // A local-unwrap or subcontext-build failure in done_adding_docs
        // never reached a subcontext at all, so the status loop above can't
        // see it. Surface it here with its real kind and message instead of
        // letting the entry sit dead until lookup/finalize report a generic
        // "unresolved key" error.
        let failed = self.entries.iter().find_map(|e| match &e.resolution {
            EntryResolution::Failed { kind, message } => Some((*kind, message.clone())),
            _ => None,
        });
        if let Some((kind, message)) = failed {
            return Err(match kind {
                StatusKind::Kms => Error::Kms(message),
                _ => Error::Client(message),
            });
        }

        for entry in &mut self.entries {
            if let EntryResolution::AwaitingKms(idx) = entry.resolution {
                if let Some(key) = self.subcontexts[idx].take_unwrapped() {
                    entry.resolution = EntryResolution::Unwrapped(key);
                }
            } else if matches!(entry.resolution, EntryResolution::LocalUnwrapped(_)) {
                if let EntryResolution::LocalUnwrapped(key) =
                    std::mem::replace(&mut entry.resolution, EntryResolution::Unresolved)
                {
                    entry.resolution = EntryResolution::Unwrapped(key);
                }
            }
        }

        self.state = BrokerState::KmsComplete;
        Ok(())
    }

    fn lookup_entry(&self, entry_id: usize) -> Result<&[u8]> {
        if self.state != BrokerState::KmsComplete {
            return Err(Error::Client(
                "wrong state: lookup requires kms-complete".into(),
            ));
        }
        match &self.entries[entry_id].resolution {
            EntryResolution::Unwrapped(key) => Ok(key.as_bytes()),
            _ => Err(Error::Client("unresolved key: no unwrapped DEK available".into())),
        }
    }

    /// Retrieves the unwrapped DEK by id.
    pub fn lookup(&self, id: Uuid) -> Result<&[u8]> {
        let entry_id = *self
            .by_id
            .get(&id)
            .ok_or_else(|| Error::Client(format!("unresolved key: no request for id {}", id)))?;
        self.lookup_entry(entry_id)
    }

    /// Retrieves the unwrapped DEK by alt-name.
    pub fn lookup_by_altname(&self, name: &str) -> Result<&[u8]> {
        let entry_id = *self.by_name.get(name).ok_or_else(|| {
            Error::Client(format!("unresolved key: no request for alt-name {}", name))
        })?;
        self.lookup_entry(entry_id)
    }

    /// Resolves an alt-name request to the key id a matching document bound
    /// it to. Used by [`crate::payload`] to stamp the DEK id onto a freshly
    /// encrypted field even when the field was only ever requested by name.
    pub fn id_for_altname(&self, name: &str) -> Result<Uuid> {
        let entry_id = *self.by_name.get(name).ok_or_else(|| {
            Error::Client(format!("unresolved key: no request for alt-name {}", name))
        })?;
        self.entries[entry_id].id.ok_or_else(|| {
            Error::Client(format!("alt-name {} has not resolved to a key id", name))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::{AeadImpl, Aes256GcmAead};
    use bson::{doc, Binary};

    fn local_key_doc(id: Uuid, alt_names: &[&str], wrapped: Vec<u8>) -> Document {
        doc! {
            "_id": Binary { subtype: bson::spec::BinarySubtype::Uuid, bytes: id.as_bytes().to_vec() },
            "keyAltNames": alt_names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "masterKey": { "provider": "local" },
            "keyMaterial": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: wrapped },
            "creationDate": 0_i64,
            "updateDate": 0_i64,
            "status": 0_i32,
            "version": 1_i32,
        }
    }

    #[test]
    fn local_kek_resolves_without_a_kms_round() {
        let master_key = vec![1_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(b"dek-bytes", &master_key).unwrap();
        let id = Uuid::new_v4();

        let creds = KmsCredentials::new().with_local_key(CryptoKey::new(master_key));
        let mut broker = KeyBroker::new(true, creds);
        broker.request_by_id(id).unwrap();
        let filter = broker.filter().unwrap();
        assert!(filter.contains_key("_id"));

        broker.add_doc(&local_key_doc(id, &[], wrapped)).unwrap();
        broker.done_adding_docs().unwrap();
        assert!(broker.next_kms().is_none());
        broker.kms_done().unwrap();

        assert_eq!(broker.lookup(id).unwrap(), b"dek-bytes");
    }

    #[test]
    fn altname_and_id_requests_for_the_same_key_unify() {
        let master_key = vec![2_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(b"payments-dek", &master_key).unwrap();
        let id = Uuid::new_v4();

        let creds = KmsCredentials::new().with_local_key(CryptoKey::new(master_key));
        let mut broker = KeyBroker::new(true, creds);
        broker.request_by_altname("payments-key").unwrap();
        broker.filter().unwrap();
        broker
            .add_doc(&local_key_doc(id, &["payments-key"], wrapped))
            .unwrap();
        broker.done_adding_docs().unwrap();
        broker.kms_done().unwrap();

        assert_eq!(broker.lookup(id).unwrap(), b"payments-dek");
        assert_eq!(broker.lookup_by_altname("payments-key").unwrap(), b"payments-dek");
    }

    #[test]
    fn strict_broker_rejects_unresolved_requests() {
        let mut broker = KeyBroker::new(true, KmsCredentials::new());
        broker.request_by_id(Uuid::new_v4()).unwrap();
        broker.filter().unwrap();
        assert!(broker.done_adding_docs().is_err());
    }

    #[test]
    fn permissive_broker_tolerates_unresolved_requests() {
        let mut broker = KeyBroker::new(false, KmsCredentials::new());
        broker.request_by_id(Uuid::new_v4()).unwrap();
        broker.filter().unwrap();
        assert!(broker.done_adding_docs().is_ok());
    }

    #[test]
    fn document_matching_nothing_is_rejected() {
        let mut broker = KeyBroker::new(true, KmsCredentials::new());
        broker.request_by_id(Uuid::new_v4()).unwrap();
        broker.filter().unwrap();
        let stray_id = Uuid::new_v4();
        let err = broker.add_doc(&local_key_doc(stray_id, &[], vec![1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn duplicate_documents_are_idempotent() {
        let master_key = vec![3_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(b"dek", &master_key).unwrap();
        let id = Uuid::new_v4();
        let creds = KmsCredentials::new().with_local_key(CryptoKey::new(master_key));
        let mut broker = KeyBroker::new(true, creds);
        broker.request_by_id(id).unwrap();
        broker.filter().unwrap();
        let doc = local_key_doc(id, &[], wrapped);
        broker.add_doc(&doc).unwrap();
        broker.add_doc(&doc).unwrap();
        broker.done_adding_docs().unwrap();
        broker.kms_done().unwrap();
        assert_eq!(broker.lookup(id).unwrap(), b"dek");
    }

    #[test]
    fn lookup_before_kms_complete_is_rejected() {
        let mut broker = KeyBroker::new(false, KmsCredentials::new());
        broker.request_by_id(Uuid::new_v4()).unwrap();
        broker.filter().unwrap();
        assert!(broker.done_adding_docs().is_ok());
        assert!(broker.lookup(Uuid::new_v4()).is_err());
    }

    #[test]
    fn id_and_altname_requested_separately_then_unified_by_one_doc() {
        // One operation asks for the same key twice: once by id, once by
        // alt-name. A single fed document resolves both at once; the
        // orphaned alt-name entry must not read as unresolved.
        let master_key = vec![4_u8; 32];
        let wrapped = Aes256GcmAead::new().encrypt(b"pay-dek", &master_key).unwrap();
        let id = Uuid::new_v4();

        let creds = KmsCredentials::new().with_local_key(CryptoKey::new(master_key));
        let mut broker = KeyBroker::new(true, creds);
        broker.request_by_id(id).unwrap();
        broker.request_by_altname("pay").unwrap();
        broker.filter().unwrap();

        broker
            .add_doc(&local_key_doc(id, &["pay"], wrapped))
            .unwrap();
        broker.done_adding_docs().unwrap();
        assert!(broker.next_kms().is_none());
        broker.kms_done().unwrap();

        assert_eq!(broker.lookup(id).unwrap(), b"pay-dek");
        assert_eq!(broker.lookup_by_altname("pay").unwrap(), b"pay-dek");
    }

    #[test]
    fn local_unwrap_failure_surfaces_at_kms_done_not_lookup() {
        // No local master key configured: local::unwrap fails inside
        // done_adding_docs. That failure must be reported by kms_done with
        // its real kind and message, not swallowed into a generic
        // "unresolved key" error at lookup time.
        let id = Uuid::new_v4();
        let mut broker = KeyBroker::new(true, KmsCredentials::new());
        broker.request_by_id(id).unwrap();
        broker.filter().unwrap();
        broker
            .add_doc(&local_key_doc(id, &[], vec![1, 2, 3, 4]))
            .unwrap();

        assert!(broker.done_adding_docs().is_ok());
        assert!(broker.next_kms().is_none());

        let err = broker.kms_done().unwrap_err();
        assert!(matches!(err, Error::Kms(_)));
        assert!(err.to_string().contains("master key"));
    }
}
