//! The driver-driven context state machine: the outer engine a host pumps
//! through collection-info fetch, marking, key fetch, and KMS rounds without
//! the core ever touching a socket (§4.4).
//!
//! `Context` stays a flat struct; the three operation shapes (auto-encrypt,
//! explicit-encrypt, decrypt) live behind [`ContextVariant`], a sealed sum
//! type whose arms each implement [`VariantHooks`] — the Rust rendition of
//! the hook table in §9.

use crate::broker::KeyBroker;
use crate::error::{Error, Result, Status};
use crate::kms::{KmsCredentials, KmsSubcontext};
use crate::payload::{self, FieldSpec, KeyReference};
use bson::Document;
use metrics::{counter, histogram};
use std::time::Instant;
use uuid::Uuid;

/// A state in the transition graph of §4.4. Every public driver method
/// dispatches on the current state and either performs the mandated I/O or
/// refuses with a client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NeedMongoCollInfo,
    NeedMongoMarkings,
    NeedMongoKeys,
    NeedKms,
    Ready,
    Done,
    NothingToDo,
    Error,
}

/// Per-variant behavior at the collinfo and markings states, and the
/// variant-specific finalize/cleanup hooks shared across all three contexts.
/// Default implementations are "this state never applies to this variant" —
/// `EncryptExplicit` and `Decrypt` never enter `NEED_MONGO_COLLINFO` or
/// `NEED_MONGO_MARKINGS`, so they simply inherit the defaults (§4.4
/// "Polymorphism").
trait VariantHooks {
    fn mongo_op_collinfo(&mut self) -> Result<Document> {
        Err(Error::Internal(
            "collinfo phase is not applicable to this operation".into(),
        ))
    }

    fn mongo_feed_collinfo(&mut self, _doc: &Document) -> Result<()> {
        Err(Error::Internal(
            "collinfo phase is not applicable to this operation".into(),
        ))
    }

    fn mongo_done_collinfo(&mut self) -> Result<State> {
        Err(Error::Internal(
            "collinfo phase is not applicable to this operation".into(),
        ))
    }

    fn mongo_op_markings(&mut self) -> Result<Document> {
        Err(Error::Internal(
            "markings phase is not applicable to this operation".into(),
        ))
    }

    fn mongo_feed_markings(&mut self, _doc: &Document) -> Result<()> {
        Err(Error::Internal(
            "markings phase is not applicable to this operation".into(),
        ))
    }

    fn mongo_done_markings(&mut self, _broker: &mut KeyBroker) -> Result<State> {
        Err(Error::Internal(
            "markings phase is not applicable to this operation".into(),
        ))
    }

    fn finalize(&mut self, broker: &KeyBroker) -> Result<Document>;

    fn cleanup(&mut self) {}
}

/// Auto-encrypt: needs the collection's schema before it knows which fields
/// to mark, then a markings round (mirroring a `mongocryptd`-style marker)
/// before it knows which DEKs to fetch.
struct EncryptAutoState {
    namespace: String,
    payload: Document,
    schema_has_encrypted_fields: bool,
    markings: Vec<FieldSpec>,
}

impl VariantHooks for EncryptAutoState {
    fn mongo_op_collinfo(&mut self) -> Result<Document> {
        Ok(bson::doc! { "name": self.namespace.clone() })
    }

    fn mongo_feed_collinfo(&mut self, doc: &Document) -> Result<()> {
        let has_fields = doc
            .get_document("options")
            .ok()
            .and_then(|opts| opts.get_array("encryptedFields").ok())
            .map(|fields| !fields.is_empty())
            .unwrap_or(false);
        self.schema_has_encrypted_fields = self.schema_has_encrypted_fields || has_fields;
        Ok(())
    }

    fn mongo_done_collinfo(&mut self) -> Result<State> {
        if self.schema_has_encrypted_fields {
            Ok(State::NeedMongoMarkings)
        } else {
            Ok(State::NothingToDo)
        }
    }

    fn mongo_op_markings(&mut self) -> Result<Document> {
        Ok(self.payload.clone())
    }

    fn mongo_feed_markings(&mut self, doc: &Document) -> Result<()> {
        self.markings.push(FieldSpec::parse_marking(doc)?);
        Ok(())
    }

    fn mongo_done_markings(&mut self, broker: &mut KeyBroker) -> Result<State> {
        if self.markings.is_empty() {
            return Ok(State::NothingToDo);
        }
        for spec in &self.markings {
            spec.key.request(broker)?;
        }
        Ok(State::NeedMongoKeys)
    }

    fn finalize(&mut self, broker: &KeyBroker) -> Result<Document> {
        payload::encrypt_fields(&mut self.payload, &self.markings, broker)?;
        Ok(self.payload.clone())
    }
}

/// Explicit encrypt: the caller already names the fields and DEKs; no
/// collinfo or markings round is needed.
struct ExplicitEncryptState {
    payload: Document,
    fields: Vec<FieldSpec>,
}

impl VariantHooks for ExplicitEncryptState {
    fn finalize(&mut self, broker: &KeyBroker) -> Result<Document> {
        payload::encrypt_fields(&mut self.payload, &self.fields, broker)?;
        Ok(self.payload.clone())
    }
}

/// Decrypt: the DEK ids are already embedded in the ciphertext blobs, so
/// construction alone is enough to seed the broker's requests.
struct DecryptState {
    payload: Document,
}

impl VariantHooks for DecryptState {
    fn finalize(&mut self, broker: &KeyBroker) -> Result<Document> {
        payload::decrypt_fields(&mut self.payload, broker)?;
        Ok(self.payload.clone())
    }
}

enum ContextVariant {
    EncryptAuto(EncryptAutoState),
    EncryptExplicit(ExplicitEncryptState),
    Decrypt(DecryptState),
}

impl ContextVariant {
    fn hooks(&mut self) -> &mut dyn VariantHooks {
        match self {
            ContextVariant::EncryptAuto(s) => s,
            ContextVariant::EncryptExplicit(s) => s,
            ContextVariant::Decrypt(s) => s,
        }
    }
}

/// An operation-scoped context: the single object a host constructs,
/// repeatedly pumps through its required I/O, and tears down (§3).
pub struct Context {
    state: State,
    status: Status,
    broker: KeyBroker,
    variant: ContextVariant,
}

impl Context {
    /// Builds an auto-encrypt context. The schema for `namespace` is not yet
    /// known; the context starts at `NEED_MONGO_COLLINFO`.
    pub fn new_encrypt_auto(
        namespace: impl Into<String>,
        payload: Document,
        strict: bool,
        credentials: KmsCredentials,
    ) -> Self {
        Context {
            state: State::NeedMongoCollInfo,
            status: Status::ok(),
            broker: KeyBroker::new(strict, credentials),
            variant: ContextVariant::EncryptAuto(EncryptAutoState {
                namespace: namespace.into(),
                payload,
                schema_has_encrypted_fields: false,
                markings: Vec::new(),
            }),
        }
    }

    /// Builds an explicit-encrypt context. `fields` names exactly which
    /// paths to encrypt and under which DEK; an empty list short-circuits
    /// straight to `NOTHING_TO_DO` (§4.4).
    pub fn new_encrypt_explicit(
        payload: Document,
        fields: Vec<FieldSpec>,
        strict: bool,
        credentials: KmsCredentials,
    ) -> Result<Self> {
        let mut broker = KeyBroker::new(strict, credentials);
        for field in &fields {
            field.key.request(&mut broker)?;
        }
        let state = if fields.is_empty() {
            State::NothingToDo
        } else {
            State::NeedMongoKeys
        };
        Ok(Context {
            state,
            status: Status::ok(),
            broker,
            variant: ContextVariant::EncryptExplicit(ExplicitEncryptState { payload, fields }),
        })
    }

    /// Builds a decrypt context. The DEK ids referenced by `payload`'s
    /// encrypted binaries are discovered up front and requested immediately;
    /// a payload with nothing encrypted short-circuits to `NOTHING_TO_DO`.
    pub fn new_decrypt(payload: Document, strict: bool, credentials: KmsCredentials) -> Result<Self> {
        let key_ids = payload::collect_encrypted_key_ids(&payload)?;
        let mut broker = KeyBroker::new(strict, credentials);
        for id in &key_ids {
            broker.request_by_id(*id)?;
        }
        let state = if key_ids.is_empty() {
            State::NothingToDo
        } else {
            State::NeedMongoKeys
        };
        Ok(Context {
            state,
            status: Status::ok(),
            broker,
            variant: ContextVariant::Decrypt(DecryptState { payload }),
        })
    }

    /// The context's current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Copies the current status into `out`, returning whether it is ok
    /// (§7, "User-visible surface").
    pub fn status(&self, out: &mut Status) -> bool {
        out.clone_from(&self.status);
        self.status.is_ok()
    }

    /// Runs `f` unless the context is already in `ERROR`; on failure records
    /// the first error into the status channel and moves to `ERROR`. First
    /// failure wins (§7).
    fn drive<F: FnOnce(&mut Self) -> Result<()>>(&mut self, f: F) -> bool {
        if self.state == State::Error {
            return false;
        }
        match f(self) {
            Ok(()) => true,
            Err(e) => {
                self.status.set_error(&e);
                self.state = State::Error;
                false
            }
        }
    }

    /// Emits the outbound document for the current `NEED_MONGO_*` state
    /// (§4.4 `mongo_op`).
    pub fn mongo_op(&mut self, out: &mut Document) -> bool {
        self.drive(|ctx| {
            *out = match ctx.state {
                State::NeedMongoCollInfo => ctx.variant.hooks().mongo_op_collinfo()?,
                State::NeedMongoMarkings => ctx.variant.hooks().mongo_op_markings()?,
                State::NeedMongoKeys => ctx.broker.filter()?,
                _ => return Err(Error::Client("wrong state: mongo_op is not valid here".into())),
            };
            Ok(())
        })
    }

    /// Ingests one result document for the current `NEED_MONGO_*` state.
    /// Additional calls accumulate (§4.4 `mongo_feed`).
    pub fn mongo_feed(&mut self, doc: &Document) -> bool {
        self.drive(|ctx| match ctx.state {
            State::NeedMongoCollInfo => ctx.variant.hooks().mongo_feed_collinfo(doc),
            State::NeedMongoMarkings => ctx.variant.hooks().mongo_feed_markings(doc),
            State::NeedMongoKeys => ctx.broker.add_doc(doc),
            _ => Err(Error::Client("wrong state: mongo_feed is not valid here".into())),
        })
    }

    /// Closes the ingest phase for the current `NEED_MONGO_*` state and
    /// advances to the next state (§4.4 `mongo_done`).
    pub fn mongo_done(&mut self) -> bool {
        self.drive(|ctx| {
            let from = ctx.state;
            ctx.state = match ctx.state {
                State::NeedMongoCollInfo => ctx.variant.hooks().mongo_done_collinfo()?,
                State::NeedMongoMarkings => {
                    ctx.variant.hooks().mongo_done_markings(&mut ctx.broker)?
                }
                State::NeedMongoKeys => {
                    ctx.broker.done_adding_docs()?;
                    State::NeedKms
                }
                _ => return Err(Error::Client("wrong state: mongo_done is not valid here".into())),
            };
            log::debug!("context {:?} -> {:?}", from, ctx.state);
            Ok(())
        })
    }

    /// Returns one incomplete KMS subcontext to drive, or `None` if the
    /// context isn't in `NEED_KMS` or every subcontext has completed (§4.4
    /// `next_kms_ctx`).
    pub fn next_kms_ctx(&mut self) -> Option<&mut KmsSubcontext> {
        if self.state != State::NeedKms {
            return None;
        }
        self.broker.next_kms()
    }

    /// Asserts every KMS subcontext has completed and advances to `READY`
    /// (§4.4 `kms_done`).
    pub fn kms_done(&mut self) -> bool {
        self.drive(|ctx| {
            if ctx.state != State::NeedKms {
                return Err(Error::Client("wrong state: kms_done is not valid here".into()));
            }
            ctx.broker.kms_done()?;
            ctx.state = State::Ready;
            Ok(())
        })
    }

    /// Produces the final output document and advances to `DONE`. Valid in
    /// `READY` or `NOTHING_TO_DO` (§4.4 `finalize`).
    pub fn finalize(&mut self, out: &mut Document) -> bool {
        self.drive(|ctx| {
            if ctx.state != State::Ready && ctx.state != State::NothingToDo {
                return Err(Error::Client("wrong state: finalize is not valid here".into()));
            }
            let start = Instant::now();
            counter!("fle.context.finalize", 1);
            *out = ctx.variant.hooks().finalize(&ctx.broker)?;
            histogram!("fle.context.finalize.time", start.elapsed());
            ctx.state = State::Done;
            log::debug!("context finalized in {:?}", start.elapsed());
            Ok(())
        })
    }

    /// Invokes the variant's cleanup hook, then drops the context, releasing
    /// the broker and status. Safe to call in any state (§4.4 `destroy`).
    pub fn destroy(mut self) {
        self.variant.hooks().cleanup();
    }
}

/// Convenience used by both explicit-encrypt and decrypt callers to name a
/// DEK without constructing a [`KeyReference`] directly.
pub fn key_by_id(id: Uuid) -> KeyReference {
    KeyReference::Id(id)
}

/// Convenience used by both explicit-encrypt and decrypt callers to name a
/// DEK by alt-name without constructing a [`KeyReference`] directly.
pub fn key_by_altname(name: impl Into<String>) -> KeyReference {
    KeyReference::AltName(name.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::{AeadImpl, Aes256GcmAead};
    use crate::key::CryptoKey;
    use bson::{doc, Binary};

    fn local_creds(master_key: Vec<u8>) -> KmsCredentials {
        KmsCredentials::new().with_local_key(CryptoKey::new(master_key))
    }

    fn local_key_doc(id: Uuid, wrapped: Vec<u8>) -> Document {
        doc! {
            "_id": Binary { subtype: bson::spec::BinarySubtype::Uuid, bytes: id.as_bytes().to_vec() },
            "keyAltNames": Vec::<String>::new(),
            "masterKey": { "provider": "local" },
            "keyMaterial": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: wrapped },
            "creationDate": 0_i64,
            "updateDate": 0_i64,
            "status": 0_i32,
            "version": 1_i32,
        }
    }

    /// Scenario 1 (§8): local KEK decrypt, end to end.
    #[test]
    fn local_kek_decrypt_round_trip() {
        let master_key = vec![4_u8; 32];
        let dek = b"field-dek-bytes-32-bytes-long!!!".to_vec();
        let wrapped = Aes256GcmAead::new().encrypt(&dek, &master_key).unwrap();
        let id = Uuid::new_v4();

        let ciphertext = Aes256GcmAead::new()
            .encrypt(
                &{
                    let mut b = Vec::new();
                    doc! { "v": "hello" }.to_writer(&mut b).unwrap();
                    b
                },
                &dek,
            )
            .unwrap();
        let envelope = crate::envelope::EncryptedValue { key_id: id, ciphertext };
        let payload = doc! { "field": envelope.encode() };

        let mut ctx = Context::new_decrypt(payload, true, local_creds(master_key)).unwrap();
        assert_eq!(ctx.state(), State::NeedMongoKeys);

        let mut filter = Document::new();
        assert!(ctx.mongo_op(&mut filter));
        assert!(filter.contains_key("_id"));

        assert!(ctx.mongo_feed(&local_key_doc(id, wrapped)));
        assert!(ctx.mongo_done());
        assert_eq!(ctx.state(), State::NeedKms);
        assert!(ctx.next_kms_ctx().is_none());

        assert!(ctx.kms_done());
        assert_eq!(ctx.state(), State::Ready);

        let mut out = Document::new();
        assert!(ctx.finalize(&mut out));
        assert_eq!(ctx.state(), State::Done);
        assert_eq!(out.get_str("field").unwrap(), "hello");
    }

    /// Scenario 3 (§8): alt-name resolution unifies with a direct id request.
    #[test]
    fn explicit_encrypt_by_altname() {
        let master_key = vec![6_u8; 32];
        let dek = b"another-32-byte-dek-material!!!!".to_vec();
        let wrapped = Aes256GcmAead::new().encrypt(&dek, &master_key).unwrap();
        let id = Uuid::new_v4();

        let fields = vec![FieldSpec {
            path: "ssn".to_string(),
            key: key_by_altname("payments-key"),
        }];
        let payload = doc! { "ssn": "000-00-0000" };
        let mut ctx =
            Context::new_encrypt_explicit(payload, fields, true, local_creds(master_key)).unwrap();
        assert_eq!(ctx.state(), State::NeedMongoKeys);

        let mut filter = Document::new();
        assert!(ctx.mongo_op(&mut filter));

        let mut key_doc = local_key_doc(id, wrapped);
        key_doc.insert("keyAltNames", vec!["payments-key"]);
        assert!(ctx.mongo_feed(&key_doc));
        assert!(ctx.mongo_done());
        assert!(ctx.kms_done());

        let mut out = Document::new();
        assert!(ctx.finalize(&mut out));
        assert!(matches!(out.get("ssn"), Some(bson::Bson::Binary(_))));
    }

    /// Scenario 4 (§8): calling `mongo_feed` from `READY` is rejected and the
    /// context moves to `ERROR`.
    #[test]
    fn wrong_state_rejection_is_terminal() {
        let master_key = vec![9_u8; 32];
        let dek = b"yet-another-32-byte-dek-material".to_vec();
        let wrapped = Aes256GcmAead::new().encrypt(&dek, &master_key).unwrap();
        let id = Uuid::new_v4();
        let ciphertext = Aes256GcmAead::new()
            .encrypt(
                &{
                    let mut b = Vec::new();
                    doc! { "v": "hello" }.to_writer(&mut b).unwrap();
                    b
                },
                &dek,
            )
            .unwrap();
        let envelope = crate::envelope::EncryptedValue { key_id: id, ciphertext };
        let payload = doc! { "field": envelope.encode() };

        let mut ctx = Context::new_decrypt(payload, true, local_creds(master_key)).unwrap();
        assert!(ctx.mongo_op(&mut Document::new()));
        assert!(ctx.mongo_feed(&local_key_doc(id, wrapped)));
        assert!(ctx.mongo_done());
        assert!(ctx.kms_done());
        assert_eq!(ctx.state(), State::Ready);

        assert!(!ctx.mongo_feed(&doc! {}));
        assert_eq!(ctx.state(), State::Error);

        let mut status = Status::ok();
        assert!(!ctx.status(&mut status));
        assert!(status.message().contains("wrong state"));

        // Second failure does not overwrite the first.
        assert!(!ctx.mongo_done());
        let mut status2 = Status::ok();
        ctx.status(&mut status2);
        assert_eq!(status, status2);
    }

    /// Scenario 6 (§8): nothing to encrypt short-circuits straight through.
    #[test]
    fn explicit_encrypt_with_no_fields_is_nothing_to_do() {
        let payload = doc! { "untouched": true };
        let mut ctx =
            Context::new_encrypt_explicit(payload.clone(), Vec::new(), true, KmsCredentials::new())
                .unwrap();
        assert_eq!(ctx.state(), State::NothingToDo);

        let mut out = Document::new();
        assert!(ctx.finalize(&mut out));
        assert_eq!(out, payload);
    }

    #[test]
    fn destroy_is_safe_after_error() {
        let mut ctx = Context::new_decrypt(doc! {}, true, KmsCredentials::new()).unwrap();
        assert!(!ctx.mongo_op(&mut Document::new()));
        ctx.destroy();
    }
}
