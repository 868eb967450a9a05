//! # fle-core
//!
//! The orchestration core of a client-side field-level encryption library for
//! a document database: a cooperative, non-blocking state machine that walks
//! an encrypt or decrypt operation through collection-info lookup, field
//! marking, key-document fetch, and KMS unwrap rounds without ever owning a
//! socket itself. The host pumps [`Context`] with the results of whatever I/O
//! each state demands; the core never blocks, spawns a thread, or retries.
//!
//! Three collaborators make up the engine:
//! - [`Context`] — the per-operation state machine (§4.4 in the design notes).
//! - [`broker::KeyBroker`] — aggregates key requests, ingests key documents,
//!   and drives the KMS subcontexts that unwrap each DEK (§4.3).
//! - [`kek::KekDescriptor`] — the tagged KEK variant for AWS, Azure, GCP, and
//!   local providers (§4.1).
//!
//! ## Basic usage
//!
//! ```
//! use fle_core::context::Context;
//! use fle_core::kms::KmsCredentials;
//! use fle_core::key::CryptoKey;
//! use bson::doc;
//!
//! // An explicit-encrypt context with no fields to encrypt short-circuits
//! // straight to NOTHING_TO_DO, so finalize can be called immediately.
//! let payload = doc! { "name": "ada" };
//! let mut ctx = Context::new_encrypt_explicit(
//!     payload,
//!     Vec::new(),
//!     true,
//!     KmsCredentials::new().with_local_key(CryptoKey::new(vec![0_u8; 32])),
//! )
//! .unwrap();
//!
//! let mut out = doc! {};
//! assert!(ctx.finalize(&mut out));
//! ```

pub mod broker;
pub mod context;
pub mod crypto;
pub mod doc;
pub mod envelope;
pub mod error;
pub mod kek;
pub mod key;
pub mod kms;
pub mod log;
pub mod metrics;
pub mod payload;

pub use crate::broker::KeyBroker;
pub use crate::context::{Context, State};
pub use crate::error::{Error, Result, Status, StatusKind};
pub use crate::kek::KekDescriptor;
pub use crate::key::CryptoKey;
pub use crate::log::{debug_enabled, set_logger, Logger, StdoutLogger};
pub use crate::metrics::{disable_metrics, metrics_enabled, set_metrics_provider, MetricsProvider};
pub use crate::payload::{FieldSpec, KeyReference};
