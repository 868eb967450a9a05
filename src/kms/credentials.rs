//! Static, caller-supplied KMS credentials.
//!
//! The core never fetches credentials itself (no network I/O, no metadata
//! service calls) — the embedding host hands them in once, the same way it
//! hands in the schema and encrypted-fields maps (§6 "CLI / environment /
//! persisted state").

use crate::key::CryptoKey;

/// AWS KMS static credentials used to SigV4-sign `Decrypt`/`Encrypt` calls.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Bearer token used for both Azure Key Vault and GCP Cloud KMS REST calls.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

/// Per-provider credentials the broker needs to build KMS subcontexts.
///
/// Each field is independent: a broker whose entries only reference local
/// KEKs need not supply any of the remote provider credentials.
#[derive(Debug, Clone, Default)]
pub struct KmsCredentials {
    pub aws: Option<AwsCredentials>,
    pub azure: Option<BearerToken>,
    pub gcp: Option<BearerToken>,
    pub local_key: Option<CryptoKey>,
}

impl KmsCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aws(mut self, creds: AwsCredentials) -> Self {
        self.aws = Some(creds);
        self
    }

    pub fn with_azure(mut self, token: impl Into<String>) -> Self {
        self.azure = Some(BearerToken(token.into()));
        self
    }

    pub fn with_gcp(mut self, token: impl Into<String>) -> Self {
        self.gcp = Some(BearerToken(token.into()));
        self
    }

    pub fn with_local_key(mut self, key: CryptoKey) -> Self {
        self.local_key = Some(key);
        self
    }
}
