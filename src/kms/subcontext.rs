//! The per-DEK KMS subcontext: a byte-level half-duplex state machine driven
//! by the host's socket code (§4.2).

use crate::error::{Error, Result, StatusKind};
use crate::key::CryptoKey;
use crate::kek::{Endpoint, KekDescriptor};
use crate::kms::credentials::KmsCredentials;
use crate::kms::{aws, azure, gcp};
use crate::error::{Status, CODE_NETWORK_FAILURE};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Aws,
    Azure,
    Gcp,
}

/// One KMS round-trip: request bytes out, response bytes in, completion
/// observed via [`KmsSubcontext::is_complete`].
pub struct KmsSubcontext {
    provider: ProviderKind,
    endpoint: Endpoint,
    message: Option<Vec<u8>>,
    response: Vec<u8>,
    completed: bool,
    unwrapped: Option<CryptoKey>,
    status: Status,
}

/// Locates the end of the HTTP header block and the declared body length.
/// Returns `None` until the full header block has arrived.
fn parse_http_header(buf: &[u8]) -> Option<(usize, usize)> {
    let marker = b"\r\n\r\n";
    let pos = buf
        .windows(marker.len())
        .position(|w| w == marker)?;
    let header_len = pos + marker.len();
    let header_text = String::from_utf8_lossy(&buf[..pos]);
    let content_length = header_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    Some((header_len, content_length))
}

impl KmsSubcontext {
    /// Builds the subcontext for one remote unwrap. Returns `Err` if `kek` is
    /// [`KekDescriptor::Local`] (the caller must special-case local unwrap
    /// rather than constructing a subcontext for it) or credentials for the
    /// provider are missing.
    pub fn build(kek: &KekDescriptor, wrapped: &[u8], creds: &KmsCredentials) -> Result<Self> {
        let (provider, endpoint, message) = match kek {
            KekDescriptor::Aws { region, key, endpoint } => {
                let aws_creds = creds.aws.as_ref().ok_or_else(|| {
                    Error::Kms("no AWS credentials configured for this broker".into())
                })?;
                let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
                let (endpoint, message) =
                    aws::build_decrypt_request(region, key, endpoint, wrapped, aws_creds, &amz_date)?;
                (ProviderKind::Aws, endpoint, message)
            }
            KekDescriptor::Azure {
                key_vault_endpoint,
                key_name,
                key_version,
            } => {
                let token = creds.azure.as_ref().ok_or_else(|| {
                    Error::Kms("no Azure credentials configured for this broker".into())
                })?;
                let (endpoint, message) = azure::build_unwrap_request(
                    key_vault_endpoint,
                    key_name,
                    key_version,
                    wrapped,
                    &token.0,
                )?;
                (ProviderKind::Azure, endpoint, message)
            }
            KekDescriptor::Gcp {
                project_id,
                location,
                key_ring,
                key_name,
                endpoint,
                ..
            } => {
                let token = creds.gcp.as_ref().ok_or_else(|| {
                    Error::Kms("no GCP credentials configured for this broker".into())
                })?;
                let (endpoint, message) = gcp::build_decrypt_request(
                    project_id, location, key_ring, key_name, endpoint, wrapped, &token.0,
                )?;
                (ProviderKind::Gcp, endpoint, message)
            }
            KekDescriptor::Local => {
                return Err(Error::Internal(
                    "local KEKs do not produce a KMS subcontext".into(),
                ))
            }
        };

        Ok(KmsSubcontext {
            provider,
            endpoint,
            message: Some(message),
            response: Vec::new(),
            completed: false,
            unwrapped: None,
            status: Status::ok(),
        })
    }

    /// Host and port the caller must connect to over TLS.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The request bytes the host must transmit exactly once. Empty after
    /// the first retrieval.
    pub fn message(&mut self) -> Vec<u8> {
        self.message.take().unwrap_or_default()
    }

    /// Hint for how many more response bytes the parser wants; `0` once the
    /// response is fully parsed.
    pub fn bytes_needed(&self) -> usize {
        if self.completed {
            return 0;
        }
        match parse_http_header(&self.response) {
            Some((header_len, content_length)) => {
                let have = self.response.len().saturating_sub(header_len);
                content_length.saturating_sub(have).max(1)
            }
            None => 1,
        }
    }

    /// Appends `chunk` to the response accumulator and attempts to parse.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if self.completed {
            return Err(Error::InvalidKeyState(
                "KMS subcontext has already completed".into(),
            ));
        }
        self.response.extend_from_slice(chunk);

        let Some((header_len, content_length)) = parse_http_header(&self.response) else {
            return Ok(());
        };
        if self.response.len() < header_len + content_length {
            return Ok(());
        }

        let body = self.response[header_len..header_len + content_length].to_vec();
        let parsed = match self.provider {
            ProviderKind::Aws => aws::parse_decrypt_response(&body),
            ProviderKind::Azure => azure::parse_unwrap_response(&body),
            ProviderKind::Gcp => gcp::parse_decrypt_response(&body),
        };

        self.completed = true;
        match parsed {
            Ok(bytes) => {
                self.unwrapped = Some(CryptoKey::new(bytes));
                Ok(())
            }
            Err(e) => {
                self.status.set_error(&e);
                Err(e)
            }
        }
    }

    /// Marks the subcontext as failed by a transport error the host observed
    /// (connection reset, TLS failure) rather than a parsed KMS response.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.completed {
            return;
        }
        self.status
            .set(StatusKind::Network, CODE_NETWORK_FAILURE, message);
        self.completed = true;
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Takes the unwrapped key material, if the subcontext completed
    /// successfully. Consumes it: a second call returns `None`.
    pub fn take_unwrapped(&mut self) -> Option<CryptoKey> {
        self.unwrapped.take()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kms::credentials::AwsCredentials;
    use base64::Engine;

    fn aws_kek() -> KekDescriptor {
        KekDescriptor::Aws {
            region: "us-east-1".into(),
            key: "arn:aws:kms:us-east-1:123:key/abc".into(),
            endpoint: None,
        }
    }

    fn aws_creds() -> KmsCredentials {
        KmsCredentials::new().with_aws(AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        })
    }

    #[test]
    fn local_kek_is_rejected() {
        assert!(KmsSubcontext::build(&KekDescriptor::Local, b"x", &KmsCredentials::new()).is_err());
    }

    #[test]
    fn missing_credentials_is_an_error() {
        assert!(KmsSubcontext::build(&aws_kek(), b"wrapped", &KmsCredentials::new()).is_err());
    }

    #[test]
    fn message_is_consumed_exactly_once() {
        let mut ctx = KmsSubcontext::build(&aws_kek(), b"wrapped", &aws_creds()).unwrap();
        assert!(!ctx.message().is_empty());
        assert!(ctx.message().is_empty());
    }

    #[test]
    fn feed_completes_on_full_response() {
        let mut ctx = KmsSubcontext::build(&aws_kek(), b"wrapped", &aws_creds()).unwrap();
        let body = serde_json::to_vec(&serde_json::json!({
            "Plaintext": base64::engine::general_purpose::STANDARD.encode(b"dek-bytes"),
        }))
        .unwrap();
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        assert!(!ctx.is_complete());
        ctx.feed(&response).unwrap();
        assert!(!ctx.is_complete());
        ctx.feed(&body).unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.take_unwrapped().unwrap().as_bytes(), b"dek-bytes");
    }

    #[test]
    fn fail_sets_network_status() {
        let mut ctx = KmsSubcontext::build(&aws_kek(), b"wrapped", &aws_creds()).unwrap();
        ctx.fail("connection reset");
        assert!(ctx.is_complete());
        assert_eq!(ctx.status().kind(), StatusKind::Network);
    }
}
