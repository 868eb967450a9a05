//! Azure Key Vault `unwrapKey` wire envelope: bearer-token REST JSON (§4.2).

use crate::error::{Error, Result};
use crate::kek::Endpoint;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "7.4";
const DEFAULT_ALG: &str = "RSA-OAEP-256";

#[derive(Serialize)]
struct UnwrapRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct UnwrapResponse {
    value: String,
}

#[derive(Deserialize)]
struct KeyVaultError {
    error: KeyVaultErrorBody,
}

#[derive(Deserialize)]
struct KeyVaultErrorBody {
    code: String,
    message: String,
}

fn resource_path(key_name: &str, key_version: &Option<String>) -> String {
    match key_version {
        Some(v) => format!("/keys/{}/{}/unwrapKey?api-version={}", key_name, v, API_VERSION),
        None => format!("/keys/{}/unwrapKey?api-version={}", key_name, API_VERSION),
    }
}

pub fn build_unwrap_request(
    key_vault_endpoint: &Endpoint,
    key_name: &str,
    key_version: &Option<String>,
    wrapped: &[u8],
    bearer_token: &str,
) -> Result<(Endpoint, Vec<u8>)> {
    let path = resource_path(key_name, key_version);
    let body = serde_json::to_vec(&UnwrapRequest {
        alg: DEFAULT_ALG,
        value: URL_SAFE_NO_PAD.encode(wrapped),
    })?;

    let mut message = Vec::new();
    message.extend_from_slice(format!("POST {} HTTP/1.1\r\n", path).as_bytes());
    message.extend_from_slice(format!("host: {}\r\n", key_vault_endpoint.host).as_bytes());
    message.extend_from_slice(b"content-type: application/json\r\n");
    message.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    message.extend_from_slice(format!("authorization: Bearer {}\r\n", bearer_token).as_bytes());
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(&body);

    Ok((key_vault_endpoint.clone(), message))
}

pub fn parse_unwrap_response(body: &[u8]) -> Result<Vec<u8>> {
    if let Ok(resp) = serde_json::from_slice::<UnwrapResponse>(body) {
        return URL_SAFE_NO_PAD
            .decode(resp.value)
            .map_err(|e| Error::Kms(format!("malformed Key Vault plaintext encoding: {}", e)));
    }

    if let Ok(err) = serde_json::from_slice::<KeyVaultError>(body) {
        return Err(Error::Kms(format!(
            "Azure Key Vault error {}: {}",
            err.error.code, err.error.message
        )));
    }

    Err(Error::Kms("unrecognized Key Vault response body".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_with_version_in_path() {
        let endpoint = Endpoint {
            host: "my-vault.vault.azure.net".into(),
            port: 443,
        };
        let (_, message) = build_unwrap_request(
            &endpoint,
            "my-key",
            &Some("abc123".into()),
            b"wrapped",
            "token",
        )
        .unwrap();
        let text = String::from_utf8_lossy(&message);
        assert!(text.starts_with("POST /keys/my-key/abc123/unwrapKey"));
        assert!(text.contains("authorization: Bearer token"));
    }

    #[test]
    fn parses_a_successful_response() {
        let body = serde_json::to_vec(&serde_json::json!({
            "kid": "https://my-vault.vault.azure.net/keys/my-key/abc123",
            "value": URL_SAFE_NO_PAD.encode(b"unwrapped-dek"),
        }))
        .unwrap();
        assert_eq!(parse_unwrap_response(&body).unwrap(), b"unwrapped-dek");
    }

    #[test]
    fn surfaces_key_vault_errors() {
        let body = br#"{"error":{"code":"Forbidden","message":"no access"}}"#;
        let err = parse_unwrap_response(body).unwrap_err();
        assert!(err.to_string().contains("Forbidden"));
    }
}
