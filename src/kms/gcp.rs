//! GCP Cloud KMS `:decrypt` wire envelope: bearer-token REST JSON (§4.2).

use crate::error::{Error, Result};
use crate::kek::Endpoint;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

fn default_endpoint() -> Endpoint {
    Endpoint {
        host: "cloudkms.googleapis.com".into(),
        port: 443,
    }
}

#[derive(Serialize)]
struct DecryptRequest {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

#[derive(Deserialize)]
struct GcpError {
    error: GcpErrorBody,
}

#[derive(Deserialize)]
struct GcpErrorBody {
    status: String,
    message: String,
}

fn resource_path(project_id: &str, location: &str, key_ring: &str, key_name: &str) -> String {
    format!(
        "/v1/projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}:decrypt",
        project_id, location, key_ring, key_name
    )
}

#[allow(clippy::too_many_arguments)]
pub fn build_decrypt_request(
    project_id: &str,
    location: &str,
    key_ring: &str,
    key_name: &str,
    endpoint: &Option<Endpoint>,
    ciphertext: &[u8],
    bearer_token: &str,
) -> Result<(Endpoint, Vec<u8>)> {
    let endpoint = endpoint.clone().unwrap_or_else(default_endpoint);
    let path = resource_path(project_id, location, key_ring, key_name);
    let body = serde_json::to_vec(&DecryptRequest {
        ciphertext: STANDARD.encode(ciphertext),
    })?;

    let mut message = Vec::new();
    message.extend_from_slice(format!("POST {} HTTP/1.1\r\n", path).as_bytes());
    message.extend_from_slice(format!("host: {}\r\n", endpoint.host).as_bytes());
    message.extend_from_slice(b"content-type: application/json\r\n");
    message.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    message.extend_from_slice(format!("authorization: Bearer {}\r\n", bearer_token).as_bytes());
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(&body);

    Ok((endpoint, message))
}

pub fn parse_decrypt_response(body: &[u8]) -> Result<Vec<u8>> {
    if let Ok(resp) = serde_json::from_slice::<DecryptResponse>(body) {
        return STANDARD
            .decode(resp.plaintext)
            .map_err(|e| Error::Kms(format!("malformed Cloud KMS plaintext encoding: {}", e)));
    }

    if let Ok(err) = serde_json::from_slice::<GcpError>(body) {
        return Err(Error::Kms(format!(
            "Cloud KMS error {}: {}",
            err.error.status, err.error.message
        )));
    }

    Err(Error::Kms("unrecognized Cloud KMS response body".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_request_path_from_resource_names() {
        let (endpoint, message) = build_decrypt_request(
            "proj", "global", "ring", "key", &None, b"wrapped", "token",
        )
        .unwrap();
        assert_eq!(endpoint.host, "cloudkms.googleapis.com");
        let text = String::from_utf8_lossy(&message);
        assert!(text.starts_with(
            "POST /v1/projects/proj/locations/global/keyRings/ring/cryptoKeys/key:decrypt"
        ));
    }

    #[test]
    fn parses_a_successful_response() {
        let body = serde_json::to_vec(&serde_json::json!({
            "plaintext": STANDARD.encode(b"unwrapped-dek"),
        }))
        .unwrap();
        assert_eq!(parse_decrypt_response(&body).unwrap(), b"unwrapped-dek");
    }

    #[test]
    fn surfaces_gcp_errors() {
        let body = br#"{"error":{"status":"PERMISSION_DENIED","message":"no access"}}"#;
        let err = parse_decrypt_response(body).unwrap_err();
        assert!(err.to_string().contains("PERMISSION_DENIED"));
    }
}
