//! AWS KMS `Decrypt` wire envelope: JSON protocol 1.1, SigV4-signed.
//!
//! Builds and signs the request bytes the host must transmit, and parses the
//! JSON response. No network calls happen here — see §4.2.

use crate::error::{Error, Result};
use crate::kek::Endpoint;
use crate::kms::credentials::AwsCredentials;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "kms";
const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Serialize)]
struct DecryptRequest<'a> {
    #[serde(rename = "CiphertextBlob")]
    ciphertext_blob: String,
    #[serde(rename = "KeyId")]
    key_id: &'a str,
}

#[derive(Deserialize)]
struct DecryptResponse {
    #[serde(rename = "Plaintext")]
    plaintext: String,
}

#[derive(Deserialize)]
struct KmsErrorResponse {
    #[serde(rename = "message", alias = "Message")]
    message: Option<String>,
    #[serde(rename = "__type")]
    kind: Option<String>,
}

fn default_endpoint(region: &str) -> Endpoint {
    Endpoint {
        host: format!("kms.{}.amazonaws.com", region),
        port: 443,
    }
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sign(
    creds: &AwsCredentials,
    region: &str,
    amz_date: &str,
    date_stamp: &str,
    canonical_request: &str,
) -> String {
    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, region, SERVICE);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_bytes(
        format!("AWS4{}", creds.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_bytes(&k_date, region.as_bytes());
    let k_service = hmac_bytes(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_bytes(&k_service, b"aws4_request");
    hex_encode(&hmac_bytes(&k_signing, string_to_sign.as_bytes()))
}

/// Builds the signed `Decrypt` request. `amz_date` must be `YYYYMMDDTHHMMSSZ`.
pub fn build_decrypt_request(
    region: &str,
    key_arn: &str,
    endpoint: &Option<Endpoint>,
    ciphertext: &[u8],
    creds: &AwsCredentials,
    amz_date: &str,
) -> Result<(Endpoint, Vec<u8>)> {
    let endpoint = endpoint.clone().unwrap_or_else(|| default_endpoint(region));
    let date_stamp = amz_date.get(0..8).ok_or_else(|| {
        Error::Kms(format!("invalid signing timestamp: {}", amz_date))
    })?;

    let body = serde_json::to_vec(&DecryptRequest {
        ciphertext_blob: STANDARD.encode(ciphertext),
        key_id: key_arn,
    })?;

    let target = "TrentService.Decrypt";
    let content_type = "application/x-amz-json-1.1";

    let mut signed_headers = vec![
        ("content-type".to_string(), content_type.to_string()),
        ("host".to_string(), endpoint.host.clone()),
        ("x-amz-date".to_string(), amz_date.to_string()),
        ("x-amz-target".to_string(), target.to_string()),
    ];
    if let Some(token) = &creds.session_token {
        signed_headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    signed_headers.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = signed_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_header_names = signed_headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers,
        signed_header_names,
        sha256_hex(&body)
    );

    let signature = sign(creds, region, amz_date, date_stamp, &canonical_request);
    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, region, SERVICE);
    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, creds.access_key_id, credential_scope, signed_header_names, signature
    );

    let mut message = Vec::new();
    message.extend_from_slice(b"POST / HTTP/1.1\r\n");
    message.extend_from_slice(format!("host: {}\r\n", endpoint.host).as_bytes());
    message.extend_from_slice(format!("content-type: {}\r\n", content_type).as_bytes());
    message.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    message.extend_from_slice(format!("x-amz-date: {}\r\n", amz_date).as_bytes());
    message.extend_from_slice(format!("x-amz-target: {}\r\n", target).as_bytes());
    if let Some(token) = &creds.session_token {
        message.extend_from_slice(format!("x-amz-security-token: {}\r\n", token).as_bytes());
    }
    message.extend_from_slice(format!("authorization: {}\r\n", authorization).as_bytes());
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(&body);

    Ok((endpoint, message))
}

/// Parses the JSON body of a `Decrypt` response, returning the plaintext DEK.
pub fn parse_decrypt_response(body: &[u8]) -> Result<Vec<u8>> {
    if let Ok(resp) = serde_json::from_slice::<DecryptResponse>(body) {
        return STANDARD
            .decode(resp.plaintext)
            .map_err(|e| Error::Kms(format!("malformed KMS plaintext encoding: {}", e)));
    }

    if let Ok(err) = serde_json::from_slice::<KmsErrorResponse>(body) {
        let kind = err.kind.unwrap_or_else(|| "UnknownError".into());
        let message = err.message.unwrap_or_default();
        return Err(Error::Kms(format!("AWS KMS error {}: {}", kind, message)));
    }

    Err(Error::Kms("unrecognized AWS KMS response body".into()))
}
