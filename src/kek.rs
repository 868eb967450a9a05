//! The KEK (key-encryption-key) descriptor model: a tagged variant representing
//! AWS KMS, Azure Key Vault, GCP Cloud KMS, or a local in-process provider.
//!
//! Mirrors the shape of the host library's provider plugins (one module per
//! KMS, dispatched on a `provider` string) but collapses them into a single
//! data type since the core only needs to parse, serialize, clone, and match
//! on the descriptor — the actual provider calls live in [`crate::kms`].

use crate::error::{Error, Result};
use bson::{Bson, Document};

/// Host-and-port form of a KMS endpoint.
///
/// Endpoints normalize to `host:port`; a bare host with no port defaults to
/// the standard HTTPS port, so `parse(serialize(k))` round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

const DEFAULT_KMS_PORT: u16 = 443;

impl Endpoint {
    /// Parses a `host`, `host:port`, or `scheme://host[:port]` string into
    /// host-and-port form.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Client("endpoint must not be empty".into()));
        }

        let without_scheme = raw
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(raw);
        let without_path = without_scheme
            .split_once('/')
            .map(|(host, _)| host)
            .unwrap_or(without_scheme);

        match without_path.rsplit_once(':') {
            Some((host, port_str)) if !host.is_empty() => {
                let port: u16 = port_str.parse().map_err(|_| {
                    Error::Client(format!("invalid port in endpoint: {}", raw))
                })?;
                Ok(Endpoint {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Ok(Endpoint {
                host: without_path.to_string(),
                port: DEFAULT_KMS_PORT,
            }),
        }
    }

    /// Renders back to the canonical `host:port` string.
    pub fn to_host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A parsed key-encryption-key descriptor, as embedded in a key document's
/// `masterKey` field (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KekDescriptor {
    Aws {
        region: String,
        key: String,
        endpoint: Option<Endpoint>,
    },
    Azure {
        key_vault_endpoint: Endpoint,
        key_name: String,
        key_version: Option<String>,
    },
    Gcp {
        project_id: String,
        location: String,
        key_ring: String,
        key_name: String,
        key_version: Option<String>,
        endpoint: Option<Endpoint>,
    },
    Local,
}

fn required_str(doc: &Document, field: &str) -> Result<String> {
    match doc.get(field) {
        Some(Bson::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Bson::String(_)) => Err(Error::Client(format!("{} must not be empty", field))),
        Some(_) => Err(Error::Client(format!("{} must be a string", field))),
        None => Err(Error::Client(format!("missing required field: {}", field))),
    }
}

fn optional_str(doc: &Document, field: &str) -> Result<Option<String>> {
    match doc.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Bson::String(_)) => Err(Error::Client(format!("{} must not be empty", field))),
        Some(_) => Err(Error::Client(format!("{} must be a string", field))),
    }
}

impl KekDescriptor {
    /// Parses a KEK descriptor out of a BSON document (§4.1).
    pub fn parse(doc: &Document) -> Result<Self> {
        let provider = required_str(doc, "provider")?;
        match provider.as_str() {
            "aws" => {
                let region = required_str(doc, "region")?;
                let key = required_str(doc, "key")?;
                let endpoint = optional_str(doc, "endpoint")?
                    .map(|s| Endpoint::parse(&s))
                    .transpose()?;
                Ok(KekDescriptor::Aws {
                    region,
                    key,
                    endpoint,
                })
            }
            "azure" => {
                let raw_endpoint = required_str(doc, "keyVaultEndpoint")?;
                let key_vault_endpoint = Endpoint::parse(&raw_endpoint)?;
                let key_name = required_str(doc, "keyName")?;
                let key_version = optional_str(doc, "keyVersion")?;
                Ok(KekDescriptor::Azure {
                    key_vault_endpoint,
                    key_name,
                    key_version,
                })
            }
            "gcp" => {
                let project_id = required_str(doc, "projectId")?;
                let location = required_str(doc, "location")?;
                let key_ring = required_str(doc, "keyRing")?;
                let key_name = required_str(doc, "keyName")?;
                let key_version = optional_str(doc, "keyVersion")?;
                let endpoint = optional_str(doc, "endpoint")?
                    .map(|s| Endpoint::parse(&s))
                    .transpose()?;
                Ok(KekDescriptor::Gcp {
                    project_id,
                    location,
                    key_ring,
                    key_name,
                    key_version,
                    endpoint,
                })
            }
            "local" => Ok(KekDescriptor::Local),
            other => Err(Error::Client(format!(
                "unrecognized KMS provider: {}",
                other
            ))),
        }
    }

    /// Serializes the descriptor back to a BSON document; `parse` then
    /// `serialize` is injective (§8, invariant 2).
    pub fn serialize(&self) -> Document {
        let mut doc = Document::new();
        match self {
            KekDescriptor::Aws {
                region,
                key,
                endpoint,
            } => {
                doc.insert("provider", "aws");
                doc.insert("region", region.clone());
                doc.insert("key", key.clone());
                if let Some(e) = endpoint {
                    doc.insert("endpoint", e.to_host_port());
                }
            }
            KekDescriptor::Azure {
                key_vault_endpoint,
                key_name,
                key_version,
            } => {
                doc.insert("provider", "azure");
                doc.insert("keyVaultEndpoint", key_vault_endpoint.to_host_port());
                doc.insert("keyName", key_name.clone());
                if let Some(v) = key_version {
                    doc.insert("keyVersion", v.clone());
                }
            }
            KekDescriptor::Gcp {
                project_id,
                location,
                key_ring,
                key_name,
                key_version,
                endpoint,
            } => {
                doc.insert("provider", "gcp");
                doc.insert("projectId", project_id.clone());
                doc.insert("location", location.clone());
                doc.insert("keyRing", key_ring.clone());
                doc.insert("keyName", key_name.clone());
                if let Some(v) = key_version {
                    doc.insert("keyVersion", v.clone());
                }
                if let Some(e) = endpoint {
                    doc.insert("endpoint", e.to_host_port());
                }
            }
            KekDescriptor::Local => {
                doc.insert("provider", "local");
            }
        }
        doc
    }

    /// The provider tag string, as it appears in the `provider` field.
    pub fn provider_name(&self) -> &'static str {
        match self {
            KekDescriptor::Aws { .. } => "aws",
            KekDescriptor::Azure { .. } => "azure",
            KekDescriptor::Gcp { .. } => "gcp",
            KekDescriptor::Local => "local",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn round_trips_aws() {
        let d = doc! {
            "provider": "aws",
            "region": "us-east-1",
            "key": "arn:aws:kms:us-east-1:123:key/abc",
            "endpoint": "kms.us-east-1.amazonaws.com:443",
        };
        let kek = KekDescriptor::parse(&d).unwrap();
        let back = KekDescriptor::parse(&kek.serialize()).unwrap();
        assert_eq!(kek, back);
    }

    #[test]
    fn round_trips_azure_without_version() {
        let d = doc! {
            "provider": "azure",
            "keyVaultEndpoint": "my-vault.vault.azure.net",
            "keyName": "my-key",
        };
        let kek = KekDescriptor::parse(&d).unwrap();
        assert_eq!(
            kek,
            KekDescriptor::Azure {
                key_vault_endpoint: Endpoint {
                    host: "my-vault.vault.azure.net".into(),
                    port: 443
                },
                key_name: "my-key".into(),
                key_version: None,
            }
        );
        let back = KekDescriptor::parse(&kek.serialize()).unwrap();
        assert_eq!(kek, back);
    }

    #[test]
    fn round_trips_gcp() {
        let d = doc! {
            "provider": "gcp",
            "projectId": "proj",
            "location": "global",
            "keyRing": "ring",
            "keyName": "key",
            "keyVersion": "3",
        };
        let kek = KekDescriptor::parse(&d).unwrap();
        let back = KekDescriptor::parse(&kek.serialize()).unwrap();
        assert_eq!(kek, back);
    }

    #[test]
    fn local_has_no_fields() {
        let d = doc! { "provider": "local" };
        assert_eq!(KekDescriptor::parse(&d).unwrap(), KekDescriptor::Local);
    }

    #[test]
    fn unknown_provider_is_a_client_error() {
        let d = doc! { "provider": "kmip" };
        let err = KekDescriptor::parse(&d).unwrap_err();
        assert!(err.to_string().contains("unrecognized KMS provider: kmip"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let d = doc! { "provider": "aws", "region": "us-east-1" };
        assert!(KekDescriptor::parse(&d).is_err());
    }

    #[test]
    fn endpoint_defaults_port_443() {
        let e = Endpoint::parse("kms.us-west-2.amazonaws.com").unwrap();
        assert_eq!(e.port, 443);
        assert_eq!(e.to_host_port(), "kms.us-west-2.amazonaws.com:443");
    }

    #[test]
    fn endpoint_strips_scheme_and_path() {
        let e = Endpoint::parse("https://vault.example.com:8443/keys/foo").unwrap();
        assert_eq!(e.host, "vault.example.com");
        assert_eq!(e.port, 8443);
    }
}
