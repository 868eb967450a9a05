//! BSON document shapes crossing the pump boundary: inbound key documents and
//! the `$or` filter the broker emits to fetch them (§6).
//!
//! BSON parsing itself is the `bson` crate's job — this module only knows the
//! field names and validation rules the spec assigns to each document shape.

use crate::error::{Error, Result};
use crate::kek::KekDescriptor;
use bson::{doc, Binary, Bson, Document};
use uuid::Uuid;

/// One inbound key document, as read from the key vault collection (§6).
#[derive(Debug, Clone)]
pub struct KeyDocument {
    pub id: Uuid,
    pub key_alt_names: Vec<String>,
    pub master_key: KekDescriptor,
    pub key_material: Vec<u8>,
}

impl KeyDocument {
    /// Validates and extracts the fields the core cares about. `creationDate`,
    /// `updateDate`, `status`, and `version` are required to be present and
    /// type-checked but are otherwise opaque to the core (§6) — ignored here
    /// beyond a presence check.
    pub fn parse(doc: &Document) -> Result<Self> {
        let id = match doc.get("_id") {
            Some(Bson::Binary(Binary { subtype, bytes })) if *subtype == bson::spec::BinarySubtype::Uuid => {
                Uuid::from_slice(bytes)
                    .map_err(|e| Error::Bson(format!("invalid _id UUID: {}", e)))?
            }
            Some(Bson::String(s)) => {
                Uuid::parse_str(s).map_err(|e| Error::Bson(format!("invalid _id UUID: {}", e)))?
            }
            _ => return Err(Error::Bson("key document missing UUID _id".into())),
        };

        let key_alt_names = match doc.get("keyAltNames") {
            None | Some(Bson::Null) => Vec::new(),
            Some(Bson::Array(arr)) => {
                let mut names = Vec::with_capacity(arr.len());
                for item in arr {
                    match item {
                        Bson::String(s) if !s.is_empty() => names.push(s.clone()),
                        _ => {
                            return Err(Error::Bson(
                                "keyAltNames must contain non-empty strings".into(),
                            ))
                        }
                    }
                }
                let mut dedup = names.clone();
                dedup.sort();
                dedup.dedup();
                if dedup.len() != names.len() {
                    return Err(Error::Bson("keyAltNames must be unique".into()));
                }
                names
            }
            _ => return Err(Error::Bson("keyAltNames must be an array of strings".into())),
        };

        let master_key_doc = match doc.get("masterKey") {
            Some(Bson::Document(d)) => d,
            _ => return Err(Error::Bson("key document missing masterKey".into())),
        };
        let master_key = KekDescriptor::parse(master_key_doc)?;

        let key_material = match doc.get("keyMaterial") {
            Some(Bson::Binary(Binary { bytes, .. })) => bytes.clone(),
            _ => return Err(Error::Bson("key document missing keyMaterial".into())),
        };

        for required in ["creationDate", "updateDate", "status", "version"] {
            if doc.get(required).is_none() {
                return Err(Error::Bson(format!(
                    "key document missing required field: {}",
                    required
                )));
            }
        }

        Ok(KeyDocument {
            id,
            key_alt_names,
            master_key,
            key_material,
        })
    }
}

fn uuid_binary(id: &Uuid) -> Bson {
    Bson::Binary(Binary {
        subtype: bson::spec::BinarySubtype::Uuid,
        bytes: id.as_bytes().to_vec(),
    })
}

/// Builds the `$or` filter matching any key document whose id is in `ids` or
/// whose alt-names intersect `names` (§4.3, `filter(out)`).
///
/// Returns an empty document when both sets are empty, per spec: the caller
/// may short-circuit rather than issue the query.
pub fn build_key_filter(ids: &[Uuid], names: &[String]) -> Document {
    if ids.is_empty() && names.is_empty() {
        return Document::new();
    }

    let mut clauses = Vec::new();
    if !ids.is_empty() {
        let id_bsons: Vec<Bson> = ids.iter().map(uuid_binary).collect();
        clauses.push(doc! { "_id": { "$in": id_bsons } });
    }
    if !names.is_empty() {
        clauses.push(doc! { "keyAltNames": { "$in": names.to_vec() } });
    }

    if clauses.len() == 1 {
        clauses.into_iter().next().expect("checked len == 1")
    } else {
        doc! { "$or": clauses }
    }
}
