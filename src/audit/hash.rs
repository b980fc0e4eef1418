//! Hash Engine
//!
//! Canonical serialization and chained record hashing. Everything here is
//! pure: no I/O, no clocks, no storage. Independent implementations that
//! follow the encoding below compute identical hashes for identical content.
//!
//! Record hash input:
//!
//! ```text
//! "audit-ledger/record/v1"
//!   ‖ len(organization_id) ‖ organization_id
//!   ‖ len(chain_sequence)  ‖ chain_sequence (decimal)
//!   ‖ len(event_name)      ‖ event_name
//!   ‖ len(target_type)     ‖ target_type
//!   ‖ len(target_id)       ‖ target_id
//!   ‖ len(metadata)        ‖ canonical(metadata)
//!   ‖ len(previous_hash)   ‖ previous_hash
//!   ‖ len(actor_id)        ‖ actor_id
//!   ‖ len(category)        ‖ category
//!   ‖ len(severity)        ‖ severity
//!   ‖ len(outcome)         ‖ outcome
//!   ‖ len(created_at)      ‖ created_at
//!   ‖ len(event_id)        ‖ event_id (hyphenated UUID)
//!   ‖ len(idempotency_key) ‖ idempotency_key
//! ```
//!
//! where `len` is an 8-byte big-endian byte count.

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const HASH_PREFIX: &str = "sha256:";

const RECORD_DOMAIN_TAG: &[u8] = b"audit-ledger/record/v1";

/// Raw SHA-256 digest
pub type DigestBytes = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    #[error("hash {0:?} is missing the sha256: prefix")]
    MissingPrefix(String),

    #[error("hash {0:?} is not 64 lowercase hex digits")]
    InvalidHex(String),
}

/// Borrowed view of the fields a record hash commits to
#[derive(Debug, Clone)]
pub struct RecordFields<'a> {
    pub organization_id: &'a str,
    pub chain_sequence: i64,
    pub event_name: &'a str,
    pub target_type: &'a str,
    pub target_id: &'a str,
    pub metadata: &'a Value,
    pub actor_id: &'a str,
    pub category: &'a str,
    pub severity: &'a str,
    pub outcome: &'a str,
    pub created_at: String,
    pub event_id: String,
    pub idempotency_key: &'a str,
}

/// Compute the chained record hash of an event
pub fn compute_record_hash(fields: &RecordFields<'_>, previous_hash: &str) -> String {
    let sequence = fields.chain_sequence.to_string();
    let metadata = canonicalize(fields.metadata);

    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN_TAG);
    for part in [
        fields.organization_id,
        sequence.as_str(),
        fields.event_name,
        fields.target_type,
        fields.target_id,
        metadata.as_str(),
        previous_hash,
        fields.actor_id,
        fields.category,
        fields.severity,
        fields.outcome,
        fields.created_at.as_str(),
        fields.event_id.as_str(),
        fields.idempotency_key,
    ] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }

    encode_digest(&hasher.finalize().into())
}

/// Byte-stable JSON rendering
///
/// Object keys are sorted at every depth, whitespace is dropped and numbers
/// are normalized so that `1`, `1.0` and `-0.0`/`0` collapse to one form.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => out.push_str(&Value::from(s.as_str()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn canonical_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && (-9.223_372_036_854_776e18..9.223_372_036_854_776e18).contains(&f) => {
            (f as i64).to_string()
        }
        // serde_json prints finite floats in shortest round-trip form
        _ => n.to_string(),
    }
}

/// SHA-256 of arbitrary bytes, rendered with the ledger prefix
pub fn sha256_hex(data: &[u8]) -> String {
    encode_digest(&Sha256::digest(data).into())
}

pub fn encode_digest(digest: &DigestBytes) -> String {
    format!("{}{}", HASH_PREFIX, hex::encode(digest))
}

pub fn decode_digest(hash: &str) -> Result<DigestBytes, HashError> {
    let hex_part = hash
        .strip_prefix(HASH_PREFIX)
        .ok_or_else(|| HashError::MissingPrefix(hash.to_string()))?;

    if hex_part.len() != 64 || hex_part.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(HashError::InvalidHex(hash.to_string()));
    }

    let mut digest = [0u8; 32];
    hex::decode_to_slice(hex_part, &mut digest).map_err(|_| HashError::InvalidHex(hash.to_string()))?;
    Ok(digest)
}

pub fn is_valid_hash(hash: &str) -> bool {
    decode_digest(hash).is_ok()
}
