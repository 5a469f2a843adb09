//! Deterministic cache-key derivation.
//!
//! The request is flattened into `(field name, canonical value)` pairs, null
//! values are dropped, pairs are ordered by name and every name and value is
//! length-prefixed, so no field content can forge a separator. The result is
//! hashed with SHA-256.

use std::collections::BTreeMap;

use genmedia_types::{CacheKey, GenerationRequest};
use sha2::{Digest, Sha256};

/// Bumped whenever the canonical form changes so old and new keys never meet.
const SCHEME: &str = "genmedia-key-v1";

/// Derive the cache key of `request`. Pure: no I/O, no clock.
pub fn derive(request: &GenerationRequest) -> CacheKey {
    let canonical = canonical_form(request);
    let digest = Sha256::digest(canonical.as_bytes());
    CacheKey::from_digest(digest.as_slice())
}

/// The exact string that is hashed by [`derive`].
pub fn canonical_form(request: &GenerationRequest) -> String {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();

    fields.insert("kind".to_owned(), request.kind.as_ref().to_owned());
    if let Some(instruction) = &request.instruction {
        fields.insert("instruction".to_owned(), instruction.clone());
    }
    // Source order is semantic (first = subject, second = reference).
    for (idx, source) in request.sources.iter().enumerate() {
        fields.insert(format!("source.{idx}"), source.canonical());
    }
    for (name, value) in &request.shape {
        if let Some(canonical) = value.canonical() {
            fields.insert(format!("shape.{}", name.trim().to_ascii_lowercase()), canonical);
        }
    }

    let mut out = String::with_capacity(64 + fields.len() * 32);
    out.push_str(SCHEME);
    out.push('\n');
    for (name, value) in &fields {
        push_prefixed(&mut out, name);
        out.push('=');
        push_prefixed(&mut out, value);
        out.push(';');
    }
    out
}

fn push_prefixed(out: &mut String, s: &str) {
    out.push_str(&s.len().to_string());
    out.push(':');
    out.push_str(s);
}
