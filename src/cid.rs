//! Content identifiers (CIDs).
//!
//! Every message and every descriptor is content-addressed: CBOR-encode with
//! stable map ordering, hash with SHA-256, and wrap as a CIDv1 with the
//! `dag-cbor` codec, rendered as lowercase base32.

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

use crate::{Result, unexpected};

/// The `dag-cbor` multicodec code.
const DAG_CBOR: u64 = 0x71;

/// The `raw` multicodec code, used for content-addressing opaque byte
/// payloads (record data) rather than CBOR structures.
const RAW: u64 = 0x55;

/// Computes the CID of `payload`, serializing it to canonical CBOR first.
///
/// # Errors
/// Returns [`crate::Error::InternalError`] if `payload` cannot be
/// CBOR-encoded.
pub fn compute_cid<T: Serialize>(payload: &T) -> Result<String> {
    let mut buf = Vec::new();
    ciborium::into_writer(payload, &mut buf)
        .map_err(|e| unexpected!("failed to CBOR-encode payload: {e}"))?;

    let hash = Code::Sha2_256.digest(&buf);
    let cid = cid::Cid::new_v1(DAG_CBOR, hash);

    Ok(cid.to_string())
}

/// Computes the CID of a raw byte payload (record data), hashed directly
/// without a CBOR encoding step.
#[must_use]
pub fn compute_data_cid(bytes: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(bytes);
    cid::Cid::new_v1(RAW, hash).to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deterministic() {
        let payload = json!({ "a": 1, "b": "two" });
        let cid1 = compute_cid(&payload).unwrap();
        let cid2 = compute_cid(&payload).unwrap();
        assert_eq!(cid1, cid2);
        assert!(cid1.starts_with('b'));
    }

    #[test]
    fn distinct_payloads_distinct_cids() {
        let a = compute_cid(&json!({ "a": 1 })).unwrap();
        let b = compute_cid(&json!({ "a": 2 })).unwrap();
        assert_ne!(a, b);
    }
}
