//! DID resolver façade (C5): a unified interface over multiple DID method
//! resolvers, with an LRU+TTL cache in front of them.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::{Result, bad_request, forbidden};

/// A DID document, reduced to the parts the signature verifier and key
/// material builders need.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The DID this document describes.
    pub id: String,

    /// Verification methods (public keys) associated with the DID.
    pub verification_method: Vec<VerificationMethod>,
}

/// A single verification method: an id, a type, and embedded key material.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// The verification method id, `<did>#<fragment>`.
    pub id: String,

    /// The verification method type, e.g. `JsonWebKey2020`.
    #[serde(rename = "type")]
    pub type_: String,

    /// The DID controlling this verification method.
    pub controller: String,

    /// The embedded public key, as a JWK.
    pub public_key_jwk: PublicKeyJwk,
}

impl VerificationMethod {
    /// Decodes the raw public key bytes from the embedded JWK.
    ///
    /// # Errors
    /// Returns [`crate::Error::Unauthorized`] if the JWK is missing its `x`
    /// coordinate or the coordinate is not valid base64url.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        use base64ct::{Base64UrlUnpadded, Encoding};
        Base64UrlUnpadded::decode_vec(&self.public_key_jwk.x)
            .map_err(|e| forbidden!("invalid public key encoding: {e}"))
    }
}

/// A public JSON Web Key, reduced to the OKP/EC fields `did:key` resolution
/// produces.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyJwk {
    /// Key type (`OKP` for Ed25519, `EC` for secp256k1).
    pub kty: String,

    /// Curve (`Ed25519` or `secp256k1`).
    pub crv: String,

    /// The public key's `x` coordinate, base64url-encoded.
    pub x: String,

    /// The public key's `y` coordinate (secp256k1 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

/// The multicodec prefix for an Ed25519 public key.
const ED25519_MULTICODEC: u8 = 0xed;
/// The multicodec prefix for a secp256k1 public key.
const SECP256K1_MULTICODEC: u8 = 0xe7;

/// A resolver for one DID method.
pub trait DidResolver: Send + Sync {
    /// Resolves `did` to its DID document.
    ///
    /// # Errors
    /// Returns [`crate::Error::BadRequest`] if `did` names an unsupported
    /// method, or [`crate::Error::Unauthorized`] if resolution fails.
    fn resolve(&self, did: &str) -> impl Future<Output = Result<Document>> + Send;
}

/// Resolves a `did:key` identifier deterministically: the method-specific id
/// is a multibase/multicodec-prefixed public key.
pub fn resolve_did_key(did: &str) -> Result<Document> {
    let Some(method_id) = did.strip_prefix("did:key:") else {
        return Err(bad_request!("not a did:key identifier: {did}"));
    };

    let (_, decoded) =
        multibase::decode(method_id).map_err(|e| bad_request!("invalid did:key encoding: {e}"))?;
    let Some((&codec, key_bytes)) = decoded.split_first() else {
        return Err(bad_request!("empty did:key public key"));
    };

    let jwk = match codec {
        ED25519_MULTICODEC => {
            use base64ct::{Base64UrlUnpadded, Encoding};
            PublicKeyJwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                x: Base64UrlUnpadded::encode_string(key_bytes),
                y: None,
            }
        }
        SECP256K1_MULTICODEC => {
            use base64ct::{Base64UrlUnpadded, Encoding};
            let point = k256::EncodedPoint::from_bytes(key_bytes)
                .map_err(|e| bad_request!("invalid secp256k1 point: {e}"))?
                .decompress()
                .ok_or_else(|| bad_request!("could not decompress secp256k1 point"))?;
            PublicKeyJwk {
                kty: "EC".to_string(),
                crv: "secp256k1".to_string(),
                x: Base64UrlUnpadded::encode_string(point.x().ok_or_else(|| bad_request!("missing x"))?),
                y: Some(Base64UrlUnpadded::encode_string(point.y().ok_or_else(|| bad_request!("missing y"))?)),
            }
        }
        other => return Err(bad_request!("unsupported did:key multicodec 0x{other:02x}")),
    };

    let vm_id = format!("{did}#{method_id}");
    Ok(Document {
        id: did.to_string(),
        verification_method: vec![VerificationMethod {
            id: vm_id,
            type_: "JsonWebKey2020".to_string(),
            controller: did.to_string(),
            public_key_jwk: jwk,
        }],
    })
}

/// Resolves a `did:ion` identifier via a configurable HTTPS resolution
/// endpoint: `GET <endpoint>/<did>`.
pub struct IonResolver {
    endpoint: String,
    client: reqwest::Client,
}

impl IonResolver {
    /// Creates a resolver targeting `endpoint` (e.g.
    /// `https://ion.tbddev.org/identifiers`).
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), client: reqwest::Client::new() }
    }
}

impl DidResolver for IonResolver {
    async fn resolve(&self, did: &str) -> Result<Document> {
        if !did.starts_with("did:ion:") {
            return Err(bad_request!("not a did:ion identifier: {did}"));
        }
        let url = format!("{}/{did}", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| forbidden!("did:ion resolution request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(forbidden!("did:ion resolution failed with status {}", response.status()));
        }
        response.json().await.map_err(|e| forbidden!("invalid did:ion resolution response: {e}"))
    }
}

struct CacheEntry {
    document: Document,
    expires_at: Instant,
}

/// A dispatching, caching façade over one or more method-specific resolvers.
///
/// Holds an LRU cache bounded by `capacity`, with entries expiring after
/// `ttl`. Concurrent access is synchronised with a mutex; reads and writes
/// both take the lock briefly, which is sufficient for the access pattern of
/// a per-process resolution cache.
pub struct Resolver {
    ion: Option<IonResolver>,
    ttl: Duration,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl Resolver {
    /// Creates a resolver with `did:key` always enabled and an optional
    /// `did:ion` HTTPS endpoint.
    #[must_use]
    pub fn new(ion_endpoint: Option<String>, ttl_seconds: u64, max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            ion: ion_endpoint.map(IonResolver::new),
            ttl: Duration::from_secs(ttl_seconds),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl DidResolver for Resolver {
    async fn resolve(&self, did: &str) -> Result<Document> {
        if let Some(entry) = self.cache.lock().expect("lock poisoned").get(did) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.document.clone());
            }
        }

        let method = did.split(':').nth(1).ok_or_else(|| bad_request!("malformed DID: {did}"))?;
        let document = match method {
            "key" => resolve_did_key(did)?,
            "ion" => {
                let Some(ion) = &self.ion else {
                    return Err(bad_request!("did:ion resolver not configured"));
                };
                ion.resolve(did).await?
            }
            other => return Err(bad_request!("unsupported DID method `{other}`")),
        };

        self.cache.lock().expect("lock poisoned").put(
            did.to_string(),
            CacheEntry { document: document.clone(), expires_at: Instant::now() + self.ttl },
        );
        Ok(document)
    }
}
