//! Authorization envelope and signature verification (C6).
//!
//! Every authorized message carries a general JWS over its descriptor plus a
//! JSON payload naming the signer's record id and, optionally, a delegated
//! grant or an invoked protocol role. Verification resolves the signer's DID
//! (via [`crate::did`]), materializes its public key, and checks the
//! signature over `<protected>.<payload>`.

use std::future::Future;

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature as EdSignature, Verifier as _, VerifyingKey};
use k256::ecdsa::signature::Verifier as _;
use k256::ecdsa::{Signature as EsSignature, VerifyingKey as EsVerifyingKey};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::did::{DidResolver, VerificationMethod};
use crate::{Result, forbidden, unexpected};

/// A signer able to produce a JWS signature over arbitrary bytes, used by
/// message builders (`WriteBuilder`, `ConfigureBuilder`, `GrantBuilder`, ...).
pub trait Signer: Send + Sync {
    /// Sign `payload`, returning the raw signature bytes.
    fn sign(&self, payload: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// The verification method id (`did#key-id`) this signer corresponds to.
    fn verification_method(&self) -> impl Future<Output = Result<String>> + Send;

    /// The JWS `alg` this signer produces (`EdDSA` or `ES256K`).
    fn algorithm(&self) -> &'static str;
}

/// A general JWS, decomposed into its component parts rather than the
/// nested flattened/general JSON serialization forms — only the single
/// (protected, payload, signatures) triple this node needs to build and
/// verify is modeled.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Jws {
    /// One or more signatures over the same payload.
    pub signatures: Vec<JwsSignature>,
}

/// A single signature entry in a general JWS.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JwsSignature {
    /// Base64url-encoded protected header (carries `alg` and `kid`).
    pub protected: String,

    /// Base64url-encoded JWS payload, shared across all signatures.
    pub payload: String,

    /// Base64url-encoded signature bytes.
    pub signature: String,
}

/// The decoded protected header.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct JwsHeader {
    /// Signature algorithm.
    pub alg: String,

    /// Verification method id.
    pub kid: String,
}

/// The decoded JWS payload carried by an [`Authorization`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePayload {
    /// The CID of the message descriptor being authorized.
    pub descriptor_cid: String,

    /// A permission grant record id invoked for this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,

    /// A role path invoked for this message (`$globalRole`/`$contextRole`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_role: Option<String>,
}

/// A message's authorization: the outer JWS (the author's signature, always
/// present), an optional delegated grant the author is acting under, and an
/// optional second, independent attestation JWS.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// The author's signature over the message descriptor.
    pub signature: Jws,

    /// A grant delegating the author's signing authority, embedded so the
    /// grant chain can be verified without a round-trip to storage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_delegated_grant: Option<serde_json::Value>,

    /// An independent attestation signature over the same descriptor CID,
    /// produced by a party other than the author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Jws>,
}

impl Authorization {
    /// Decodes the payload carried by the (first/outermost) signature.
    ///
    /// # Errors
    /// Returns an error if the payload is missing or not valid JSON.
    pub fn payload(&self) -> Result<SignaturePayload> {
        let Some(sig) = self.signature.signatures.first() else {
            return Err(unexpected!("missing signature"));
        };
        let bytes = Base64UrlUnpadded::decode_vec(&sig.payload)
            .map_err(|e| unexpected!("invalid payload encoding: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("invalid payload: {e}"))
    }

    /// Decodes the protected header of the (first/outermost) signature.
    fn header(&self) -> Result<JwsHeader> {
        let Some(sig) = self.signature.signatures.first() else {
            return Err(unexpected!("missing signature"));
        };
        let bytes = Base64UrlUnpadded::decode_vec(&sig.protected)
            .map_err(|e| unexpected!("invalid header encoding: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("invalid header: {e}"))
    }

    /// The signer's DID, derived from the verification method id (`kid`) of
    /// the outermost signature, stripping any `#fragment`.
    ///
    /// # Errors
    /// Returns an error when the signature or its `kid` is malformed.
    pub fn signer(&self) -> Result<String> {
        let kid = self.header()?.kid;
        Ok(kid.split('#').next().unwrap_or(&kid).to_string())
    }

    /// The logical author of the message: the delegate, if a delegated grant
    /// is present, else the signer itself.
    ///
    /// # Errors
    /// Returns an error when the signature is malformed.
    pub fn author(&self) -> Result<String> {
        self.signer()
    }

    /// Verifies the outermost signature (and, if present, the attestation
    /// signature) against the resolved signer DID document.
    ///
    /// # Errors
    /// Returns [`crate::Error::Unauthorized`] if the DID cannot be resolved,
    /// no matching verification method is found, or the signature does not
    /// verify.
    pub async fn verify(&self, resolver: &impl DidResolver, cache: &SignatureCache) -> Result<()> {
        verify_jws(&self.signature, resolver, cache).await?;
        if let Some(attestation) = &self.attestation {
            verify_jws(attestation, resolver, cache).await?;
        }
        if self.signature.signatures.len() > 1 && self.attestation.is_none() {
            return Err(forbidden!("expected no more than 1 signature"));
        }
        Ok(())
    }
}

/// Verifies every signature in `jws` against its resolved signer.
async fn verify_jws(jws: &Jws, resolver: &impl DidResolver, cache: &SignatureCache) -> Result<()> {
    for sig in &jws.signatures {
        if cache.contains(&sig.signature) {
            continue;
        }

        let header_bytes = Base64UrlUnpadded::decode_vec(&sig.protected)
            .map_err(|e| forbidden!("invalid protected header: {e}"))?;
        let header: JwsHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| forbidden!("invalid protected header: {e}"))?;

        let did = header.kid.split('#').next().unwrap_or(&header.kid);
        let document = resolver
            .resolve(did)
            .await
            .map_err(|e| forbidden!("failed resolving signer DID: {e}"))?;

        let method = document
            .verification_method
            .iter()
            .find(|vm| vm.id == header.kid || header.kid.is_empty())
            .or_else(|| document.verification_method.first())
            .ok_or_else(|| forbidden!("no matching verification method for `{}`", header.kid))?;

        let signing_input = format!("{}.{}", sig.protected, sig.payload);
        let signature_bytes = Base64UrlUnpadded::decode_vec(&sig.signature)
            .map_err(|e| forbidden!("invalid signature encoding: {e}"))?;

        verify_signature(method, header.alg.as_str(), signing_input.as_bytes(), &signature_bytes)?;
        cache.insert(sig.signature.clone());
    }
    Ok(())
}

fn verify_signature(
    method: &VerificationMethod, alg: &str, signing_input: &[u8], signature: &[u8],
) -> Result<()> {
    let key_bytes = method.public_key_bytes()?;

    match alg {
        "EdDSA" => {
            let key = VerifyingKey::try_from(key_bytes.as_slice())
                .map_err(|e| forbidden!("invalid Ed25519 key: {e}"))?;
            let sig = EdSignature::try_from(signature)
                .map_err(|e| forbidden!("invalid Ed25519 signature: {e}"))?;
            key.verify(signing_input, &sig).map_err(|_| forbidden!("signature invalid"))
        }
        "ES256K" => {
            let key = EsVerifyingKey::from_sec1_bytes(&key_bytes)
                .map_err(|e| forbidden!("invalid secp256k1 key: {e}"))?;
            let sig = EsSignature::from_slice(signature)
                .map_err(|e| forbidden!("invalid secp256k1 signature: {e}"))?;
            key.verify(signing_input, &sig).map_err(|_| forbidden!("signature invalid"))
        }
        other => Err(forbidden!("unsupported signature algorithm `{other}`")),
    }
}

/// A bounded, process-wide cache of already-verified signature bytes,
/// short-circuiting repeat verification work for the same JWS signature.
pub struct SignatureCache {
    inner: Mutex<LruCache<String, ()>>,
}

impl SignatureCache {
    /// Creates a cache bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    fn contains(&self, signature: &str) -> bool {
        self.inner.lock().expect("lock poisoned").contains(signature)
    }

    fn insert(&self, signature: String) {
        self.inner.lock().expect("lock poisoned").put(signature, ());
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Builds a [`SignaturePayload`] + protected header into a ready-to-sign
/// `Authorization`, given a [`Signer`]. Used by `WriteBuilder`,
/// `ConfigureBuilder`, and the permissions builders.
pub(crate) async fn sign(
    descriptor_cid: &str, permission_grant_id: Option<String>, protocol_role: Option<String>,
    author_delegated_grant: Option<serde_json::Value>, signer: &impl Signer,
) -> Result<Authorization> {
    let payload = SignaturePayload { descriptor_cid: descriptor_cid.to_string(), permission_grant_id, protocol_role };
    let payload_bytes = serde_json::to_vec(&payload).map_err(|e| unexpected!("{e}"))?;
    let payload_b64 = Base64UrlUnpadded::encode_string(&payload_bytes);

    let header = JwsHeader { alg: signer.algorithm().to_string(), kid: signer.verification_method().await? };
    let header_bytes = serde_json::to_vec(&header).map_err(|e| unexpected!("{e}"))?;
    let header_b64 = Base64UrlUnpadded::encode_string(&header_bytes);

    let signing_input = format!("{header_b64}.{payload_b64}");
    let sig_bytes = signer.sign(signing_input.as_bytes()).await?;
    let sig_b64 = Base64UrlUnpadded::encode_string(&sig_bytes);

    Ok(Authorization {
        signature: Jws { signatures: vec![JwsSignature { protected: header_b64, payload: payload_b64, signature: sig_b64 }] },
        author_delegated_grant,
        attestation: None,
    })
}

/// Builds an [`Authorization`] for a message, invoking at most one of a
/// permission grant or a protocol role, and optionally acting under a
/// delegated grant. Used by every message builder (`WriteBuilder`,
/// `ConfigureBuilder`, the permissions builders).
#[derive(Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: String,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<serde_json::Value>,
}

impl AuthorizationBuilder {
    /// Starts an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CID of the descriptor being authorized.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = descriptor_cid.into();
        self
    }

    /// Invokes a permission grant by id.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: Option<String>) -> Self {
        self.permission_grant_id = permission_grant_id;
        self
    }

    /// Invokes a protocol role.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: Option<String>) -> Self {
        self.protocol_role = protocol_role;
        self
    }

    /// Embeds the grant the signer is acting as a delegate under.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: Option<serde_json::Value>) -> Self {
        self.delegated_grant = delegated_grant;
        self
    }

    /// Signs and builds the authorization.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        sign(&self.descriptor_cid, self.permission_grant_id, self.protocol_role, self.delegated_grant, signer).await
    }
}
