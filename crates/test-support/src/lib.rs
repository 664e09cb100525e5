//! Fixtures shared by `dwn-core`'s integration tests: a `did:key`-backed
//! [`Signer`] that needs no registry (the DID *is* the public key) and a
//! convenience constructor for an in-memory [`Dwn`].

use base64ct::{Base64UrlUnpadded, Encoding};
use dwn_core::auth::Signer;
use dwn_core::store::kv::MemKv;
use dwn_core::Dwn;
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;

const ED25519_MULTICODEC: u8 = 0xed;

/// An Ed25519 `did:key` identity for signing test messages.
pub struct TestSigner {
    signing_key: SigningKey,
    did: String,
}

impl TestSigner {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut codec_prefixed = vec![ED25519_MULTICODEC];
        codec_prefixed.extend_from_slice(signing_key.verifying_key().as_bytes());
        let method_id = multibase::encode(multibase::Base::Base58Btc, &codec_prefixed);
        Self { signing_key, did: format!("did:key:{method_id}") }
    }

    /// The identity's `did:key` identifier.
    #[must_use]
    pub fn did(&self) -> &str {
        &self.did
    }
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for TestSigner {
    async fn sign(&self, payload: &[u8]) -> dwn_core::Result<Vec<u8>> {
        Ok(self.signing_key.sign(payload).to_bytes().to_vec())
    }

    async fn verification_method(&self) -> dwn_core::Result<String> {
        let method_id = self.did.strip_prefix("did:key:").unwrap_or(&self.did);
        Ok(format!("{}#{method_id}", self.did))
    }

    fn algorithm(&self) -> &'static str {
        "EdDSA"
    }
}

/// Encodes `bytes` the same way `RecordsWrite`'s inline `encodedData` would,
/// for tests asserting against a reply's stored payload.
#[must_use]
pub fn base64url(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

/// Builds a fresh in-memory node, isolated from every other call (a new
/// [`MemKv`] backs each one).
#[must_use]
pub fn test_dwn() -> Dwn<MemKv> {
    Dwn::in_memory()
}
