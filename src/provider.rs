//! Collaborator seams a [`crate::dwn::Dwn`] is built from: message/event
//! storage, external blob storage, DID resolution, and signature
//! verification. Handlers are generic over `impl Provider` rather than a
//! trait object, so a deployment assembles its own concrete stack and pays
//! no dynamic-dispatch cost.

pub use crate::auth::{Signer, SignatureCache};
pub use crate::did::DidResolver;
pub use crate::store::data::DataStore;
pub use crate::store::events::{EventLog, EventStream};
pub use crate::store::message::MessageStore;

/// The full set of collaborators a node needs to handle messages: durable
/// storage for messages, the index they're queried through, the event log
/// and live tail subscriptions are built on, a blob store for payloads too
/// large to inline, DID resolution, and a signature verification cache.
pub trait Provider:
    MessageStore + EventLog + EventStream + DataStore + DidResolver + Clone + Send + Sync
{
    /// The process-wide signature verification cache shared across
    /// messages, avoiding repeat cryptographic work for identical JWS
    /// signatures.
    fn signature_cache(&self) -> &SignatureCache;
}
