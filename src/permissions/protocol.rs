//! Decodes the `Scope` of a permission grant/request record directly from
//! its encoded data, without resolving it through [`super::fetch_grant`]
//! (used when the caller already holds the `RecordsWrite`).

use base64ct::{Base64UrlUnpadded, Encoding};

use crate::Result;
use crate::permissions::{Scope, grant::GrantData};
use crate::provider::MessageStore;
use crate::records::Write;
use crate::unexpected;

/// Decodes the `scope` of a permission grant `RecordsWrite`.
///
/// # Errors
/// Returns an error if `write` carries no encoded data or it cannot be
/// decoded as a [`GrantData`] payload.
pub(crate) async fn fetch_scope(
    _owner: &str, write: &Write, _store: &impl MessageStore,
) -> Result<Scope> {
    let Some(encoded) = &write.encoded_data else {
        return Err(unexpected!("grant record has no data"));
    };
    let bytes = Base64UrlUnpadded::decode_vec(encoded)
        .map_err(|e| unexpected!("invalid base64 grant data: {e}"))?;
    let data: GrantData =
        serde_json::from_slice(&bytes).map_err(|e| unexpected!("invalid grant data: {e}"))?;
    Ok(data.scope)
}
