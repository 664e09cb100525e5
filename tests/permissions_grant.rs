//! Integration test for permission-grant-based delegation: Alice grants Bob
//! the right to configure protocols on her behalf, Bob's configure succeeds
//! while the grant is active, and is rejected once it expires.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use dwn_core::permissions::{GrantBuilder, Scope};
use dwn_core::protocols::{ConfigureBuilder, ProtocolDefinition, RuleSet, Type};
use dwn_core::{endpoint, Error, Method};
use dwn_test_support::{test_dwn, TestSigner};

fn minimal_definition(protocol: &str) -> ProtocolDefinition {
    ProtocolDefinition {
        protocol: protocol.to_string(),
        published: true,
        types: BTreeMap::from([("doc".to_string(), Type::default())]),
        structure: BTreeMap::from([("doc".to_string(), RuleSet::default())]),
    }
}

#[tokio::test]
async fn grant_authorizes_configure_until_it_expires() {
    let provider = test_dwn();
    let alice = TestSigner::new();
    let bob = TestSigner::new();

    let expires = Utc::now() + chrono::Duration::milliseconds(500);
    let grant = GrantBuilder::new()
        .grantee(bob.did())
        .scope(Scope::Protocols { method: Method::Configure, protocol: None })
        .date_expires(expires)
        .description("let Bob configure protocols on my behalf")
        .build(&alice)
        .await
        .expect("should build grant");
    let grant_id = grant.descriptor.record_id.clone();
    endpoint::handle(alice.did(), grant, &provider).await.expect("should store grant");

    // the grant is active: Bob's configure, invoked under it, succeeds
    let configure = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocols/delegated"))
        .permission_grant_id(grant_id.clone())
        .build(&bob)
        .await
        .expect("should build configure");
    let reply = endpoint::handle(alice.did(), configure, &provider)
        .await
        .expect("configure under an active grant should succeed");
    assert_eq!(reply.status.code, 202);

    tokio::time::sleep(Duration::from_millis(600)).await;

    // after expiry the same grant no longer authorizes the configure
    let configure = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocols/delegated-2"))
        .permission_grant_id(grant_id)
        .build(&bob)
        .await
        .expect("should build configure");
    let err = endpoint::handle(alice.did(), configure, &provider)
        .await
        .expect_err("configure under an expired grant should be rejected");
    assert!(matches!(err, Error::Unauthorized(_)));
}
