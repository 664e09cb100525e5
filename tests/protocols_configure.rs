//! Integration tests for `ProtocolsConfigure`: installing a definition,
//! tenant-only enforcement, and newest-wins conflict resolution.

use std::collections::BTreeMap;

use dwn_core::auth::AuthorizationBuilder;
use dwn_core::protocols::{ConfigureBuilder, ProtocolDefinition, RuleSet, Type};
use dwn_core::{cid, endpoint, Error};
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
async fn owner_configures_protocol() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let configure = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocol"))
        .build(&alice)
        .await
        .expect("should build configure");

    let reply = endpoint::handle(alice.did(), configure, &provider).await.expect("configure should succeed");
    assert_eq!(reply.status.code, 202);
}

#[tokio::test]
async fn non_owner_configure_rejected() {
    let provider = test_dwn();
    let alice = TestSigner::new();
    let bob = TestSigner::new();

    let configure = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocol"))
        .build(&bob)
        .await
        .expect("should build configure");

    let err = endpoint::handle(alice.did(), configure, &provider)
        .await
        .expect_err("non-owner configure should be rejected");
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn reconfigure_with_older_timestamp_conflicts() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let first = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocol"))
        .build(&alice)
        .await
        .expect("should build first configure");
    let first_timestamp = first.descriptor.base.message_timestamp;
    endpoint::handle(alice.did(), first, &provider).await.expect("first configure should succeed");

    // Force the second configure's `messageTimestamp` back to the first's,
    // re-signing over the mutated descriptor, to exercise the `>=` conflict
    // check without racing the clock.
    let mut second = ConfigureBuilder::new()
        .definition(minimal_definition("https://example.com/protocol"))
        .build(&alice)
        .await
        .expect("should build second configure");
    second.descriptor.base.message_timestamp = first_timestamp;
    let descriptor_cid = cid::compute_cid(&second.descriptor).expect("should compute descriptor cid");
    second.authorization =
        AuthorizationBuilder::new().descriptor_cid(descriptor_cid).build(&alice).await.expect("should re-sign");

    let err = endpoint::handle(alice.did(), second, &provider)
        .await
        .expect_err("reconfigure without a strictly newer timestamp should conflict");
    let Error::Conflict(msg) = err else { panic!("expected Conflict, got {err:?}") };
    assert!(msg.contains("newer definition exists"));
}
