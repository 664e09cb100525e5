//! Integration tests for `RecordsQuery`: schema/date-range filtering,
//! anonymous visibility of unpublished records, and protocol-role-privileged
//! visibility.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dwn_core::protocols::{ActionRule, Actor, Action, ConfigureBuilder, ProtocolDefinition, RuleSet, Type};
use dwn_core::records::{Data, QueryBuilder, RecordsFilter, Sort, WriteBuilder};
use dwn_core::{endpoint, DateRange, Error};
use dwn_test_support::{test_dwn, TestSigner};

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

#[tokio::test]
async fn query_by_schema_returns_only_matching_records() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    for schema in ["https://example.com/schemas/s1", "https://example.com/schemas/s2", "https://example.com/schemas/s2"] {
        let write = WriteBuilder::new()
            .data(Data::Bytes(b"content".to_vec()))
            .data_format("text/plain")
            .schema(schema)
            .build(&alice)
            .await
            .expect("should build write");
        endpoint::handle(alice.did(), write, &provider).await.expect("should store write");
    }

    let query = QueryBuilder::new()
        .filter(RecordsFilter {
            schema: Some("https://example.com/schemas/s2".to_string()),
            ..RecordsFilter::default()
        })
        .build(&alice)
        .await
        .expect("should build query");

    let reply = endpoint::handle(alice.did(), query, &provider).await.expect("query should succeed");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.write.descriptor.schema.as_deref(), Some("https://example.com/schemas/s2"));
    }
}

#[tokio::test]
async fn query_by_date_created_range_returns_sorted_matches() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let dates = [at("2021-01-01T00:00:00Z"), at("2022-01-01T00:00:00Z"), at("2023-01-01T00:00:00Z")];
    for date in dates {
        let write = WriteBuilder::new()
            .data(Data::Bytes(b"content".to_vec()))
            .data_format("text/plain")
            .date_created(date)
            .build(&alice)
            .await
            .expect("should build write");
        endpoint::handle(alice.did(), write, &provider).await.expect("should store write");
    }

    let query = QueryBuilder::new()
        .filter(RecordsFilter {
            date_created: Some(DateRange::from(at("2021-12-31T00:00:00Z"))),
            ..RecordsFilter::default()
        })
        .date_sort(Sort::CreatedAsc)
        .build(&alice)
        .await
        .expect("should build query");

    let reply = endpoint::handle(alice.did(), query, &provider).await.expect("query should succeed");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].write.descriptor.date_created, dates[1]);
    assert_eq!(entries[1].write.descriptor.date_created, dates[2]);
}

#[tokio::test]
async fn anonymous_query_sees_only_published_records_and_is_rejected_for_explicit_unpublished_filter() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let published = WriteBuilder::new()
        .data(Data::Bytes(b"public".to_vec()))
        .data_format("text/plain")
        .published(true)
        .build(&alice)
        .await
        .expect("should build published write");
    let published_id = published.descriptor.record_id.clone();
    endpoint::handle(alice.did(), published, &provider).await.expect("should store published write");

    let draft = WriteBuilder::new()
        .data(Data::Bytes(b"draft".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build draft write");
    endpoint::handle(alice.did(), draft, &provider).await.expect("should store draft write");

    let query = QueryBuilder::new().authorize(false).build(&alice).await.expect("should build anonymous query");
    let reply = endpoint::handle(alice.did(), query, &provider).await.expect("anonymous query should succeed");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.descriptor.record_id, published_id);

    let query = QueryBuilder::new()
        .filter(RecordsFilter { published: Some(false), ..RecordsFilter::default() })
        .authorize(false)
        .build(&alice)
        .await
        .expect("should build anonymous unpublished query");
    let err = endpoint::handle(alice.did(), query, &provider)
        .await
        .expect_err("anonymous query for published:false should be rejected");
    assert!(matches!(err, Error::Unauthorized(_)));
}

fn role_definition(protocol: &str) -> ProtocolDefinition {
    ProtocolDefinition {
        protocol: protocol.to_string(),
        published: true,
        types: BTreeMap::from([
            ("friend".to_string(), Type::default()),
            ("chat".to_string(), Type::default()),
        ]),
        structure: BTreeMap::from([
            ("friend".to_string(), RuleSet { role: Some(true), ..RuleSet::default() }),
            (
                "chat".to_string(),
                RuleSet {
                    actions: Some(vec![ActionRule {
                        who: Some(Actor::Anyone),
                        can: vec![Action::Create],
                        ..ActionRule::default()
                    }]),
                    ..RuleSet::default()
                },
            ),
        ]),
    }
}

#[tokio::test]
async fn protocol_role_authorizes_visibility_into_unpublished_records() {
    let provider = test_dwn();
    let alice = TestSigner::new();
    let bob = TestSigner::new();

    let protocol = "https://example.com/protocols/friends";
    let configure =
        ConfigureBuilder::new().definition(role_definition(protocol)).build(&alice).await.expect("should build configure");
    endpoint::handle(alice.did(), configure, &provider).await.expect("should configure protocol");

    let friend_write = WriteBuilder::new()
        .data(Data::Bytes(b"friend".to_vec()))
        .data_format("text/plain")
        .protocol(protocol)
        .protocol_path("friend")
        .recipient(bob.did())
        .build(&alice)
        .await
        .expect("should build friend write");
    endpoint::handle(alice.did(), friend_write, &provider).await.expect("should store friend write");

    for i in 0..3 {
        let chat_write = WriteBuilder::new()
            .data(Data::Bytes(format!("chat {i}").into_bytes()))
            .data_format("text/plain")
            .protocol(protocol)
            .protocol_path("chat")
            .build(&alice)
            .await
            .expect("should build chat write");
        endpoint::handle(alice.did(), chat_write, &provider).await.expect("should store chat write");
    }

    let privileged_query = QueryBuilder::new()
        .filter(RecordsFilter {
            protocol: Some(protocol.to_string()),
            protocol_path: Some("chat".to_string()),
            ..RecordsFilter::default()
        })
        .protocol_role("friend")
        .build(&bob)
        .await
        .expect("should build role-authorized query");
    let reply =
        endpoint::handle(alice.did(), privileged_query, &provider).await.expect("role-authorized query should succeed");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 3);

    let unprivileged_query = QueryBuilder::new()
        .filter(RecordsFilter {
            protocol: Some(protocol.to_string()),
            protocol_path: Some("chat".to_string()),
            ..RecordsFilter::default()
        })
        .build(&bob)
        .await
        .expect("should build unprivileged query");
    let reply =
        endpoint::handle(alice.did(), unprivileged_query, &provider).await.expect("unprivileged query should succeed");
    assert!(reply.body.expect("should have body").entries.is_none());
}
