//! Integration tests for `RecordsWrite`: initial creation, update
//! conflict resolution, immutability, and authorization.

use chrono::Duration;
use dwn_core::records::{Data, WriteBuilder};
use dwn_core::{endpoint, Error};
use dwn_test_support::{test_dwn, TestSigner};

#[tokio::test]
async fn initial_write_succeeds() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"hello".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build write");

    let reply = endpoint::handle(alice.did(), write, &provider).await.expect("should store write");
    assert_eq!(reply.status.code, 202);
}

#[tokio::test]
async fn later_update_replaces_earlier_write() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let initial = WriteBuilder::new()
        .data(Data::Bytes(b"v1".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build initial write");
    let record_id = initial.descriptor.record_id.clone();
    let date_created = initial.descriptor.date_created;
    let timestamp = initial.descriptor.base.message_timestamp;

    endpoint::handle(alice.did(), initial, &provider).await.expect("should store initial write");

    let update = WriteBuilder::new()
        .record_id(record_id)
        .date_created(date_created)
        .data(Data::Bytes(b"v2".to_vec()))
        .data_format("text/plain")
        .message_timestamp(timestamp + Duration::seconds(1))
        .build(&alice)
        .await
        .expect("should build update");

    let reply = endpoint::handle(alice.did(), update, &provider).await.expect("should accept update");
    assert_eq!(reply.status.code, 202);
}

#[tokio::test]
async fn earlier_update_loses_conflict_resolution() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let initial = WriteBuilder::new()
        .data(Data::Bytes(b"v1".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build initial write");
    let record_id = initial.descriptor.record_id.clone();
    let date_created = initial.descriptor.date_created;
    let timestamp = initial.descriptor.base.message_timestamp;

    endpoint::handle(alice.did(), initial, &provider).await.expect("should store initial write");

    let stale = WriteBuilder::new()
        .record_id(record_id)
        .date_created(date_created)
        .data(Data::Bytes(b"v0".to_vec()))
        .data_format("text/plain")
        .message_timestamp(timestamp - Duration::seconds(1))
        .build(&alice)
        .await
        .expect("should build stale update");

    let err = endpoint::handle(alice.did(), stale, &provider).await.expect_err("should reject stale update");
    let Error::Conflict(msg) = err else { panic!("expected Conflict, got {err:?}") };
    assert!(msg.contains("superseded by a later write"));
}

#[tokio::test]
async fn immutable_property_change_rejected() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let initial = WriteBuilder::new()
        .data(Data::Bytes(b"v1".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build initial write");
    let record_id = initial.descriptor.record_id.clone();
    let date_created = initial.descriptor.date_created;
    let timestamp = initial.descriptor.base.message_timestamp;

    endpoint::handle(alice.did(), initial, &provider).await.expect("should store initial write");

    let mutated = WriteBuilder::new()
        .record_id(record_id)
        .date_created(date_created)
        .schema("https://example.com/schema")
        .data(Data::Bytes(b"v2".to_vec()))
        .data_format("text/plain")
        .message_timestamp(timestamp + Duration::seconds(1))
        .build(&alice)
        .await
        .expect("should build mutated update");

    let err = endpoint::handle(alice.did(), mutated, &provider).await.expect_err("should reject mutated update");
    let Error::BadRequest(msg) = err else { panic!("expected BadRequest, got {err:?}") };
    assert!(msg.contains("RecordsWriteImmutablePropertyChanged"));
}

#[tokio::test]
async fn non_owner_write_without_protocol_rejected() {
    let provider = test_dwn();
    let alice = TestSigner::new();
    let bob = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"hello".to_vec()))
        .data_format("text/plain")
        .build(&bob)
        .await
        .expect("should build write");

    let err =
        endpoint::handle(alice.did(), write, &provider).await.expect_err("non-owner write should be rejected");
    assert!(matches!(err, Error::Unauthorized(_)));
}
