//! Integration tests for `RecordsRead`: owner access, anonymous access to
//! published records, authorization failure, and reads of deleted records.

use dwn_core::records::{Data, DeleteBuilder, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_core::{endpoint, Error};
use dwn_test_support::{test_dwn, TestSigner};

#[tokio::test]
async fn owner_reads_own_unpublished_record() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"private".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build write");
    let record_id = write.descriptor.record_id.clone();
    endpoint::handle(alice.did(), write, &provider).await.expect("should store write");

    let read = ReadBuilder::new()
        .filter(RecordsFilter { record_id: Some(record_id), ..RecordsFilter::default() })
        .build(&alice)
        .await
        .expect("should build read");

    let reply = endpoint::handle(alice.did(), read, &provider).await.expect("owner read should succeed");
    assert_eq!(reply.status.code, 200);
    let body = reply.body.expect("should have body");
    assert!(body.entry.records_write.is_some());
}

#[tokio::test]
async fn anonymous_reads_published_record() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"public".to_vec()))
        .data_format("text/plain")
        .published(true)
        .build(&alice)
        .await
        .expect("should build write");
    let record_id = write.descriptor.record_id.clone();
    endpoint::handle(alice.did(), write, &provider).await.expect("should store write");

    let read = ReadBuilder::new()
        .filter(RecordsFilter { record_id: Some(record_id), ..RecordsFilter::default() })
        .authorize(false)
        .build(&alice)
        .await
        .expect("should build anonymous read");

    let reply =
        endpoint::handle(alice.did(), read, &provider).await.expect("anonymous read of published record should succeed");
    assert_eq!(reply.status.code, 200);
    let body = reply.body.expect("should have body");
    assert!(body.entry.records_write.is_some());
}

#[tokio::test]
async fn non_owner_read_of_unpublished_record_without_protocol_rejected() {
    let provider = test_dwn();
    let alice = TestSigner::new();
    let bob = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"private".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build write");
    let record_id = write.descriptor.record_id.clone();
    endpoint::handle(alice.did(), write, &provider).await.expect("should store write");

    let read = ReadBuilder::new()
        .filter(RecordsFilter { record_id: Some(record_id), ..RecordsFilter::default() })
        .build(&bob)
        .await
        .expect("should build read");

    let err =
        endpoint::handle(alice.did(), read, &provider).await.expect_err("non-owner read should be rejected");
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn read_of_deleted_record_returns_not_found_with_initial_write() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let write = WriteBuilder::new()
        .data(Data::Bytes(b"to be deleted".to_vec()))
        .data_format("text/plain")
        .build(&alice)
        .await
        .expect("should build write");
    let record_id = write.descriptor.record_id.clone();
    endpoint::handle(alice.did(), write, &provider).await.expect("should store write");

    let delete = DeleteBuilder::new()
        .record_id(record_id.clone())
        .build(&alice)
        .await
        .expect("should build delete");
    endpoint::handle(alice.did(), delete, &provider).await.expect("should delete record");

    let read = ReadBuilder::new()
        .filter(RecordsFilter { record_id: Some(record_id), ..RecordsFilter::default() })
        .build(&alice)
        .await
        .expect("should build read");

    let reply = endpoint::handle(alice.did(), read, &provider).await.expect("should process read");
    assert_eq!(reply.status.code, 404);
    let body = reply.body.expect("should have body");
    assert!(body.entry.records_write.is_none());
    assert!(body.entry.records_delete.is_some());
    assert!(body.entry.initial_write.is_some());
}
