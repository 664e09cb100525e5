//! Integration tests for `RecordsDelete`: deleting a record, the
//! subsequent read, and deleting a record that doesn't exist.

use dwn_core::records::{Data, DeleteBuilder, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_core::{endpoint, Error};
use dwn_test_support::{test_dwn, TestSigner};

#[tokio::test]
async fn owner_deletes_own_record() {
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

    let delete =
        DeleteBuilder::new().record_id(record_id.clone()).build(&alice).await.expect("should build delete");

    let reply = endpoint::handle(alice.did(), delete, &provider).await.expect("delete should succeed");
    assert_eq!(reply.status.code, 202);

    let read = ReadBuilder::new()
        .filter(RecordsFilter { record_id: Some(record_id), ..RecordsFilter::default() })
        .build(&alice)
        .await
        .expect("should build read");
    let reply = endpoint::handle(alice.did(), read, &provider).await.expect("should process read");
    assert_eq!(reply.status.code, 404);
}

#[tokio::test]
async fn delete_of_nonexistent_record_not_found() {
    let provider = test_dwn();
    let alice = TestSigner::new();

    let delete = DeleteBuilder::new()
        .record_id("nonexistent-record")
        .build(&alice)
        .await
        .expect("should build delete");

    let err = endpoint::handle(alice.did(), delete, &provider).await.expect_err("should 404");
    let Error::NotFound(msg) = err else { panic!("expected NotFound, got {err:?}") };
    assert!(msg.contains("no matching record found"));
}
