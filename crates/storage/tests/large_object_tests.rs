//! Large object tarball store tests against a real PostgreSQL database.
//!
//! They require Docker to be running. Set SKIP_POSTGRES_TESTS=1 to skip.

mod common;

use bytes::Bytes;
use common::{payload, storage_or_skip};
use futures::StreamExt;
use pgreg_metadata::repos::PackageRepo;
use pgreg_metadata::{MetadataError, MetadataStore};
use pgreg_storage::{StorageError, TarballKey, TarballStore, WriteMode, copy_stream};
use serde_json::json;

const TEN_MB: usize = 10 * 1024 * 1024;

fn key(name: &str) -> TarballKey {
    TarballKey::new("default", "tar", name)
}

async fn read_all(store: &impl TarballStore, key: &TarballKey) -> (u64, Vec<u8>) {
    let reader = store.get_stream(key).await.unwrap();
    let size = reader.size;
    let mut stream = reader.stream;
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    (size, data)
}

#[tokio::test]
async fn test_ten_megabyte_round_trip() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-1.0.0.tgz");
    let data = payload(TEN_MB, 1);

    // Feed the upload in uneven pieces, the way a network body arrives.
    let pieces: Vec<Result<Bytes, StorageError>> = data
        .chunks(100_003)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let upload = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    let written = copy_stream(futures::stream::iter(pieces), upload)
        .await
        .unwrap();
    assert_eq!(written, TEN_MB as u64);

    let (size, read) = read_all(store, &key).await;
    assert_eq!(size, TEN_MB as u64);
    assert_eq!(read.len(), data.len());
    assert!(read == data, "streamed bytes differ from uploaded bytes");
    assert_eq!(store.head(&key).await.unwrap(), TEN_MB as u64);
}

#[tokio::test]
async fn test_replace_returns_new_bytes_without_orphans() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-1.0.0.tgz");
    let first = payload(300_000, 1);
    let second = payload(200_000, 2);

    store
        .put(&key, Bytes::from(first), WriteMode::Replace)
        .await
        .unwrap();
    assert_eq!(storage.large_object_count().await, 1);

    store
        .put(&key, Bytes::from(second.clone()), WriteMode::Replace)
        .await
        .unwrap();

    let (size, read) = read_all(store, &key).await;
    assert_eq!(size, second.len() as u64);
    assert_eq!(read, second);
    assert_eq!(storage.large_object_count().await, 1);

    let referenced: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_largeobject_metadata m JOIN tarball t ON t.file = m.oid",
    )
    .fetch_one(storage.pool())
    .await
    .unwrap();
    assert_eq!(referenced, 1);
}

#[tokio::test]
async fn test_failed_replacement_keeps_old_blob() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-1.0.0.tgz");
    let original = payload(150_000, 3);

    store
        .put(&key, Bytes::from(original.clone()), WriteMode::Replace)
        .await
        .unwrap();

    // The client disconnects after sending part of the replacement.
    let pieces = vec![
        Ok(Bytes::from(payload(100_000, 9))),
        Err(StorageError::Stream("connection reset".to_string())),
    ];
    let upload = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    let err = copy_stream(futures::stream::iter(pieces), upload)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Stream(_)));

    let (_, read) = read_all(store, &key).await;
    assert_eq!(read, original);
    assert_eq!(storage.large_object_count().await, 1);
}

#[tokio::test]
async fn test_dropped_upload_rolls_back() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-2.0.0.tgz");

    let mut upload = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    upload
        .write(Bytes::from(payload(200_000, 4)))
        .await
        .unwrap();
    drop(upload);

    assert_eq!(storage.wait_for_large_object_count(0).await, 0);
    assert!(!store.exists(&key).await.unwrap());

    let mut upload = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    upload.write(Bytes::from_static(b"partial")).await.unwrap();
    upload.abort().await.unwrap();

    assert!(store.head(&key).await.unwrap_err().is_not_found());
    assert_eq!(storage.large_object_count().await, 0);
}

#[tokio::test]
async fn test_create_new_refuses_existing_tarball() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-1.0.0.tgz");

    store
        .put(&key, Bytes::from_static(b"v1"), WriteMode::CreateNew)
        .await
        .unwrap();

    let err = store
        .put(&key, Bytes::from_static(b"v2"), WriteMode::CreateNew)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(_)), "{err:?}");
    assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"v1"));
    assert_eq!(storage.large_object_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_create_new_has_one_winner() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-3.0.0.tgz");

    // Both uploads start while the key is still absent.
    let mut first = store.put_stream(&key, WriteMode::CreateNew).await.unwrap();
    let mut second = store.put_stream(&key, WriteMode::CreateNew).await.unwrap();
    first.write(Bytes::from_static(b"first")).await.unwrap();
    second.write(Bytes::from_static(b"second")).await.unwrap();

    first.finish().await.unwrap();
    let err = second.finish().await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(_)), "{err:?}");

    assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"first"));
    assert_eq!(storage.large_object_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_replace_leaves_one_object() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-4.0.0.tgz");

    let mut first = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    let mut second = store.put_stream(&key, WriteMode::Replace).await.unwrap();
    first.write(Bytes::from_static(b"first")).await.unwrap();
    second.write(Bytes::from_static(b"second")).await.unwrap();

    let (a, b) = tokio::join!(first.finish(), second.finish());
    a.unwrap();
    b.unwrap();

    let content = store.get(&key).await.unwrap();
    assert!(content == Bytes::from_static(b"first") || content == Bytes::from_static(b"second"));
    assert_eq!(storage.large_object_count().await, 1);
}

#[tokio::test]
async fn test_delete_and_remove_package_unlink_objects() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;

    for name in ["tar-1.0.0.tgz", "tar-1.1.0.tgz", "tar-2.0.0.tgz"] {
        store
            .put(&key(name), Bytes::from_static(b"bytes"), WriteMode::Replace)
            .await
            .unwrap();
    }
    let other = TarballKey::new("default", "other", "other-1.0.0.tgz");
    store
        .put(&other, Bytes::from_static(b"keep"), WriteMode::Replace)
        .await
        .unwrap();
    assert_eq!(storage.large_object_count().await, 4);

    store.delete(&key("tar-1.0.0.tgz")).await.unwrap();
    assert!(!store.exists(&key("tar-1.0.0.tgz")).await.unwrap());
    assert_eq!(storage.large_object_count().await, 3);

    // Deleting an absent tarball is not an error.
    store.delete(&key("tar-1.0.0.tgz")).await.unwrap();

    let removed = store.delete_package("default", "tar").await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(storage.large_object_count().await, 1);
    assert_eq!(store.get(&other).await.unwrap(), Bytes::from_static(b"keep"));
}

#[tokio::test]
async fn test_remove_package_drops_document_and_tarballs() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    storage
        .metadata
        .save_package("default", "tar", &json!({"name": "tar"}))
        .await
        .unwrap();
    for name in ["tar-1.0.0.tgz", "tar-2.0.0.tgz"] {
        store
            .put(&key(name), Bytes::from_static(b"bytes"), WriteMode::Replace)
            .await
            .unwrap();
    }

    assert_eq!(store.remove_package("default", "tar").await.unwrap(), 2);
    let err = storage.metadata.read_package("default", "tar").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!store.exists(&key("tar-1.0.0.tgz")).await.unwrap());
    assert_eq!(storage.large_object_count().await, 0);

    // Removing a package that is already gone succeeds.
    assert_eq!(store.remove_package("default", "tar").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_document_delete_keeps_tarballs() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let doc = json!({"name": "tar", "version": "1.0.0"});
    storage
        .metadata
        .save_package("default", "tar", &doc)
        .await
        .unwrap();
    store
        .put(&key("tar-1.0.0.tgz"), Bytes::from_static(b"bytes"), WriteMode::Replace)
        .await
        .unwrap();

    sqlx::query(
        r#"
        CREATE FUNCTION refuse_package_delete() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION 'packages are append-only here';
        END;
        $$ LANGUAGE plpgsql
        "#,
    )
    .execute(storage.pool())
    .await
    .unwrap();
    sqlx::query(
        "CREATE TRIGGER refuse_package_delete BEFORE DELETE ON packages \
         FOR EACH ROW EXECUTE FUNCTION refuse_package_delete()",
    )
    .execute(storage.pool())
    .await
    .unwrap();

    let err = store.remove_package("default", "tar").await.unwrap_err();
    assert!(matches!(err, StorageError::Metadata(MetadataError::Query { .. })), "{err:?}");

    // The tarball delete ran first in the same transaction and was undone.
    assert_eq!(
        storage.metadata.read_package("default", "tar").await.unwrap(),
        doc
    );
    assert_eq!(
        store.get(&key("tar-1.0.0.tgz")).await.unwrap(),
        Bytes::from_static(b"bytes")
    );
    assert_eq!(storage.large_object_count().await, 1);
}

#[tokio::test]
async fn test_read_missing_tarball_is_not_found() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let err = storage.tarballs.get_stream(&key("nope.tgz")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_abandoned_reader_releases_transaction() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-5.0.0.tgz");
    let data = payload(500_000, 5);
    store
        .put(&key, Bytes::from(data.clone()), WriteMode::Replace)
        .await
        .unwrap();

    let reader = store.get_stream(&key).await.unwrap();
    let mut stream = reader.stream;
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(&first[..], &data[..first.len()]);
    drop(stream);

    // The snapshot is gone; replacing and deleting still work.
    store
        .put(&key, Bytes::from_static(b"new"), WriteMode::Replace)
        .await
        .unwrap();
    store.delete(&key).await.unwrap();
    assert_eq!(storage.large_object_count().await, 0);
}

#[tokio::test]
async fn test_degraded_engine_refuses_tarball_writes() {
    let Some(storage) = storage_or_skip().await else {
        return;
    };
    let store = &storage.tarballs;
    let key = key("tar-1.0.0.tgz");
    store
        .put(&key, Bytes::from_static(b"kept"), WriteMode::Replace)
        .await
        .unwrap();

    storage.metadata.gate().degrade("startup read failed");

    for result in [
        store.put(&key, Bytes::from_static(b"x"), WriteMode::Replace).await.map(|_| ()),
        store.delete(&key).await,
        store.delete_package("default", "tar").await.map(|_| ()),
        store.remove_package("default", "tar").await.map(|_| ()),
    ] {
        assert!(matches!(
            result,
            Err(StorageError::Metadata(MetadataError::Locked(_)))
        ));
    }
    assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"kept"));
}
