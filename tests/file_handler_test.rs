//! Local and dual-destination saves

mod common;

use common::{received, EtagFromBody};
use hayate::filestore::{save_file_from_reader, FileStoreError, SaveOptions};
use hayate::objectstore::ObjectStoreClients;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_until_removed(path: &std::path::Path) -> bool {
    for _ in 0..100 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_local_save_hashes_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();
    let opts = SaveOptions::local(dir.path()).with_prefix("hello.txt");

    let handler = save_file_from_reader(
        &ctx,
        &ObjectStoreClients::default(),
        &b"hello"[..],
        5,
        &opts,
        &[],
    )
    .await
    .unwrap();

    let local = handler.local_path.clone().unwrap();
    assert!(local.starts_with(dir.path()));
    assert!(local
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("hello.txt"));
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"hello");

    assert_eq!(handler.name, "hello.txt");
    assert_eq!(handler.size, 5);
    assert_eq!(handler.hashes["md5"], "5d41402abc4b2a76b9719d911017c592");
    assert_eq!(handler.hashes["sha1"], "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    assert_eq!(
        handler.sha256().unwrap(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert!(handler.hashes.contains_key("sha512"));

    ctx.cancel();
    assert!(wait_until_removed(&local).await);
}

#[tokio::test]
async fn test_selected_hashes_only() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();

    let handler = save_file_from_reader(
        &ctx,
        &ObjectStoreClients::default(),
        &b"hello"[..],
        5,
        &SaveOptions::local(dir.path()),
        &["md5".to_string()],
    )
    .await
    .unwrap();

    assert!(handler.hashes.contains_key("md5"));
    assert!(handler.hashes.contains_key("sha256"));
    assert!(!handler.hashes.contains_key("sha1"));
    assert!(!handler.hashes.contains_key("sha512"));
    ctx.cancel();
}

#[tokio::test]
async fn test_size_mismatch_removes_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();

    let err = save_file_from_reader(
        &ctx,
        &ObjectStoreClients::default(),
        &b"short"[..],
        100,
        &SaveOptions::local(dir.path()),
        &[],
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        FileStoreError::SizeMismatch {
            expected: 100,
            actual: 5
        }
    ));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_streamed_size_over_limit() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancellationToken::new();
    let mut opts = SaveOptions::local(dir.path());
    opts.maximum_size = 10;

    let data = vec![1u8; 64];
    let err = save_file_from_reader(
        &ctx,
        &ObjectStoreClients::default(),
        &data[..],
        -1,
        &opts,
        &[],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FileStoreError::EntityTooLarge { limit: 10 }));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_local_and_remote_receive_same_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/put"))
        .respond_with(EtagFromBody)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/delete"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut opts = SaveOptions::local(dir.path());
    opts.remote_id = "both-1".into();
    opts.remote_url = format!("{}/get", server.uri());
    opts.presigned_put = Some(format!("{}/put", server.uri()));
    opts.presigned_delete = Some(format!("{}/delete", server.uri()));

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let ctx = CancellationToken::new();
    let handler = save_file_from_reader(
        &ctx,
        &ObjectStoreClients::default(),
        &data[..],
        data.len() as i64,
        &opts,
        &[],
    )
    .await
    .unwrap();

    let local = handler.local_path.clone().unwrap();
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
    assert_eq!(received(&server, "PUT", "/put").await[0].body, data);
    assert_eq!(handler.remote_id, "both-1");

    ctx.cancel();
    assert!(wait_until_removed(&local).await);
}
