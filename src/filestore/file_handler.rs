//! Save engine
//!
//! [`save_file_from_reader`] reads the source exactly once and writes every
//! chunk, in order, to each active destination:
//!
//! ```text
//!                    ┌─► MultiHash (md5, sha256, ...)
//! source ── chunk ───┼─► local temp file        (optional)
//!                    └─► Uploader ─► PUT / multipart / SDK   (optional)
//! ```
//!
//! The remote uploader applies backpressure: a slow store stalls the copy.
//! The local temp file is removed when the caller context is cancelled.

use super::multi_hash::{MultiHash, HASH_NAMES};
use super::save_options::{RemoteMode, SaveOptions};
use super::FileStoreError;
use crate::objectstore::{
    Lifetimes, Multipart, Object, ObjectStoreClients, RemoteStrategy, S3Object, Uploader,
};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Result of saving one file
///
/// `local_path` stays valid only until the caller context that was passed
/// to [`save_file_from_reader`] is cancelled.
#[derive(Debug, Clone, Default)]
pub struct FileHandler {
    pub local_path: Option<PathBuf>,
    pub remote_id: String,
    pub remote_url: String,
    pub size: u64,
    pub name: String,
    /// Digest name → lowercase hex
    pub hashes: BTreeMap<String, String>,
    pub upload_duration: Duration,
}

impl FileHandler {
    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(String::as_str)
    }

    /// Outbound form fields describing this file, named `<prefix>.<key>`
    ///
    /// `hash_functions` selects the digest fields; `None` emits none, an
    /// empty slice emits every digest that was computed.
    pub fn fields(&self, prefix: &str, hash_functions: Option<&[String]>) -> Vec<(String, String)> {
        let key = |name: &str| format!("{}.{}", prefix, name);
        let mut fields = Vec::new();

        fields.push((key("name"), self.name.clone()));
        if let Some(path) = &self.local_path {
            fields.push((key("path"), path.display().to_string()));
        }
        if !self.remote_url.is_empty() {
            fields.push((key("remote_url"), self.remote_url.clone()));
        }
        if !self.remote_id.is_empty() {
            fields.push((key("remote_id"), self.remote_id.clone()));
        }
        fields.push((key("size"), self.size.to_string()));

        if let Some(functions) = hash_functions {
            for name in HASH_NAMES {
                let wanted = functions.is_empty() || functions.iter().any(|f| f == name);
                if let Some(digest) = self.hashes.get(name).filter(|_| wanted) {
                    fields.push((key(name), digest.clone()));
                }
            }
            fields.push((
                key("upload_duration"),
                self.upload_duration.as_secs_f64().to_string(),
            ));
        }

        fields
    }
}

struct LocalFile {
    file: File,
    path: PathBuf,
}

enum Destination {
    Local(LocalFile),
    Remote(Uploader),
}

/// Save `reader` to the destinations configured in `opts`
///
/// `size` is the expected byte count or negative when unknown. Returns only
/// after every destination finished, so a successful return means a remote
/// object is fully stored and verified.
#[tracing::instrument(
    name = "filestore.save",
    skip(ctx, clients, reader, opts),
    fields(
        file.name = %opts.temp_file_prefix,
        file.expected_size = size,
        file.size = tracing::field::Empty,
        remote.mode = ?opts.remote_mode()
    ),
    err
)]
pub async fn save_file_from_reader<R>(
    ctx: &CancellationToken,
    clients: &ObjectStoreClients,
    reader: R,
    size: i64,
    opts: &SaveOptions,
    hash_functions: &[String],
) -> Result<FileHandler, FileStoreError>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let limit = u64::try_from(opts.maximum_size).ok().filter(|limit| *limit > 0);

    if let Some(limit) = limit {
        if size > opts.maximum_size {
            return Err(FileStoreError::EntityTooLarge { limit });
        }
    }

    let mut handler = FileHandler {
        name: opts.temp_file_prefix.clone(),
        ..Default::default()
    };
    let mut destinations = Vec::with_capacity(2);

    if let Some(uploader) = start_remote(ctx, clients, size, opts).await? {
        handler.remote_id = opts.remote_id.clone();
        handler.remote_url = opts.remote_url.clone();
        destinations.push(Destination::Remote(uploader));
    }

    if let Some(dir) = &opts.local_temp_path {
        let local = create_local_file(ctx, dir, &opts.temp_file_prefix).await?;
        handler.local_path = Some(local.path.clone());
        destinations.push(Destination::Local(local));
    }

    if destinations.is_empty() {
        return Err(FileStoreError::MissingDestination);
    }

    let mut hasher = MultiHash::new(hash_functions);
    let result = copy_and_close(reader, &mut destinations, &mut hasher, size, limit).await;

    let written = match result {
        Ok(written) => written,
        Err(e) => {
            // Remote uploaders abort on drop; the partial local copy goes now.
            if let Some(path) = &handler.local_path {
                remove_quietly(path).await;
            }
            return Err(e);
        }
    };

    handler.size = written;
    handler.hashes = hasher.finish();
    handler.upload_duration = started.elapsed();
    tracing::Span::current().record("file.size", written);

    Ok(handler)
}

async fn start_remote(
    ctx: &CancellationToken,
    clients: &ObjectStoreClients,
    size: i64,
    opts: &SaveOptions,
) -> Result<Option<Uploader>, FileStoreError> {
    let strategy = match opts.remote_mode() {
        RemoteMode::None => return Ok(None),
        RemoteMode::SinglePut => {
            let put_url = opts.presigned_put.as_deref().unwrap_or_default();
            RemoteStrategy::Object(Object::new(
                clients.http().clone(),
                put_url,
                opts.presigned_delete.as_deref(),
                size,
                opts.put_requires_length,
            )?)
        }
        RemoteMode::Multipart => RemoteStrategy::Multipart(Multipart::new(
            clients.http().clone(),
            &opts.presigned_parts,
            opts.presigned_complete_multipart.as_deref().unwrap_or_default(),
            opts.presigned_abort_multipart.as_deref(),
            opts.presigned_delete.as_deref(),
            opts.part_size,
        )?),
        RemoteMode::Sdk => {
            let Some(sdk) = &opts.object_storage else {
                return Ok(None);
            };
            let client = clients.s3().get_or_create(&sdk.client).await?;
            RemoteStrategy::S3(S3Object::new(
                client,
                sdk.object_name.clone(),
                sdk.encryption.clone(),
            )?)
        }
    };

    Ok(Some(Uploader::start(
        strategy,
        Lifetimes::new(ctx, opts.deadline),
        clients.pipe_capacity(),
    )))
}

async fn create_local_file(
    ctx: &CancellationToken,
    dir: &Path,
    prefix: &str,
) -> Result<LocalFile, FileStoreError> {
    tokio::fs::create_dir_all(dir).await?;

    let dir = dir.to_path_buf();
    let prefix = prefix.to_string();
    let (file, path) = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(&dir)?
            .keep()
            .map_err(|e| e.error)
    })
    .await
    .map_err(io::Error::other)??;

    let cleanup_path = path.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        ctx.cancelled().await;
        remove_quietly(&cleanup_path).await;
    });

    Ok(LocalFile {
        file: File::from_std(file),
        path,
    })
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

async fn copy_and_close<R>(
    mut reader: R,
    destinations: &mut [Destination],
    hasher: &mut MultiHash,
    size: i64,
    limit: Option<u64>,
) -> Result<u64, FileStoreError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        written += n as u64;
        if let Some(limit) = limit.filter(|limit| written > *limit) {
            return Err(FileStoreError::EntityTooLarge { limit });
        }

        let chunk = &buf[..n];
        hasher.update(chunk);
        for destination in destinations.iter_mut() {
            write_chunk(destination, chunk).await?;
        }
    }

    if size >= 0 && written != size as u64 {
        return Err(FileStoreError::SizeMismatch {
            expected: size,
            actual: written,
        });
    }

    for destination in destinations.iter_mut() {
        match destination {
            Destination::Local(local) => {
                local.file.flush().await?;
                local.file.sync_all().await?;
            }
            Destination::Remote(uploader) => uploader.close().await?,
        }
    }

    Ok(written)
}

async fn write_chunk(destination: &mut Destination, chunk: &[u8]) -> Result<(), FileStoreError> {
    match destination {
        Destination::Local(local) => Ok(local.file.write_all(chunk).await?),
        Destination::Remote(uploader) => match uploader.write_all(chunk).await {
            Ok(()) => Ok(()),
            // The upload task is gone; its own error explains why.
            Err(write_error) => match uploader.close().await {
                Err(upload_error) => Err(upload_error.into()),
                Ok(()) => Err(write_error.into()),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> FileHandler {
        let mut hashes = BTreeMap::new();
        hashes.insert("md5".to_string(), "m".to_string());
        hashes.insert("sha256".to_string(), "s".to_string());
        FileHandler {
            local_path: Some(PathBuf::from("/tmp/file123")),
            size: 10,
            name: "a.txt".into(),
            hashes,
            ..Default::default()
        }
    }

    #[test]
    fn test_fields_without_hashes() {
        let fields = handler().fields("file", None);
        let names: Vec<_> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["file.name", "file.path", "file.size"]);
    }

    #[test]
    fn test_fields_with_selected_hashes() {
        let fields = handler().fields("file", Some(&["sha256".to_string()]));
        let names: Vec<_> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["file.name", "file.path", "file.size", "file.sha256", "file.upload_duration"]
        );
    }

    #[test]
    fn test_fields_for_remote_only() {
        let handler = FileHandler {
            remote_id: "obj-1".into(),
            remote_url: "http://store/get".into(),
            name: "a.txt".into(),
            ..Default::default()
        };
        let fields = handler.fields("file", None);
        assert!(fields.contains(&("file.remote_id".to_string(), "obj-1".to_string())));
        assert!(fields.contains(&("file.remote_url".to_string(), "http://store/get".to_string())));
        assert!(!fields.iter().any(|(k, _)| k == "file.path"));
    }

    #[tokio::test]
    async fn test_missing_destination() {
        let ctx = CancellationToken::new();
        let mut opts = SaveOptions::local("/unused");
        opts.local_temp_path = None;

        let result = save_file_from_reader(
            &ctx,
            &ObjectStoreClients::default(),
            &b"data"[..],
            4,
            &opts,
            &[],
        )
        .await;
        assert!(matches!(result, Err(FileStoreError::MissingDestination)));
    }

    #[tokio::test]
    async fn test_declared_size_over_limit_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CancellationToken::new();
        let mut opts = SaveOptions::local(dir.path());
        opts.maximum_size = 3;

        let result = save_file_from_reader(
            &ctx,
            &ObjectStoreClients::default(),
            &b"data"[..],
            4,
            &opts,
            &[],
        )
        .await;
        assert!(matches!(result, Err(FileStoreError::EntityTooLarge { limit: 3 })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
