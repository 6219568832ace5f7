//! Part buffering for multipart uploads
//!
//! Each multipart part is copied into a private anonymous temp file before
//! it is sent, so the part `PUT` carries an exact `Content-Length` and the
//! part's MD5 is known up front. The file has no name on disk and is
//! reclaimed by the OS as soon as the handle is dropped.

use md5::{Digest, Md5};
use std::io::{self, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// One part's bytes, parked in an anonymous temp file
pub struct PartBuffer {
    file: File,
    size: u64,
    md5: String,
}

impl PartBuffer {
    /// Read up to `limit` bytes from `reader` into a new buffer
    ///
    /// Fewer than `limit` bytes means the reader hit end-of-stream.
    pub async fn fill<R>(reader: &mut R, limit: u64) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let file = tokio::task::spawn_blocking(tempfile::tempfile)
            .await
            .map_err(io::Error::other)??;
        let mut file = File::from_std(file);

        let mut limited = (&mut *reader).take(limit);
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut size = 0u64;

        loop {
            let n = limited.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }

        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;

        Ok(Self {
            file,
            size,
            md5: hex::encode(hasher.finalize()),
        })
    }

    /// Number of buffered bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Hex MD5 of the buffered bytes
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Stream the buffered bytes as a request body
    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(ReaderStream::new(self.file))
    }

    /// Hand the underlying file over, positioned at the start
    pub fn into_file(self) -> File {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fill_stops_at_limit() {
        let mut source: &[u8] = b"0123456789";

        let first = PartBuffer::fill(&mut source, 4).await.unwrap();
        let second = PartBuffer::fill(&mut source, 4).await.unwrap();
        let third = PartBuffer::fill(&mut source, 4).await.unwrap();
        let fourth = PartBuffer::fill(&mut source, 4).await.unwrap();

        assert_eq!(first.size(), 4);
        assert_eq!(second.size(), 4);
        assert_eq!(third.size(), 2);
        assert!(fourth.is_empty());
    }

    #[tokio::test]
    async fn test_fill_computes_md5() {
        let mut source: &[u8] = b"hello";
        let part = PartBuffer::fill(&mut source, 1024).await.unwrap();

        assert_eq!(part.md5(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_file_rewound_after_fill() {
        let mut source: &[u8] = b"part contents";
        let part = PartBuffer::fill(&mut source, 1024).await.unwrap();

        let mut file = part.into_file();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "part contents");
    }
}
