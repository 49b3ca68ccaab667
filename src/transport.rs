//! Transport and filesystem seams.
//!
//! The client dials through a [`Dialer`] so tests can substitute an in-memory
//! pipe, and persists BLOBs through [`BlobStorage`] so the working directory
//! is pluggable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{IndiError, IndiResult};

/// A bidirectional byte stream to an INDI server.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Dials a (network, address) pair to produce a connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> IndiResult<Box<dyn Connection>>;
}

/// The default dialer: plain TCP.
#[derive(Debug, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> IndiResult<Box<dyn Connection>> {
        if network != "tcp" {
            return Err(IndiError::Dial(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported network: {network}"),
            )));
        }
        let stream = TcpStream::connect(address).await.map_err(IndiError::Dial)?;
        Ok(Box::new(stream))
    }
}

/// Filesystem operations the BLOB pipeline needs: open-for-read,
/// create-truncate-write, and basename extraction. BLOB filenames are flat;
/// no directory creation is required.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn open(&self, name: &str) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>>;
    async fn create(&self, name: &str) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
    fn base_name(&self, path: &str) -> String;
}

/// [`BlobStorage`] backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for LocalStorage {
    /// Stores BLOBs in the process working directory.
    fn default() -> Self {
        Self::new(".")
    }
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn open(&self, name: &str) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(self.root.join(name)).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, name: &str) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let file = tokio::fs::File::create(self.root.join(name)).await?;
        Ok(Box::new(file))
    }

    fn base_name(&self, path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_local_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let mut w = storage.create("cam_CCD1_CCD1.fits").await.unwrap();
        w.write_all(b"SIMPLE").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = storage.open("cam_CCD1_CCD1.fits").await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"SIMPLE");
    }

    #[tokio::test]
    async fn test_create_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let mut w = storage.create("f.bin").await.unwrap();
        w.write_all(b"long old contents").await.unwrap();
        w.shutdown().await.unwrap();

        let mut w = storage.create("f.bin").await.unwrap();
        w.write_all(b"new").await.unwrap();
        w.shutdown().await.unwrap();

        let mut r = storage.open("f.bin").await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"new");
    }

    #[test]
    fn test_base_name() {
        let storage = LocalStorage::default();
        assert_eq!(storage.base_name("a/b/c.fits"), "c.fits");
        assert_eq!(storage.base_name("c.fits"), "c.fits");
    }

    #[tokio::test]
    async fn test_tcp_dialer_rejects_other_networks() {
        let result = TcpDialer.dial("unix", "/tmp/sock").await;
        match result {
            Err(err) => assert!(matches!(err, IndiError::Dial(_))),
            Ok(_) => panic!("expected dial to fail"),
        }
    }

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = TcpDialer.dial("tcp", &addr.to_string()).await;
        assert!(conn.is_ok());
    }
}
