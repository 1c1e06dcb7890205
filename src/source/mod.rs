//! Byte-addressable data sources.
//!
//! A [Source] is the seam between the cache engine and whatever actually
//! holds the bytes: a local file ([FileSource]), a peer on the other end of
//! a connection ([crate::remote::RemoteSource]), or an in-memory buffer in
//! tests ([crate::mocks::MemorySource]). The cache never learns which one
//! it is talking to.
//!
//! # Read semantics
//!
//! [Source::read_at] returns at most `len` bytes and is short only when the
//! requested range extends past the end of the source. A read that starts
//! at or beyond the end returns empty bytes. Any other shortfall is an
//! error, not a short read.
//!
//! All operations are positional; there is no file pointer to seek. This
//! keeps concurrent readers independent of each other.

use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

mod file;
pub use file::FileSource;

/// Errors that can occur when interacting with a [Source].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("source closed")]
    Closed,
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("remote error: {0}")]
    Remote(String),
}

/// A positional byte store.
pub trait Source: Clone + Send + Sync + 'static {
    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Short only at end-of-source; empty when `offset` is at or past the
    /// end.
    fn read_at(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;

    /// Write `buf` at `offset`, extending the source if needed. Returns the
    /// number of bytes written.
    fn write_at(&self, buf: Bytes, offset: u64)
        -> impl Future<Output = Result<usize, Error>> + Send;

    /// Current size of the source in bytes.
    fn size(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Durably persist any pending writes.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release the source. Pending writes are synced first.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}
