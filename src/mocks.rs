//! Test doubles for [crate::source::Source].

use crate::source::{Error, Source};
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// An in-memory [Source] that counts reads, so tests can assert that a
/// cache did (or did not) go back to its backing store.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<Mutex<Vec<u8>>>,
    reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `read_at` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Source for MemorySource {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        offset
            .checked_add(len as u64)
            .ok_or(Error::OffsetOverflow)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(Error::OffsetOverflow)? as usize;
        let mut data = self.data.lock().unwrap();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(&buf);
        Ok(buf.len())
    }

    async fn size(&self) -> Result<u64, Error> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    async fn sync(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}

/// Wraps a [Source] and fails the next `n` reads on command.
#[derive(Clone)]
pub struct FlakySource<S: Source> {
    inner: S,
    failures: Arc<AtomicUsize>,
}

impl<S: Source> FlakySource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `n` calls to `read_at` fail.
    pub fn fail_reads(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl<S: Source> Source for FlakySource<S> {
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let mut remaining = self.failures.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.failures.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(Error::ReadFailed),
                Err(actual) => remaining = actual,
            }
        }
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, buf: Bytes, offset: u64) -> Result<usize, Error> {
        self.inner.write_at(buf, offset).await
    }

    async fn size(&self) -> Result<u64, Error> {
        self.inner.size().await
    }

    async fn sync(&self) -> Result<(), Error> {
        self.inner.sync().await
    }

    async fn close(self) -> Result<(), Error> {
        self.inner.close().await
    }
}
