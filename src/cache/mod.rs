//! A byte-range cache that pages a remote dataset into a local file.
//!
//! A [Cache] session maps a dataset onto fixed-size pages and tracks, one
//! bit per page, which pages are already resident in a local cache file.
//! Reads are served from resident pages directly; missing pages are
//! fetched from the backing [crate::source::Source], written to the local
//! file, and marked resident before the requested bytes are returned. A
//! page never goes back to non-resident except through [Cache::clear].
//!
//! # Persistence
//!
//! Residency survives restarts through a status file stored alongside the
//! cache file (cache file `data` ⇒ status file `data.status`). The status
//! file carries the dataset geometry and the packed residency bitmap
//! behind a CRC32 checksum; it is rewritten every
//! [Config::flush_threshold] fetched bytes and on [Cache::close]. A
//! status file that fails validation, or disagrees with the cache file it
//! accompanies, is discarded and the session starts over (costly, never
//! fatal). Once every page is resident the status file is deleted
//! instead: a cache file whose length equals the dataset size is complete
//! by construction, and [Cache::open] restores full residency from that
//! alone.
//!
//! # Prefetch
//!
//! Callers that know ranges they will need soon can queue them with
//! [Cache::request] and later drain the queue with [Cache::prefetch],
//! which fetches up to a byte budget per pass using one coalesced backing
//! read per contiguous page run. [Cache::try_complete] finishes off a
//! nearly-complete cache in one sweep instead of paying per-page round
//! trips, but only when the outstanding volume is at or below
//! [Config::completion_threshold].
//!
//! # Concurrency
//!
//! State is partitioned, each partition behind its own lock: the
//! residency table and counters, the single-page staging buffer, and the
//! status-file I/O path. Concurrent readers of disjoint ranges proceed in
//! parallel through the local file; overlapping readers may redundantly
//! fetch the same page (both write identical bytes, so this is safe, just
//! wasteful). A cache file and its status file belong to one session in
//! one process; nothing arbitrates concurrent sessions over the same
//! paths.
//!
//! # Example
//!
//! ```
//! use pagecache::{cache::{Cache, Config}, mocks::MemorySource};
//! use prometheus_client::registry::Registry;
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     let dir = tempfile::tempdir().unwrap();
//!     let remote = MemorySource::new(b"a small remote dataset".to_vec());
//!     let mut registry = Registry::default();
//!
//!     let cfg = Config::new(dir.path().join("data")).with_page_size(8);
//!     let cache = Cache::open(cfg, &mut registry, remote).await.unwrap();
//!
//!     let bytes = cache.read(2, 5).await.unwrap();
//!     assert_eq!(&bytes[..], b"small");
//!     cache.close().await.unwrap();
//! });
//! ```

use std::path::PathBuf;
use thiserror::Error;

mod residency;
mod status;
mod storage;

pub use residency::ResidencyTable;
pub use storage::Cache;

/// Default page size (128 KiB).
pub const DEFAULT_PAGE_SIZE: u64 = 128 * 1024;

/// Largest allowed page size (10 MiB), bounding the cost of the staging
/// buffer.
pub const MAX_PAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Default fetched-byte volume between status file flushes (50 MiB).
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Default largest outstanding volume [Cache::try_complete] will finish in
/// one pass (5 MiB).
pub const DEFAULT_COMPLETION_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Errors that can occur when interacting with a [Cache].
#[derive(Debug, Error)]
pub enum Error {
    #[error("source error: {0}")]
    Source(#[from] crate::source::Error),
    #[error("invalid page size: {0}")]
    InvalidPageSize(u64),
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("status file corrupt")]
    CorruptStatus,
    #[error("short read of page {page}: {got} of {want} bytes")]
    ShortRead {
        page: usize,
        got: usize,
        want: usize,
    },
}

/// Configuration for a [Cache] session.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the local cache file. The status file lives at the same
    /// path with a `.status` suffix.
    pub path: PathBuf,

    /// Page size in bytes. Fixed for the lifetime of the cache file; a
    /// persisted status recorded under a different page size is discarded.
    pub page_size: u64,

    /// Fetched-byte volume after which the status file is rewritten.
    pub flush_threshold: u64,

    /// Largest outstanding volume [Cache::try_complete] will fetch.
    pub completion_threshold: u64,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            completion_threshold: DEFAULT_COMPLETION_THRESHOLD,
        }
    }

    /// See [Config::page_size].
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// See [Config::flush_threshold].
    pub fn with_flush_threshold(mut self, flush_threshold: u64) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    /// See [Config::completion_threshold].
    pub fn with_completion_threshold(mut self, completion_threshold: u64) -> Self {
        self.completion_threshold = completion_threshold;
        self
    }
}

/// A contiguous run of pages selected for one coalesced backing read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRun {
    /// First page of the run.
    pub start: usize,
    /// Number of pages in the run.
    pub pages: usize,
}

/// The outcome of [Cache::plan]: the runs to fetch and their total byte
/// volume (always within the requested budget).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchPlan {
    pub runs: Vec<PageRun>,
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FlakySource, MemorySource};
    use prometheus_client::registry::Registry;
    use rand::RngCore;
    use std::path::Path;

    const PAGE: u64 = 4096;

    fn dataset(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn config(path: &Path) -> Config {
        Config::new(path)
            .with_page_size(PAGE)
            .with_flush_threshold(u64::MAX)
            .with_completion_threshold(DEFAULT_COMPLETION_THRESHOLD)
    }

    #[tokio::test]
    async fn test_read_spanning_pages() {
        // 10000 bytes at page size 4096: pages of 4096, 4096, and 1808.
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(10_000);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote.clone())
            .await
            .unwrap();
        assert_eq!(cache.pages(), 3);
        assert_eq!(cache.resident_pages(), 0);

        // Spans pages 0 and 1: one fetch each.
        let before = remote.reads();
        let bytes = cache.read(4000, 200).await.unwrap();
        assert_eq!(&bytes[..], &data[4000..4200]);
        assert_eq!(remote.reads() - before, 2);
        assert_eq!(cache.resident_pages(), 2);

        // The short last page.
        let bytes = cache.read(9000, 5000).await.unwrap();
        assert_eq!(&bytes[..], &data[9000..10_000]);
        assert_eq!(cache.resident_pages(), 3);
        assert!(cache.is_complete());

        // Reads past the end are empty.
        let bytes = cache.read(10_000, 10).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(3 * PAGE as usize);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote.clone())
            .await
            .unwrap();

        let first = cache.read(100, 5000).await.unwrap();
        let fetched = remote.reads();

        // Identical bytes, no further remote reads.
        let second = cache.read(100, 5000).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.reads(), fetched);

        // Still none after the staging buffer moves to another page.
        cache.read(2 * PAGE, 10).await.unwrap();
        let third = cache.read(100, 5000).await.unwrap();
        assert_eq!(first, third);
        assert_eq!(remote.reads(), fetched + 1);
    }

    #[tokio::test]
    async fn test_restart_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let data = dataset(5 * PAGE as usize + 123);
        let remote = MemorySource::new(data.clone());

        // Make pages 1 and 3 resident, then close.
        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        cache.read(PAGE, 100).await.unwrap();
        cache.read(3 * PAGE, 100).await.unwrap();
        assert_eq!(cache.resident_pages(), 2);
        cache.close().await.unwrap();

        // Resume: the same pages are resident and served locally.
        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        assert_eq!(cache.resident_pages(), 2);
        let before = remote.reads();
        let bytes = cache.read(3 * PAGE, 100).await.unwrap();
        assert_eq!(&bytes[..], &data[3 * PAGE as usize..3 * PAGE as usize + 100]);
        assert_eq!(remote.reads(), before);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_residency_drops_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let status = dir.path().join("data.status");
        let data = dataset(2 * PAGE as usize + 7);
        let remote = MemorySource::new(data.clone());

        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        cache.read(0, data.len()).await.unwrap();
        assert!(cache.is_complete());
        cache.close().await.unwrap();
        assert!(!status.exists());

        // Reopen: full residency is reconstructed from the file size, and
        // no remote reads are needed to serve everything.
        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        assert!(cache.is_complete());
        let before = remote.reads();
        let bytes = cache.read(0, data.len()).await.unwrap();
        assert_eq!(&bytes[..], &data[..]);
        assert_eq!(remote.reads(), before);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_status_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let status = dir.path().join("data.status");
        let data = dataset(4 * PAGE as usize);
        let remote = MemorySource::new(data.clone());

        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        cache.read(0, 100).await.unwrap();
        cache.close().await.unwrap();

        // Corrupt the status file.
        let mut buf = std::fs::read(&status).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        std::fs::write(&status, &buf).unwrap();

        // The session starts over and still serves correct bytes.
        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        assert_eq!(cache.resident_pages(), 0);
        let bytes = cache.read(0, 100).await.unwrap();
        assert_eq!(&bytes[..], &data[..100]);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_geometry_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let data = dataset(4 * PAGE as usize);
        let remote = MemorySource::new(data.clone());

        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();
        cache.read(0, 100).await.unwrap();
        cache.close().await.unwrap();

        // A different page size invalidates the persisted status.
        let mut registry = Registry::default();
        let cfg = config(&path).with_page_size(PAGE * 2);
        let cache = Cache::open(cfg, &mut registry, remote.clone()).await.unwrap();
        assert_eq!(cache.resident_pages(), 0);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_budget_plan() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(10 * PAGE as usize);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote)
            .await
            .unwrap();

        // Queue runs [0..2), [4..7), and [9].
        assert_eq!(cache.request(0, 2 * PAGE as usize), 2);
        assert_eq!(cache.request(4 * PAGE, 3 * PAGE as usize), 3);
        assert_eq!(cache.request(9 * PAGE, 1), 1);
        assert_eq!(cache.pending(), 6);

        // No budget, no plan.
        assert_eq!(cache.plan(0), FetchPlan { runs: vec![], bytes: 0 });
        assert_eq!(cache.plan(PAGE - 1).runs, vec![]);

        // The longest run wins, trimmed to the budget, and selection stops
        // at the first page that does not fit.
        let plan = cache.plan(2 * PAGE);
        assert_eq!(plan.runs, vec![PageRun { start: 4, pages: 2 }]);
        assert_eq!(plan.bytes, 2 * PAGE);

        // Enough budget for everything.
        let plan = cache.plan(100 * PAGE);
        assert_eq!(
            plan.runs,
            vec![
                PageRun { start: 4, pages: 3 },
                PageRun { start: 0, pages: 2 },
                PageRun { start: 9, pages: 1 },
            ]
        );
        assert_eq!(plan.bytes, 6 * PAGE);

        // Budget respected for every value, and planning is repeatable.
        for budget in [0, 1, PAGE, 3 * PAGE + 17, 6 * PAGE] {
            let plan = cache.plan(budget);
            assert!(plan.bytes <= budget);
            assert_eq!(plan, cache.plan(budget));
        }
    }

    #[tokio::test]
    async fn test_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(6 * PAGE as usize);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote.clone())
            .await
            .unwrap();

        cache.request(0, data.len());
        assert_eq!(cache.pending(), 6);

        // One pass bounded to half the dataset: one coalesced read.
        let before = remote.reads();
        let fetched = cache.prefetch(3 * PAGE).await.unwrap();
        assert_eq!(fetched, 3 * PAGE);
        assert_eq!(remote.reads() - before, 1);
        assert_eq!(cache.pending(), 3);
        assert_eq!(cache.resident_pages(), 3);

        // Drain the rest and verify contents come from the local file.
        cache.prefetch(u64::MAX).await.unwrap();
        assert_eq!(cache.pending(), 0);
        assert!(cache.is_complete());
        let before = remote.reads();
        let bytes = cache.read(0, data.len()).await.unwrap();
        assert_eq!(&bytes[..], &data[..]);
        assert_eq!(remote.reads(), before);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(3 * PAGE as usize);
        let remote = FlakySource::new(MemorySource::new(data.clone()));
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote.clone())
            .await
            .unwrap();

        // Page 0 fetches, page 1 fails: the bytes produced so far come
        // back and the failed page stays non-resident.
        cache.read(0, 1).await.unwrap();
        remote.fail_reads(usize::MAX);
        let bytes = cache.read(0, 2 * PAGE as usize).await.unwrap();
        assert_eq!(bytes.len(), PAGE as usize);
        assert_eq!(&bytes[..], &data[..PAGE as usize]);
        assert_eq!(cache.resident_pages(), 1);

        // No progress at all surfaces the error.
        assert!(cache.read(PAGE, 10).await.is_err());

        // The failure is transient: once the source recovers, so does the
        // cache.
        remote.fail_reads(0);
        let bytes = cache.read(0, 2 * PAGE as usize).await.unwrap();
        assert_eq!(&bytes[..], &data[..2 * PAGE as usize]);
        assert_eq!(cache.resident_pages(), 2);
    }

    #[tokio::test]
    async fn test_try_complete() {
        let dir = tempfile::tempdir().unwrap();
        let data = dataset(8 * PAGE as usize + 99);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cfg = config(&dir.path().join("data")).with_completion_threshold(3 * PAGE);
        let cache = Cache::open(cfg, &mut registry, remote.clone()).await.unwrap();

        // Too much outstanding: declined.
        assert!(!cache.try_complete().await.unwrap());
        assert_eq!(cache.resident_pages(), 0);

        // Bring the gap under the threshold, then complete in one pass.
        cache.read(0, 6 * PAGE as usize).await.unwrap();
        assert!(cache.remaining() <= 3 * PAGE);
        assert!(cache.try_complete().await.unwrap());
        assert!(cache.is_complete());
        let before = remote.reads();
        let bytes = cache.read(0, data.len()).await.unwrap();
        assert_eq!(&bytes[..], &data[..]);
        assert_eq!(remote.reads(), before);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let data = dataset(2 * PAGE as usize);
        let remote = MemorySource::new(data.clone());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&path), &mut registry, remote.clone())
            .await
            .unwrap();

        cache.read(0, data.len()).await.unwrap();
        assert!(cache.is_complete());

        cache.clear().await.unwrap();
        assert_eq!(cache.resident_pages(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // Reads refetch and still produce the right bytes.
        let before = remote.reads();
        let bytes = cache.read(0, 100).await.unwrap();
        assert_eq!(&bytes[..], &data[..100]);
        assert!(remote.reads() > before);
    }

    #[tokio::test]
    async fn test_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemorySource::new(Vec::new());
        let mut registry = Registry::default();
        let cache = Cache::open(config(&dir.path().join("data")), &mut registry, remote)
            .await
            .unwrap();
        assert_eq!(cache.pages(), 0);
        assert!(cache.is_complete());
        assert!(cache.read(0, 10).await.unwrap().is_empty());
        assert!(cache.try_complete().await.unwrap());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_page_size() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MemorySource::new(vec![0u8; 16]);
        let mut registry = Registry::default();
        let cfg = Config::new(dir.path().join("data")).with_page_size(0);
        assert!(matches!(
            Cache::open(cfg, &mut registry, remote.clone()).await,
            Err(Error::InvalidPageSize(0))
        ));
        let cfg = Config::new(dir.path().join("data")).with_page_size(MAX_PAGE_SIZE + 1);
        assert!(matches!(
            Cache::open(cfg, &mut registry, remote).await,
            Err(Error::InvalidPageSize(_))
        ));
    }
}
