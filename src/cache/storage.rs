use super::{residency::ResidencyTable, status, Config, Error, FetchPlan, PageRun};
use crate::source::{FileSource, Source};
use bytes::{Bytes, BytesMut};
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Mutex as StateMutex,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Mutable bookkeeping, guarded by one short-held lock: the residency
/// table, the dirty-byte counter, and the out-of-cache set. Never held
/// across I/O.
struct State {
    table: ResidencyTable,
    dirty: u64,
    wanted: BTreeSet<usize>,
}

/// The shared single-page staging buffer and the page currently loaded in
/// it. Serializes the fast path only; concurrent callers degrade to taking
/// turns, not to corruption.
struct Staging {
    page: Option<usize>,
    buf: Vec<u8>,
}

struct Metrics {
    resident_pages: Gauge,
    fetches: Counter,
    fetched_bytes: Counter,
    status_syncs: Counter,
}

impl Metrics {
    fn register(registry: &mut Registry) -> Self {
        let metrics = Self {
            resident_pages: Gauge::default(),
            fetches: Counter::default(),
            fetched_bytes: Counter::default(),
            status_syncs: Counter::default(),
        };
        registry.register(
            "resident_pages",
            "Number of pages resident in the local cache file",
            metrics.resident_pages.clone(),
        );
        registry.register(
            "fetches",
            "Number of reads issued to the backing source",
            metrics.fetches.clone(),
        );
        registry.register(
            "fetched_bytes",
            "Bytes fetched from the backing source",
            metrics.fetched_bytes.clone(),
        );
        registry.register(
            "status_syncs",
            "Number of status file writes",
            metrics.status_syncs.clone(),
        );
        metrics
    }
}

/// Append the status suffix to the cache file path.
fn status_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".status");
    PathBuf::from(name)
}

/// A page-residency cache session over a backing [Source].
pub struct Cache<R: Source> {
    remote: R,
    local: FileSource,
    status_path: PathBuf,

    size: u64,
    page_size: u64,
    pages: usize,
    flush_threshold: u64,
    completion_threshold: u64,

    state: StateMutex<State>,
    staging: Mutex<Staging>,
    status_io: Mutex<()>,

    metrics: Metrics,
}

impl<R: Source> Cache<R> {
    /// Create or resume a session against `cfg.path`.
    ///
    /// A persisted status file is restored if it matches the dataset
    /// geometry and the cache file on disk; otherwise it is discarded and
    /// every page starts non-resident. With no status file at all, a cache
    /// file whose length equals the dataset size is taken as fully
    /// resident (the counterpart of [Cache::close] deleting the status
    /// file once the cache is complete).
    pub async fn open(cfg: Config, registry: &mut Registry, remote: R) -> Result<Self, Error> {
        if cfg.page_size == 0 || cfg.page_size > super::MAX_PAGE_SIZE {
            return Err(Error::InvalidPageSize(cfg.page_size));
        }
        let size = remote.size().await?;
        let pages = size.div_ceil(cfg.page_size) as usize;
        let status_path = status_path(&cfg.path);
        let (local, local_len) = FileSource::open(&cfg.path).await?;

        let mut restored = None;
        let mut had_status = false;
        match tokio::fs::read(&status_path).await {
            Ok(buf) => {
                had_status = true;
                match status::decode(&buf, size, cfg.page_size) {
                    Ok(table) => {
                        // The cache file must cover every page the status
                        // claims is resident.
                        let covered = table.last_resident().map_or(true, |page| {
                            ((page as u64 + 1) * cfg.page_size).min(size) <= local_len
                        });
                        if covered {
                            restored = Some(table);
                        } else {
                            warn!(
                                path = ?status_path,
                                "status file claims pages beyond cache file: discarding"
                            );
                        }
                    }
                    Err(Error::CorruptStatus) => {
                        warn!(path = ?status_path, "invalid status file: discarding");
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Source(err.into())),
        }

        let table = match restored {
            Some(table) => table,
            None if !had_status && size > 0 && local_len == size => {
                debug!("cache file complete and no status file: restoring full residency");
                ResidencyTable::full(pages)
            }
            None => {
                // Full refetch: drop whatever is on disk so the file
                // length stays a meaningful completeness signal.
                if local_len > 0 {
                    local.resize(0).await?;
                }
                if had_status {
                    let _ = tokio::fs::remove_file(&status_path).await;
                }
                ResidencyTable::empty(pages)
            }
        };

        let metrics = Metrics::register(registry);
        metrics.resident_pages.set(table.resident() as i64);
        Ok(Self {
            remote,
            local,
            status_path,
            size,
            page_size: cfg.page_size,
            pages,
            flush_threshold: cfg.flush_threshold,
            completion_threshold: cfg.completion_threshold,
            state: StateMutex::new(State {
                table,
                dirty: 0,
                wanted: BTreeSet::new(),
            }),
            staging: Mutex::new(Staging {
                page: None,
                buf: Vec::new(),
            }),
            status_io: Mutex::new(()),
            metrics,
        })
    }

    /// Size of the dataset in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Total number of pages.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.state.lock().unwrap().table.resident()
    }

    /// Whether every page is resident.
    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().table.is_full()
    }

    /// Non-resident byte volume.
    pub fn remaining(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let missing = (self.pages - state.table.resident()) as u64;
        if missing == 0 {
            return 0;
        }
        let mut bytes = missing * self.page_size;
        if !state.table.get(self.pages - 1) {
            bytes -= self.page_size - self.page_data(self.pages - 1);
        }
        bytes
    }

    /// Number of pages queued for prefetch.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().wanted.len()
    }

    /// Data size of `page` (the last page may be short).
    fn page_data(&self, page: usize) -> u64 {
        let start = page as u64 * self.page_size;
        (start + self.page_size).min(self.size) - start
    }

    /// Read up to `len` bytes starting at `offset`, fetching any missing
    /// pages from the backing source and marking them resident.
    ///
    /// The result is clamped to the dataset size. If a fetch fails after
    /// some bytes were already produced, those bytes are returned (the
    /// failure is logged); the error surfaces only when nothing could be
    /// produced at all.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Bytes, Error> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(Error::OffsetOverflow)?
            .min(self.size);
        if offset >= end {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::with_capacity((end - offset) as usize);
        let first = (offset / self.page_size) as usize;
        let last = ((end - 1) / self.page_size) as usize;
        for page in first..=last {
            let page_start = page as u64 * self.page_size;
            let from = offset.max(page_start);
            let to = end.min(page_start + self.page_data(page));
            match self
                .page_slice(page, (from - page_start) as usize, (to - from) as usize)
                .await
            {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(err) => {
                    if out.is_empty() {
                        return Err(err);
                    }
                    warn!(page, ?err, "range read stopped early");
                    break;
                }
            }
        }
        Ok(out.freeze())
    }

    /// Copy `len` bytes at `start` within `page` out of the staging
    /// buffer, loading the page into it first if needed.
    async fn page_slice(&self, page: usize, start: usize, len: usize) -> Result<Bytes, Error> {
        let mut staging = self.staging.lock().await;
        if staging.page != Some(page) {
            let want = self.page_data(page) as usize;
            let page_start = page as u64 * self.page_size;
            let resident = self.state.lock().unwrap().table.get(page);
            let buf = if resident {
                let buf = self.local.read_at(page_start, want).await?;
                if buf.len() != want {
                    return Err(Error::ShortRead {
                        page,
                        got: buf.len(),
                        want,
                    });
                }
                buf
            } else {
                let buf = self.remote.read_at(page_start, want).await?;
                if buf.len() != want {
                    return Err(Error::ShortRead {
                        page,
                        got: buf.len(),
                        want,
                    });
                }
                self.local.write_at(buf.clone(), page_start).await?;
                self.commit_pages(page, 1, want as u64);
                self.maybe_flush().await;
                buf
            };
            staging.buf.clear();
            staging.buf.extend_from_slice(&buf);
            staging.page = Some(page);
        }
        Ok(Bytes::copy_from_slice(&staging.buf[start..start + len]))
    }

    /// Record `count` pages starting at `first` as resident after one
    /// backing-source read of `bytes` bytes.
    fn commit_pages(&self, first: usize, count: usize, bytes: u64) {
        let resident = {
            let mut state = self.state.lock().unwrap();
            for page in first..first + count {
                state.table.set(page);
                state.wanted.remove(&page);
            }
            state.dirty += bytes;
            state.table.resident()
        };
        self.metrics.resident_pages.set(resident as i64);
        self.metrics.fetches.inc();
        self.metrics.fetched_bytes.inc_by(bytes);
    }

    /// Queue the non-resident pages covering `[offset, offset + len)` for
    /// a later [Cache::prefetch] pass. Returns the number of pages added.
    pub fn request(&self, offset: u64, len: usize) -> usize {
        let end = offset.saturating_add(len as u64).min(self.size);
        if offset >= end {
            return 0;
        }
        let first = (offset / self.page_size) as usize;
        let last = ((end - 1) / self.page_size) as usize;
        let mut state = self.state.lock().unwrap();
        let mut added = 0;
        for page in first..=last {
            if !state.table.get(page) && state.wanted.insert(page) {
                added += 1;
            }
        }
        added
    }

    /// Select queued pages to fetch within `budget` bytes.
    ///
    /// Queued pages are grouped into maximal contiguous runs; runs are
    /// taken longest-first (ties to the lowest start page) and consumed
    /// page by page until the next page would exceed the budget, at which
    /// point selection stops. The result is deterministic for a given
    /// queue and budget.
    pub fn plan(&self, budget: u64) -> FetchPlan {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for &page in &state.wanted {
            if state.table.get(page) {
                continue;
            }
            match runs.last_mut() {
                Some((start, count)) if *start + *count == page => *count += 1,
                _ => runs.push((page, 1)),
            }
        }
        drop(state);
        runs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut picked = Vec::new();
        let mut used = 0u64;
        let mut full = false;
        for (start, count) in runs {
            if full {
                break;
            }
            let mut taken = 0;
            for page in start..start + count {
                let data = self.page_data(page);
                if used + data > budget {
                    full = true;
                    break;
                }
                used += data;
                taken += 1;
            }
            if taken > 0 {
                picked.push(PageRun {
                    start,
                    pages: taken,
                });
            }
        }
        FetchPlan {
            runs: picked,
            bytes: used,
        }
    }

    /// Fetch queued pages within `budget` bytes, one coalesced backing
    /// read per contiguous run. Returns the bytes fetched. A failed run is
    /// logged and its pages stay queued; the error surfaces only when no
    /// run succeeded.
    pub async fn prefetch(&self, budget: u64) -> Result<u64, Error> {
        let plan = self.plan(budget);
        let mut fetched = 0u64;
        let mut last_err = None;
        for run in &plan.runs {
            match self.fetch_run(run.start, run.pages).await {
                Ok(bytes) => fetched += bytes,
                Err(err) => {
                    warn!(start = run.start, pages = run.pages, ?err, "prefetch run failed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if fetched == 0 => Err(err),
            _ => Ok(fetched),
        }
    }

    /// Fetch `count` contiguous pages starting at `first` with a single
    /// backing read and persist them.
    async fn fetch_run(&self, first: usize, count: usize) -> Result<u64, Error> {
        let start = first as u64 * self.page_size;
        let end = ((first + count) as u64 * self.page_size).min(self.size);
        let want = (end - start) as usize;
        let buf = self.remote.read_at(start, want).await?;
        if buf.len() != want {
            return Err(Error::ShortRead {
                page: first,
                got: buf.len(),
                want,
            });
        }
        self.local.write_at(buf, start).await?;
        self.commit_pages(first, count, want as u64);
        self.maybe_flush().await;
        Ok(want as u64)
    }

    /// Fetch every missing page if the non-resident volume is at or below
    /// the completion threshold. Returns whether the cache is fully
    /// resident afterwards; `Ok(false)` means the threshold declined the
    /// pass.
    pub async fn try_complete(&self) -> Result<bool, Error> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(true);
        }
        if remaining > self.completion_threshold {
            debug!(remaining, "completion declined: too much outstanding");
            return Ok(false);
        }
        let mut from = 0;
        loop {
            let run = {
                let state = self.state.lock().unwrap();
                state.table.next_missing(from).map(|page| {
                    let (_, len) = state.table.run_at(page);
                    (page, len)
                })
            };
            let Some((page, len)) = run else { break };
            self.fetch_run(page, len).await?;
            from = page + len;
        }
        self.flush_status().await;
        Ok(true)
    }

    /// Flush the status file if enough has been written since the last
    /// flush.
    async fn maybe_flush(&self) {
        let due = self.state.lock().unwrap().dirty >= self.flush_threshold;
        if due {
            self.flush_status().await;
        }
    }

    /// Write the status file. Failure degrades to in-memory-only tracking:
    /// it is logged and the dirty counter reset, never surfaced.
    async fn flush_status(&self) {
        let _guard = self.status_io.lock().await;
        let buf = {
            let state = self.state.lock().unwrap();
            status::encode(self.size, self.page_size, &state.table)
        };
        match self.write_status(buf).await {
            Ok(()) => {
                self.metrics.status_syncs.inc();
            }
            Err(err) => warn!(?err, "status flush failed: continuing in memory"),
        }
        self.state.lock().unwrap().dirty = 0;
    }

    /// Write the encoded status through a temporary file so a torn write
    /// never replaces a valid status file.
    async fn write_status(&self, buf: Vec<u8>) -> Result<(), std::io::Error> {
        let mut tmp = self.status_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &self.status_path).await?;
        Ok(())
    }

    /// Drop all cached state: every page becomes non-resident, the local
    /// file is truncated, and the status file is removed.
    pub async fn clear(&self) -> Result<(), Error> {
        {
            let mut staging = self.staging.lock().await;
            staging.page = None;
            staging.buf.clear();
        }
        {
            let mut state = self.state.lock().unwrap();
            state.table.clear_all();
            state.wanted.clear();
            state.dirty = 0;
        }
        self.metrics.resident_pages.set(0);
        self.local.resize(0).await?;
        let _guard = self.status_io.lock().await;
        match tokio::fs::remove_file(&self.status_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Source(err.into())),
        }
    }

    /// End the session. Persists the status file, unless the cache is
    /// fully resident, in which case the status file is deleted (full
    /// residency is reconstructible from the file size alone).
    pub async fn close(self) -> Result<(), Error> {
        let (full, buf) = {
            let state = self.state.lock().unwrap();
            (
                state.table.is_full(),
                status::encode(self.size, self.page_size, &state.table),
            )
        };
        {
            let _guard = self.status_io.lock().await;
            if full {
                match tokio::fs::remove_file(&self.status_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::Source(err.into())),
                }
            } else {
                self.write_status(buf)
                    .await
                    .map_err(|err| Error::Source(err.into()))?;
                self.metrics.status_syncs.inc();
            }
        }
        self.local.close().await?;
        Ok(())
    }
}
