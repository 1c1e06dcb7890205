use super::Error;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as MapMutex,
    },
    time::Duration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Opaque identity of a guarded object. Issued by the caller (or minted
/// with [LockRegistry::issue]); never derived from an address, so entries
/// cannot be confused by allocator reuse.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct LockId(u64);

impl From<u64> for LockId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// One registered lock: the object's mutex and the number of callers that
/// currently intend to hold it (holders plus waiters in flight).
struct Entry {
    mutex: Arc<Mutex<()>>,
    holds: AtomicUsize,
}

/// Holds a lock acquired through [LockRegistry::lock]. Dropping the guard
/// releases the lock and withdraws the hold.
pub struct Guard {
    id: LockId,
    entry: Arc<Entry>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Guard {
    /// Identity of the locked object.
    pub fn id(&self) -> LockId {
        self.id
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.entry.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A directory of per-object locks.
///
/// Acquisition is two-phase: the hold is recorded under the registry's own
/// short-held map lock, and only after that lock is released does the
/// caller block on the entry's mutex. Holding one object's lock therefore
/// never stalls registry operations on a different object.
pub struct LockRegistry {
    entries: MapMutex<HashMap<LockId, Arc<Entry>>>,
    next: AtomicU64,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            entries: MapMutex::new(HashMap::new()),
            next: AtomicU64::new(0),
        }
    }

    /// Mint a fresh [LockId], unique within this registry.
    pub fn issue(&self) -> LockId {
        LockId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of registered locks.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a lock for `id`. Fails with [Error::AlreadyExists] if one
    /// is already registered.
    pub fn register(&self, id: LockId) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(Error::AlreadyExists);
        }
        entries.insert(
            id,
            Arc::new(Entry {
                mutex: Arc::new(Mutex::new(())),
                holds: AtomicUsize::new(0),
            }),
        );
        Ok(())
    }

    /// Register a lock for `id` and acquire it before returning.
    pub fn register_held(&self, id: LockId) -> Result<Guard, Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(Error::AlreadyExists);
        }
        let mutex = Arc::new(Mutex::new(()));
        let permit = mutex
            .clone()
            .try_lock_owned()
            .expect("freshly created mutex is free");
        let entry = Arc::new(Entry {
            mutex,
            holds: AtomicUsize::new(1),
        });
        entries.insert(id, entry.clone());
        Ok(Guard {
            id,
            entry,
            permit: Some(permit),
        })
    }

    /// Acquire the lock registered for `id`, waiting up to `timeout`
    /// (`None` waits forever).
    pub async fn lock(&self, id: LockId, timeout: Option<Duration>) -> Result<Guard, Error> {
        // Phase one: record the intent to hold under the map lock. The
        // hold count is what keeps [LockRegistry::delete] from removing an
        // entry a waiter is still blocked on.
        let entry = {
            let entries = self.entries.lock().unwrap();
            let entry = entries.get(&id).ok_or(Error::NotFound)?.clone();
            entry.holds.fetch_add(1, Ordering::SeqCst);
            entry
        };

        // Phase two: block on the entry's own mutex with the map unlocked.
        let acquire = entry.mutex.clone().lock_owned();
        let permit = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    entry.holds.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::Timeout);
                }
            },
            None => acquire.await,
        };
        Ok(Guard {
            id,
            entry,
            permit: Some(permit),
        })
    }

    /// Remove the lock registered for `id`.
    ///
    /// The lock is acquired first (bounded by `timeout` per attempt), then
    /// removed only if no other caller has a hold in flight. Otherwise the
    /// lock is released and the attempt repeated after `retry_sleep`, up
    /// to `retries` extra times, to give in-flight holders a chance to
    /// finish. Exhausting the retries fails with [Error::Busy]; under
    /// sustained contention deletion may never win, which is the caller's
    /// signal to stop and reconsider, not grounds for retrying forever.
    pub async fn delete(
        &self,
        id: LockId,
        timeout: Option<Duration>,
        retries: usize,
        retry_sleep: Duration,
    ) -> Result<(), Error> {
        for attempt in 0..=retries {
            let guard = self.lock(id, timeout).await?;
            if self.try_remove(&guard) {
                return Ok(());
            }
            drop(guard);
            if attempt < retries {
                tokio::time::sleep(retry_sleep).await;
            }
        }
        Err(Error::Busy)
    }

    /// Remove the lock behind a guard the caller already holds. Falls back
    /// to the [LockRegistry::delete] retry loop (releasing the guard) when
    /// other holds are in flight.
    pub async fn delete_held(
        &self,
        guard: Guard,
        timeout: Option<Duration>,
        retries: usize,
        retry_sleep: Duration,
    ) -> Result<(), Error> {
        if self.try_remove(&guard) {
            return Ok(());
        }
        let id = guard.id;
        drop(guard);
        if retries == 0 {
            return Err(Error::Busy);
        }
        tokio::time::sleep(retry_sleep).await;
        self.delete(id, timeout, retries - 1, retry_sleep).await
    }

    /// Remove the entry behind `guard` if the guard is the only hold.
    /// Holds are only ever added under the map lock, so the check and the
    /// removal are atomic with respect to new waiters.
    fn try_remove(&self, guard: &Guard) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if guard.entry.holds.load(Ordering::SeqCst) == 1 {
            entries.remove(&guard.id);
            true
        } else {
            false
        }
    }
}
