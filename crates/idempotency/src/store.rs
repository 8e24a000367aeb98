use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use crate::IdempotencyKey;

/// Default retention; providers stop redelivering well before this.
pub const DEFAULT_TTL_DAYS: i64 = 30;

/// Outcome of the first successful processing, handed to every later caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<T> {
    pub result: T,
    pub first_seen_at: DateTime<Utc>,
}

/// Answer to [`IdempotencyStore::check_and_reserve`].
#[derive(Debug)]
pub enum Reservation<T: Clone + Send + Sync + 'static> {
    /// The caller owns the key and must run the side effect, then
    /// [`ReservationGuard::complete`] it. Dropping the guard releases the key.
    FirstTime(ReservationGuard<T>),
    /// Someone already processed the key.
    Cached(CachedResult<T>),
}

impl<T: Clone + Send + Sync + 'static> Reservation<T> {
    pub fn is_first_time(&self) -> bool {
        matches!(self, Reservation::FirstTime(_))
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    InFlight,
    Done(CachedResult<T>),
    Released,
}

#[derive(Debug)]
enum Entry<T> {
    Reserved {
        token: u64,
        tx: watch::Sender<Slot<T>>,
    },
    Completed {
        cached: CachedResult<T>,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Inner<T> {
    entries: Mutex<HashMap<IdempotencyKey, Entry<T>>>,
    ttl: Duration,
    next_token: AtomicU64,
}

impl<T> Inner<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<IdempotencyKey, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed record of operations that must be applied at most once.
///
/// `check_and_reserve` is an atomic check-and-set: for a given key exactly
/// one caller is told it is first. Callers racing with it wait until the
/// first caller completes and then all receive its result. If the first
/// caller gives up (its guard is dropped), one waiter is promoted instead.
///
/// Completed entries expire after the TTL. Expired entries are dropped
/// lazily when touched and in bulk by [`purge_expired`](Self::purge_expired).
#[derive(Debug)]
pub struct IdempotencyStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IdempotencyStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for IdempotencyStore<T> {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_TTL_DAYS))
    }
}

impl<T: Clone + Send + Sync + 'static> IdempotencyStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                ttl,
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Claims `key` or returns the result recorded for it, waiting for an
    /// in-flight first caller if necessary.
    pub async fn check_and_reserve(&self, key: &IdempotencyKey) -> Reservation<T> {
        loop {
            let mut rx = {
                let mut entries = self.inner.entries();
                let now = Utc::now();

                match entries.get(key) {
                    Some(Entry::Completed { cached, expires_at }) if *expires_at > now => {
                        metrics::counter!("idempotency_hits_total").increment(1);
                        tracing::debug!(%key, "idempotency hit");
                        return Reservation::Cached(cached.clone());
                    }
                    Some(Entry::Reserved { tx, .. }) => tx.subscribe(),
                    _ => {
                        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                        let (tx, _) = watch::channel(Slot::InFlight);
                        entries.insert(key.clone(), Entry::Reserved { token, tx });
                        metrics::counter!("idempotency_reservations_total").increment(1);
                        return Reservation::FirstTime(ReservationGuard {
                            inner: Arc::clone(&self.inner),
                            key: key.clone(),
                            token,
                            finished: false,
                        });
                    }
                }
            };

            tracing::debug!(%key, "waiting on in-flight reservation");
            loop {
                let slot = rx.borrow_and_update().clone();
                match slot {
                    Slot::Done(cached) => return Reservation::Cached(cached),
                    Slot::Released => break,
                    Slot::InFlight => {}
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Looks up a completed, unexpired result without reserving.
    pub fn get(&self, key: &IdempotencyKey) -> Option<CachedResult<T>> {
        let mut entries = self.inner.entries();
        match entries.get(key) {
            Some(Entry::Completed { cached, expires_at }) => {
                if *expires_at > Utc::now() {
                    Some(cached.clone())
                } else {
                    entries.remove(key);
                    None
                }
            }
            _ => None,
        }
    }

    /// Drops every expired completed entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.inner.entries();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Completed { expires_at, .. } => *expires_at > now,
            Entry::Reserved { .. } => true,
        });
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, "purged expired idempotency records");
        }
        purged
    }

    /// Number of entries, reserved or completed.
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of a reserved key.
#[derive(Debug)]
pub struct ReservationGuard<T> {
    inner: Arc<Inner<T>>,
    key: IdempotencyKey,
    token: u64,
    finished: bool,
}

impl<T: Clone> ReservationGuard<T> {
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Records the result and wakes every waiter with it.
    pub fn complete(mut self, result: T) -> CachedResult<T> {
        let cached = CachedResult {
            result,
            first_seen_at: Utc::now(),
        };
        let mut entries = self.inner.entries();
        if let Some(Entry::Reserved { token, tx }) = entries.get(&self.key)
            && *token == self.token
        {
            tx.send_replace(Slot::Done(cached.clone()));
        }
        entries.insert(
            self.key.clone(),
            Entry::Completed {
                cached: cached.clone(),
                expires_at: cached.first_seen_at + self.inner.ttl,
            },
        );
        drop(entries);
        self.finished = true;
        cached
    }

    /// Gives the key back so the operation can be attempted again.
    pub fn release(self) {}
}

impl<T> Drop for ReservationGuard<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut entries = self.inner.entries();
        if let Some(Entry::Reserved { token, tx }) = entries.get(&self.key)
            && *token == self.token
        {
            tx.send_replace(Slot::Released);
            entries.remove(&self.key);
            tracing::debug!(key = %self.key, "idempotency reservation released");
        }
    }
}
