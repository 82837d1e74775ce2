//! A set whose entries expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::InteractError;
use crate::events::EventBus;

#[cfg(test)]
#[path = "ttl_set.test.rs"]
mod tests;

type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Membership changes, published after the mutation that caused them.
#[derive(Debug, Clone, PartialEq)]
pub enum SetEvent<T> {
    /// Values inserted for the first time
    Appended(Vec<T>),
    /// Values evicted by a sweep
    Expired(Vec<T>),
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

/// Unordered collection of unique values, each with its own time to live.
///
/// Uniqueness is decided by an equality function rather than `Eq`/`Hash`, so callers
/// can key entries on part of a value. Every mutation and every read sweeps expired
/// entries first.
pub struct ExpiringSet<T> {
    ttl: Duration,
    equal: Equality<T>,
    entries: Mutex<Vec<Entry<T>>>,
    events: EventBus<SetEvent<T>>,
}

impl<T> std::fmt::Debug for ExpiringSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringSet")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<T> ExpiringSet<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Result<Self, InteractError>
    where
        T: PartialEq,
    {
        Self::with_equality(ttl, |a: &T, b: &T| a == b)
    }

    pub fn with_equality<F>(ttl: Duration, equal: F) -> Result<Self, InteractError>
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        if ttl.is_zero() {
            return Err(InteractError::InvalidArgument(
                "time to live must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            ttl,
            equal: Arc::new(equal),
            entries: Mutex::new(Vec::new()),
            events: EventBus::default(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Inserts `value`, or refreshes the lifetime of an equal entry.
    ///
    /// Returns `true` only for a new entry. The entry lives for `ttl`, or the set's
    /// default when `None` or zero.
    pub fn add(&self, value: T, ttl: Option<Duration>) -> bool {
        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(self.ttl);
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, now);

        let expires_at = now + ttl;
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| (self.equal)(&entry.value, &value))
        {
            entry.expires_at = expires_at;
            return false;
        }
        entries.push(Entry {
            value: value.clone(),
            expires_at,
        });
        self.events.publish(SetEvent::Appended(vec![value]));
        true
    }

    /// Evicts expired entries now.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, Instant::now());
    }

    fn sweep_locked(&self, entries: &mut Vec<Entry<T>>, now: Instant) {
        let mut expired = Vec::new();
        entries.retain(|entry| {
            if entry.expires_at <= now {
                expired.push(entry.value.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            tracing::trace!(count = expired.len(), "Evicted expired entries");
            self.events.publish(SetEvent::Expired(expired));
        }
    }

    /// Live values, in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, Instant::now());
        entries.iter().map(|entry| entry.value.clone()).collect()
    }

    pub fn contains(&self, value: &T) -> bool {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, Instant::now());
        entries.iter().any(|entry| (self.equal)(&entry.value, value))
    }

    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        self.sweep_locked(&mut entries, Instant::now());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SetEvent<T>> {
        self.events.subscribe()
    }
}
