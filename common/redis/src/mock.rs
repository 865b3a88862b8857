use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::{Client, CustomRedisError, RedisErrorKind};

/// In-memory stand-in for Redis with real conditional-write and expiry semantics.
///
/// Clones share the same keyspace, so several clones can model replicas racing
/// against one store. Expiry is measured on the tokio clock, which lets tests
/// running with paused time expire keys through `tokio::time::advance`.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, MockEntry>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
    unavailable: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct MockEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    // Helper methods to safely lock the mutexes, a panicking test must not poison the rest
    fn lock_calls(&self) -> MutexGuard<'_, Vec<MockRedisCall>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, MockEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) {
        self.lock_calls().push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
    }

    fn check_available(&self) -> Result<(), CustomRedisError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CustomRedisError::from_redis_kind(
                RedisErrorKind::IoError,
                "Connection refused",
            ))
        } else {
            Ok(())
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    /// Stored keys keep expiring while the store is unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        self.lock_calls().clone()
    }

    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    /// Write a key directly, bypassing availability checks and the call log.
    pub fn seed(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.lock_entries().insert(
            key.to_owned(),
            MockEntry {
                value: value.to_owned(),
                expires_at,
            },
        );
    }

    /// Read a live key directly, bypassing availability checks and the call log.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.lock_entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of a live key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock_entries()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline - now)
    }
}

/// Redis-style glob matching supporting `*` and `?`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, c));
            p += 1;
        } else if let Some((star_p, star_c)) = backtrack {
            p = star_p + 1;
            c = star_c + 1;
            backtrack = Some((star_p, star_c + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None);
        self.check_available()?;

        self.peek(&key).ok_or(CustomRedisError::NotFound)
    }

    async fn set_nx_ex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "set_nx_ex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.lock_entries();
        if entries.get(&key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        entries.insert(
            key,
            MockEntry {
                value,
                expires_at: Some(now + Duration::from_secs(seconds)),
            },
        );
        Ok(true)
    }

    async fn set_xx_ex(
        &self,
        key: String,
        value: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.record(
            "set_xx_ex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.lock_entries();
        match entries.get_mut(&key) {
            Some(entry) if entry.is_live(now) => {
                entry.value = value;
                entry.expires_at = Some(now + Duration::from_secs(seconds));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None);
        self.check_available()?;

        self.lock_entries().remove(&key);
        Ok(())
    }

    async fn scan_match(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("scan_match", &pattern, MockRedisValue::String(pattern.clone()));
        self.check_available()?;

        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock_entries()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(&pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        Ok(keys)
    }
}
