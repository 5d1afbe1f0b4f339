//! Shared- and private-queue access.
//!
//! `QueueClient` is the trait boundary; `RedisQueueClient` is the real
//! implementation backed by the `redis` crate, and `InMemoryQueueClient`
//! is a test double. This mirrors the trait/real/in-memory duality used
//! elsewhere in this codebase for external collaborators.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Blocking queue + small key/value surface, scoped to exactly the Redis
/// commands this pipeline issues: `BRPOP`, `LPUSH`, `HGET`, `EXISTS`,
/// `DEL`. No other Redis feature is modeled.
pub trait QueueClient: Send + Sync {
    /// Block until `key` has an element, then pop and return it from the
    /// right end. A `None` return means the wait timed out without a
    /// poisoned connection; callers in this crate pass a zero timeout
    /// (block forever), matching `BRPOP key 0`.
    fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    fn lpush(&self, key: &str, value: &str) -> Result<()>;

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn del(&self, key: &str) -> Result<()>;
}

/// Real queue client backed by a Redis (or Redis-protocol-compatible)
/// server, via the `redis` crate's blocking `Connection`.
pub struct RedisQueueClient {
    client: redis::Client,
}

impl RedisQueueClient {
    pub fn connect(addr: &str) -> Result<Self> {
        let url = if addr.starts_with("redis://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };
        let client = redis::Client::open(url)
            .map_err(|e| anyhow!("failed to construct redis client for {}: {}", addr, e))?;
        Ok(Self { client })
    }

    fn connection(&self) -> Result<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| anyhow!("failed to connect to redis: {}", e))
    }
}

impl QueueClient for RedisQueueClient {
    fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        use redis::Commands;
        let mut conn = self.connection()?;
        let reply: Option<(String, String)> = conn
            .brpop(key, timeout.as_secs_f64())
            .map_err(|e| anyhow!("BRPOP {} failed: {}", key, e))?;
        Ok(reply.map(|(_, value)| value))
    }

    fn lpush(&self, key: &str, value: &str) -> Result<()> {
        use redis::Commands;
        let mut conn = self.connection()?;
        conn.lpush(key, value)
            .map_err(|e| anyhow!("LPUSH {} failed: {}", key, e))
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        use redis::Commands;
        let mut conn = self.connection()?;
        conn.hget(key, field)
            .map_err(|e| anyhow!("HGET {} {} failed: {}", key, field, e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        use redis::Commands;
        let mut conn = self.connection()?;
        conn.exists(key)
            .map_err(|e| anyhow!("EXISTS {} failed: {}", key, e))
    }

    fn del(&self, key: &str) -> Result<()> {
        use redis::Commands;
        let mut conn = self.connection()?;
        conn.del(key)
            .map_err(|e| anyhow!("DEL {} failed: {}", key, e))
    }
}

#[derive(Default)]
struct InMemoryState {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-memory queue double for tests: every list/hash lives in a single
/// process-local map guarded by a mutex, with a condvar to support
/// `brpop`'s blocking semantics without a real network round trip.
pub struct InMemoryQueueClient {
    state: Mutex<InMemoryState>,
    notify: Condvar,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryState::default()),
            notify: Condvar::new(),
        }
    }

    pub fn seed_hash(&self, key: &str, field: &str, value: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub fn push_shared(&self, key: &str, value: &str) {
        self.lpush(key, value).expect("in-memory lpush cannot fail");
    }
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueClient for InMemoryQueueClient {
    fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if let Some(list) = state.lists.get_mut(key) {
                if let Some(value) = list.pop_back() {
                    return Ok(Some(value));
                }
            }
            if timeout.is_zero() {
                // "block forever" in production; tests must push before
                // calling brpop, since there is no real wall-clock wait here.
                return Ok(None);
            }
            let (guard, result) = self
                .notify
                .wait_timeout(state, timeout)
                .expect("lock poisoned");
            state = guard;
            if result.timed_out() {
                return Ok(None);
            }
        }
    }

    fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.notify.notify_all();
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field))
            .cloned())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.lists.contains_key(key) || state.hashes.contains_key(key))
    }

    fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.lists.remove(key);
        state.hashes.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lpush_then_brpop_round_trips() {
        let client = InMemoryQueueClient::new();
        client.lpush("q", "job-1").unwrap();
        let popped = client.brpop("q", Duration::from_secs(0)).unwrap();
        assert_eq!(popped, Some("job-1".to_string()));
    }

    #[test]
    fn brpop_on_empty_nonblocking_queue_returns_none() {
        let client = InMemoryQueueClient::new();
        let popped = client.brpop("empty", Duration::from_secs(0)).unwrap();
        assert_eq!(popped, None);
    }

    #[test]
    fn hget_reads_seeded_field() {
        let client = InMemoryQueueClient::new();
        client.seed_hash("pid-1", "isAuth", "blob");
        assert_eq!(
            client.hget("pid-1", "isAuth").unwrap(),
            Some("blob".to_string())
        );
        assert_eq!(client.hget("pid-1", "other").unwrap(), None);
    }

    #[test]
    fn exists_and_del() {
        let client = InMemoryQueueClient::new();
        client.lpush("private:1", "x").unwrap();
        assert!(client.exists("private:1").unwrap());
        client.del("private:1").unwrap();
        assert!(!client.exists("private:1").unwrap());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let client = InMemoryQueueClient::new();
        client.lpush("q", "first").unwrap();
        client.lpush("q", "second").unwrap();
        assert_eq!(
            client.brpop("q", Duration::from_secs(0)).unwrap(),
            Some("first".to_string())
        );
        assert_eq!(
            client.brpop("q", Duration::from_secs(0)).unwrap(),
            Some("second".to_string())
        );
    }
}
