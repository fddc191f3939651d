//! Response cache: short-lived keys used for duplicate detection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{LeadFlowError, Result};

/// Key marking a recently captured phone number.
pub fn phone_key(phone: &str) -> String {
    format!("lead:phone:{}", phone)
}

/// Key marking a recently captured email address.
pub fn email_key(email: &str) -> String {
    format!("lead:email:{}", email)
}

/// Key/value cache with per-entry TTL.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

/// In-process cache. Expired entries are dropped on read and swept on every write.
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| LeadFlowError::Cache("cache lock poisoned".to_string()))
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = InMemoryCache::new();
        cache
            .set(&phone_key("0501234567"), "1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set(&email_key("a@b.c"), "1", Duration::ZERO)
            .await
            .unwrap();

        assert!(cache.exists("lead:phone:0501234567").await.unwrap());
        assert!(!cache.exists("lead:email:a@b.c").await.unwrap());
        assert!(!cache.exists("lead:phone:unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_sweep_expired_entries() {
        let cache = InMemoryCache::new();
        for i in 0..1000 {
            cache
                .set(&phone_key(&format!("05{:08}", i)), "1", Duration::ZERO)
                .await
                .unwrap();
        }
        cache
            .set(&phone_key("0509999999"), "1", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.exists(&phone_key("0509999999")).await.unwrap());
    }
}
