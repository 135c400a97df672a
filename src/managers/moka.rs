use crate::{
    store::{CacheStore, StoreResult},
    Ttl,
};

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{future::Cache, Expiry};

/// Implements [`CacheStore`] with [`moka`](https://github.com/moka-rs/moka) as the backend.
///
/// An in-process store for local development and tests. Entries expire on
/// their own TTL, as they would in Redis.
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
#[derive(Clone)]
pub struct MokaStore {
    /// The instance of `moka::future::Cache`
    pub cache: Arc<Cache<String, Entry>>,
}

impl fmt::Debug for MokaStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaStore")
            .field("entries", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl Default for MokaStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// A stored payload together with its expiration.
#[derive(Debug, Clone)]
pub struct Entry {
    value: Arc<str>,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn remaining(&self, now: Instant) -> Option<Ttl> {
        match self.expires_at {
            None => Some(Ttl::Unbounded),
            Some(at) if at > now => {
                Some(Ttl::Seconds((at - now).as_secs()))
            }
            Some(_) => None,
        }
    }
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

impl MokaStore {
    /// Create a new store holding at most `max_capacity` entries
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self { cache: Arc::new(cache) }
    }

    /// Clears out the entire cache.
    pub async fn clear(&self) -> StoreResult<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn entry(&self, key: &str) -> Option<(Ttl, Entry)> {
        let entry = self.cache.get(key).await?;
        entry.remaining(Instant::now()).map(|ttl| (ttl, entry))
    }
}

#[async_trait::async_trait]
impl CacheStore for MokaStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entry(key).await.map(|(_, entry)| entry.value.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Ttl) -> StoreResult<()> {
        let ttl = ttl.for_store().as_duration();
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        let entry =
            Entry { value: value.into(), ttl: expires_at.and(ttl), expires_at };
        self.cache.insert(key.to_owned(), entry).await;
        self.cache.run_pending_tasks().await;
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>> {
        Ok(self.entry(key).await.map(|(ttl, _)| ttl))
    }

    async fn lookup(
        &self,
        key: &str,
    ) -> StoreResult<(Option<Ttl>, Option<String>)> {
        Ok(match self.entry(key).await {
            Some((ttl, entry)) => (Some(ttl), Some(entry.value.to_string())),
            None => (None, None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ONE_YEAR_IN_SECONDS;

    #[tokio::test]
    async fn set_get_and_ttl() -> StoreResult<()> {
        let store = MokaStore::default();
        assert_eq!(store.lookup("missing").await?, (None, None));

        store.set("bounded", "1".into(), Ttl::Seconds(60)).await?;
        store.set("forever", "2".into(), Ttl::Unbounded).await?;

        let (ttl, value) = store.lookup("bounded").await?;
        assert!(matches!(ttl, Some(Ttl::Seconds(59..=60))));
        assert_eq!(value.as_deref(), Some("1"));
        assert_eq!(store.ttl_remaining("forever").await?, Some(Ttl::Unbounded));
        assert_eq!(store.get("forever").await?.as_deref(), Some("2"));

        store.clear().await?;
        assert_eq!(store.get("forever").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn entries_expire() -> StoreResult<()> {
        let store = MokaStore::default();
        store.set("short", "x".into(), Ttl::Seconds(1)).await?;
        assert!(store.get("short").await?.is_some());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.lookup("short").await?, (None, None));
        Ok(())
    }

    #[tokio::test]
    async fn huge_ttls_do_not_overflow() -> StoreResult<()> {
        let store = MokaStore::default();
        store.set("huge", "x".into(), Ttl::Seconds(u64::MAX)).await?;
        assert_eq!(
            store.lookup("huge").await?,
            (Some(Ttl::Unbounded), Some("x".to_string()))
        );

        let two_years = 2 * ONE_YEAR_IN_SECONDS;
        store.set("long", "y".into(), Ttl::Seconds(two_years)).await?;
        let (ttl, _) = store.lookup("long").await?;
        assert!(
            matches!(ttl, Some(Ttl::Seconds(secs)) if secs + 1 >= two_years)
        );
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_replaces_ttl() -> StoreResult<()> {
        let store = MokaStore::default();
        store.set("k", "old".into(), Ttl::Seconds(1)).await?;
        store.set("k", "new".into(), Ttl::Unbounded).await?;
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            store.lookup("k").await?,
            (Some(Ttl::Unbounded), Some("new".to_string()))
        );
        Ok(())
    }
}
