use std::fmt;

use crate::{error::BoxError, Ttl};

/// A `Result` typedef for store operations.
pub type StoreResult<T> = std::result::Result<T, BoxError>;

/// Outcome of the startup connection check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has been made.
    #[default]
    Uninitialized,
    /// The store answered.
    Connected,
    /// The store rejected the credentials.
    AuthError,
    /// The store could not be reached.
    ConnectionError,
}

impl ConnectionState {
    /// Whether caching is enabled.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Connected => write!(f, "connected"),
            Self::AuthError => write!(f, "authentication error"),
            Self::ConnectionError => write!(f, "connection error"),
        }
    }
}

/// A key-value store with per-entry expiration.
///
/// Implementations must be safe to share between concurrent requests.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Checks the connection once at startup.
    async fn connect(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    /// Reads a stored payload.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a payload, replacing any existing entry.
    async fn set(&self, key: &str, value: String, ttl: Ttl) -> StoreResult<()>;

    /// Remaining lifetime of an entry, `None` if the key is absent.
    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>>;

    /// Reads remaining lifetime and payload together.
    ///
    /// Backends that can should override this to answer in a single round
    /// trip, so the entry cannot expire between the two reads.
    async fn lookup(
        &self,
        key: &str,
    ) -> StoreResult<(Option<Ttl>, Option<String>)> {
        let ttl = self.ttl_remaining(key).await?;
        let value = self.get(key).await?;
        Ok((ttl, value))
    }
}

#[async_trait::async_trait]
impl<T: CacheStore + ?Sized> CacheStore for std::sync::Arc<T> {
    async fn connect(&self) -> ConnectionState {
        (**self).connect().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Ttl) -> StoreResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>> {
        (**self).ttl_remaining(key).await
    }

    async fn lookup(
        &self,
        key: &str,
    ) -> StoreResult<(Option<Ttl>, Option<String>)> {
        (**self).lookup(key).await
    }
}
