use crate::{
    store::{CacheStore, ConnectionState, StoreResult},
    Ttl,
};

use std::{fmt, sync::Arc};

use redis::{
    aio::MultiplexedConnection, AsyncCommands, Client, ErrorKind, RedisError,
};
use tokio::sync::OnceCell;

/// Implements [`CacheStore`] with [`redis`](https://github.com/redis-rs/redis-rs) as the backend.
///
/// All clones share one multiplexed connection, opened on first use.
///
/// ```no_run
/// use redis_response_cache::{CacheStore, RedisStore};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisStore::open("redis://127.0.0.1:6379")?;
/// assert!(store.connect().await.is_connected());
/// # Ok(())
/// # }
/// ```
#[cfg_attr(docsrs, doc(cfg(feature = "manager-redis")))]
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: Arc<OnceCell<MultiplexedConnection>>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Creates a store for a `redis://` URL. No connection is made yet.
    pub fn open(url: &str) -> Result<Self, RedisError> {
        Ok(Self::from_client(Client::open(url)?))
    }

    /// Creates a store from a pre-configured client.
    pub fn from_client(client: Client) -> Self {
        Self { client, connection: Arc::new(OnceCell::new()) }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        self.connection
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()
    }

    async fn ping(&self) -> Result<(), RedisError> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Maps a `TTL` reply: `-2` is a missing key, `-1` a key without expiration.
pub(crate) fn ttl_from_reply(reply: i64) -> Option<Ttl> {
    match reply {
        -1 => Some(Ttl::Unbounded),
        secs if secs >= 0 => Some(Ttl::Seconds(secs.unsigned_abs())),
        _ => None,
    }
}

fn is_auth_error(error: &RedisError) -> bool {
    error.kind() == ErrorKind::AuthenticationFailed
        || matches!(error.code(), Some("NOAUTH" | "WRONGPASS"))
}

#[async_trait::async_trait]
impl CacheStore for RedisStore {
    async fn connect(&self) -> ConnectionState {
        match self.ping().await {
            Ok(()) => ConnectionState::Connected,
            Err(e) if is_auth_error(&e) => {
                log::debug!("redis authentication failed: {e}");
                ConnectionState::AuthError
            }
            Err(e) => {
                log::debug!("redis connection failed: {e}");
                ConnectionState::ConnectionError
            }
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Ttl) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        match ttl.for_store() {
            Ttl::Seconds(secs) => {
                conn.set_ex::<_, _, ()>(key, value, secs).await?
            }
            Ttl::Unbounded => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>> {
        let mut conn = self.connection().await?;
        let reply: i64 = conn.ttl(key).await?;
        Ok(ttl_from_reply(reply))
    }

    async fn lookup(
        &self,
        key: &str,
    ) -> StoreResult<(Option<Ttl>, Option<String>)> {
        let mut conn = self.connection().await?;
        let (ttl, value): (i64, Option<String>) = redis::pipe()
            .atomic()
            .cmd("TTL")
            .arg(key)
            .cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok((ttl_from_reply(ttl), value))
    }
}
