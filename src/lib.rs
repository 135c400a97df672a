#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A response caching interceptor for HTTP read endpoints.
//!
//! [`ResponseCache`] sits between an endpoint handler and its caller. For
//! every eligible request it derives a key from the handler's identity and
//! effective arguments, consults a key-value store with per-entry TTL
//! (Redis by default), and either serves the stored payload, answers a
//! conditional request with `304 Not Modified`, or runs the handler and
//! stores its result.
//!
//! - Deterministic keys: `prefix:module::handler(arg=value,...)`, leaving
//!   out request/response carriers and any configured argument types
//! - A JSON codec that also round-trips timestamps, dates and
//!   arbitrary-precision decimals
//! - `X-FastAPI-Cache`, `Cache-Control`, `Expires`, `ETag` and
//!   `Last-Modified` response headers
//! - `If-None-Match` evaluation against the stored payload
//! - Store and serialization failures never fail a request
//!
//! ## Basic Usage
//!
//! ```rust
//! use redis_response_cache::{
//!     ArgType, Arguments, CacheOptions, Endpoint, Expire, MokaStore,
//!     Operation, Outcome, ResponseCache, Value,
//! };
//!
//! # tokio_test_block_on(async {
//! let cache =
//!     ResponseCache::connect(MokaStore::default(), CacheOptions::default())
//!         .await;
//!
//! let endpoint = Endpoint::new(
//!     Operation::new("app::users::get_user")
//!         .param("request", ArgType::REQUEST)
//!         .param("user_id", ArgType::named("i64")),
//! )
//! .expire(Expire::one_hour());
//!
//! let (parts, ()) = http::Request::get("/users/42").body(()).unwrap().into_parts();
//! let args = || Arguments::new().arg(Value::Null).arg(42);
//! let handler = || async {
//!     Ok::<_, std::io::Error>(Value::object([("id", 42)]))
//! };
//!
//! let first = cache.intercept(&endpoint, &parts, args(), handler).await.unwrap();
//! assert_eq!(first.outcome, Outcome::Miss);
//! let second = cache.intercept(&endpoint, &parts, args(), handler).await.unwrap();
//! assert_eq!(second.outcome, Outcome::Hit);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! ## Features
//!
//! The following features are available. By default `manager-redis` and
//! `manager-moka` are enabled.
//!
//! - `manager-redis` (default): enable [redis](https://github.com/redis-rs/redis-rs),
//! a remote key-value store, backend.
//! - `manager-moka` (default): enable [moka](https://github.com/moka-rs/moka),
//! an in-memory cache, backend.
pub mod codec;
pub mod conditional;
mod error;
pub mod headers;
pub mod key;
mod managers;
mod store;
pub mod ttl;
mod value;

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::{
    header::{CACHE_CONTROL, CONTENT_TYPE},
    request, response, HeaderMap, HeaderName, HeaderValue, Method, Response,
    StatusCode,
};

pub use error::{
    BindingError, BoxError, CacheError, Result, SerializationError,
};
pub use headers::{HitOrMiss, DEFAULT_RESPONSE_HEADER};
pub use key::{
    build_key, ArgType, Arguments, BoundArguments, ExcludedTypes, KeyBuilder,
    Operation, Param,
};
pub use store::{CacheStore, ConnectionState, StoreResult};
pub use ttl::{Expire, Ttl, MAX_STORE_TTL_IN_SECONDS, ONE_YEAR_IN_SECONDS};
pub use value::{Map, Opaque, Value};

#[cfg(feature = "manager-moka")]
pub use managers::moka::MokaStore;

#[cfg(feature = "manager-redis")]
pub use managers::redis::RedisStore;

use conditional::is_not_modified;
use headers::apply_headers;

/// Media type of encoded payloads.
pub const APPLICATION_JSON: &str = "application/json";

/// Configuration options for a [`ResponseCache`].
///
/// ```rust
/// use redis_response_cache::{ArgType, CacheOptions};
/// use http::Method;
///
/// let options = CacheOptions {
///     prefix: Some("myapi-cache".into()),
///     ignore_arg_types: vec![ArgType::named("Session")],
///     allow_request_types: vec![Method::GET, Method::HEAD],
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Namespace prepended to every key, followed by `:`.
    pub prefix: Option<String>,
    /// Name of the cache-status header.
    pub response_header: HeaderName,
    /// Argument types left out of keys in addition to the request and
    /// response carriers.
    pub ignore_arg_types: Vec<ArgType>,
    /// Request methods eligible for caching.
    pub allow_request_types: Vec<Method>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            response_header: HeaderName::from_static(DEFAULT_RESPONSE_HEADER),
            ignore_arg_types: Vec::new(),
            allow_request_types: vec![Method::GET],
        }
    }
}

/// Per-endpoint configuration: the handler's signature and its expiration.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    /// Identity and parameters of the wrapped handler
    pub operation: Operation,
    /// How long stored responses live
    pub expire: Expire,
}

impl Endpoint {
    /// An endpoint whose responses never expire.
    pub fn new(operation: Operation) -> Self {
        Self { operation, expire: Expire::never() }
    }

    /// Sets the expiration.
    pub fn expire(mut self, expire: impl Into<Expire>) -> Self {
        self.expire = expire.into();
        self
    }
}

/// Cache performance metrics.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Requests answered from the store with a body.
    pub hits: AtomicU64,
    /// Requests answered with `304 Not Modified`.
    pub not_modified: AtomicU64,
    /// Eligible requests that ran the handler.
    pub misses: AtomicU64,
    /// Payloads written to the store.
    pub stores: AtomicU64,
    /// Requests that bypassed caching or could not be stored.
    pub skipped: AtomicU64,
}

impl CacheMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of lookups served from the store, 304s included (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed)
            + self.not_modified.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.not_modified.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Caching did not apply: store not connected, method not allowed, or
    /// the request asked for `no-store`/`no-cache`.
    Bypass,
    /// Served from the store.
    Hit,
    /// The conditional request matched the stored payload.
    NotModified,
    /// The handler ran and its result was stored.
    Miss,
    /// The handler ran but its result could not be stored.
    Uncached,
}

impl Outcome {
    /// The cache-status reported for this outcome, if any.
    pub fn hit_or_miss(self) -> Option<HitOrMiss> {
        match self {
            Outcome::Hit | Outcome::NotModified => Some(HitOrMiss::Hit),
            Outcome::Miss => Some(HitOrMiss::Miss),
            Outcome::Bypass | Outcome::Uncached => None,
        }
    }
}

/// The body produced by [`ResponseCache::intercept`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No body (`304 Not Modified`).
    Empty,
    /// The stored encoding, with its decoded value.
    Stored {
        /// Bytes exactly as read from the store
        raw: String,
        /// The decoded payload
        value: Value,
    },
    /// A freshly computed handler result.
    Fresh {
        /// The handler's return value
        value: Value,
        /// Its encoding, when one was produced
        encoded: Option<String>,
    },
}

/// The result of intercepting one request.
#[derive(Debug)]
pub struct Intercepted {
    /// How the request was handled
    pub outcome: Outcome,
    /// `200 OK`, or `304 Not Modified`
    pub status: StatusCode,
    /// Cache headers to send; empty unless the outcome has a cache-status
    pub headers: HeaderMap,
    /// The response body
    pub payload: Payload,
}

impl Intercepted {
    fn uncached(outcome: Outcome, value: Value, encoded: Option<String>) -> Self {
        Self {
            outcome,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            payload: Payload::Fresh { value, encoded },
        }
    }

    /// The payload as a value. `None` for `304 Not Modified`.
    pub fn into_value(self) -> Option<Value> {
        match self.payload {
            Payload::Empty => None,
            Payload::Stored { value, .. } | Payload::Fresh { value, .. } => {
                Some(value)
            }
        }
    }

    /// Applies status and headers to a caller-supplied response and returns
    /// the payload.
    pub fn respond_with(self, parts: &mut response::Parts) -> Option<Value> {
        if self.status != StatusCode::OK {
            parts.status = self.status;
        }
        for (name, value) in &self.headers {
            parts.headers.insert(name.clone(), value.clone());
        }
        self.into_value()
    }

    /// Builds a new response. Stored payloads are sent as read from the
    /// store, without re-encoding.
    ///
    /// Fails only for a fresh payload the codec cannot encode. Every
    /// response, `304 Not Modified` included, is labelled as JSON.
    pub fn into_response(self) -> Result<Response<Bytes>> {
        let body = match self.payload {
            Payload::Empty => Bytes::new(),
            Payload::Stored { raw, .. } => Bytes::from(raw),
            Payload::Fresh { encoded: Some(encoded), .. } => {
                Bytes::from(encoded)
            }
            Payload::Fresh { value, encoded: None } => {
                Bytes::from(codec::encode(&value)?)
            }
        };
        let mut response = Response::builder().status(self.status).body(body)?;
        *response.headers_mut() = self.headers;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        Ok(response)
    }
}

/// Checks whether a `Cache-Control` value carries `directive`.
fn has_directive(cache_control: &str, directive: &str) -> bool {
    cache_control.split(',').map(str::trim).any(|d| {
        let name = d.split('=').next().unwrap_or_default().trim();
        name.eq_ignore_ascii_case(directive)
    })
}

/// Caches endpoint responses in a [`CacheStore`].
///
/// One instance serves any number of concurrent requests; it holds no
/// state besides its configuration, the injected store handle and
/// metrics.
pub struct ResponseCache<S: CacheStore> {
    store: S,
    options: CacheOptions,
    keys: KeyBuilder,
    state: ConnectionState,
    metrics: Arc<CacheMetrics>,
}

impl<S: CacheStore> fmt::Debug for ResponseCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "manager-redis")]
impl ResponseCache<RedisStore> {
    /// Opens a [`RedisStore`] for `url` and runs the connection check.
    ///
    /// Only a malformed URL is an error; an unreachable server or rejected
    /// credentials leave caching disabled.
    pub async fn from_redis_url(url: &str, options: CacheOptions) -> Result<Self> {
        let store =
            RedisStore::open(url).map_err(|e| CacheError::Store(Box::new(e)))?;
        Ok(Self::connect(store, options).await)
    }
}

impl<S: CacheStore> ResponseCache<S> {
    /// Checks the store connection and builds the cache.
    ///
    /// When the store is unreachable every request passes through uncached
    /// for the lifetime of this instance.
    pub async fn connect(store: S, options: CacheOptions) -> Self {
        log::info!("CONNECT_BEGIN: attempting to connect to cache store");
        let state = store.connect().await;
        match state {
            ConnectionState::Connected => {
                log::info!("CONNECT_SUCCESS: cache store is connected")
            }
            ConnectionState::AuthError => log::warn!(
                "CONNECT_FAIL: unable to connect to cache store due to authentication error, caching is disabled"
            ),
            ConnectionState::ConnectionError
            | ConnectionState::Uninitialized => log::warn!(
                "CONNECT_FAIL: cache store did not respond, caching is disabled"
            ),
        }
        Self::with_state(store, options, state)
    }

    /// Builds the cache with a known connection state, skipping the check.
    pub fn with_state(
        store: S,
        options: CacheOptions,
        state: ConnectionState,
    ) -> Self {
        let keys = KeyBuilder::new(
            options.prefix.clone(),
            ExcludedTypes::new(options.ignore_arg_types.iter().cloned()),
        );
        Self {
            store,
            options,
            keys,
            state,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration in use.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Result of the startup connection check.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get a reference to the cache metrics.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Whether a request may be served from or written to the store.
    pub fn is_cacheable(&self, request: &request::Parts) -> bool {
        self.options.allow_request_types.contains(&request.method)
            && !request
                .headers
                .get_all(CACHE_CONTROL)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|cc| {
                    has_directive(cc, "no-store") || has_directive(cc, "no-cache")
                })
    }

    /// Derives the store key for a call.
    pub fn cache_key(
        &self,
        endpoint: &Endpoint,
        args: Arguments,
    ) -> std::result::Result<String, BindingError> {
        self.keys.build(&endpoint.operation, args)
    }

    /// Serves a request from the store or through `handler`.
    ///
    /// `args` are the handler's call arguments, bound against
    /// `endpoint.operation` to derive the key. The handler runs at most
    /// once, and its result is returned whether or not it could be stored.
    /// Errors are limited to argument binding failures and handler
    /// failures.
    pub async fn intercept<F, Fut, E>(
        &self,
        endpoint: &Endpoint,
        request: &request::Parts,
        args: Arguments,
        handler: F,
    ) -> Result<Intercepted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: Into<BoxError>,
    {
        if !self.state.is_connected() || !self.is_cacheable(request) {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            let value = run_handler(handler).await?;
            return Ok(Intercepted::uncached(Outcome::Bypass, value, None));
        }

        let key = self.cache_key(endpoint, args)?;

        if let Some((ttl, raw, value)) = self.check_cache(&key).await {
            let mut headers = HeaderMap::new();
            apply_headers(
                &mut headers,
                &self.options.response_header,
                HitOrMiss::Hit,
                &raw,
                &value,
                ttl,
            )?;
            if is_not_modified(&request.headers, &raw) {
                self.metrics.not_modified.fetch_add(1, Ordering::Relaxed);
                return Ok(Intercepted {
                    outcome: Outcome::NotModified,
                    status: StatusCode::NOT_MODIFIED,
                    headers,
                    payload: Payload::Empty,
                });
            }
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Intercepted {
                outcome: Outcome::Hit,
                status: StatusCode::OK,
                headers,
                payload: Payload::Stored { raw, value },
            });
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        let value = run_handler(handler).await?;
        let ttl = endpoint.expire.resolve();

        let encoded = match codec::encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("FAILED_TO_CACHE_KEY: key={key}: {e}");
                self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(Intercepted::uncached(Outcome::Uncached, value, None));
            }
        };

        if let Err(e) = self.store.set(&key, encoded.clone(), ttl).await {
            log::warn!("FAILED_TO_CACHE_KEY: key={key}: {e}");
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(Intercepted::uncached(
                Outcome::Uncached,
                value,
                Some(encoded),
            ));
        }
        log::info!("KEY_ADDED_TO_CACHE: key={key}, ttl={ttl}");
        self.metrics.stores.fetch_add(1, Ordering::Relaxed);

        let mut headers = HeaderMap::new();
        apply_headers(
            &mut headers,
            &self.options.response_header,
            HitOrMiss::Miss,
            &encoded,
            &value,
            ttl,
        )?;
        Ok(Intercepted {
            outcome: Outcome::Miss,
            status: StatusCode::OK,
            headers,
            payload: Payload::Fresh { value, encoded: Some(encoded) },
        })
    }

    /// Reads remaining TTL and payload in one lookup. Read and decode
    /// failures count as a miss.
    async fn check_cache(&self, key: &str) -> Option<(Ttl, String, Value)> {
        let (ttl, raw) = match self.store.lookup(key).await {
            Ok((ttl, Some(raw))) => (ttl, raw),
            Ok((_, None)) => return None,
            Err(e) => {
                log::warn!("failed to read key={key} from cache store: {e}");
                return None;
            }
        };
        match codec::decode(&raw) {
            Ok(value) => {
                log::info!("KEY_FOUND_IN_CACHE: key={key}");
                Some((ttl.unwrap_or(Ttl::Seconds(0)), raw, value))
            }
            Err(e) => {
                log::warn!("discarding undecodable entry for key={key}: {e}");
                None
            }
        }
    }
}

async fn run_handler<F, Fut, E>(handler: F) -> Result<Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<Value, E>>,
    E: Into<BoxError>,
{
    handler().await.map_err(|e| CacheError::Handler(e.into()))
}
