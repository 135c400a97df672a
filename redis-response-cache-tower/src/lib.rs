//! Tower middleware for [`redis_response_cache`].
//!
//! [`ResponseCacheLayer`] wraps one endpoint. The wrapped service is the
//! endpoint handler: it receives the request and returns the payload as a
//! [`Value`]. The layer derives the cache key from the endpoint's declared
//! parameters, serves hits and `304 Not Modified` answers from the store,
//! and encodes fresh payloads as JSON.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use http::Request;
//! use redis_response_cache::{
//!     ArgType, CacheOptions, Endpoint, Expire, Operation, ResponseCache, Value,
//! };
//! use redis_response_cache_tower::ResponseCacheLayer;
//! use tower::{Layer, Service, ServiceExt};
//! # use redis_response_cache::{CacheStore, StoreResult, Ttl};
//! # use std::collections::HashMap;
//! # use std::sync::Mutex;
//! #
//! # #[derive(Default)]
//! # struct MemoryStore(Mutex<HashMap<String, String>>);
//! #
//! # #[async_trait::async_trait]
//! # impl CacheStore for MemoryStore {
//! #     async fn get(&self, key: &str) -> StoreResult<Option<String>> {
//! #         Ok(self.0.lock().unwrap().get(key).cloned())
//! #     }
//! #     async fn set(&self, key: &str, value: String, _ttl: Ttl) -> StoreResult<()> {
//! #         self.0.lock().unwrap().insert(key.to_owned(), value);
//! #         Ok(())
//! #     }
//! #     async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>> {
//! #         Ok(self.0.lock().unwrap().get(key).map(|_| Ttl::Unbounded))
//! #     }
//! # }
//!
//! # tokio_test_block_on(async {
//! let cache = Arc::new(
//!     ResponseCache::connect(MemoryStore::default(), CacheOptions::default())
//!         .await,
//! );
//! let endpoint = Endpoint::new(
//!     Operation::new("app::items::list").param("page", ArgType::named("u32")),
//! )
//! .expire(Expire::one_minute());
//!
//! let layer = ResponseCacheLayer::new(cache, endpoint);
//! let mut service = layer.layer(tower::service_fn(|_req: Request<()>| async {
//!     Ok::<_, std::io::Error>(Value::from(vec!["a", "b"]))
//! }));
//!
//! let req = Request::get("/items?page=1").body(()).unwrap();
//! let res = service.ready().await.unwrap().call(req).await.unwrap();
//! assert_eq!(res.headers()["x-fastapi-cache"], "Miss");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! # Shared cache
//!
//! Entries are shared by every caller whose arguments render the same key.
//! Endpoints returning user-specific data must declare the user or session
//! identifier as a parameter, or use [`CustomArguments`] to supply it.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_TYPE},
    request, Request, Response,
};
use http_body::{Body as HttpBody, Frame};
use redis_response_cache::{
    codec, ArgType, Arguments, BoxError, CacheMetrics, CacheStore, Endpoint,
    Intercepted, Operation, Outcome, Payload, ResponseCache, Value,
    APPLICATION_JSON,
};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Supplies the call arguments of an endpoint from an incoming request.
pub trait ArgumentSource: Clone + Send + Sync + 'static {
    /// Collect the arguments for `operation` from the request head.
    fn arguments(
        &self,
        operation: &Operation,
        request: &request::Parts,
    ) -> Arguments;
}

/// Binds request and response carrier parameters to `null`.
fn carriers(operation: &Operation) -> Arguments {
    operation
        .params()
        .iter()
        .filter(|p| p.ty == ArgType::REQUEST || p.ty == ArgType::RESPONSE)
        .fold(Arguments::new(), |args, p| args.named(p.name.clone(), Value::Null))
}

/// Binds declared parameters from the query string.
///
/// Query pairs whose name is not a declared parameter are ignored; when a
/// name repeats, the first occurrence wins. Values stay strings.
///
/// ```
/// # use http::Request;
/// # use redis_response_cache::{ArgType, KeyBuilder, Operation};
/// # use redis_response_cache_tower::{ArgumentSource, QueryArguments};
/// let op = Operation::new("app::items::list")
///     .param("page", ArgType::named("u32"))
///     .param_with_default("sort", ArgType::named("String"), "asc");
/// let (parts, ()) = Request::get("/items?page=2&utm=x").body(()).unwrap().into_parts();
/// let args = QueryArguments.arguments(&op, &parts);
/// let key = KeyBuilder::default().build(&op, args).unwrap();
/// assert_eq!(key, "app::items::list(page=2,sort=asc)");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryArguments;

impl ArgumentSource for QueryArguments {
    fn arguments(
        &self,
        operation: &Operation,
        request: &request::Parts,
    ) -> Arguments {
        let query = request.uri.query().unwrap_or_default();
        let mut seen = Vec::new();
        let mut args = carriers(operation);
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let declared = operation.params().iter().any(|p| {
                p.name == name
                    && p.ty != ArgType::REQUEST
                    && p.ty != ArgType::RESPONSE
            });
            if declared && !seen.contains(&name) {
                args = args.named(name.clone(), value.into_owned());
                seen.push(name);
            }
        }
        args
    }
}

/// Binds only request and response carriers.
///
/// For endpoints whose responses do not depend on the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArguments;

impl ArgumentSource for NoArguments {
    fn arguments(&self, operation: &Operation, _: &request::Parts) -> Arguments {
        carriers(operation)
    }
}

/// Argument source backed by a user-provided function.
///
/// Use this when arguments come from path parameters, headers or request
/// extensions.
///
/// ```
/// # use http::Request;
/// # use redis_response_cache::{ArgType, Arguments, KeyBuilder, Operation};
/// # use redis_response_cache_tower::{ArgumentSource, CustomArguments};
/// let source = CustomArguments::new(|_op: &Operation, req: &http::request::Parts| {
///     let user = req
///         .headers
///         .get("x-user-id")
///         .and_then(|v| v.to_str().ok())
///         .unwrap_or("anonymous")
///         .to_owned();
///     Arguments::new().named("user", user)
/// });
/// let op = Operation::new("app::me").param("user", ArgType::named("String"));
/// let (parts, ()) = Request::get("/me").header("x-user-id", "7").body(()).unwrap().into_parts();
/// let key = KeyBuilder::default().build(&op, source.arguments(&op, &parts)).unwrap();
/// assert_eq!(key, "app::me(user=7)");
/// ```
#[derive(Clone)]
pub struct CustomArguments<F> {
    func: F,
}

impl<F> CustomArguments<F> {
    /// Create a new argument source with the given function.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for CustomArguments<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomArguments").finish_non_exhaustive()
    }
}

impl<F> ArgumentSource for CustomArguments<F>
where
    F: Fn(&Operation, &request::Parts) -> Arguments
        + Clone
        + Send
        + Sync
        + 'static,
{
    fn arguments(
        &self,
        operation: &Operation,
        request: &request::Parts,
    ) -> Arguments {
        (self.func)(operation, request)
    }
}

/// Response body types.
#[derive(Debug)]
pub enum ResponseBody {
    /// Served from the store.
    Cached(Bytes),
    /// Freshly computed and stored.
    Fresh(Bytes),
    /// Computed but not stored.
    Uncacheable(Bytes),
}

impl ResponseBody {
    fn bytes(&self) -> &Bytes {
        match self {
            ResponseBody::Cached(b)
            | ResponseBody::Fresh(b)
            | ResponseBody::Uncacheable(b) => b,
        }
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let bytes = match &mut *self {
            ResponseBody::Cached(b)
            | ResponseBody::Fresh(b)
            | ResponseBody::Uncacheable(b) => {
                std::mem::replace(b, Bytes::new())
            }
        };

        if bytes.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Frame::data(bytes))))
        }
    }

    fn is_end_stream(&self) -> bool {
        self.bytes().is_empty()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::SizeHint::with_exact(self.bytes().len() as u64)
    }
}

/// Tower layer caching one endpoint's responses.
///
/// Several layers may share one [`ResponseCache`]; each carries its own
/// [`Endpoint`] description.
pub struct ResponseCacheLayer<S, A = QueryArguments>
where
    S: CacheStore,
    A: ArgumentSource,
{
    cache: Arc<ResponseCache<S>>,
    endpoint: Arc<Endpoint>,
    arguments: A,
}

impl<S, A> Clone for ResponseCacheLayer<S, A>
where
    S: CacheStore,
    A: ArgumentSource,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            endpoint: self.endpoint.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

impl<S, A> fmt::Debug for ResponseCacheLayer<S, A>
where
    S: CacheStore,
    A: ArgumentSource + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacheLayer")
            .field("endpoint", &self.endpoint.operation.name())
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

impl<S> ResponseCacheLayer<S, QueryArguments>
where
    S: CacheStore,
{
    /// Create a layer reading arguments from the query string.
    pub fn new(cache: Arc<ResponseCache<S>>, endpoint: Endpoint) -> Self {
        Self::with_arguments(cache, endpoint, QueryArguments)
    }
}

impl<S, A> ResponseCacheLayer<S, A>
where
    S: CacheStore,
    A: ArgumentSource,
{
    /// Create a layer with a custom argument source.
    pub fn with_arguments(
        cache: Arc<ResponseCache<S>>,
        endpoint: Endpoint,
        arguments: A,
    ) -> Self {
        Self { cache, endpoint: Arc::new(endpoint), arguments }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<ResponseCache<S>> {
        &self.cache
    }

    /// Get a reference to the cache metrics.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        self.cache.metrics()
    }
}

impl<Svc, S, A> Layer<Svc> for ResponseCacheLayer<S, A>
where
    S: CacheStore,
    A: ArgumentSource,
{
    type Service = ResponseCacheService<Svc, S, A>;

    fn layer(&self, inner: Svc) -> Self::Service {
        ResponseCacheService {
            inner,
            cache: self.cache.clone(),
            endpoint: self.endpoint.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Tower service that implements response caching.
pub struct ResponseCacheService<Svc, S, A>
where
    S: CacheStore,
    A: ArgumentSource,
{
    inner: Svc,
    cache: Arc<ResponseCache<S>>,
    endpoint: Arc<Endpoint>,
    arguments: A,
}

impl<Svc, S, A> Clone for ResponseCacheService<Svc, S, A>
where
    Svc: Clone,
    S: CacheStore,
    A: ArgumentSource,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cache: self.cache.clone(),
            endpoint: self.endpoint.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

impl<Svc, S, A> fmt::Debug for ResponseCacheService<Svc, S, A>
where
    S: CacheStore,
    A: ArgumentSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCacheService")
            .field("endpoint", &self.endpoint.operation.name())
            .finish_non_exhaustive()
    }
}

impl<Svc, ReqBody, S, A> Service<Request<ReqBody>>
    for ResponseCacheService<Svc, S, A>
where
    Svc: Service<Request<ReqBody>, Response = Value> + Clone + Send + 'static,
    Svc::Error: Into<BoxError>,
    Svc::Future: Send + 'static,
    S: CacheStore,
    A: ArgumentSource,
    ReqBody: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = BoxError;
    type Future = Pin<
        Box<
            dyn std::future::Future<
                    Output = std::result::Result<Self::Response, Self::Error>,
                > + Send,
        >,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let cache = self.cache.clone();
        let endpoint = self.endpoint.clone();
        let arguments = self.arguments.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let args = arguments.arguments(&endpoint.operation, &parts);
            let handler_parts = parts.clone();

            let intercepted = cache
                .intercept(&endpoint, &parts, args, move || {
                    inner.call(Request::from_parts(handler_parts, body))
                })
                .await
                .map_err(|e| Box::new(e) as BoxError)?;

            log::debug!(
                "{} {}: {:?}",
                endpoint.operation.name(),
                parts.uri,
                intercepted.outcome
            );
            into_response(intercepted).map_err(|e| Box::new(e) as BoxError)
        })
    }
}

/// Converts an interception result into a response.
///
/// Responses are labelled as JSON, `304 Not Modified` included. A fresh
/// payload the codec cannot represent is passed on as a [`Value`] response
/// extension with an empty body and no content type.
fn into_response(
    intercepted: Intercepted,
) -> std::result::Result<Response<ResponseBody>, http::Error> {
    let Intercepted { outcome, status, headers, payload } = intercepted;
    let mut extension = None;
    let body = match payload {
        Payload::Empty => ResponseBody::Cached(Bytes::new()),
        Payload::Stored { raw, .. } => ResponseBody::Cached(Bytes::from(raw)),
        Payload::Fresh { value, encoded } => {
            let encoded = match encoded {
                Some(encoded) => Some(encoded),
                None => match codec::encode(&value) {
                    Ok(encoded) => Some(encoded),
                    Err(e) => {
                        log::warn!("response payload is not serializable: {e}");
                        extension = Some(value);
                        None
                    }
                },
            };
            let bytes = encoded.map(Bytes::from).unwrap_or_default();
            match outcome {
                Outcome::Miss => ResponseBody::Fresh(bytes),
                _ => ResponseBody::Uncacheable(bytes),
            }
        }
    };

    let has_json = extension.is_none();
    let mut response = Response::builder().status(status).body(body)?;
    *response.headers_mut() = headers;
    if has_json {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    }
    if let Some(value) = extension {
        response.extensions_mut().insert(value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_response_cache::KeyBuilder;

    fn parts(uri: &str) -> request::Parts {
        Request::get(uri).body(()).unwrap().into_parts().0
    }

    fn list_items() -> Operation {
        Operation::new("app::items::list")
            .param("request", ArgType::REQUEST)
            .param("page", ArgType::named("u32"))
            .param_with_default("q", ArgType::named("String"), "")
    }

    #[test]
    fn query_arguments_bind_declared_params() {
        let op = list_items();
        let args = QueryArguments
            .arguments(&op, &parts("/items?q=red%20shoes&page=3&page=4&x=1"));
        let key = KeyBuilder::default().build(&op, args).unwrap();
        assert_eq!(key, "app::items::list(page=3,q=red shoes)");
    }

    #[test]
    fn query_arguments_cannot_bind_carriers() {
        let op = list_items();
        let args =
            QueryArguments.arguments(&op, &parts("/items?request=1&page=1"));
        let key = KeyBuilder::default().build(&op, args).unwrap();
        assert_eq!(key, "app::items::list(page=1,q=)");
    }

    #[test]
    fn missing_query_params_fail_binding() {
        let op = list_items();
        let args = QueryArguments.arguments(&op, &parts("/items"));
        assert!(KeyBuilder::default().build(&op, args).is_err());
    }

    #[test]
    fn no_arguments_binds_carriers() {
        let op = Operation::new("app::health").param("request", ArgType::REQUEST);
        let args = NoArguments.arguments(&op, &parts("/health?verbose=1"));
        let key = KeyBuilder::default().build(&op, args).unwrap();
        assert_eq!(key, "app::health()");
    }

    #[test]
    fn body_frames() {
        let body = ResponseBody::Fresh(Bytes::from_static(b"{}"));
        assert!(!body.is_end_stream());
        assert_eq!(body.size_hint().exact(), Some(2));
        assert!(ResponseBody::Cached(Bytes::new()).is_end_stream());
    }
}
