use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use redis_response_cache::{
    ArgType, Arguments, BindingError, CacheError, CacheOptions, CacheStore,
    ConnectionState, Endpoint, Expire, Opaque, Operation, ResponseCache,
    StoreResult, Ttl, Value,
};
use redis_response_cache_tower::{
    CustomArguments, NoArguments, ResponseBody, ResponseCacheLayer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

const STATUS: &str = "x-fastapi-cache";

// Simple in-memory store for testing; entries never expire
#[derive(Clone, Default)]
struct MemoryStore {
    store: Arc<Mutex<HashMap<String, (String, Ttl)>>>,
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.store.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Ttl) -> StoreResult<()> {
        self.store.lock().unwrap().insert(key.to_owned(), (value, ttl));
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Ttl>> {
        Ok(self.store.lock().unwrap().get(key).map(|(_, ttl)| *ttl))
    }
}

fn list_items() -> Endpoint {
    Endpoint::new(
        Operation::new("app::items::list")
            .param("request", ArgType::REQUEST)
            .param("page", ArgType::named("u32")),
    )
    .expire(Expire::one_minute())
}

async fn cache(store: MemoryStore) -> Arc<ResponseCache<MemoryStore>> {
    Arc::new(ResponseCache::connect(store, CacheOptions::default()).await)
}

// Echoes the query string and counts invocations
fn handler(
    calls: Arc<AtomicUsize>,
) -> BoxCloneService<Request<()>, Value, std::io::Error> {
    BoxCloneService::new(tower::service_fn(move |req: Request<()>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let query = req.uri().query().unwrap_or_default().to_owned();
            Ok::<_, std::io::Error>(Value::object([("query", query)]))
        }
    }))
}

async fn body(res: Response<ResponseBody>) -> Bytes {
    res.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn test_cache_hit_and_miss() {
    let store = MemoryStore::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let layer = ResponseCacheLayer::new(cache(store.clone()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    // First request - cache miss
    let req = Request::get("/items?page=1").body(()).unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get(STATUS).unwrap(), "Miss");
    assert_eq!(res.headers().get("cache-control").unwrap(), "max-age=60");
    assert_eq!(res.headers().get("content-type").unwrap(), "application/json");
    assert!(matches!(res.body(), ResponseBody::Fresh(_)));
    let etag = res.headers().get("etag").unwrap().clone();
    let miss_body = body(res).await;
    assert_eq!(miss_body, Bytes::from_static(br#"{"query":"page=1"}"#));

    // Written before the response is returned
    assert_eq!(
        store.store.lock().unwrap().get("app::items::list(page=1)").unwrap().1,
        Ttl::Seconds(60)
    );

    // Second request - cache hit
    let req = Request::get("/items?page=1").body(()).unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.headers().get(STATUS).unwrap(), "Hit");
    assert_eq!(res.headers().get("etag").unwrap(), etag);
    assert!(matches!(res.body(), ResponseBody::Cached(_)));
    assert_eq!(body(res).await, miss_body);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_params_select_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer =
        ResponseCacheLayer::new(cache(MemoryStore::default()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    for uri in ["/items?page=1", "/items?page=2", "/items?page=1&utm=abc"] {
        let req = Request::get(uri).body(()).unwrap();
        service.ready().await.unwrap().call(req).await.unwrap();
    }

    // The unknown `utm` parameter does not contribute to the key
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_query_param_is_an_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer =
        ResponseCacheLayer::new(cache(MemoryStore::default()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    let req = Request::get("/items").body(()).unwrap();
    let err = service.ready().await.unwrap().call(req).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::Binding(BindingError::MissingArgument { .. }))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_not_modified() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer =
        ResponseCacheLayer::new(cache(MemoryStore::default()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    let req = Request::get("/items?page=1").body(()).unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    let etag = res.headers().get("etag").unwrap().clone();

    let req = Request::get("/items?page=1")
        .header("if-none-match", etag.clone())
        .body(())
        .unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(res.headers().get("etag").unwrap(), etag);
    assert_eq!(res.headers().get(STATUS).unwrap(), "Hit");
    assert_eq!(res.headers().get("content-type").unwrap(), "application/json");
    assert!(body(res).await.is_empty());

    let req = Request::get("/items?page=1")
        .header("if-none-match", "*")
        .body(())
        .unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_cache_request_bypasses() {
    let store = MemoryStore::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let layer = ResponseCacheLayer::new(cache(store.clone()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    for directive in ["no-cache", "no-store"] {
        let req = Request::get("/items?page=1")
            .header("cache-control", directive)
            .body(())
            .unwrap();
        let res = service.ready().await.unwrap().call(req).await.unwrap();
        assert!(res.headers().get(STATUS).is_none());
        assert!(res.headers().get("etag").is_none());
        assert!(matches!(res.body(), ResponseBody::Uncacheable(_)));
        assert_eq!(
            body(res).await,
            Bytes::from_static(br#"{"query":"page=1"}"#)
        );
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(store.store.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_post_bypasses() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer =
        ResponseCacheLayer::new(cache(MemoryStore::default()).await, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    for _ in 0..2 {
        let req = Request::post("/items?page=1").body(()).unwrap();
        let res = service.ready().await.unwrap().call(req).await.unwrap();
        assert!(res.headers().get(STATUS).is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnected_store() {
    let store = MemoryStore::default();
    let cache = Arc::new(ResponseCache::with_state(
        store.clone(),
        CacheOptions::default(),
        ConnectionState::ConnectionError,
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let layer = ResponseCacheLayer::new(cache, list_items());
    let mut service = layer.layer(handler(calls.clone()));

    for _ in 0..2 {
        let req = Request::get("/items?page=1").body(()).unwrap();
        let res = service.ready().await.unwrap().call(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(STATUS).is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(store.store.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unencodable_payload() {
    let store = MemoryStore::default();
    let layer = ResponseCacheLayer::with_arguments(
        cache(store.clone()).await,
        Endpoint::new(Operation::new("app::connection")),
        NoArguments,
    );
    let mut service = layer.layer(tower::service_fn(|_req: Request<()>| async {
        Ok::<_, std::io::Error>(Value::object([("conn", Opaque::new(1u8))]))
    }));

    let req = Request::get("/connection").body(()).unwrap();
    let res = service.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().is_empty());
    let value = res.extensions().get::<Value>().cloned().unwrap();
    assert_eq!(value.get("conn").unwrap().kind(), "u8");
    assert!(body(res).await.is_empty());
    assert!(store.store.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_handler_error_propagates() {
    let layer = ResponseCacheLayer::with_arguments(
        cache(MemoryStore::default()).await,
        Endpoint::new(Operation::new("app::broken")),
        NoArguments,
    );
    let mut service = layer.layer(tower::service_fn(|_req: Request<()>| async {
        Err::<Value, _>(std::io::Error::other("database down"))
    }));

    let req = Request::get("/broken").body(()).unwrap();
    let err = service.ready().await.unwrap().call(req).await.unwrap_err();
    let err = err.downcast_ref::<CacheError>().unwrap();
    assert!(matches!(err, CacheError::Handler(_)));
    assert_eq!(err.to_string(), "endpoint handler failed: database down");
}

#[tokio::test]
async fn test_custom_arguments() {
    let calls = Arc::new(AtomicUsize::new(0));
    let arguments =
        CustomArguments::new(|_op: &Operation, req: &http::request::Parts| {
            let user = req
                .headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("anonymous")
                .to_owned();
            Arguments::new().named("user", user)
        });
    let layer = ResponseCacheLayer::with_arguments(
        cache(MemoryStore::default()).await,
        Endpoint::new(
            Operation::new("app::me").param("user", ArgType::named("String")),
        ),
        arguments,
    );
    let mut service = layer.layer(handler(calls.clone()));

    for user in ["1", "2", "1"] {
        let req = Request::get("/me").header("x-user-id", user).body(()).unwrap();
        service.ready().await.unwrap().call(req).await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_metrics() {
    let calls = Arc::new(AtomicUsize::new(0));
    let layer =
        ResponseCacheLayer::new(cache(MemoryStore::default()).await, list_items());
    let mut service = layer.clone().layer(handler(calls.clone()));

    for _ in 0..3 {
        let req = Request::get("/items?page=1").body(()).unwrap();
        service.ready().await.unwrap().call(req).await.unwrap();
    }

    let metrics = layer.metrics();
    assert_eq!(metrics.misses.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.hits.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.stores.load(Ordering::Relaxed), 1);
    assert!((metrics.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
}
