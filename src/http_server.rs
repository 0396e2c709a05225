//! HTTP Server Module
//!
//! Client-facing HTTP surface: range-proxied streaming, external ID lookup and
//! registration, format validation and health. One task per connection, a
//! semaphore bounding in-flight requests, JSON error bodies that never carry
//! upstream detail, and a bounded drain period on shutdown.

use crate::config::Config;
use crate::format_validator::FormatValidator;
use crate::health::HealthManager;
use crate::id_cache::IdResolutionCache;
use crate::logging::LoggerManager;
use crate::lookup_service::LookupService;
use crate::media_resolver::{EncodingConstraint, MediaResolver};
use crate::proxy_engine::{ProxyEngine, RangeResponse};
use crate::range_handler::build_unsatisfied_content_range;
use crate::shutdown::ShutdownSignal;
use crate::size_cache::ResourceSizeCache;
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Response body type for every route
pub type ResponseBody = UnsyncBoxBody<Bytes, ProxyError>;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Routes of the HTTP surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Stream { media_id: String },
    Resolve { external_id: String },
    Register { external_id: String, media_id: String },
    Validate { media_id: String },
    Health,
    NotFound,
}

impl Route {
    /// Match a request path. Path segments are percent-decoded.
    pub fn from_path(path: &str, health_endpoint: Option<&str>) -> Result<Route> {
        if health_endpoint == Some(path) {
            return Ok(Route::Health);
        }

        let segments = path
            .trim_start_matches('/')
            .split('/')
            .map(percent_decode)
            .collect::<Result<Vec<_>>>()?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        let route = match segments.as_slice() {
            ["stream", media_id] if !media_id.is_empty() => Route::Stream {
                media_id: media_id.to_string(),
            },
            ["resolve", external_id] if !external_id.is_empty() => Route::Resolve {
                external_id: external_id.to_string(),
            },
            ["register", external_id, media_id]
                if !external_id.is_empty() && !media_id.is_empty() =>
            {
                Route::Register {
                    external_id: external_id.to_string(),
                    media_id: media_id.to_string(),
                }
            }
            ["audioEncoding", media_id] | ["validate", media_id] if !media_id.is_empty() => {
                Route::Validate {
                    media_id: media_id.to_string(),
                }
            }
            _ => Route::NotFound,
        };
        Ok(route)
    }

    fn allows(&self, method: &Method) -> bool {
        match self {
            Route::Register { .. } => method == Method::GET || method == Method::POST,
            Route::NotFound => true,
            _ => method == Method::GET,
        }
    }

    fn allow_header(&self) -> &'static str {
        match self {
            Route::Register { .. } => "GET, POST, OPTIONS",
            _ => "GET, OPTIONS",
        }
    }
}

/// Shared per-process state handed to every request
pub struct AppState {
    config: Arc<Config>,
    engine: Arc<ProxyEngine>,
    lookup: LookupService,
    validator: FormatValidator,
    health: Option<HealthManager>,
    logger: Option<Arc<LoggerManager>>,
    request_semaphore: Arc<Semaphore>,
}

/// HTTP server for the media range proxy
pub struct MediaProxyServer {
    listen_addr: SocketAddr,
    state: Arc<AppState>,
    active_connections: Arc<AtomicUsize>,
}

impl MediaProxyServer {
    /// Wire caches, engine and services around an upstream resolver
    pub fn new(config: Arc<Config>, resolver: Arc<dyn MediaResolver>) -> Result<Self> {
        let listen_addr: SocketAddr = format!(
            "{}:{}",
            config.server.bind_address, config.server.http_port
        )
        .parse()
        .map_err(|e| {
            ProxyError::ConfigError(format!(
                "Invalid listen address {}:{}: {}",
                config.server.bind_address, config.server.http_port, e
            ))
        })?;

        let size_cache = Arc::new(ResourceSizeCache::new(config.size_cache_bound()));
        let id_cache = Arc::new(IdResolutionCache::new());
        let engine = Arc::new(
            ProxyEngine::new(Arc::clone(&resolver), Arc::clone(&size_cache))
                .with_read_timeout(config.upstream.read_timeout),
        );

        let health = config.health.enabled.then(|| {
            HealthManager::new(
                Arc::clone(&size_cache),
                Arc::clone(&id_cache),
                Arc::clone(&engine),
            )
        });

        let request_semaphore = Arc::new(Semaphore::new(config.server.max_concurrent_requests));

        let state = AppState {
            lookup: LookupService::new(id_cache, Arc::clone(&resolver)),
            validator: FormatValidator::new(resolver),
            engine,
            health,
            logger: None,
            request_semaphore,
            config,
        };

        Ok(Self {
            listen_addr,
            state: Arc::new(state),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Emit access log lines through `logger`
    pub fn set_logger_manager(&mut self, logger: Arc<LoggerManager>) {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.logger = Some(logger);
        } else {
            warn!("Logger manager set after the server started; ignoring");
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.state.engine
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.start_with_listener(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn start_with_listener(
        &self,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        info!("Media range proxy listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let state = Arc::clone(&self.state);
                            let active_connections = Arc::clone(&self.active_connections);

                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, state, active_connections)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        self.drain().await;
        info!("Media range proxy stopped");
        Ok(())
    }

    async fn drain(&self) {
        let drain_timeout = self.state.config.server.shutdown_timeout;
        let drain_start = Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active == 0 {
            return;
        }

        info!("Draining {} active connections (timeout: {:?})", active, drain_timeout);
        while self.active_connections.load(Ordering::Relaxed) > 0
            && drain_start.elapsed() < drain_timeout
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("Shutting down with {} connections still active", remaining);
        } else {
            info!("All connections drained");
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<AppState>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            async move { Self::handle_request(req, addr, state).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else if err.is_body_write_aborted() {
                // upstream failed mid-stream; the connection is cut without trailers
                debug!("Response body aborted for {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request
    pub async fn handle_request<B>(
        req: Request<B>,
        client_addr: SocketAddr,
        state: Arc<AppState>,
    ) -> std::result::Result<Response<ResponseBody>, Infallible> {
        let start_time = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let method = req.method().clone();
        let uri = req.uri().clone();
        let range = header_string(&req, header::RANGE);
        let user_agent = header_string(&req, header::USER_AGENT);

        debug!(request_id = %request_id, "Processing {} {}", method, uri);

        let mut response = if method == Method::OPTIONS {
            Self::preflight_response()
        } else {
            match Arc::clone(&state.request_semaphore).try_acquire_owned() {
                Ok(permit) => {
                    match Self::dispatch(&state, &method, &uri, range.as_deref(), permit).await {
                        Ok(response) => response,
                        Err(e) => build_error_response(&e, &request_id),
                    }
                }
                Err(_) => {
                    warn!("Request limit exceeded, returning 429");
                    too_many_requests_response(&request_id)
                }
            }
        };

        if !state.config.server.cors_allow_origin.is_empty() {
            set_header(
                &mut response,
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                &state.config.server.cors_allow_origin,
            );
            set_header(
                &mut response,
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                "Content-Range, Content-Length, Accept-Ranges",
            );
        }
        set_header(
            &mut response,
            HeaderName::from_static(REQUEST_ID_HEADER),
            &request_id,
        );

        if let Some(logger) = &state.logger {
            let status = response.status();
            let bytes_declared = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let error_code = (!status.is_success()).then(|| status.as_u16().to_string());

            let entry = logger.create_access_log_entry(
                &request_id,
                client_addr.to_string(),
                method.as_str(),
                uri.to_string(),
                status.as_u16(),
                bytes_declared,
                start_time.elapsed(),
                range,
                user_agent,
                error_code,
            );
            logger.log_access(&entry);
        }

        Ok(response)
    }

    async fn dispatch(
        state: &AppState,
        method: &Method,
        uri: &hyper::Uri,
        range: Option<&str>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Response<ResponseBody>> {
        let health_endpoint = state
            .health
            .as_ref()
            .map(|_| state.config.health.endpoint.as_str());
        let route = Route::from_path(uri.path(), health_endpoint)?;

        if !route.allows(method) {
            let mut response = json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({
                    "error": "MethodNotAllowed",
                    "message": "The method is not allowed for this resource",
                }),
            );
            set_header(&mut response, header::ALLOW, route.allow_header());
            return Ok(response);
        }

        let query = uri.query();
        match route {
            Route::Stream { media_id } => {
                let encoding = match query_param(query, "encoding")? {
                    Some(value) => EncodingConstraint::from_param(&value)?,
                    None => EncodingConstraint::Any,
                };
                let ranged = state.engine.serve(&media_id, encoding, range).await?;
                Ok(stream_response(ranged, permit))
            }
            Route::Resolve { external_id } => {
                let media_id = state.lookup.verify(&external_id).await;
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "mediaId": media_id }),
                ))
            }
            Route::Register {
                external_id,
                media_id,
            } => {
                state.lookup.register(&external_id, &media_id);
                Ok(empty_response(StatusCode::NO_CONTENT))
            }
            Route::Validate { media_id } => {
                let encoding = match query_param(query, "encoding")? {
                    Some(value) => EncodingConstraint::from_param(&value)?,
                    None => EncodingConstraint::WebmOpus,
                };
                let valid = state.validator.is_valid_format(&media_id, encoding).await;
                Ok(json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "validFormat": valid }),
                ))
            }
            Route::Health => match &state.health {
                Some(health) => {
                    let body = health.health_json()?;
                    let mut response = full_response(StatusCode::OK, Bytes::from(body));
                    set_header(&mut response, header::CONTENT_TYPE, "application/json");
                    Ok(response)
                }
                None => Ok(not_found_response()),
            },
            Route::NotFound => Ok(not_found_response()),
        }
    }

    fn preflight_response() -> Response<ResponseBody> {
        let mut response = empty_response(StatusCode::NO_CONTENT);
        set_header(
            &mut response,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, OPTIONS",
        );
        set_header(
            &mut response,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Range, Content-Type",
        );
        set_header(&mut response, header::ACCESS_CONTROL_MAX_AGE, "86400");
        response
    }
}

/// 206 response piping the verified range body. The concurrency permit is
/// held until the body finishes or the client goes away.
fn stream_response(ranged: RangeResponse, permit: OwnedSemaphorePermit) -> Response<ResponseBody> {
    let headers = ranged.headers();
    let body = ranged.body.map(move |chunk| {
        let _permit = &permit;
        chunk.map(Frame::data)
    });

    let mut response = Response::new(StreamBody::new(body).boxed_unsync());
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    for (name, value) in headers {
        set_header(&mut response, HeaderName::from_static(name), &value);
    }
    response
}

/// JSON error response for a failed request
pub fn build_error_response(err: &ProxyError, request_id: &str) -> Response<ResponseBody> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(request_id = %request_id, "Request failed: {}", err);
    } else {
        debug!(request_id = %request_id, "Request rejected: {}", err);
    }

    let mut response = json_response(
        status,
        &serde_json::json!({
            "error": err.code(),
            "message": err.public_message(),
            "requestId": request_id,
        }),
    );

    if let ProxyError::RangeNotSatisfiable { total } = err {
        set_header(
            &mut response,
            header::CONTENT_RANGE,
            &build_unsatisfied_content_range(*total),
        );
    }
    response
}

fn too_many_requests_response(request_id: &str) -> Response<ResponseBody> {
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        &serde_json::json!({
            "error": "TooManyRequests",
            "message": "Too many concurrent requests. Please retry after some time.",
            "requestId": request_id,
        }),
    );
    set_header(&mut response, header::RETRY_AFTER, "1");
    response
}

fn not_found_response() -> Response<ResponseBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "NotFound",
            "message": "No route matches this path",
        }),
    )
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<ResponseBody> {
    let mut response = full_response(status, Bytes::from(value.to_string()));
    set_header(&mut response, header::CONTENT_TYPE, "application/json");
    response
}

fn full_response(status: StatusCode, body: Bytes) -> Response<ResponseBody> {
    let len = body.len();
    let mut response =
        Response::new(Full::new(body).map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}

fn empty_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = status;
    response
}

fn set_header(response: &mut Response<ResponseBody>, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response.headers_mut().insert(name, value);
        }
        Err(e) => debug!("Dropping invalid {} header value: {}", name, e),
    }
}

fn header_string<B>(req: &Request<B>, name: HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// First value of a query parameter, percent-decoded (`+` reads as a space)
pub fn query_param(query: Option<&str>, name: &str) -> Result<Option<String>> {
    let Some(query) = query else {
        return Ok(None);
    };

    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if percent_decode(&key.replace('+', " "))? == name {
            return percent_decode(&value.replace('+', " ")).map(Some);
        }
    }
    Ok(None)
}

/// Decode `%XX` escapes in a URL component
pub fn percent_decode(input: &str) -> Result<String> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ProxyError::InvalidRequest(format!("'{}' is not valid UTF-8", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_matching() {
        assert_eq!(
            Route::from_path("/stream/vid1", Some("/health")).unwrap(),
            Route::Stream {
                media_id: "vid1".to_string()
            }
        );
        assert_eq!(
            Route::from_path("/register/abc/xyz", None).unwrap(),
            Route::Register {
                external_id: "abc".to_string(),
                media_id: "xyz".to_string()
            }
        );
        assert_eq!(
            Route::from_path("/audioEncoding/vid1", None).unwrap(),
            Route::from_path("/validate/vid1", None).unwrap()
        );
        assert_eq!(
            Route::from_path("/health", Some("/health")).unwrap(),
            Route::Health
        );
        assert_eq!(Route::from_path("/health", None).unwrap(), Route::NotFound);
        assert_eq!(Route::from_path("/stream/", None).unwrap(), Route::NotFound);
        assert_eq!(
            Route::from_path("/stream/a/b", None).unwrap(),
            Route::NotFound
        );
    }

    #[test]
    fn test_route_decodes_segments() {
        assert_eq!(
            Route::from_path("/resolve/spotify%3Atrack%3A42", None).unwrap(),
            Route::Resolve {
                external_id: "spotify:track:42".to_string()
            }
        );
        assert!(matches!(
            Route::from_path("/resolve/%FF%FE", None),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_route_methods() {
        let register = Route::Register {
            external_id: "a".to_string(),
            media_id: "b".to_string(),
        };
        assert!(register.allows(&Method::POST));
        assert!(register.allows(&Method::GET));
        assert!(!register.allows(&Method::DELETE));

        let stream = Route::Stream {
            media_id: "a".to_string(),
        };
        assert!(stream.allows(&Method::GET));
        assert!(!stream.allows(&Method::POST));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("encoding=opus&x=1"), "encoding").unwrap(),
            Some("opus".to_string())
        );
        assert_eq!(query_param(Some("x=1"), "encoding").unwrap(), None);
        assert_eq!(query_param(None, "encoding").unwrap(), None);
        assert_eq!(
            query_param(Some("encoding"), "encoding").unwrap(),
            Some(String::new())
        );
        assert_eq!(
            query_param(Some("q=a+b%2Bc"), "q").unwrap(),
            Some("a b+c".to_string())
        );
    }

    #[test]
    fn test_error_response_hides_upstream_detail() {
        let err = ProxyError::UpstreamFetch("10.0.0.7:443 reset by peer".to_string());
        let response = build_error_response(&err, "req-1");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    }

    #[test]
    fn test_unsatisfiable_response_has_content_range() {
        let response =
            build_error_response(&ProxyError::RangeNotSatisfiable { total: 1000 }, "req-2");
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }
}
