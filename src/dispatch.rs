//! The request dispatcher: from an accepted request to a sent response.
//!
//! Per request: apply the plaintext-upgrade policy, resolve the site from
//! the `Host` header, enforce the method policy, collect `POST` bodies
//! under the process-wide upload admission limits, consult the response
//! cache, run the hook chain, render the returned [`Descriptor`], and store
//! cacheable results.
//!
//! The URI hook for `/blog/post` on a site with canonical host
//! `example.com` is named `example.com$blog/post`; when it is absent the
//! site-default hook `example.com$` runs with the path as its extra
//! argument. When neither exists the request is a plain 404.

use crate::application::{Body, ResponsePipe};
use crate::hooks::{ChainResult, HookArgs, MatchMode, RequestArgs, Takeover, TakeoverParts};
use crate::host::PlaintextPolicy;
use crate::prelude::*;
use crate::reply::Payload;
use crate::utility;
use crate::Server;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// What the connection loop does after a request has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Flow {
    /// Keep the connection for the next request.
    Continue,
    /// Destroy the connection.
    Close,
}

/// Redirect status for the plaintext-upgrade policy: permanent, but
/// method-preserving for everything except `GET`/`HEAD`.
fn redirect_status(method: &Method) -> StatusCode {
    if method == Method::GET || method == Method::HEAD {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::PERMANENT_REDIRECT
    }
}

/// Whether the client asked for an upgrade to HTTPS.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade-insecure-requests")
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.trim() == "1")
}

/// Sends a plain status page.
async fn respond_status(pipe: &ResponsePipe, status: StatusCode) {
    let body = utility::status_body(status);
    // Infallible: static names, rendered values.
    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html")
        .header(header::CONTENT_LENGTH, body.len())
        .body(())
        .expect("static response head");
    if let Err(err) = pipe.send(&response, &body).await {
        debug!("failed to send {status} page: {err}");
    }
}

async fn redirect_to_https(parts: &http::request::Parts, pipe: &ResponsePipe) {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |path_query| path_query.as_str());
    let location = format!("https://{host}{target}");
    let body = format!(
        "<html><body>Continue to <a href=\"{location}\">{}</a>.</body></html>",
        utility::html_escape(&location)
    );

    let builder = Response::builder()
        .status(redirect_status(&parts.method))
        .header(header::VARY, "Upgrade-Insecure-Requests")
        .header(header::CONTENT_TYPE, "text/html")
        .header(header::CONTENT_LENGTH, body.len());
    let response = match builder.header(header::LOCATION, location.as_str()).body(()) {
        Ok(response) => response,
        Err(err) => {
            // A host header with illegal value bytes cannot be redirected.
            warn!("cannot build redirect to {location:?}: {err}");
            respond_status(pipe, StatusCode::BAD_REQUEST).await;
            return;
        }
    };
    if let Err(err) = pipe.send(&response, body.as_bytes()).await {
        debug!("failed to send redirect: {err}");
    }
}

/// Reserves space in the process-wide upload counter and releases it when
/// the request is done with its body.
struct UploadGuard<'a> {
    server: &'a Server,
    reserved: usize,
}

impl<'a> UploadGuard<'a> {
    fn new(server: &'a Server) -> Self {
        Self {
            server,
            reserved: 0,
        }
    }

    /// Admits `amount` more bytes, unless that would cross the storage
    /// limit.
    fn admit(&mut self, amount: usize) -> bool {
        let counter = self.server.pending_uploads();
        let limit = self.server.options().upload_max_storage;
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(amount) else {
                return false;
            };
            if next > limit {
                return false;
            }
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.reserved += amount;
                    return true;
                }
                Err(changed) => current = changed,
            }
        }
    }
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.server
                .pending_uploads()
                .fetch_sub(self.reserved, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Default)]
struct CollectedBody {
    bytes: Bytes,
    params: Option<HashMap<String, String>>,
}

/// Collects a request body under the admission limits.
///
/// # Errors
///
/// The status to answer with: 406 for anything oversized or broken, 500
/// when the client aborted mid-body.
async fn collect_body(
    server: &Server,
    headers: &HeaderMap,
    body: &mut Body,
) -> Result<CollectedBody, StatusCode> {
    if body.remaining() > server.options().upload_max_unit_size as u64 {
        // Refused before reading a single body byte.
        return Err(StatusCode::NOT_ACCEPTABLE);
    }
    let mut guard = UploadGuard::new(server);
    let mut collected = BytesMut::with_capacity(body.remaining() as usize);
    while let Some(chunk) = body.chunk().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
            Err(err) => {
                debug!("request body failed: {err}");
                return Err(StatusCode::NOT_ACCEPTABLE);
            }
        };
        if !guard.admit(chunk.len()) {
            warn!("upload storage limit reached; refusing request body");
            return Err(StatusCode::NOT_ACCEPTABLE);
        }
        collected.extend_from_slice(&chunk);
    }
    let bytes = collected.freeze();

    let urlencoded = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| {
            value
                .trim_start()
                .starts_with("application/x-www-form-urlencoded")
        });
    let params = urlencoded.then(|| utility::parse_query(&String::from_utf8_lossy(&bytes)));
    Ok(CollectedBody { bytes, params })
}

struct Timing {
    arrival: Instant,
    hook_entry: Instant,
}

impl Timing {
    /// `X-GMetrics`, measured now: request-arrival to hook-entry, then
    /// hook-entry to response-send.
    fn metrics_value(&self) -> String {
        let stage1 = self
            .hook_entry
            .duration_since(self.arrival)
            .as_micros();
        let stage2 = self.hook_entry.elapsed().as_micros();
        format!("{stage1}us, {stage2}us")
    }
}

fn keep_alive(parts: &http::request::Parts, body: &Body) -> Flow {
    if !body.is_consumed() || parts.version != Version::HTTP_11 {
        return Flow::Close;
    }
    let close = parts
        .headers
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.eq_ignore_ascii_case("close"));
    if close {
        Flow::Close
    } else {
        Flow::Continue
    }
}

/// Handles one request end to end.
pub async fn handle(
    server: &Arc<Server>,
    request: Request<Body>,
    pipe: ResponsePipe,
    secure: bool,
) -> Flow {
    let arrival = Instant::now();
    let (parts, mut body) = request.into_parts();

    // Plaintext-upgrade policy, before anything else sees the request.
    if !secure && server.tls_active() {
        let redirect = match server.options().plaintext_policy {
            PlaintextPolicy::None => false,
            PlaintextPolicy::Reject => true,
            PlaintextPolicy::Upgrade => wants_upgrade(&parts.headers),
        };
        if redirect {
            redirect_to_https(&parts, &pipe).await;
            return keep_alive(&parts, &body);
        }
    }

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    let Some(site) = server.options().resolve_site(host).cloned() else {
        debug!("no site serves host {host:?}; destroying connection");
        let _ = body.drain().await;
        return Flow::Close;
    };

    let collected = if parts.method == Method::GET || parts.method == Method::HEAD {
        CollectedBody::default()
    } else if parts.method == Method::POST {
        match collect_body(server, &parts.headers, &mut body).await {
            Ok(collected) => collected,
            Err(status) => {
                respond_status(&pipe, status).await;
                return Flow::Close;
            }
        }
    } else {
        // OPTIONS is reserved; everything else is unsupported.
        respond_status(&pipe, StatusCode::METHOD_NOT_ALLOWED).await;
        return keep_alive(&parts, &body);
    };

    let path = parts.uri.path().to_owned();
    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| path.clone(), |path_query| path_query.as_str().to_owned());
    let cache_key = format!("{}${}", site.canonical(), target);
    let mask = site.mask();

    // Bound separately so the cache lock is released before rendering.
    let cached = server.cache().lock().await.get(&cache_key);
    if let Some(cached) = cached {
        trace!("cache hit for {cache_key:?}");
        let timing = Timing {
            arrival,
            hook_entry: Instant::now(),
        };
        let flow = render(server, &parts, pipe, cached, timing, None).await;
        return flow.min(keep_alive(&parts, &body));
    }

    let mut params = utility::parse_query(parts.uri.query().unwrap_or(""));
    if let Some(body_params) = collected.params {
        // Body parameters override query parameters of the same name.
        for (name, value) in body_params {
            params.insert(name, value);
        }
    }

    let uri_hook = format!("{}${}", site.canonical(), &path[1..]);
    let default_hook = format!("{}$", site.canonical());
    let timing_entry = Instant::now();
    let result: ChainResult;
    if server
        .registry()
        .check_target(&uri_hook, mask, MatchMode::Inclusive)
    {
        let args = HookArgs::request(RequestArgs {
            path: None,
            params,
            headers: parts.headers.clone(),
            body: collected.bytes,
        });
        result = server
            .registry()
            .call_wait(&uri_hook, mask, MatchMode::Inclusive, args)
            .await;
    } else if server
        .registry()
        .check_target(&default_hook, mask, MatchMode::Inclusive)
    {
        let args = HookArgs::request(RequestArgs {
            path: Some(path.clone()),
            params,
            headers: parts.headers.clone(),
            body: collected.bytes,
        });
        result = server
            .registry()
            .call_wait(&default_hook, mask, MatchMode::Inclusive, args)
            .await;
    } else {
        respond_status(&pipe, StatusCode::NOT_FOUND).await;
        return keep_alive(&parts, &body);
    }

    let timing = Timing {
        arrival,
        hook_entry: timing_entry,
    };
    let descriptor = match result {
        Ok(Some(descriptor)) => descriptor,
        Ok(None) => {
            error!("hooks for {target:?} on {} produced no descriptor", site.canonical());
            respond_status(&pipe, StatusCode::INTERNAL_SERVER_ERROR).await;
            return keep_alive(&parts, &body);
        }
        Err(err) => {
            error!("hook chain failed for {target:?}: {err}");
            respond_status(&pipe, StatusCode::BAD_GATEWAY).await;
            return keep_alive(&parts, &body);
        }
    };

    let flow = render(server, &parts, pipe, descriptor, timing, Some(&cache_key)).await;
    flow.min(keep_alive(&parts, &body))
}

impl Flow {
    /// The stricter of two decisions.
    fn min(self, other: Self) -> Self {
        if self == Flow::Close || other == Flow::Close {
            Flow::Close
        } else {
            Flow::Continue
        }
    }
}

/// Renders `descriptor` and sends it, inserting cacheable responses under
/// `cache_key`.
async fn render(
    server: &Arc<Server>,
    parts: &http::request::Parts,
    pipe: ResponsePipe,
    descriptor: Arc<Descriptor>,
    timing: Timing,
    cache_key: Option<&str>,
) -> Flow {
    if descriptor.error {
        error!("hook signaled a fatal error for {}", parts.uri);
        respond_status(&pipe, StatusCode::INTERNAL_SERVER_ERROR).await;
        return Flow::Continue;
    }

    if let Some(target) = &descriptor.manual {
        return delegate(server, parts, pipe, &descriptor, target).await;
    }

    if !(100..600).contains(&descriptor.status) {
        error!(
            "hook returned out-of-range status {} for {}",
            descriptor.status, parts.uri
        );
        respond_status(&pipe, StatusCode::INTERNAL_SERVER_ERROR).await;
        return Flow::Continue;
    }
    let status = StatusCode::from_u16(descriptor.status).expect("range checked");

    let mut response = Response::builder()
        .status(status)
        .body(())
        .expect("static response head");
    let headers = response.headers_mut();

    // User headers, one at a time; a bad entry is skipped, the rest apply.
    for (name, value) in &descriptor.headers {
        let header_name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!("skipping invalid header name {name:?}");
                continue;
            }
        };
        match HeaderValue::from_str(value) {
            Ok(header_value) => {
                headers.insert(header_name, header_value);
            }
            Err(_) => warn!("skipping invalid value for header {name:?}"),
        }
    }

    let mut cacheable = true;
    match descriptor
        .entity_tag
        .as_deref()
        .map(HeaderValue::from_str)
    {
        Some(Ok(tag)) => {
            headers.insert(header::ETAG, tag);
        }
        Some(Err(_)) => {
            warn!("skipping invalid entity tag");
            cacheable = false;
        }
        None => cacheable = false,
    }
    match descriptor.max_age {
        Some(age) => {
            let directive = format!("max-age={age}, must-revalidate");
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_str(&directive).expect("rendered from a number"),
            );
        }
        None => cacheable = false,
    }

    let content_type = descriptor
        .data_type
        .as_deref()
        .and_then(|value| value.parse::<mime::Mime>().ok());
    match content_type {
        Some(mime_type) => {
            if let Ok(value) = HeaderValue::from_str(mime_type.as_ref()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        None => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
    }

    match &descriptor.payload {
        Payload::Bytes(_) | Payload::Text(_) => {
            let body = descriptor.payload.as_bytes().expect("buffered payload");
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            if let Ok(value) = HeaderValue::from_str(&timing.metrics_value()) {
                headers.insert("x-gmetrics", value);
            }
            if let Err(err) = pipe.send(&response, &body).await {
                debug!("response write failed for {}: {err}", parts.uri);
                return Flow::Close;
            }
            if cacheable {
                if let (Some(key), Some(age)) = (cache_key, descriptor.max_age) {
                    let expires = Instant::now() + Duration::from_secs(u64::from(age));
                    server.cache().lock().await.put(
                        key.to_owned(),
                        Arc::clone(&descriptor),
                        body.len(),
                        expires,
                    );
                    trace!("cached {key:?} for {age}s");
                }
            }
            Flow::Continue
        }
        Payload::Stream(source) => {
            // Streams are sent as they come and never cached.
            if let Some(length) = source.length() {
                if length > 0 {
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                }
            }
            if let Ok(value) = HeaderValue::from_str(&timing.metrics_value()) {
                headers.insert("x-gmetrics", value);
            }
            match source.take() {
                Some(mut reader) => {
                    if let Err(err) = pipe.send_streamed(&response, &mut reader).await {
                        debug!("response stream failed for {}: {err}", parts.uri);
                        return Flow::Close;
                    }
                }
                None => {
                    warn!("stream source for {} already consumed", parts.uri);
                    if let Err(err) = pipe.send(&response, b"").await {
                        debug!("response write failed for {}: {err}", parts.uri);
                        return Flow::Close;
                    }
                }
            }
            Flow::Continue
        }
        Payload::None => {
            headers.remove(header::CONTENT_TYPE);
            headers.remove(header::ETAG);
            headers.remove(header::CACHE_CONTROL);
            let body = utility::status_body(status);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            if let Ok(value) = HeaderValue::from_str(&timing.metrics_value()) {
                headers.insert("x-gmetrics", value);
            }
            if let Err(err) = pipe.send(&response, &body).await {
                debug!("response write failed for {}: {err}", parts.uri);
                return Flow::Close;
            }
            Flow::Continue
        }
    }
}

/// Hands the raw connection to the chain named by a `manual` descriptor.
async fn delegate(
    server: &Arc<Server>,
    parts: &http::request::Parts,
    pipe: ResponsePipe,
    descriptor: &Arc<Descriptor>,
    target: &str,
) -> Flow {
    let mask = server
        .options()
        .resolve_site(
            parts
                .headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok()),
        )
        .map_or(crate::hooks::CategoryMask::ALL, |site| site.mask());
    if !server
        .registry()
        .check_target(target, mask, MatchMode::Inclusive)
    {
        error!("manual target {target:?} does not exist");
        respond_status(&pipe, StatusCode::BAD_GATEWAY).await;
        return Flow::Continue;
    }

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version);
    if let Some(headers) = builder.headers_mut() {
        *headers = parts.headers.clone();
    }
    let request = builder.body(()).expect("rebuilt from a parsed request");

    let takeover = Takeover::new(TakeoverParts {
        request,
        pipe,
        descriptor: Arc::clone(descriptor),
    });
    server.registry().dispatch(
        target,
        mask,
        MatchMode::Inclusive,
        HookArgs::Takeover(Arc::new(takeover)),
    );
    // The delegated chain owns the connection now.
    Flow::Close
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_status_per_method() {
        assert_eq!(redirect_status(&Method::GET), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(redirect_status(&Method::HEAD), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            redirect_status(&Method::POST),
            StatusCode::PERMANENT_REDIRECT
        );
        assert_eq!(
            redirect_status(&Method::DELETE),
            StatusCode::PERMANENT_REDIRECT
        );
    }

    #[test]
    fn upgrade_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_upgrade(&headers));
        headers.insert(
            "upgrade-insecure-requests",
            HeaderValue::from_static("1"),
        );
        assert!(wants_upgrade(&headers));
        headers.insert(
            "upgrade-insecure-requests",
            HeaderValue::from_static("0"),
        );
        assert!(!wants_upgrade(&headers));
    }

    #[test]
    fn flow_combines_strictly() {
        assert_eq!(Flow::Continue.min(Flow::Continue), Flow::Continue);
        assert_eq!(Flow::Continue.min(Flow::Close), Flow::Close);
        assert_eq!(Flow::Close.min(Flow::Continue), Flow::Close);
    }
}
