//! Proxy dispatcher: forwards a resolved request to its backend and relays
//! the answer, either buffered or as a live byte stream.

use actix_web::http::header::HeaderMap as InboundHeaders;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, Sleep};

use crate::access_log::{CorrelationId, ACCESS_TARGET};
use crate::error::{GatewayError, Result};
use crate::registry::ModelDescriptor;
use crate::router::Operation;

/// Headers that are never copied from the inbound request. The outbound
/// host differs and the body is re-encoded, so framing headers are stale.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-authenticate",
    "accept-encoding",
];

const RETRY_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Tunables for the shared outbound transport.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Per-call timeout: whole buffered exchange, time-to-headers for streams,
    /// and the maximum silence between two streamed chunks.
    pub timeout: Duration,
    /// Cap on concurrently open outbound connections.
    pub max_connections: usize,
    /// Cap on idle pooled connections per backend host.
    pub max_idle_connections: usize,
    /// Extra attempts when the connection could not be established.
    pub retries: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_connections: 100,
            max_idle_connections: 20,
            retries: 3,
        }
    }
}

/// One outbound call against a resolved descriptor.
pub struct DispatchRequest<'a> {
    pub descriptor: &'a ModelDescriptor,
    pub operation: Operation,
    pub payload: &'a serde_json::Value,
    pub inbound_headers: &'a InboundHeaders,
    pub stream: bool,
    pub correlation_id: CorrelationId,
}

/// Shared, cloneable dispatcher. Holds no per-model state.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, settings: DispatchSettings) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<HttpResponse> {
        let url = request.descriptor.endpoint(request.operation.path());
        let headers = compose_headers(request.inbound_headers, &request.descriptor.extra_headers);

        tracing::debug!(
            trace_id = %request.correlation_id,
            model = %request.descriptor.name,
            url = %url,
            stream = request.stream,
            "dispatching to backend"
        );

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GatewayError::Internal(format!("connection limiter closed: {e}")))?;

        let upstream = self
            .send_with_retry(&url, headers, request.payload, request.stream)
            .await?;

        if request.stream && upstream.status().is_success() {
            Ok(self.relay_stream(upstream, &request, permit))
        } else if request.stream {
            relay_raw(upstream, self.settings.timeout).await
        } else {
            let response = relay_json(upstream).await;
            drop(permit);
            response
        }
    }

    async fn send_with_retry(
        &self,
        url: &str,
        headers: HeaderMap,
        payload: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            let mut builder = self.client.post(url).headers(headers.clone()).json(payload);
            if !stream {
                builder = builder.timeout(self.settings.timeout);
            }
            let sent = tokio::time::timeout(self.settings.timeout, builder.send()).await;

            let err = match sent {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => {
                    return Err(GatewayError::BackendUnavailable(format!(
                        "{url}: no response within {:?}",
                        self.settings.timeout
                    )))
                }
            };

            if err.is_connect() && attempt < self.settings.retries {
                let delay = RETRY_BACKOFF_MS[(attempt as usize).min(RETRY_BACKOFF_MS.len() - 1)];
                tracing::warn!(error = %err, attempt, delay_ms = delay, "backend connect failed; retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
                continue;
            }
            return Err(GatewayError::BackendUnavailable(err.to_string()));
        }
    }

    fn relay_stream(
        &self,
        upstream: reqwest::Response,
        request: &DispatchRequest<'_>,
        permit: OwnedSemaphorePermit,
    ) -> HttpResponse {
        let status = actix_status(upstream.status()).unwrap_or(StatusCode::OK);
        let relay = RelayStream::new(
            Box::pin(upstream.bytes_stream()),
            request.correlation_id.clone(),
            request.descriptor.name.clone(),
            self.settings.timeout,
        )
        .with_permit(permit);

        HttpResponse::build(status)
            .insert_header(("content-type", "text/event-stream"))
            .insert_header(("cache-control", "no-cache"))
            .streaming(relay)
    }
}

/// Inbound headers minus [`STRIPPED_HEADERS`], overlaid with the
/// descriptor's headers. Descriptor values replace inbound ones.
pub fn compose_headers(inbound: &InboundHeaders, extra: &BTreeMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(value)) => {
                out.append(name, value);
            }
            _ => tracing::warn!("Skipping unforwardable inbound header: {}", name),
        }
    }
    for (key, value) in extra {
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => tracing::warn!("Skipping invalid descriptor header: {}", key),
        }
    }
    out
}

fn actix_status(status: reqwest::StatusCode) -> Result<StatusCode> {
    StatusCode::from_u16(status.as_u16()).map_err(|_| {
        GatewayError::BackendProtocolError(format!("unsupported status code {status}"))
    })
}

/// Buffered relay: body must be JSON; status is passed through.
async fn relay_json(upstream: reqwest::Response) -> Result<HttpResponse> {
    let status = actix_status(upstream.status())?;
    let body = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))?;
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
        return Err(GatewayError::BackendProtocolError(format!(
            "status {}: {e}",
            status.as_u16()
        )));
    }
    Ok(HttpResponse::build(status)
        .insert_header(("content-type", "application/json"))
        .body(body))
}

/// Non-success answer to a streaming request: relay it as-is. Streaming
/// sends carry no total timeout, so the body read is bounded here.
async fn relay_raw(upstream: reqwest::Response, timeout: Duration) -> Result<HttpResponse> {
    let status = actix_status(upstream.status())?;
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = tokio::time::timeout(timeout, upstream.bytes())
        .await
        .map_err(|_| {
            GatewayError::BackendUnavailable(format!(
                "error body not received within {timeout:?}"
            ))
        })?
        .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))?;
    Ok(HttpResponse::build(status)
        .insert_header(("content-type", content_type))
        .body(body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// The caller went away before the backend finished.
    Aborted,
    BackendError,
    TimedOut,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Aborted => "aborted",
            StreamOutcome::BackendError => "backend_error",
            StreamOutcome::TimedOut => "timed_out",
        }
    }
}

/// Pass-through byte stream that records size and timing, logging one
/// record when the relay ends. Dropping it drops the backend response,
/// which cancels the outbound call.
pub struct RelayStream<S> {
    inner: Option<S>,
    correlation_id: CorrelationId,
    model: String,
    started: Instant,
    bytes: u64,
    chunks: u64,
    outcome: Option<StreamOutcome>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<S, E> RelayStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    pub fn new(inner: S, correlation_id: CorrelationId, model: String, idle_timeout: Duration) -> Self {
        Self {
            inner: Some(inner),
            correlation_id,
            model,
            started: Instant::now(),
            bytes: 0,
            chunks: 0,
            outcome: None,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
            permit: None,
        }
    }

    fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.outcome
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        finish_relay(self, outcome);
    }
}

impl<S> RelayStream<S> {
    /// The caller went away: drop the backend stream, which cancels the
    /// outbound call, and record the relay as aborted.
    pub fn abort(&mut self) {
        finish_relay(self, StreamOutcome::Aborted);
    }
}

fn finish_relay<S>(relay: &mut RelayStream<S>, outcome: StreamOutcome) {
    if relay.outcome.is_some() {
        return;
    }
    relay.outcome = Some(outcome);
    relay.inner.take();
    relay.permit.take();
    tracing::info!(
        target: ACCESS_TARGET,
        trace_id = %relay.correlation_id,
        model = %relay.model,
        bytes = relay.bytes,
        chunks = relay.chunks,
        duration_ms = relay.started.elapsed().as_secs_f64() * 1000.0,
        outcome = outcome.as_str(),
        "stream finished"
    );
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                this.chunks += 1;
                let deadline = Instant::now() + this.idle_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                tracing::warn!(trace_id = %this.correlation_id, error = %err, "backend stream aborted");
                this.finish(StreamOutcome::BackendError);
                Poll::Ready(Some(Err(std::io::Error::other(err.to_string()))))
            }
            Poll::Ready(None) => {
                this.finish(StreamOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    this.finish(StreamOutcome::TimedOut);
                    return Poll::Ready(Some(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "backend stream stalled",
                    ))));
                }
                Poll::Pending
            }
        }
    }
}

impl<S> Drop for RelayStream<S> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName as InName, HeaderValue as InValue};
    use futures_util::StreamExt;

    fn inbound(pairs: &[(&'static str, &'static str)]) -> InboundHeaders {
        let mut map = InboundHeaders::new();
        for (k, v) in pairs {
            map.append(InName::from_static(k), InValue::from_static(v));
        }
        map
    }

    #[test]
    fn compose_strips_host_and_prefers_descriptor_headers() {
        let headers = compose_headers(
            &inbound(&[
                ("host", "gateway.local"),
                ("content-length", "42"),
                ("authorization", "Bearer caller"),
                ("x-tenant", "inbound"),
                ("x-trace", "abc"),
            ]),
            &BTreeMap::from([
                ("X-Tenant".to_string(), "descriptor".to_string()),
                ("x-extra".to_string(), "1".to_string()),
            ]),
        );

        assert!(headers.get("host").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers["authorization"], "Bearer caller");
        assert_eq!(headers["x-trace"], "abc");
        assert_eq!(headers["x-extra"], "1");
        let tenants: Vec<&str> = headers
            .get_all("x-tenant")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(tenants, vec!["descriptor"]);
    }

    #[test]
    fn compose_keeps_repeated_inbound_headers() {
        let headers = compose_headers(
            &inbound(&[("x-tag", "a"), ("x-tag", "b")]),
            &BTreeMap::new(),
        );
        assert_eq!(headers.get_all("x-tag").iter().count(), 2);
    }

    #[actix_web::test]
    async fn relay_stream_forwards_chunks_in_order() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Ok(Bytes::from_static(b"data: 2\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let mut relay = RelayStream::new(
            futures_util::stream::iter(chunks),
            CorrelationId::new(),
            "m".into(),
            Duration::from_secs(5),
        );

        let mut seen = Vec::new();
        while let Some(item) = relay.next().await {
            seen.push(item.expect("chunk"));
        }
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"data: 1\n\n"),
                Bytes::from_static(b"data: 2\n\n"),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ]
        );
        assert_eq!(relay.outcome(), Some(StreamOutcome::Completed));
        assert_eq!(relay.chunks, 3);
    }

    #[actix_web::test]
    async fn relay_stream_ends_after_backend_error() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err(std::io::Error::other("reset by peer")),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let mut relay = RelayStream::new(
            futures_util::stream::iter(chunks),
            CorrelationId::new(),
            "m".into(),
            Duration::from_secs(5),
        );

        assert!(relay.next().await.expect("first").is_ok());
        assert!(relay.next().await.expect("error").is_err());
        assert!(relay.next().await.is_none());
        assert_eq!(relay.outcome(), Some(StreamOutcome::BackendError));
    }

    #[actix_web::test]
    async fn relay_stream_times_out_when_backend_stalls() {
        let stalled = futures_util::stream::pending::<std::result::Result<Bytes, std::io::Error>>();
        let mut relay = RelayStream::new(
            stalled,
            CorrelationId::new(),
            "m".into(),
            Duration::from_millis(20),
        );
        let item = relay.next().await.expect("timeout item");
        assert_eq!(item.expect_err("timeout").kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(relay.outcome(), Some(StreamOutcome::TimedOut));
    }

    struct DropSignal(Option<tokio::sync::oneshot::Sender<()>>);

    impl Drop for DropSignal {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    #[actix_web::test]
    async fn abort_releases_backend_stream_and_records_aborted() {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let signal = DropSignal(Some(tx));
        let backend = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: 1\n\n",
        ))])
        .chain(futures_util::stream::pending())
        .map(move |item| {
            let _ = &signal;
            item
        });
        let mut relay = RelayStream::new(
            Box::pin(backend),
            CorrelationId::new(),
            "m".into(),
            Duration::from_secs(5),
        );

        assert!(relay.next().await.expect("first chunk").is_ok());
        assert!(rx.try_recv().is_err());

        relay.abort();
        assert_eq!(relay.outcome(), Some(StreamOutcome::Aborted));
        assert!(rx.try_recv().is_ok());
        assert!(relay.next().await.is_none());
        assert_eq!(relay.chunks, 1);
    }
}
