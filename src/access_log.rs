//! Request logger.
//!
//! Wraps every request with a correlation id and emits one structured record
//! on the [`ACCESS_TARGET`] tracing target once the response head is ready:
//! method, path, model, status, latency and trace id. Streaming relays log a
//! second record from [`crate::proxy::RelayStream`] when the body ends.
//!
//! Handlers report the model they parsed from the body through
//! [`note_model`]; requests without a JSON body or a `model` field are logged
//! with [`MODEL_PLACEHOLDER`].

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::middleware::Next;
use actix_web::{HttpMessage, HttpRequest};
use std::fmt;
use std::time::Instant;

pub const ACCESS_TARGET: &str = "modelgate::access";
pub const MODEL_PLACEHOLDER: &str = "-";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request unique token joining all log lines of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id attached by the logger, or a fresh one when the request did
    /// not pass through it (unit tests, custom app wiring).
    pub fn of(req: &HttpRequest) -> Self {
        req.extensions()
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct RequestModel(String);

/// Record the `model` field of a parsed JSON body for the access record.
pub fn note_model(req: &HttpRequest, body: &serde_json::Value) {
    if let Some(model) = model_from_body(body) {
        req.extensions_mut().insert(RequestModel(model.to_string()));
    }
}

/// Best-effort `model` lookup; anything but a JSON object with a string
/// `model` yields `None`.
pub fn model_from_body(body: &serde_json::Value) -> Option<&str> {
    body.get("model").and_then(|v| v.as_str())
}

/// Actix middleware (`middleware::from_fn(access_log)`).
pub async fn access_log(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let started = Instant::now();
    let correlation_id = CorrelationId::new();
    let method = req.method().to_string();
    let path = req.path().to_string();
    req.extensions_mut().insert(correlation_id.clone());

    let result = next.call(req).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(mut res) => {
            let model = res
                .request()
                .extensions()
                .get::<RequestModel>()
                .map(|m| m.0.clone())
                .unwrap_or_else(|| MODEL_PLACEHOLDER.to_string());
            if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
                res.headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            tracing::info!(
                target: ACCESS_TARGET,
                method = %method,
                path = %path,
                model = %model,
                status = res.status().as_u16(),
                latency_ms = (latency_ms * 100.0).round() / 100.0,
                trace_id = %correlation_id,
                "request"
            );
            Ok(res)
        }
        Err(err) => {
            tracing::error!(
                target: ACCESS_TARGET,
                method = %method,
                path = %path,
                model = MODEL_PLACEHOLDER,
                status = err.as_response_error().status_code().as_u16(),
                latency_ms = (latency_ms * 100.0).round() / 100.0,
                trace_id = %correlation_id,
                error = %err,
                "request failed"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{middleware::from_fn, test, web, App, HttpResponse};
    use serde_json::json;

    async fn echo_model(req: HttpRequest, body: web::Json<serde_json::Value>) -> HttpResponse {
        note_model(&req, &body);
        HttpResponse::Ok().body(CorrelationId::of(&req).to_string())
    }

    #[::core::prelude::v1::test]
    fn model_extraction_is_best_effort() {
        assert_eq!(model_from_body(&json!({"model": "m"})), Some("m"));
        assert_eq!(model_from_body(&json!({"model": 7})), None);
        assert_eq!(model_from_body(&json!(["model"])), None);
        assert_eq!(model_from_body(&json!("text")), None);
    }

    #[actix_web::test]
    async fn attaches_request_id_matching_handler_view() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(access_log))
                .route("/echo", web::post().to(echo_model)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/echo")
            .set_json(json!({"model": "m"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let header = resp
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("request id header");
        let body = test::read_body(resp).await;
        assert_eq!(header.as_bytes(), &body[..]);
        assert_eq!(header.len(), 32);
    }

    #[actix_web::test]
    async fn malformed_bodies_do_not_break_requests() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(access_log))
                .route("/echo", web::post().to(echo_model)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/echo")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    }
}
