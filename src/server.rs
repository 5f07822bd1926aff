use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde_json::json;

use crate::access_log::{note_model, CorrelationId};
use crate::error::Result;
use crate::models::{parse_payload, summarize};
use crate::proxy::DispatchRequest;
use crate::router::Operation;
use crate::util::AppState;

/// Upper bound on inbound request bodies.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const ROUTES: &[&str] = &[
    "/healthz",
    "/v1/models",
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/admin/reload",
    "/admin/status",
];

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES));
    cfg.service(
        web::scope("")
            .route("/healthz", web::get().to(healthz))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/completions", web::post().to(completions))
            .route("/v1/embeddings", web::post().to(embeddings))
            .route("/admin/reload", web::post().to(reload_models))
            .route("/admin/status", web::get().to(status))
            .default_service(web::to(not_found)),
    );
}

/// Liveness plus the currently configured model names. Never guarded.
async fn healthz(state: web::Data<AppState>) -> impl Responder {
    state.router.refresh();
    web::Json(json!({
        "status": "ok",
        "models": state.registry().model_names(),
    }))
}

async fn list_models(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    state.guard.authorize_headers(req.headers())?;
    state.router.refresh();
    let data: Vec<_> = state
        .registry()
        .model_names()
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model" }))
        .collect();
    Ok(HttpResponse::Ok().json(json!({ "data": data, "object": "list" })))
}

/// Explicit reload. Validation failures come back as 400 and leave the
/// active snapshot in place.
async fn reload_models(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    state.guard.authorize_headers(req.headers())?;
    tracing::info!(
        "Reloading model configuration from: {}",
        state.registry().path().display()
    );
    let snapshot = state.registry().load()?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "reloaded",
        "models": snapshot.names(),
    })))
}

async fn status(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    state.guard.authorize_headers(req.headers())?;
    state.router.refresh();
    let registry = state.registry();
    let settings = state.dispatcher.settings();
    Ok(HttpResponse::Ok().json(json!({
        "name": "modelgate",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ROUTES,
        "config_path": registry.path().display().to_string(),
        "registry": registry.snapshot().stats(),
        "auth": { "enabled": state.guard.is_enabled() },
        "dispatch": {
            "timeout_seconds": settings.timeout.as_secs(),
            "max_connections": settings.max_connections,
            "max_idle_connections": settings.max_idle_connections,
            "retries": settings.retries,
        }
    })))
}

async fn chat_completions(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    proxy_model_call(req, body, state, Operation::ChatCompletions).await
}

async fn completions(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    proxy_model_call(req, body, state, Operation::Completions).await
}

async fn embeddings(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    proxy_model_call(req, body, state, Operation::Embeddings).await
}

/// Guard, validate, resolve, dispatch. An authorization failure wins over
/// a malformed body.
async fn proxy_model_call(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
    operation: Operation,
) -> Result<HttpResponse> {
    let payload = parse_payload(&body);
    if let Ok(value) = &payload {
        note_model(&req, value);
    }
    state.guard.authorize_headers(req.headers())?;

    let payload = payload?;
    let summary = summarize(operation, &payload)?;
    let descriptor = state.router.route(&summary.model, operation)?;

    state
        .dispatcher
        .dispatch(DispatchRequest {
            descriptor: descriptor.as_ref(),
            operation,
            payload: &payload,
            inbound_headers: req.headers(),
            stream: summary.stream,
            correlation_id: CorrelationId::of(&req),
        })
        .await
}

async fn not_found(req: HttpRequest) -> HttpResponse {
    HttpResponse::NotFound().json(json!({
        "error": {
            "message": format!("No route for {} {}", req.method(), req.path()),
            "type": "not_found_error",
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessGuard;
    use crate::proxy::DispatchSettings;
    use crate::registry::Registry;
    use actix_web::{http::StatusCode, test, App};
    use std::io::Write;
    use std::sync::Arc;

    fn state_with(yaml: &str, guard: AccessGuard) -> (tempfile::NamedTempFile, AppState) {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write config");
        let registry = Arc::new(Registry::open(file.path()).expect("registry"));
        (
            file,
            AppState::new(registry, guard, DispatchSettings::default()),
        )
    }

    const TWO_MODELS: &str = "models:\n  alpha:\n    backend_url: http://127.0.0.1:9\n  beta:\n    backend_url: http://127.0.0.1:9\n    backend: llamacpp\n    embeddings: true\n";

    #[actix_web::test]
    async fn healthz_lists_models_without_auth() {
        let (_file, state) = state_with(TWO_MODELS, AccessGuard::new(Some("k")));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(config_routes),
        )
        .await;

        let resp =
            test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"status": "ok", "models": ["alpha", "beta"]}));
    }

    #[actix_web::test]
    async fn status_reports_registry_stats() {
        let (_file, state) = state_with(TWO_MODELS, AccessGuard::open());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(config_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/admin/status").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["registry"]["total_models"], 2);
        assert_eq!(body["registry"]["embedding_models"], 1);
        assert_eq!(body["registry"]["backends"]["llamacpp"], 1);
        assert_eq!(body["auth"]["enabled"], false);
        assert_eq!(body["dispatch"]["max_connections"], 100);
    }

    #[actix_web::test]
    async fn unknown_routes_use_error_envelope() {
        let (_file, state) = state_with(TWO_MODELS, AccessGuard::open());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(config_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/v1/nothing").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[actix_web::test]
    async fn unauthorized_beats_malformed_body() {
        let (_file, state) = state_with(TWO_MODELS, AccessGuard::new(Some("k")));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(config_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/chat/completions")
                .insert_header(("content-type", "application/json"))
                .set_payload("{broken")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/v1/chat/completions")
                .insert_header(("authorization", "Bearer k"))
                .insert_header(("content-type", "application/json"))
                .set_payload("{broken")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }
}
