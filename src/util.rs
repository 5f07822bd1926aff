use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use crate::auth::AccessGuard;
use crate::proxy::{DispatchSettings, Dispatcher};
use crate::registry::Registry;
use crate::router::ModelRouter;

/// Load the environment file and install the global tracing subscriber.
///
/// - Explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to `.env` discovery in the working directory
/// - RUST_LOG filter (default `info`); LOG_FORMAT=json switches to JSON lines
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = fmt().with_env_filter(EnvFilter::new(filter));
    let _ = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };

    tracing::info!("Environment loaded from: {}", env_source);
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Build the shared outbound HTTP client.
///
/// Environment:
/// - MODELGATE_NO_PROXY = 1|true|yes|on -> disable all proxies
/// - MODELGATE_PROXY_URL = <url>        -> proxy for all schemes
/// - HTTP_PROXY / http_proxy            -> HTTP proxy
/// - HTTPS_PROXY / https_proxy          -> HTTPS proxy
/// - NO_PROXY / no_proxy                -> hosts exempt from the two above
///
/// Timeouts are applied per call by the dispatcher, not here.
pub fn build_http_client(settings: &DispatchSettings) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(settings.max_idle_connections)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(settings.timeout);

    if env_flag("MODELGATE_NO_PROXY") {
        builder = builder.no_proxy();
    } else {
        if let Ok(url) = std::env::var("MODELGATE_PROXY_URL") {
            let u = url.trim();
            if !u.is_empty() {
                match reqwest::Proxy::all(u) {
                    Ok(p) => builder = builder.proxy(p),
                    Err(e) => tracing::warn!(error = %e, "ignoring invalid MODELGATE_PROXY_URL"),
                }
            }
        }
        if let Ok(http_p) = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")) {
            let u = http_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::http(u) {
                    builder = builder.proxy(p.no_proxy(reqwest::NoProxy::from_env()));
                }
            }
        }
        if let Ok(https_p) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let u = https_p.trim();
            if !u.is_empty() {
                if let Ok(p) = reqwest::Proxy::https(u) {
                    builder = builder.proxy(p.no_proxy(reqwest::NoProxy::from_env()));
                }
            }
        }
    }

    builder = builder.user_agent(format!("modelgate/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default HTTP client");
        reqwest::Client::new()
    })
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub router: ModelRouter,
    pub dispatcher: Dispatcher,
    pub guard: AccessGuard,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, guard: AccessGuard, settings: DispatchSettings) -> Self {
        let client = build_http_client(&settings);
        Self {
            router: ModelRouter::new(registry),
            dispatcher: Dispatcher::new(client, settings),
            guard,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins (e.g., "https://a.com, https://b.com")
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods (e.g., "GET,POST,OPTIONS")
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds (usize)
///
/// Unset variables are permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for origin in split_list(&origins) {
                cors = cors.allowed_origin(origin);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods = split_list(&methods);
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in split_list(&headers) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS") {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_skips_blanks() {
        assert_eq!(
            split_list(" https://a.com, ,https://b.com "),
            vec!["https://a.com", "https://b.com"]
        );
        assert!(split_list(" , ").is_empty());
    }
}
