use actix_web::{middleware::from_fn, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use modelgate::access_log::access_log;
use modelgate::config::{Cli, Command};
use modelgate::registry::Registry;
use modelgate::server::config_routes;
use modelgate::util::{cors_config_from_env, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap reads env-backed flags.
    init_tracing();
    let cli = Cli::parse();
    let settings = cli.settings;

    let registry = Registry::open(&settings.config_path).with_context(|| {
        format!(
            "failed to load model config from {}",
            settings.config_path.display()
        )
    })?;

    if cli.command == Some(Command::Models) {
        let snapshot = registry.snapshot();
        if snapshot.is_empty() {
            println!("No models configured.");
        }
        for descriptor in snapshot.descriptors() {
            println!(
                "- {}: backend={} url={}",
                descriptor.name, descriptor.backend_kind, descriptor.backend_url
            );
        }
        return Ok(());
    }

    let guard = settings.access_guard();
    if !guard.is_enabled() {
        tracing::warn!("API_KEY not set; model endpoints are open to any caller");
    }

    let registry = Arc::new(registry);
    let state = web::Data::new(AppState::new(
        registry.clone(),
        guard,
        settings.dispatch_settings(),
    ));

    tracing::info!(
        bind = %settings.bind_addr,
        config = %settings.config_path.display(),
        models = registry.snapshot().len(),
        "starting modelgate"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(from_fn(access_log))
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&settings.bind_addr)
    .with_context(|| format!("failed to bind {}", settings.bind_addr))?
    .run()
    .await
    .context("HTTP server terminated with an error")?;

    tracing::info!("shutdown complete; outbound connection pool released");
    Ok(())
}
