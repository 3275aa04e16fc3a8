mod catalog;
mod classifier;
mod config;
mod error;
mod matcher;
mod model;
mod pipeline;
mod rate_limit;
mod responder;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use concierge_common::openai::{OpenAiClient, OpenAiClientConfig};

use catalog::Catalog;
use classifier::LlmNavigationClassifier;
use config::Config;
use error::AppError;
use pipeline::ClassificationPipeline;
use rate_limit::RateLimiter;
use responder::LlmResponder;
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting site-concierge");

    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        faq_path = %config.faq_path.display(),
        navigation_path = %config.navigation_path.display(),
        max_requests = config.rate_limit.max_requests,
        window_secs = config.rate_limit.window.as_secs(),
        "configuration loaded"
    );

    let catalog = Arc::new(Catalog::load(&config.faq_path, &config.navigation_path).await?);

    let openai_config = OpenAiClientConfig::from_env();
    info!(
        base_url = %openai_config.base_url,
        model = %config.llm_model,
        timeout_ms = openai_config.default_timeout.as_millis(),
        max_retries = openai_config.max_retries,
        "llm client configured"
    );
    let openai = Arc::new(OpenAiClient::new(openai_config).map_err(AppError::Llm)?);

    let classifier = Arc::new(LlmNavigationClassifier::new(
        Arc::clone(&openai),
        config.llm_model.clone(),
        config.matching.classifier_keyword_preview,
    ));
    let responder = Arc::new(LlmResponder::new(openai, config.llm_model.clone()));

    let limiter = RateLimiter::load(&config.rate_limit).await;
    limiter.start_sweeper().await;

    let state = AppState {
        pipeline: Arc::new(ClassificationPipeline::new(
            catalog,
            classifier,
            config.matching.clone(),
        )),
        responder,
        limiter: limiter.clone(),
        trust_forwarded_for: config.trust_forwarded_for,
    };

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "HTTP server ready");
    axum::serve(
        listener,
        server::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = limiter.shutdown().await {
        warn!(error = %e, "final rate-limit flush failed");
    }
    info!("site-concierge shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
