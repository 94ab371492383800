use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use docconv::api::conversion_routes;
use docconv::config::ServiceConfig;
use docconv::service::ConversionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();

    std::fs::create_dir_all(&config.logs_dir)
        .with_context(|| format!("creating log directory {}", config.logs_dir.display()))?;

    // Stderr plus a daily rolling file in the logs directory.
    let file_appender = tracing_appender::rolling::daily(&config.logs_dir, "docconv.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("📄 docconv v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.bind_addr);
    eprintln!("   Workspaces: {}", config.temp_dir.display());
    eprintln!("   Logs: {}", config.logs_dir.display());
    eprintln!(
        "   Max upload: {} MB\n",
        config.max_upload_bytes / (1024 * 1024)
    );

    let service = Arc::new(ConversionService::new(config.clone()));

    service.init().await.context("preparing workspace root")?;

    let _sweep_handle = service.spawn_sweep_task();

    let app = conversion_routes(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Conversion server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await
        .context("serving HTTP")?;

    Ok(())
}
