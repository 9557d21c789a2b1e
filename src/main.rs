use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ytdlp_audio_api::{
    AppState, Settings, blob::BlobError, build_router, extractor, jobs, sweeper,
};

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Error)]
enum StartupError {
    #[error("could not create output directory {path:?}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("could not build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("invalid blob storage configuration: {0}")]
    Blob(#[from] BlobError),

    #[error("could not listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("HTTP server error: {0}")]
    Serve(#[source] io::Error),
}

#[tokio::main]
async fn main() {
    // A missing .env file is the normal case in containers.
    let _ = dotenvy::dotenv();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("Configuration error: {error}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", settings.log_level))),
        )
        .init();

    if let Err(error) = run(settings).await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), StartupError> {
    tokio::fs::create_dir_all(&settings.output_dir)
        .await
        .map_err(|source| StartupError::OutputDir {
            path: settings.output_dir.clone(),
            source,
        })?;
    extractor::purge_staging(&settings.staging_dir()).await;

    if settings.blob.upload_enabled && !settings.blob.is_configured() {
        warn!(
            "AZURE_UPLOAD_ENABLED is set but no credentials are configured; uploads will report an error"
        );
    }

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
        .build()?;
    let (job_queue, job_receiver) = jobs::JobQueue::new();
    let state = AppState::new(settings, http_client, job_queue)?;
    let settings = state.settings.clone();
    let signed_urls = state
        .uploader
        .as_ref()
        .is_some_and(|uploader| uploader.can_sign());

    let cancel = CancellationToken::new();
    let sweeper = sweeper::spawn(
        settings.output_dir.clone(),
        settings.max_file_age,
        settings.cleanup_interval,
        cancel.clone(),
    );
    let workers = jobs::spawn_workers(
        state.clone(),
        job_receiver,
        settings.max_concurrent_downloads,
        cancel.clone(),
    );

    let app = build_router(state);
    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: settings.bind_addr.clone(),
            source,
        })?;

    info!(
        addr = %settings.bind_addr,
        output_dir = ?settings.output_dir,
        ytdlp_binary = ?settings.ytdlp_binary,
        max_concurrent_downloads = settings.max_concurrent_downloads,
        max_file_age_secs = settings.max_file_age.as_secs(),
        allowed_formats = %settings.allowed_formats.join(","),
        allowed_domains = %settings.allowed_domains.join(","),
        blob_upload = settings.blob.upload_enabled,
        signed_urls,
        "Server ready and accepting connections"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;
    cancel.cancel();

    let _ = sweeper.await;
    for worker in workers {
        let _ = worker.await;
    }

    served.map_err(StartupError::Serve)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }

    info!("Shutting down gracefully...");
    cancel.cancel();
}
