use std::sync::Arc;

use callscribe_api::{build_router, state::AppState};
use callscribe_config::Settings;
use callscribe_platform::PlatformClient;
use callscribe_services::RoomRegistry;
use callscribe_transcription::ModelRegistry;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXAPP_SOCKET_PATH: &str = "/tmp/exapp.sock";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "callscribe_api=debug,callscribe_services=debug,callscribe_signaling=debug,tower_http=debug"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    settings.validate()?;
    info!(
        app_id = %settings.app.id,
        app_version = %settings.app.version,
        port = settings.app.port,
        "starting callscribe"
    );

    let platform = PlatformClient::new(&settings)?;
    let models = Arc::new(ModelRegistry::new(&settings.storage.persistent_dir));
    let registry = RoomRegistry::new(settings.clone(), platform.clone(), models);
    registry.prefetch_hpb_settings().await;

    let state = AppState::new(settings.clone(), platform, Arc::clone(&registry));
    let app = build_router(state);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    };

    if settings.app.shared_key.is_some() {
        // Deployed behind the platform's app gateway: serve on a Unix socket.
        let _ = std::fs::remove_file(EXAPP_SOCKET_PATH);
        let listener = tokio::net::UnixListener::bind(EXAPP_SOCKET_PATH)?;
        info!(path = EXAPP_SOCKET_PATH, "listening on unix socket");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
    } else {
        let addr = format!("0.0.0.0:{}", settings.app.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "listening on TCP");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    info!("shutting down");
    registry.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
