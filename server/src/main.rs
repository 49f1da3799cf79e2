use clap::Parser;
use log::{error, info, warn};
use server::config::ServerConfig;
use server::hooks::{NoopHooks, SessionHooks, StorageHooks};
use server::metrics::{serve_metrics, ServerMetrics};
use server::network::Dispatcher;
use server::session::SessionStore;
use server::storage::PostgresStorage;
use server::tick::TickScheduler;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Parses configuration, wires the components together and runs until a
/// shutdown signal arrives
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();
    info!(
        "Starting arena server on {} at {} Hz",
        config.game_addr(),
        config.tick_rate
    );

    let metrics = Arc::new(ServerMetrics::new()?);
    let sessions = Arc::new(SessionStore::new());

    // Storage is optional; the server runs without it
    let storage = if config.storage_enabled() {
        let storage = Arc::new(
            PostgresStorage::new(config.database_dsn.clone())
                .with_connect_timeout(config.db_connect_timeout()),
        );
        if !storage.connect().await {
            warn!("Running without session persistence");
        }
        Some(storage)
    } else {
        info!("No database configured, session events will not be persisted");
        None
    };
    let hooks: Arc<dyn SessionHooks> = match &storage {
        Some(storage) => Arc::new(StorageHooks::new(Arc::clone(storage), Arc::clone(&metrics))),
        None => Arc::new(NoopHooks),
    };

    let dispatcher = Dispatcher::bind(
        config.game_addr(),
        Arc::clone(&sessions),
        hooks,
        Arc::clone(&metrics),
        config.dispatcher_config(),
    )
    .await?;
    let dispatcher_handle = dispatcher.handle();

    let mut scheduler = TickScheduler::new(config.tick_rate, Arc::new(dispatcher.broadcaster()))?;
    let scheduler_handle = scheduler.handle();

    let metrics_listener = TcpListener::bind(config.metrics_addr()).await?;
    let (metrics_stop, metrics_stopped) = oneshot::channel::<()>();
    let metrics_task = tokio::spawn(serve_metrics(metrics_listener, Arc::clone(&metrics), async move {
        let _ = metrics_stopped.await;
    }));

    let mut dispatcher_task = tokio::spawn(dispatcher.run());
    scheduler.start()?;

    tokio::select! {
        result = &mut dispatcher_task => {
            match result {
                Ok(Ok(())) => warn!("Dispatcher exited unexpectedly"),
                Ok(Err(e)) => error!("Dispatcher failed: {}", e),
                Err(e) => error!("Dispatcher task panicked: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    // Stop accepting input before the clock stops, then wait for both
    dispatcher_handle.stop();
    scheduler_handle.stop();
    if !dispatcher_task.is_finished() {
        match dispatcher_task.await {
            Ok(Err(e)) => error!("Dispatcher failed during shutdown: {}", e),
            Err(e) => error!("Dispatcher task panicked: {}", e),
            Ok(Ok(())) => {}
        }
    }
    tokio::task::spawn_blocking(move || scheduler.join()).await?;

    let _ = metrics_stop.send(());
    match metrics_task.await {
        Ok(Err(e)) => error!("Metrics endpoint failed: {}", e),
        Err(e) => error!("Metrics task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    if let Some(storage) = storage {
        storage.disconnect().await;
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
