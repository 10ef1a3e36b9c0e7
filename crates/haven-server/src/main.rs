//! Haven server binary: config, wiring, and the cooperative task set
//! (worker, dispatcher, HTTP server) on one runtime.

mod app;
mod logging;
mod tools;

use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "haven-server", about = "Haven assistant core server")]
struct Args {
    /// Path to haven.toml (default: ~/.haven/haven.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = haven_core::HavenConfig::load(args.config.as_deref())?;

    let handles = app::build(config).await?;
    logging::init(handles.db.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "haven server starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let worker = handles.worker.clone();
    let worker_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

    let dispatcher = handles.dispatcher.clone();
    let events_rx = handles
        .events_rx
        .lock()
        .await
        .take()
        .expect("event channel taken once");
    let dispatcher_task = tokio::spawn(dispatcher.run(events_rx));

    let bind = format!("{}:{}", handles.config.a2a.bind, handles.config.a2a.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "http server listening");

    let router = handles.router.clone();
    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "http server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    handles.sources.stop_all().await;
    handles.tools.close().await;

    let _ = worker_task.await;
    let _ = dispatcher_task.await;
    let _ = server_task.await;
    info!("haven server stopped");
    Ok(())
}
