use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use duraflow::logging::{self, LogFormat};
use duraflow::providers::HistoryStore;
use duraflow::providers::fs::FsHistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::server::{AppState, build_router};
use duraflow::{Runtime, samples};

/// Durable workflow runtime with an HTTP control plane.
#[derive(Debug, Parser)]
#[command(name = "duraflow", version, about)]
struct Args {
    /// Address the HTTP API listens on.
    #[arg(long, env = "DURAFLOW_BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Directory for durable history. In-memory when unset.
    #[arg(long, env = "DURAFLOW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Simulated work per hello-world activity, in milliseconds.
    #[arg(long, env = "DURAFLOW_ACTIVITY_DELAY_MS", default_value_t = 1000)]
    activity_delay_ms: u64,

    #[arg(long, env = "DURAFLOW_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.log_format, "info");

    let store: Arc<dyn HistoryStore> = match &args.data_dir {
        Some(dir) => {
            let fs_store = FsHistoryStore::new(dir, false);
            info!(data_dir = %fs_store.root().display(), "using filesystem history store");
            Arc::new(fs_store)
        }
        None => {
            info!("using in-memory history store; state is lost on exit");
            Arc::new(InMemoryHistoryStore::new())
        }
    };

    let runtime = Runtime::start_with_store(
        store,
        samples::hello_activities(Duration::from_millis(args.activity_delay_ms)),
        samples::hello_orchestrations(),
    )
    .await;

    let app = build_router(AppState::new(runtime.clone()));
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}
