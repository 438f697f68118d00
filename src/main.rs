//! Cistern Server
//!
//! Aggregates per-producer change streams into one commit-ordered log and
//! publishes complete entries downstream.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | CISTERN_CONFIG | - | TOML config file |
//! | CISTERN_DATA_DIR | data.cistern | Store directory |
//! | CISTERN_CLUSTER_ID | 1 | Store namespace id |
//! | CISTERN_SINK | log | `log`, or a file path for length-prefixed output |
//! | CISTERN_LOG_FORMAT | text | `text` or `json` |
//! | RUST_LOG | info | Log filter |
//!
//! See `config.rs` for the remaining `CISTERN_*` overrides.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use cistern::observability::{init_tracing, LogFormat};
use cistern::server::ShutdownReport;
use cistern::sink::{FileSink, LogSink, Sink};
use cistern::{Server, ServerConfig};
use tokio::signal;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing(LogFormat::from_env())?;

    let config = ServerConfig::from_env()?;
    info!(
        "Cistern starting: data_dir={} cluster_id={} listen={} metrics={}",
        config.data_dir.display(),
        config.cluster_id,
        config.listen_addr,
        config.metrics_addr.as_deref().unwrap_or("-")
    );

    let report = match std::env::var("CISTERN_SINK").ok().as_deref() {
        None | Some("") | Some("log") => serve(config, LogSink).await?,
        Some(path) => {
            let sink = FileSink::open(path, true).await?;
            info!("Publishing to {}", sink.path().display());
            serve(config, sink).await?
        }
    };

    match report.publisher {
        Some(Ok(publisher)) => info!(
            "Publisher stopped at save point {} ({} delivered)",
            publisher.save_point, publisher.delivered
        ),
        Some(Err(e)) => error!("Publisher failed: {}", e),
        None => {}
    }
    for outcome in &report.producers {
        if let Err(e) = outcome {
            warn!("Producer ended with error: {}", e);
        }
    }
    info!(
        "Cistern stopped: lower={} upper={}",
        report.window.lower, report.window.upper
    );
    Ok(())
}

async fn serve<K: Sink>(config: ServerConfig, sink: K) -> Result<ShutdownReport, BoxError> {
    let server = Server::open(config, sink)?;
    server.start()?;

    signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");

    Ok(server.close().await?)
}
