//! TD Streamer Binary
//!
//! Connects to the streamer, applies the configured subscriptions and
//! writes decoded records to the configured sink until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin td-streamer
//! ```
//!
//! # Environment Variables
//!
//! ## Credentials
//! - `TD_CREDENTIALS_PATH`: JSON credential file
//!   (default: `$HOME/.td-streamer/credentials.json`)
//!
//! ## Optional
//! - `STREAMER_URL`: Streamer WebSocket URL
//! - `STREAMER_SUBSCRIPTIONS`: e.g. `QUOTE=AAPL,MSFT|bid-price,ask-price;CHART_EQUITY=SPY`
//! - `STREAMER_QOS`: express | real-time | fast | moderate | slow | delayed
//! - `STREAMER_SINK`: console | file:<path> | file+truncate:<path> (default: console)
//! - `STREAMER_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `STREAMER_*`: session timing, backoff and backpressure settings
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::{Context, anyhow};
use td_streamer::infrastructure::telemetry;
use td_streamer::{
    ClientConfig, ConsoleSink, JsonFileCredentialStore, JsonLinesFileSink, RecordSink,
    RequestHandle, SinkSettings, StoredAuthProvider, StreamerConfig, StreamingClient,
    WebSocketConnector, init_metrics,
};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting TD streamer");

    let config = StreamerConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics_port != 0 {
        init_metrics(config.metrics_port).context("failed to start metrics listener")?;
        tracing::info!(port = config.metrics_port, "Metrics listener started");
    }

    let auth = Arc::new(StoredAuthProvider::new(JsonFileCredentialStore::new(
        &config.credentials_path,
    )));
    let sink = build_sink(&config.sink).await?;

    let client = StreamingClient::new(
        ClientConfig::from(&config),
        auth,
        Arc::new(WebSocketConnector::new()),
        sink,
    );
    client.on_error(|error| tracing::debug!(error = %error, "Stream error"));

    client
        .connect()
        .await
        .context("failed to start streamer session")?;

    apply_subscriptions(&client, &config).await;

    tracing::info!("Streamer ready");

    let outcome = tokio::select! {
        () = await_shutdown() => {
            client.shutdown().await;
            Ok(())
        }
        result = client.wait() => result,
    };

    let stats = client.delivery_stats();
    tracing::info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        failed = stats.failed,
        "TD streamer stopped"
    );

    outcome.context("streamer session ended")
}

async fn build_sink(settings: &SinkSettings) -> anyhow::Result<Arc<dyn RecordSink>> {
    let sink: Arc<dyn RecordSink> = match settings {
        SinkSettings::Console => Arc::new(ConsoleSink::new()),
        SinkSettings::File { path, append } => Arc::new(
            JsonLinesFileSink::open(path, *append)
                .await
                .with_context(|| format!("failed to open sink file {}", path.display()))?,
        ),
    };
    Ok(sink)
}

/// Send the configured subscriptions and quality of service.
///
/// Responses are awaited in the background so a slow or failing
/// subscription does not hold up the rest.
async fn apply_subscriptions(client: &StreamingClient, config: &StreamerConfig) {
    for spec in &config.subscriptions {
        let label = format!("{} {}", spec.service, spec.symbols.join(","));
        match client
            .subscribe(spec.service, &spec.symbols, &spec.fields)
            .await
        {
            Ok(handle) => watch_response(label, handle),
            Err(e) => tracing::warn!(subscription = %label, error = %e, "Subscription not sent"),
        }
    }

    if let Some(level) = config.qos {
        match client.set_quality_of_service(level).await {
            Ok(handle) => watch_response(format!("QOS {level}"), handle),
            Err(e) => tracing::warn!(level = %level, error = %e, "QOS not sent"),
        }
    }
}

fn watch_response(label: String, handle: RequestHandle) {
    tokio::spawn(async move {
        match handle.response().await {
            Ok(ack) => tracing::info!(request = %label, message = %ack.message, "Request acknowledged"),
            Err(e) => tracing::warn!(request = %label, error = %e, "Request failed"),
        }
    });
}

/// Log the parsed configuration.
fn log_config(config: &StreamerConfig) {
    tracing::info!(
        url = %config.url,
        subscriptions = config.subscriptions.len(),
        qos = ?config.qos,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(
        credentials = %config.credentials_path.display(),
        sink = ?config.sink,
        field_keying = config.session.field_keying.as_str(),
        backpressure = %config.delivery.policy,
        queue_depth = config.delivery.queue_depth,
        "Session settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
