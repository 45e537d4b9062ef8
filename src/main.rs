use std::sync::Arc;

use firehydrant_webhooks::config::ServiceConfig;
use firehydrant_webhooks::dispatch::ChannelSink;
use firehydrant_webhooks::rpc::{self, Host, JsonRpcRequest, Publisher};
use firehydrant_webhooks::upstream::{FireHydrantClient, WebhookResource};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // stdout carries the JSON-RPC stream, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "firehydrant_webhooks=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(
        host = %config.host,
        port = config.port,
        account = %config.account,
        "Loaded configuration"
    );

    let upstream: Option<Arc<dyn WebhookResource>> = if config.api_key.is_empty() {
        None
    } else {
        match FireHydrantClient::new(&config.api_url, &config.api_key, config.upstream_timeout) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build FireHydrant client");
                std::process::exit(1);
            }
        }
    };

    // Single writer for stdout: responses and event notifications share it.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let publisher = Publisher::spawn(event_rx, out_tx.clone());

    let host = Host::new(config, upstream, Arc::new(ChannelSink::new(event_tx)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (response, is_shutdown) = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
            Ok(request) => (
                host.handle_request(&request).await,
                request.method == "shutdown",
            ),
            Err(e) => (rpc::parse_error(e.to_string()), false),
        };

        match serde_json::to_string(&response) {
            Ok(line) => {
                let _ = out_tx.send(line);
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize response"),
        }

        if is_shutdown {
            break;
        }
    }

    tracing::info!("Shutting down");
    publisher.shutdown().await;
    drop(out_tx);
    let _ = writer.await;
}
