//! flagsync - fetch a feature payload and follow live updates
//!
//! Prints the fetch result as JSON on stdout. With `--watch`, keeps the
//! stream open and prints every pushed payload as a JSON line until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use flagsync::cli::{Cli, CliConsumer, RunConfig};
use flagsync::transport::{ReqwestTransport, SseTransport};
use flagsync::{FeatureConsumer, FeatureRepository, FetchOptions, FileStore, StreamingOptions};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flagsync=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match RunConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut builder = FeatureRepository::builder()
        .settings(config.settings.clone())
        .http(Arc::new(ReqwestTransport::new()))
        .stream(Arc::new(SseTransport::new()));
    if config.persist {
        match FileStore::new() {
            Some(store) => builder = builder.store(Arc::new(store)),
            None => tracing::warn!("no cache directory available, keeping cache in memory"),
        }
    }
    let repository = builder.build();

    let timeout = config.timeout;
    let watch = config.watch;
    let consumer: Arc<dyn FeatureConsumer> = Arc::new(CliConsumer::new(config));

    let result = repository
        .get_data(
            &consumer,
            FetchOptions {
                timeout,
                ..FetchOptions::default()
            },
        )
        .await;

    println!(
        "{}",
        json!({
            "success": result.success,
            "source": result.source.as_str(),
            "data": result.data,
            "error": result.error.as_ref().map(ToString::to_string),
        })
    );
    if !result.success {
        return ExitCode::FAILURE;
    }

    if watch {
        let options = StreamingOptions {
            streaming: true,
            payload_provided: false,
        };
        if let Err(e) = repository.start_streaming(&consumer, options) {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
        if repository.is_auto_refreshing(consumer.as_ref()) {
            tracing::info!("watching for feature updates, press Ctrl-C to stop");
        } else {
            tracing::warn!(
                "server does not advertise streaming and --poll-secs is not set; no updates will arrive"
            );
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
