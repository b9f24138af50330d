use std::sync::Arc;

use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use camrelay::config::Config;
use camrelay::ingest::IngestPipeline;
use camrelay::publisher::Publisher;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!("signaling broker: {}", config.signaling_url());

    let publisher = match Publisher::new(&config) {
        Ok(publisher) => Arc::new(publisher),
        Err(err) => {
            tracing::error!("failed to create publisher: {}", err);
            std::process::exit(1);
        }
    };

    let pipeline = match IngestPipeline::start(&config.video).await {
        Ok(pipeline) => pipeline,
        Err(err) => {
            tracing::error!("failed to start ingest pipeline: {}", err);
            std::process::exit(1);
        }
    };

    {
        let publisher = publisher.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                publisher.shutdown();
            }
        });
    }

    if let Err(err) = publisher.run(pipeline).await {
        tracing::error!("publisher failed: {}", err);
        std::process::exit(1);
    }
}
