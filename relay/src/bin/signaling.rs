use std::sync::Arc;

use actix_web::web::Data;
use actix_web::{web, App, HttpServer};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use camrelay::broker::{self, Hub};
use camrelay::config::Config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let address = config.bind_address();

    let hub = Data::new(Arc::new(Hub::new()));
    let origins = Data::new(config.allowed_origins.clone());

    tracing::info!("signaling broker listening on {}", address);
    tracing::info!("WebSocket endpoint: ws://{}/ws", address);

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(hub.clone())
            .app_data(origins.clone())
            .route("/ws", web::get().to(broker::ws_route))
            .route("/health", web::get().to(broker::health))
    })
    .bind(&address)
    .map_err(|err| {
        tracing::error!("failed to bind {}: {}", address, err);
        err
    })?
    .run()
    .await
}
