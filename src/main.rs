use std::sync::Arc;

mod config;
mod functions;
mod schema;
mod services;
mod store;
mod text;

use crate::functions::webhook::AppState;
use crate::functions::{DeliveryPipeline, Publisher, Review, Scheduler};
use crate::services::{AlertThrottle, DiscussionResolver, Messenger, ProcessorHandoff};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env()?;
    let db = store::connect(&config.database_path).await?;
    store::init_schema(&db).await?;
    tracing::info!(path = %config.database_path, "storage ready");

    let messenger: Arc<dyn Messenger> =
        Arc::new(services::TelegramBot::new(config.bot_token.clone())?);
    let alerts = Arc::new(AlertThrottle::new(config.alert_chat_id.clone()));
    let discussion = config
        .discussion_resolver_url
        .as_ref()
        .map(|url| {
            DiscussionResolver::new(url.clone(), config.discussion_resolver_token.clone())
                .map(Arc::new)
        })
        .transpose()?;

    let publisher = Arc::new(Publisher::new(
        messenger.clone(),
        discussion,
        config.pdf_storage_root.clone(),
    ));
    let pipeline = Arc::new(DeliveryPipeline::new(messenger.clone(), alerts.clone()));
    let review = Arc::new(Review::new(
        publisher.clone(),
        messenger.clone(),
        alerts.clone(),
        config.fallback_channel.clone(),
    ));
    let processor: Arc<dyn ProcessorHandoff> =
        Arc::new(services::ProcessorClient::new(config.processor_url.clone())?);
    let scheduler = Arc::new(Scheduler::new(
        pipeline.clone(),
        publisher,
        messenger,
        alerts,
        config.fallback_channel.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatch_handle = tokio::spawn(functions::dispatch::dispatch_loop(
        db.clone(),
        processor,
        config.dispatch_pacing,
        shutdown_rx.clone(),
    ));
    let scheduler_handle = tokio::spawn({
        let db = db.clone();
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(db, shutdown).await }
    });

    let state = AppState {
        db: db.clone(),
        pipeline,
        review,
        api_token: config.api_token.clone(),
    };
    let app = functions::webhook::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "http api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in [dispatch_handle, scheduler_handle] {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task ended abnormally");
        }
    }
    db.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}
