use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use billing_backend::billing::consumer::QueueIngress;
use billing_backend::billing::{scheduler, BillingEngine, Collaborators};
use billing_backend::store::Stores;
use billing_backend::{app, config};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

const CONSUMER_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let root = (*config::BILLING_ROOT_ACCOUNT)
        .ok_or("BILLING_ROOT_ACCOUNT must be set to a non-nil account uuid")?;
    let stores = Stores::postgres(pool);
    let collaborators = Collaborators::from_env(&stores);
    let engine = Arc::new(BillingEngine::new(stores, collaborators, root));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = scheduler::spawn(engine.clone(), shutdown_rx.clone());
    let daily = scheduler::spawn_daily(engine.clone(), shutdown_rx);

    let (queues, consumers) = QueueIngress::start(&engine, CONSUMER_BUFFER);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let router = app(engine.clone(), queues)
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(?error, "failed to listen for shutdown signal");
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(ticker, daily);
    for consumer in consumers {
        let _ = consumer.await;
    }
    tracing::info!("billing routines stopped");
    Ok(())
}
