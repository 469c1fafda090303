//! Sequex Connector
//!
//! Maintains Binance spot order books, forwards best bid/ask ticks over IPC
//! and hosts one order executor per configured account.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sequex_connector::exchange::{BinanceAdapter, ExchangeAdapter};
use sequex_connector::orderbook::BookManager;
use sequex_connector::{AccountRegistry, AppState, Config, OrderExecutor, Publisher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Sequex connector");

    let config = Arc::new(Config::load()?);
    info!(
        symbols = ?config.symbols,
        accounts = config.accounts.len(),
        update_speed_ms = config.update_speed.as_millis(),
        "Configuration loaded"
    );

    let market_data: Arc<dyn ExchangeAdapter> =
        Arc::new(BinanceAdapter::public(config.binance_settings())?);
    let books = Arc::new(BookManager::new(market_data, config.book_settings()));

    for symbol in &config.symbols {
        if let Err(e) = books.create(symbol, config.update_speed).await {
            error!(symbol = %symbol, error = %e, "Failed to create order book");
        }
    }

    // Best-depth ticks -> IPC
    let publisher = Arc::new(Publisher::new(&config.ipc_socket_path).await);
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();
    let mut subscriptions = Vec::new();
    for symbol in books.symbols().await {
        let tx = tick_tx.clone();
        let name = symbol.clone();
        match books
            .subscribe_best_depth(&symbol, move |depth| {
                let _ = tx.send((name.clone(), depth));
            })
            .await
        {
            Ok(subscription) => subscriptions.push(subscription),
            Err(e) => warn!(symbol = %symbol, error = %e, "Failed to wire book to publisher"),
        }
    }
    drop(tick_tx);
    let forwarder = publisher.spawn_forwarder(books.clone(), tick_rx);

    let accounts = Arc::new(AccountRegistry::new());
    for account in &config.accounts {
        let adapter =
            BinanceAdapter::with_credentials(config.binance_settings(), account.credentials.clone())?;
        let executor = OrderExecutor::new(
            &account.name,
            Arc::new(adapter),
            books.clone(),
            config.executor_settings(),
        );
        accounts.register(Arc::new(executor))?;
    }

    let state = Arc::new(AppState {
        books: books.clone(),
        accounts: accounts.clone(),
        config: config.clone(),
    });

    let health_state = state.clone();
    let health = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for subscription in subscriptions {
        subscription.detach();
    }
    accounts.close_all().await;
    books.shutdown().await;
    forwarder.abort();
    health.abort();

    info!("Sequex connector stopped");
    Ok(())
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut books = Vec::new();
    for symbol in state.books.symbols().await {
        if let Some(book_state) = state.books.state(&symbol).await {
            books.push(serde_json::json!({ "symbol": symbol, "state": book_state }));
        }
    }

    Json(serde_json::json!({
        "status": "healthy",
        "component": "sequex-connector",
        "books": books,
        "accounts": state.accounts.names(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics() -> Result<String, StatusCode> {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
