use std::env;

use axum::{
    extract::State as AxumState,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use llmos_operator::{config::AppConfig, AppError, State, OPERATOR};
use prometheus::{Encoder as _, TextEncoder};
use snafu::ResultExt as _;
use tracing::{error, info};

async fn metrics(AxumState(state): AxumState<State>) -> Response {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&state.metrics(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], buffer).into_response()
}

async fn health() -> &'static str {
    "healthy"
}

async fn diagnostics(AxumState(state): AxumState<State>) -> impl IntoResponse {
    Json(state.diagnostics().await)
}

fn load_config() -> llmos_operator::Result<AppConfig> {
    config::Config::builder()
        .add_source(
            config::File::with_name(env::var("APP_CONFIG").as_deref().unwrap_or(OPERATOR))
                .required(false),
        )
        .add_source(config::Environment::with_prefix("APP").prefix_separator("_").separator("__"))
        .build()
        .and_then(|x| x.try_deserialize::<AppConfig>())
        .whatever_context::<_, AppError>("failed to load configuration")
}

#[tokio::main]
async fn main() -> llmos_operator::Result<()> {
    llmos_operator::telemetry::init();

    let state = State::new(load_config()?);
    let address = state.config().metrics_address.clone();

    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/", get(diagnostics))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .whatever_context::<_, AppError>(format!("failed to bind {address}"))?;
    info!(address, "Serving metrics");
    let server = async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(?err, "Metrics server stopped");
        }
    };

    // The controllers stop on SIGTERM, the server goes down with them
    tokio::select! {
        res = llmos_operator::run(state) => res,
        () = server => Ok(()),
    }
}
