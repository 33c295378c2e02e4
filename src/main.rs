mod api;
mod collection;
mod config;
mod health;
mod persistence;
mod run;
mod runner;
mod storage;

use clap::Parser;
use tracing::info;

use crate::api::build_api;
use crate::config::Config;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::parse();
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    let router = build_api(&config).await;
    info!(bind = %config.bind, "runboard listening");
    axum::serve(listener, router).await
}
